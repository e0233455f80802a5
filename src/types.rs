//! PostgreSQL type encoding and decoding.
//!
//! The pool treats type handling as a planner: `TypeRegistry` maps a type
//! OID to its preferred parameter and result wire formats and hands out
//! per-column [`ScanPlan`]s that decode raw column bytes into [`PgValue`]s.
//! Argument dispatch is a pattern match over the `PgValue` sum type rather
//! than runtime capability probing.
//!
//! Binary format reference:
//! <https://www.postgresql.org/docs/current/protocol-overview.html#PROTOCOL-FORMAT-CODES>

use std::collections::HashMap;

use bytes::Bytes;

use crate::error::{Error, Result};

// ============================================================================
// OIDs and format codes
// ============================================================================

/// A PostgreSQL type object identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Oid(pub u32);

impl Oid {
    pub const BOOL: Oid = Oid(16);
    pub const BYTEA: Oid = Oid(17);
    pub const CHAR: Oid = Oid(18);
    pub const NAME: Oid = Oid(19);
    pub const INT8: Oid = Oid(20);
    pub const INT2: Oid = Oid(21);
    pub const INT4: Oid = Oid(23);
    pub const TEXT: Oid = Oid(25);
    pub const OID_TYPE: Oid = Oid(26);
    pub const JSON: Oid = Oid(114);
    pub const FLOAT4: Oid = Oid(700);
    pub const FLOAT8: Oid = Oid(701);
    pub const UNKNOWN: Oid = Oid(705);
    pub const BPCHAR: Oid = Oid(1042);
    pub const VARCHAR: Oid = Oid(1043);
    pub const DATE: Oid = Oid(1082);
    pub const TIME: Oid = Oid(1083);
    pub const TIMESTAMP: Oid = Oid(1114);
    pub const TIMESTAMPTZ: Oid = Oid(1184);
    pub const NUMERIC: Oid = Oid(1700);
    pub const UUID: Oid = Oid(2950);
    pub const JSONB: Oid = Oid(3802);
}

/// Wire format code for parameters and result columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Text,
    Binary,
}

impl Format {
    pub fn code(self) -> i16 {
        match self {
            Format::Text => 0,
            Format::Binary => 1,
        }
    }

    pub fn from_code(code: i16) -> Format {
        if code == 1 {
            Format::Binary
        } else {
            Format::Text
        }
    }
}

// ============================================================================
// Values
// ============================================================================

/// A PostgreSQL value: query argument or decoded result cell.
///
/// Each variant knows its own binary encoding; `Text` and `Json` prefer the
/// text format. `Raw` carries bytes for a type the registry has no special
/// handling for.
#[derive(Debug, Clone, PartialEq)]
pub enum PgValue {
    Null,
    Bool(bool),
    Int2(i16),
    Int4(i32),
    Int8(i64),
    Float4(f32),
    Float8(f64),
    Text(String),
    Bytea(Vec<u8>),
    Uuid([u8; 16]),
    /// Microseconds since 2000-01-01 00:00:00.
    Timestamp(i64),
    /// Days since 2000-01-01.
    Date(i32),
    /// Microseconds since midnight.
    Time(i64),
    Json(String),
    Raw { oid: Oid, data: Vec<u8> },
}

impl PgValue {
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, PgValue::Null)
    }

    /// The OID this value would be sent as when the statement leaves the
    /// parameter type unspecified.
    pub fn type_oid(&self) -> Oid {
        match self {
            PgValue::Null => Oid::UNKNOWN,
            PgValue::Bool(_) => Oid::BOOL,
            PgValue::Int2(_) => Oid::INT2,
            PgValue::Int4(_) => Oid::INT4,
            PgValue::Int8(_) => Oid::INT8,
            PgValue::Float4(_) => Oid::FLOAT4,
            PgValue::Float8(_) => Oid::FLOAT8,
            PgValue::Text(_) => Oid::TEXT,
            PgValue::Bytea(_) => Oid::BYTEA,
            PgValue::Uuid(_) => Oid::UUID,
            PgValue::Timestamp(_) => Oid::TIMESTAMP,
            PgValue::Date(_) => Oid::DATE,
            PgValue::Time(_) => Oid::TIME,
            PgValue::Json(_) => Oid::JSONB,
            PgValue::Raw { oid, .. } => *oid,
        }
    }

    /// The format this value insists on, if any. `Raw` and `Null` defer to
    /// the registry's per-OID preference.
    pub fn preferred_format(&self) -> Option<Format> {
        match self {
            PgValue::Null | PgValue::Raw { .. } => None,
            PgValue::Text(_) | PgValue::Json(_) => Some(Format::Text),
            _ => Some(Format::Binary),
        }
    }

    /// Append this value's wire encoding to `buf`, returning the appended
    /// range, or `None` for a null-coded value.
    pub fn encode(&self, format: Format, buf: &mut Vec<u8>) -> Result<Option<(usize, usize)>> {
        if self.is_null() {
            return Ok(None);
        }
        let start = buf.len();
        match format {
            Format::Binary => self.encode_binary(buf)?,
            Format::Text => self.encode_text(buf)?,
        }
        Ok(Some((start, buf.len())))
    }

    fn encode_binary(&self, buf: &mut Vec<u8>) -> Result<()> {
        match self {
            PgValue::Null => {}
            PgValue::Bool(v) => buf.push(u8::from(*v)),
            PgValue::Int2(v) => buf.extend_from_slice(&v.to_be_bytes()),
            PgValue::Int4(v) => buf.extend_from_slice(&v.to_be_bytes()),
            PgValue::Int8(v) => buf.extend_from_slice(&v.to_be_bytes()),
            PgValue::Float4(v) => buf.extend_from_slice(&v.to_be_bytes()),
            PgValue::Float8(v) => buf.extend_from_slice(&v.to_be_bytes()),
            PgValue::Text(v) => buf.extend_from_slice(v.as_bytes()),
            PgValue::Bytea(v) => buf.extend_from_slice(v),
            PgValue::Uuid(v) => buf.extend_from_slice(v),
            PgValue::Timestamp(v) => buf.extend_from_slice(&v.to_be_bytes()),
            PgValue::Date(v) => buf.extend_from_slice(&v.to_be_bytes()),
            PgValue::Time(v) => buf.extend_from_slice(&v.to_be_bytes()),
            PgValue::Json(v) => {
                // JSONB binary format carries a version byte
                buf.push(1);
                buf.extend_from_slice(v.as_bytes());
            }
            PgValue::Raw { data, .. } => buf.extend_from_slice(data),
        }
        Ok(())
    }

    fn encode_text(&self, buf: &mut Vec<u8>) -> Result<()> {
        match self {
            PgValue::Null => {}
            PgValue::Bool(v) => buf.push(if *v { b't' } else { b'f' }),
            PgValue::Int2(v) => buf.extend_from_slice(v.to_string().as_bytes()),
            PgValue::Int4(v) => buf.extend_from_slice(v.to_string().as_bytes()),
            PgValue::Int8(v) => buf.extend_from_slice(v.to_string().as_bytes()),
            PgValue::Float4(v) => buf.extend_from_slice(v.to_string().as_bytes()),
            PgValue::Float8(v) => buf.extend_from_slice(v.to_string().as_bytes()),
            PgValue::Text(v) | PgValue::Json(v) => buf.extend_from_slice(v.as_bytes()),
            PgValue::Bytea(v) => {
                buf.extend_from_slice(b"\\x");
                for b in v {
                    buf.extend_from_slice(format!("{b:02x}").as_bytes());
                }
            }
            PgValue::Raw { data, .. } => buf.extend_from_slice(data),
            other => {
                return Err(Error::Serialization(format!(
                    "cannot encode {other:?} in text format"
                )))
            }
        }
        Ok(())
    }
}

impl From<bool> for PgValue {
    fn from(v: bool) -> Self {
        PgValue::Bool(v)
    }
}

impl From<i16> for PgValue {
    fn from(v: i16) -> Self {
        PgValue::Int2(v)
    }
}

impl From<i32> for PgValue {
    fn from(v: i32) -> Self {
        PgValue::Int4(v)
    }
}

impl From<i64> for PgValue {
    fn from(v: i64) -> Self {
        PgValue::Int8(v)
    }
}

impl From<f32> for PgValue {
    fn from(v: f32) -> Self {
        PgValue::Float4(v)
    }
}

impl From<f64> for PgValue {
    fn from(v: f64) -> Self {
        PgValue::Float8(v)
    }
}

impl From<&str> for PgValue {
    fn from(v: &str) -> Self {
        PgValue::Text(v.to_string())
    }
}

impl From<String> for PgValue {
    fn from(v: String) -> Self {
        PgValue::Text(v)
    }
}

impl From<Vec<u8>> for PgValue {
    fn from(v: Vec<u8>) -> Self {
        PgValue::Bytea(v)
    }
}

impl<T: Into<PgValue>> From<Option<T>> for PgValue {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => PgValue::Null,
        }
    }
}

// ============================================================================
// Registry and scan plans
// ============================================================================

/// Per-OID format preferences. Types with a fixed-width binary
/// representation prefer binary on both sides; everything else stays text.
#[derive(Debug, Clone, Copy)]
struct TypeEntry {
    param_format: Format,
    result_format: Format,
}

/// The encode/decode planner.
///
/// The pool never inspects type internals; it asks the registry for the
/// preferred parameter format of an OID, the preferred result format of a
/// column, and a [`ScanPlan`] for a `(oid, format)` pair.
#[derive(Debug)]
pub struct TypeRegistry {
    entries: HashMap<u32, TypeEntry>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        let mut entries = HashMap::new();
        let binary = TypeEntry {
            param_format: Format::Binary,
            result_format: Format::Binary,
        };
        let text = TypeEntry {
            param_format: Format::Text,
            result_format: Format::Text,
        };
        for oid in [
            Oid::BOOL,
            Oid::BYTEA,
            Oid::INT2,
            Oid::INT4,
            Oid::INT8,
            Oid::OID_TYPE,
            Oid::FLOAT4,
            Oid::FLOAT8,
            Oid::DATE,
            Oid::TIME,
            Oid::TIMESTAMP,
            Oid::TIMESTAMPTZ,
            Oid::UUID,
        ] {
            entries.insert(oid.0, binary);
        }
        for oid in [
            Oid::CHAR,
            Oid::NAME,
            Oid::TEXT,
            Oid::JSON,
            Oid::UNKNOWN,
            Oid::BPCHAR,
            Oid::VARCHAR,
            Oid::NUMERIC,
            Oid::JSONB,
        ] {
            entries.insert(oid.0, text);
        }
        TypeRegistry { entries }
    }

    /// Preferred wire format for a parameter of the given type.
    pub fn param_format_for(&self, oid: Oid) -> Format {
        self.entries
            .get(&oid.0)
            .map(|e| e.param_format)
            .unwrap_or(Format::Text)
    }

    /// Preferred wire format for a result column of the given type.
    pub fn result_format_for(&self, oid: Oid) -> Format {
        self.entries
            .get(&oid.0)
            .map(|e| e.result_format)
            .unwrap_or(Format::Text)
    }

    /// Build the decode plan for one result column.
    pub fn plan_scan(&self, oid: Oid, format: i16) -> ScanPlan {
        ScanPlan {
            oid,
            format: Format::from_code(format),
        }
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// A per-column decode plan: fixed `(oid, format)`, applied to every row.
#[derive(Debug, Clone, Copy)]
pub struct ScanPlan {
    oid: Oid,
    format: Format,
}

impl ScanPlan {
    /// Decode one column value. `None` is SQL NULL.
    pub fn scan(&self, raw: Option<&[u8]>) -> Result<PgValue> {
        let Some(data) = raw else {
            return Ok(PgValue::Null);
        };
        match self.format {
            Format::Binary => decode_binary(self.oid, data),
            Format::Text => decode_text(self.oid, data),
        }
    }
}

fn bad_len(oid: Oid, want: usize, got: usize) -> Error {
    Error::Serialization(format!(
        "invalid value length for oid {}: expected {want}, got {got}",
        oid.0
    ))
}

fn decode_binary(oid: Oid, data: &[u8]) -> Result<PgValue> {
    let fixed = |n: usize| -> Result<&[u8]> {
        if data.len() == n {
            Ok(data)
        } else {
            Err(bad_len(oid, n, data.len()))
        }
    };
    match oid {
        Oid::BOOL => Ok(PgValue::Bool(fixed(1)?[0] != 0)),
        Oid::INT2 => Ok(PgValue::Int2(i16::from_be_bytes(
            fixed(2)?.try_into().expect("length checked"),
        ))),
        Oid::INT4 | Oid::OID_TYPE => Ok(PgValue::Int4(i32::from_be_bytes(
            fixed(4)?.try_into().expect("length checked"),
        ))),
        Oid::INT8 => Ok(PgValue::Int8(i64::from_be_bytes(
            fixed(8)?.try_into().expect("length checked"),
        ))),
        Oid::FLOAT4 => Ok(PgValue::Float4(f32::from_be_bytes(
            fixed(4)?.try_into().expect("length checked"),
        ))),
        Oid::FLOAT8 => Ok(PgValue::Float8(f64::from_be_bytes(
            fixed(8)?.try_into().expect("length checked"),
        ))),
        Oid::TEXT | Oid::VARCHAR | Oid::BPCHAR | Oid::CHAR | Oid::NAME | Oid::UNKNOWN => {
            decode_utf8(data).map(PgValue::Text)
        }
        Oid::BYTEA => Ok(PgValue::Bytea(data.to_vec())),
        Oid::UUID => {
            let raw: [u8; 16] = fixed(16)?.try_into().expect("length checked");
            Ok(PgValue::Uuid(raw))
        }
        Oid::TIMESTAMP | Oid::TIMESTAMPTZ => Ok(PgValue::Timestamp(i64::from_be_bytes(
            fixed(8)?.try_into().expect("length checked"),
        ))),
        Oid::DATE => Ok(PgValue::Date(i32::from_be_bytes(
            fixed(4)?.try_into().expect("length checked"),
        ))),
        Oid::TIME => Ok(PgValue::Time(i64::from_be_bytes(
            fixed(8)?.try_into().expect("length checked"),
        ))),
        Oid::JSON => decode_utf8(data).map(PgValue::Json),
        Oid::JSONB => {
            // version byte prefix
            let body = if data.is_empty() { data } else { &data[1..] };
            decode_utf8(body).map(PgValue::Json)
        }
        _ => Ok(PgValue::Raw {
            oid,
            data: data.to_vec(),
        }),
    }
}

fn decode_text(oid: Oid, data: &[u8]) -> Result<PgValue> {
    let text = decode_utf8(data)?;
    let parse_err = |what: &str| {
        Error::Serialization(format!("invalid {what} text representation: {text:?}"))
    };
    match oid {
        Oid::BOOL => Ok(PgValue::Bool(matches!(
            text.as_str(),
            "t" | "true" | "1" | "yes" | "on"
        ))),
        Oid::INT2 => text.parse().map(PgValue::Int2).map_err(|_| parse_err("int2")),
        Oid::INT4 | Oid::OID_TYPE => {
            text.parse().map(PgValue::Int4).map_err(|_| parse_err("int4"))
        }
        Oid::INT8 => text.parse().map(PgValue::Int8).map_err(|_| parse_err("int8")),
        Oid::FLOAT4 => text.parse().map(PgValue::Float4).map_err(|_| parse_err("float4")),
        Oid::FLOAT8 => text.parse().map(PgValue::Float8).map_err(|_| parse_err("float8")),
        Oid::JSON | Oid::JSONB => Ok(PgValue::Json(text)),
        _ => Ok(PgValue::Text(text)),
    }
}

fn decode_utf8(data: &[u8]) -> Result<String> {
    std::str::from_utf8(data)
        .map(str::to_owned)
        .map_err(|e| Error::Serialization(format!("invalid utf-8 in value: {e}")))
}

// ============================================================================
// Row scanning
// ============================================================================

/// Convert a decoded [`PgValue`] into a concrete Rust type.
pub trait FromPg: Sized {
    fn from_pg(value: PgValue) -> Result<Self>;
}

fn mismatch<T>(value: &PgValue, want: &str) -> Result<T> {
    Err(Error::Serialization(format!(
        "cannot decode {value:?} into {want}"
    )))
}

impl FromPg for bool {
    fn from_pg(value: PgValue) -> Result<Self> {
        match value {
            PgValue::Bool(v) => Ok(v),
            other => mismatch(&other, "bool"),
        }
    }
}

impl FromPg for i16 {
    fn from_pg(value: PgValue) -> Result<Self> {
        match value {
            PgValue::Int2(v) => Ok(v),
            other => mismatch(&other, "i16"),
        }
    }
}

impl FromPg for i32 {
    fn from_pg(value: PgValue) -> Result<Self> {
        match value {
            PgValue::Int2(v) => Ok(v.into()),
            PgValue::Int4(v) => Ok(v),
            other => mismatch(&other, "i32"),
        }
    }
}

impl FromPg for i64 {
    fn from_pg(value: PgValue) -> Result<Self> {
        match value {
            PgValue::Int2(v) => Ok(v.into()),
            PgValue::Int4(v) => Ok(v.into()),
            PgValue::Int8(v) => Ok(v),
            other => mismatch(&other, "i64"),
        }
    }
}

impl FromPg for f32 {
    fn from_pg(value: PgValue) -> Result<Self> {
        match value {
            PgValue::Float4(v) => Ok(v),
            other => mismatch(&other, "f32"),
        }
    }
}

impl FromPg for f64 {
    fn from_pg(value: PgValue) -> Result<Self> {
        match value {
            PgValue::Float4(v) => Ok(v.into()),
            PgValue::Float8(v) => Ok(v),
            other => mismatch(&other, "f64"),
        }
    }
}

impl FromPg for String {
    fn from_pg(value: PgValue) -> Result<Self> {
        match value {
            PgValue::Text(v) | PgValue::Json(v) => Ok(v),
            other => mismatch(&other, "String"),
        }
    }
}

impl FromPg for Vec<u8> {
    fn from_pg(value: PgValue) -> Result<Self> {
        match value {
            PgValue::Bytea(v) => Ok(v),
            PgValue::Raw { data, .. } => Ok(data),
            other => mismatch(&other, "Vec<u8>"),
        }
    }
}

impl FromPg for [u8; 16] {
    fn from_pg(value: PgValue) -> Result<Self> {
        match value {
            PgValue::Uuid(v) => Ok(v),
            other => mismatch(&other, "[u8; 16]"),
        }
    }
}

impl FromPg for PgValue {
    fn from_pg(value: PgValue) -> Result<Self> {
        Ok(value)
    }
}

impl<T: FromPg> FromPg for Option<T> {
    fn from_pg(value: PgValue) -> Result<Self> {
        match value {
            PgValue::Null => Ok(None),
            other => T::from_pg(other).map(Some),
        }
    }
}

/// One result row during a scan: raw column bytes plus the column plans.
pub struct Row<'a> {
    pub(crate) values: &'a [Option<Bytes>],
    pub(crate) plans: &'a [ScanPlan],
}

impl Row<'_> {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Decode column `index` into `T`.
    pub fn get<T: FromPg>(&self, index: usize) -> Result<T> {
        let plan = self.plans.get(index).ok_or_else(|| {
            Error::Serialization(format!("column index {index} out of range"))
        })?;
        T::from_pg(plan.scan(self.values[index].as_deref())?)
    }
}

/// Build a destination element from one result row, columns in declaration
/// order.
pub trait FromRow: Sized {
    fn from_row(row: &Row<'_>) -> Result<Self>;
}

macro_rules! impl_from_row_tuple {
    ($($idx:tt $name:ident),+) => {
        impl<$($name: FromPg),+> FromRow for ($($name,)+) {
            fn from_row(row: &Row<'_>) -> Result<Self> {
                Ok(($(row.get::<$name>($idx)?,)+))
            }
        }
    };
}

impl_from_row_tuple!(0 A);
impl_from_row_tuple!(0 A, 1 B);
impl_from_row_tuple!(0 A, 1 B, 2 C);
impl_from_row_tuple!(0 A, 1 B, 2 C, 3 D);
impl_from_row_tuple!(0 A, 1 B, 2 C, 3 D, 4 E);
impl_from_row_tuple!(0 A, 1 B, 2 C, 3 D, 4 E, 5 F);
impl_from_row_tuple!(0 A, 1 B, 2 C, 3 D, 4 E, 5 F, 6 G);
impl_from_row_tuple!(0 A, 1 B, 2 C, 3 D, 4 E, 5 F, 6 G, 7 H);

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(value: PgValue) {
        let registry = TypeRegistry::new();
        let oid = value.type_oid();
        let format = value
            .preferred_format()
            .unwrap_or_else(|| registry.param_format_for(oid));
        let mut buf = Vec::new();
        let range = value.encode(format, &mut buf).unwrap().unwrap();
        let plan = registry.plan_scan(oid, format.code());
        let decoded = plan.scan(Some(&buf[range.0..range.1])).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn scalar_roundtrips() {
        roundtrip(PgValue::Bool(true));
        roundtrip(PgValue::Int2(-7));
        roundtrip(PgValue::Int4(123_456));
        roundtrip(PgValue::Int8(-9_000_000_000));
        roundtrip(PgValue::Float8(2.5));
        roundtrip(PgValue::Text("hello world".into()));
        roundtrip(PgValue::Bytea(vec![0, 1, 2, 255]));
        roundtrip(PgValue::Uuid([7; 16]));
        roundtrip(PgValue::Timestamp(694_224_000_000_000));
    }

    #[test]
    fn null_encodes_as_absent() {
        let mut buf = Vec::new();
        assert!(PgValue::Null.encode(Format::Binary, &mut buf).unwrap().is_none());
        assert!(buf.is_empty());
    }

    #[test]
    fn text_value_prefers_text_format() {
        assert_eq!(PgValue::Text("x".into()).preferred_format(), Some(Format::Text));
        assert_eq!(PgValue::Int4(1).preferred_format(), Some(Format::Binary));
        assert_eq!(PgValue::Null.preferred_format(), None);
    }

    #[test]
    fn registry_format_preferences() {
        let registry = TypeRegistry::new();
        assert_eq!(registry.param_format_for(Oid::INT4), Format::Binary);
        assert_eq!(registry.result_format_for(Oid::TEXT), Format::Text);
        assert_eq!(registry.result_format_for(Oid::NUMERIC), Format::Text);
        // unregistered types default to text
        assert_eq!(registry.param_format_for(Oid(60000)), Format::Text);
    }

    #[test]
    fn scan_plan_decodes_null() {
        let registry = TypeRegistry::new();
        let plan = registry.plan_scan(Oid::INT4, Format::Binary.code());
        assert_eq!(plan.scan(None).unwrap(), PgValue::Null);
    }

    #[test]
    fn scan_plan_rejects_short_int4() {
        let registry = TypeRegistry::new();
        let plan = registry.plan_scan(Oid::INT4, Format::Binary.code());
        assert!(plan.scan(Some(&[0, 1])).is_err());
    }

    #[test]
    fn text_format_decoding() {
        let registry = TypeRegistry::new();
        let plan = registry.plan_scan(Oid::INT8, Format::Text.code());
        assert_eq!(plan.scan(Some(b"42")).unwrap(), PgValue::Int8(42));
        let plan = registry.plan_scan(Oid::BOOL, Format::Text.code());
        assert_eq!(plan.scan(Some(b"t")).unwrap(), PgValue::Bool(true));
    }

    #[test]
    fn row_get_with_coercion() {
        let registry = TypeRegistry::new();
        let plans = vec![
            registry.plan_scan(Oid::INT4, Format::Binary.code()),
            registry.plan_scan(Oid::TEXT, Format::Text.code()),
        ];
        let values = vec![
            Some(Bytes::copy_from_slice(&7i32.to_be_bytes())),
            None,
        ];
        let row = Row {
            values: &values,
            plans: &plans,
        };
        assert_eq!(row.get::<i64>(0).unwrap(), 7);
        assert_eq!(row.get::<Option<String>>(1).unwrap(), None);
        assert!(row.get::<String>(2).is_err());
    }

    #[test]
    fn tuple_from_row() {
        let registry = TypeRegistry::new();
        let plans = vec![
            registry.plan_scan(Oid::INT4, Format::Binary.code()),
            registry.plan_scan(Oid::TEXT, Format::Text.code()),
        ];
        let values = vec![
            Some(Bytes::copy_from_slice(&1i32.to_be_bytes())),
            Some(Bytes::copy_from_slice(b"one")),
        ];
        let row = Row {
            values: &values,
            plans: &plans,
        };
        let (id, name) = <(i32, String)>::from_row(&row).unwrap();
        assert_eq!(id, 1);
        assert_eq!(name, "one");
    }
}
