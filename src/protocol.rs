//! PostgreSQL wire protocol message encoding and decoding.
//!
//! Implements the v3 protocol frames the pool drives. Every regular message
//! is `type(1) | length(4, big-endian, including the length field) | body`.
//! Reference: <https://www.postgresql.org/docs/current/protocol-message-formats.html>
//!
//! Frontend encoders append into a caller-supplied buffer so a worker can
//! assemble one compound message (e.g. Bind + Describe + Execute + Sync) in
//! its reusable write buffer and issue a single socket write.

use std::collections::HashMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::types::Oid;

/// PostgreSQL protocol version 3.0.
pub const PROTOCOL_VERSION: i32 = 196608; // (3 << 16) | 0

/// Magic code of the TLS request pseudo-packet.
pub const SSL_REQUEST_CODE: i32 = 80877103;

/// Transaction status indicator carried by ReadyForQuery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Not in a transaction block.
    Idle,
    /// In a transaction block.
    InTransaction,
    /// In a failed transaction block.
    Failed,
}

impl From<u8> for TransactionStatus {
    fn from(b: u8) -> Self {
        match b {
            b'T' => TransactionStatus::InTransaction,
            b'E' => TransactionStatus::Failed,
            _ => TransactionStatus::Idle,
        }
    }
}

impl TransactionStatus {
    pub fn as_byte(self) -> u8 {
        match self {
            TransactionStatus::Idle => b'I',
            TransactionStatus::InTransaction => b'T',
            TransactionStatus::Failed => b'E',
        }
    }
}

// ============================================================================
// Frontend (client -> server) messages
// ============================================================================

/// Trait for encoding frontend messages into a write buffer.
pub trait FrontendMessage {
    fn encode(&self, buf: &mut BytesMut);
}

/// Append a tagged message, backpatching the length field once the body is
/// written.
fn put_message(buf: &mut BytesMut, tag: u8, body: impl FnOnce(&mut BytesMut)) {
    buf.put_u8(tag);
    let len_at = buf.len();
    buf.put_i32(0);
    body(buf);
    let len = (buf.len() - len_at) as i32;
    buf[len_at..len_at + 4].copy_from_slice(&len.to_be_bytes());
}

fn put_cstring(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

/// Startup message. Has no type byte; carries the protocol version and the
/// session parameters (`user`, `database`, runtime parameters).
#[derive(Debug, Clone)]
pub struct StartupMessage {
    pub parameters: Vec<(String, String)>,
}

impl FrontendMessage for StartupMessage {
    fn encode(&self, buf: &mut BytesMut) {
        let len_at = buf.len();
        buf.put_i32(0);
        buf.put_i32(PROTOCOL_VERSION);
        for (key, value) in &self.parameters {
            put_cstring(buf, key);
            put_cstring(buf, value);
        }
        buf.put_u8(0);
        let len = (buf.len() - len_at) as i32;
        buf[len_at..len_at + 4].copy_from_slice(&len.to_be_bytes());
    }
}

/// TLS request pseudo-packet, sent before the startup message when TLS is
/// wanted. The server answers with a single byte: 'S' or 'N'.
#[derive(Debug, Clone, Copy)]
pub struct SslRequest;

impl FrontendMessage for SslRequest {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32(8);
        buf.put_i32(SSL_REQUEST_CODE);
    }
}

/// Password message, for cleartext and MD5 responses ('p').
#[derive(Debug, Clone)]
pub struct PasswordMessage<'a> {
    pub password: &'a str,
}

impl FrontendMessage for PasswordMessage<'_> {
    fn encode(&self, buf: &mut BytesMut) {
        put_message(buf, b'p', |buf| put_cstring(buf, self.password));
    }
}

/// First SASL message ('p'): mechanism name plus the client-first payload.
#[derive(Debug, Clone)]
pub struct SaslInitialResponse<'a> {
    pub mechanism: &'a str,
    pub data: &'a [u8],
}

impl FrontendMessage for SaslInitialResponse<'_> {
    fn encode(&self, buf: &mut BytesMut) {
        put_message(buf, b'p', |buf| {
            put_cstring(buf, self.mechanism);
            buf.put_i32(self.data.len() as i32);
            buf.put_slice(self.data);
        });
    }
}

/// Follow-up SASL message ('p'): raw mechanism payload.
#[derive(Debug, Clone)]
pub struct SaslResponse<'a> {
    pub data: &'a [u8],
}

impl FrontendMessage for SaslResponse<'_> {
    fn encode(&self, buf: &mut BytesMut) {
        put_message(buf, b'p', |buf| buf.put_slice(self.data));
    }
}

/// Parse ('P'): create a prepared statement.
#[derive(Debug, Clone)]
pub struct Parse<'a> {
    /// Statement name; empty for the unnamed statement.
    pub name: &'a str,
    pub query: &'a str,
    pub param_oids: &'a [Oid],
}

impl FrontendMessage for Parse<'_> {
    fn encode(&self, buf: &mut BytesMut) {
        put_message(buf, b'P', |buf| {
            put_cstring(buf, self.name);
            put_cstring(buf, self.query);
            buf.put_i16(self.param_oids.len() as i16);
            for oid in self.param_oids {
                buf.put_u32(oid.0);
            }
        });
    }
}

/// Bind ('B'): bind parameter values to a prepared statement, producing the
/// unnamed portal. Parameter values are pre-encoded byte slices; `None` is a
/// null-coded parameter.
#[derive(Debug)]
pub struct Bind<'a> {
    /// Source statement name; empty for the unnamed statement.
    pub statement: &'a str,
    pub param_formats: &'a [i16],
    pub param_values: &'a [Option<&'a [u8]>],
    pub result_formats: &'a [i16],
}

impl FrontendMessage for Bind<'_> {
    fn encode(&self, buf: &mut BytesMut) {
        put_message(buf, b'B', |buf| {
            buf.put_u8(0); // unnamed destination portal
            put_cstring(buf, self.statement);
            buf.put_i16(self.param_formats.len() as i16);
            for format in self.param_formats {
                buf.put_i16(*format);
            }
            buf.put_i16(self.param_values.len() as i16);
            for value in self.param_values {
                match value {
                    Some(v) => {
                        buf.put_i32(v.len() as i32);
                        buf.put_slice(v);
                    }
                    None => buf.put_i32(-1),
                }
            }
            buf.put_i16(self.result_formats.len() as i16);
            for format in self.result_formats {
                buf.put_i16(*format);
            }
        });
    }
}

/// Describe ('D'): request the description of a statement ('S') or portal
/// ('P').
#[derive(Debug, Clone)]
pub struct Describe<'a> {
    pub object_type: u8,
    pub name: &'a str,
}

impl FrontendMessage for Describe<'_> {
    fn encode(&self, buf: &mut BytesMut) {
        put_message(buf, b'D', |buf| {
            buf.put_u8(self.object_type);
            put_cstring(buf, self.name);
        });
    }
}

/// Execute ('E'): run the unnamed portal to completion.
#[derive(Debug, Clone, Copy, Default)]
pub struct Execute;

impl FrontendMessage for Execute {
    fn encode(&self, buf: &mut BytesMut) {
        put_message(buf, b'E', |buf| {
            buf.put_u8(0); // unnamed portal
            buf.put_i32(0); // no row limit
        });
    }
}

/// Sync ('S'): end of an extended-query sequence.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sync;

impl FrontendMessage for Sync {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(b'S');
        buf.put_i32(4);
    }
}

/// Terminate ('X'): orderly connection shutdown.
#[derive(Debug, Clone, Copy)]
pub struct Terminate;

impl FrontendMessage for Terminate {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(b'X');
        buf.put_i32(4);
    }
}

// ============================================================================
// Backend (server -> client) messages
// ============================================================================

/// One column of a RowDescription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescription {
    pub name: String,
    pub table_oid: u32,
    pub column_attr: i16,
    pub type_oid: Oid,
    pub type_size: i16,
    pub type_modifier: i32,
    /// Wire format the server will use for this column (0 text, 1 binary).
    pub format: i16,
}

#[derive(Debug, Clone)]
pub enum BackendMessage {
    AuthenticationOk,
    AuthenticationCleartextPassword,
    AuthenticationMd5Password { salt: [u8; 4] },
    AuthenticationSasl { mechanisms: Vec<String> },
    AuthenticationSaslContinue { data: Bytes },
    AuthenticationSaslFinal { data: Bytes },

    RowDescription { fields: Vec<FieldDescription> },
    DataRow { values: Vec<Option<Bytes>> },
    CommandComplete { tag: Bytes },
    EmptyQueryResponse,

    ParseComplete,
    BindComplete,
    CloseComplete,
    NoData,
    PortalSuspended,

    ReadyForQuery { status: TransactionStatus },
    ParameterStatus { name: String, value: String },
    BackendKeyData { process_id: u32, secret_key: u32 },
    ParameterDescription { param_oids: Vec<Oid> },

    ErrorResponse { fields: HashMap<u8, String> },
    NoticeResponse { fields: HashMap<u8, String> },
    NotificationResponse { process_id: u32, channel: String, payload: String },
}

impl BackendMessage {
    /// Decode one complete frame (type byte + length + body).
    pub fn decode(mut frame: Bytes) -> Result<Self> {
        if frame.remaining() < 5 {
            return Err(Error::Protocol("incomplete message header".into()));
        }
        let msg_type = frame.get_u8();
        let len = frame.get_i32() as usize;
        if len < 4 || frame.remaining() < len - 4 {
            return Err(Error::Protocol("incomplete message body".into()));
        }
        let body = frame.split_to(len - 4);

        match msg_type {
            b'R' => Self::decode_auth(body),
            b'T' => Self::decode_row_description(body),
            b'D' => Self::decode_data_row(body),
            b'C' => {
                let mut body = body;
                let tag = read_cstring_bytes(&mut body)?;
                Ok(BackendMessage::CommandComplete { tag })
            }
            b'Z' => {
                let mut body = body;
                if body.remaining() < 1 {
                    return Err(Error::Protocol("empty ReadyForQuery".into()));
                }
                Ok(BackendMessage::ReadyForQuery {
                    status: TransactionStatus::from(body.get_u8()),
                })
            }
            b'E' => Ok(BackendMessage::ErrorResponse {
                fields: read_notice_fields(body)?,
            }),
            b'N' => Ok(BackendMessage::NoticeResponse {
                fields: read_notice_fields(body)?,
            }),
            b'S' => {
                let mut body = body;
                let name = read_cstring(&mut body)?;
                let value = read_cstring(&mut body)?;
                Ok(BackendMessage::ParameterStatus { name, value })
            }
            b'K' => {
                let mut body = body;
                if body.remaining() < 8 {
                    return Err(Error::Protocol("short BackendKeyData".into()));
                }
                Ok(BackendMessage::BackendKeyData {
                    process_id: body.get_u32(),
                    secret_key: body.get_u32(),
                })
            }
            b't' => {
                let mut body = body;
                if body.remaining() < 2 {
                    return Err(Error::Protocol("short ParameterDescription".into()));
                }
                let count = body.get_i16() as usize;
                if body.remaining() < count * 4 {
                    return Err(Error::Protocol("short ParameterDescription".into()));
                }
                let mut param_oids = Vec::with_capacity(count);
                for _ in 0..count {
                    param_oids.push(Oid(body.get_u32()));
                }
                Ok(BackendMessage::ParameterDescription { param_oids })
            }
            b'A' => {
                let mut body = body;
                if body.remaining() < 4 {
                    return Err(Error::Protocol("short NotificationResponse".into()));
                }
                let process_id = body.get_u32();
                let channel = read_cstring(&mut body)?;
                let payload = read_cstring(&mut body)?;
                Ok(BackendMessage::NotificationResponse {
                    process_id,
                    channel,
                    payload,
                })
            }
            b'1' => Ok(BackendMessage::ParseComplete),
            b'2' => Ok(BackendMessage::BindComplete),
            b'3' => Ok(BackendMessage::CloseComplete),
            b'I' => Ok(BackendMessage::EmptyQueryResponse),
            b'n' => Ok(BackendMessage::NoData),
            b's' => Ok(BackendMessage::PortalSuspended),
            other => Err(Error::Protocol(format!(
                "unknown message type: {:?}",
                other as char
            ))),
        }
    }

    fn decode_auth(mut body: Bytes) -> Result<Self> {
        if body.remaining() < 4 {
            return Err(Error::Protocol("short authentication message".into()));
        }
        match body.get_i32() {
            0 => Ok(BackendMessage::AuthenticationOk),
            3 => Ok(BackendMessage::AuthenticationCleartextPassword),
            5 => {
                if body.remaining() < 4 {
                    return Err(Error::Protocol("short MD5 salt".into()));
                }
                let mut salt = [0u8; 4];
                body.copy_to_slice(&mut salt);
                Ok(BackendMessage::AuthenticationMd5Password { salt })
            }
            10 => {
                let mut mechanisms = Vec::new();
                while body.remaining() > 0 && body[0] != 0 {
                    mechanisms.push(read_cstring(&mut body)?);
                }
                Ok(BackendMessage::AuthenticationSasl { mechanisms })
            }
            11 => Ok(BackendMessage::AuthenticationSaslContinue { data: body }),
            12 => Ok(BackendMessage::AuthenticationSaslFinal { data: body }),
            other => Err(Error::Protocol(format!(
                "unknown authentication type: {other}"
            ))),
        }
    }

    fn decode_row_description(mut body: Bytes) -> Result<Self> {
        if body.remaining() < 2 {
            return Err(Error::Protocol("short RowDescription".into()));
        }
        let count = body.get_i16() as usize;
        let mut fields = Vec::with_capacity(count);
        for _ in 0..count {
            let name = read_cstring(&mut body)?;
            if body.remaining() < 18 {
                return Err(Error::Protocol("short RowDescription field".into()));
            }
            fields.push(FieldDescription {
                name,
                table_oid: body.get_u32(),
                column_attr: body.get_i16(),
                type_oid: Oid(body.get_u32()),
                type_size: body.get_i16(),
                type_modifier: body.get_i32(),
                format: body.get_i16(),
            });
        }
        Ok(BackendMessage::RowDescription { fields })
    }

    fn decode_data_row(mut body: Bytes) -> Result<Self> {
        if body.remaining() < 2 {
            return Err(Error::Protocol("short DataRow".into()));
        }
        let count = body.get_i16() as usize;
        let mut values = Vec::with_capacity(count);
        for _ in 0..count {
            if body.remaining() < 4 {
                return Err(Error::Protocol("short DataRow column".into()));
            }
            let len = body.get_i32();
            if len < 0 {
                values.push(None);
            } else {
                let len = len as usize;
                if body.remaining() < len {
                    return Err(Error::Protocol("short DataRow column".into()));
                }
                values.push(Some(body.split_to(len)));
            }
        }
        Ok(BackendMessage::DataRow { values })
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Read a null-terminated string.
fn read_cstring(buf: &mut Bytes) -> Result<String> {
    let raw = read_cstring_bytes(buf)?;
    match std::str::from_utf8(&raw) {
        Ok(s) => Ok(s.to_owned()),
        Err(_) => Ok(String::from_utf8_lossy(&raw).into_owned()),
    }
}

/// Read a null-terminated byte string without copying.
fn read_cstring_bytes(buf: &mut Bytes) -> Result<Bytes> {
    let end = buf
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| Error::Protocol("missing null terminator in string".into()))?;
    let s = buf.split_to(end);
    buf.advance(1);
    Ok(s)
}

/// Read the tagged fields of an ErrorResponse or NoticeResponse.
fn read_notice_fields(mut body: Bytes) -> Result<HashMap<u8, String>> {
    let mut fields = HashMap::new();
    while body.remaining() > 0 {
        let tag = body.get_u8();
        if tag == 0 {
            break;
        }
        fields.insert(tag, read_cstring(&mut body)?);
    }
    Ok(fields)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode<M: FrontendMessage>(msg: &M) -> BytesMut {
        let mut buf = BytesMut::new();
        msg.encode(&mut buf);
        buf
    }

    #[test]
    fn startup_message_length_and_version() {
        let msg = StartupMessage {
            parameters: vec![
                ("user".into(), "test".into()),
                ("database".into(), "testdb".into()),
            ],
        };
        let buf = encode(&msg);

        let len = i32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        assert_eq!(len as usize, buf.len());
        let version = i32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        assert_eq!(version, PROTOCOL_VERSION);
        assert_eq!(buf[buf.len() - 1], 0);
    }

    #[test]
    fn ssl_request_is_eight_bytes() {
        let buf = encode(&SslRequest);
        assert_eq!(&buf[..], &[0, 0, 0, 8, 0x04, 0xd2, 0x16, 0x2f]);
    }

    #[test]
    fn parse_message_layout() {
        let msg = Parse {
            name: "pap_ps_0",
            query: "SELECT $1",
            param_oids: &[Oid::INT4],
        };
        let buf = encode(&msg);
        assert_eq!(buf[0], b'P');
        let len = i32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
        assert_eq!(len as usize, buf.len() - 1);
        // trailing: i16 count followed by one OID
        let n = buf.len();
        assert_eq!(&buf[n - 6..], &[0, 1, 0, 0, 0, 23]);
    }

    #[test]
    fn bind_message_null_and_value() {
        let raw = 7i32.to_be_bytes();
        let msg = Bind {
            statement: "pap_ps_0",
            param_formats: &[1, 1],
            param_values: &[Some(&raw), None],
            result_formats: &[1],
        };
        let buf = encode(&msg);
        assert_eq!(buf[0], b'B');
        let len = i32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
        assert_eq!(len as usize, buf.len() - 1);
        // the null parameter is encoded as length -1
        assert!(buf
            .windows(4)
            .any(|w| w == (-1i32).to_be_bytes()));
    }

    #[test]
    fn trailer_messages_are_fixed_size() {
        let mut buf = BytesMut::new();
        Describe { object_type: b'P', name: "" }.encode(&mut buf);
        Execute.encode(&mut buf);
        Sync.encode(&mut buf);
        // 1+4+1+1 describe, 1+4+1+4 execute, 1+4 sync
        assert_eq!(buf.len(), 22);
        assert_eq!(buf[0], b'D');
        assert_eq!(buf[7], b'E');
        assert_eq!(buf[17], b'S');
    }

    #[test]
    fn decode_row_description_roundtrip() {
        let mut frame = BytesMut::new();
        frame.put_u8(b'T');
        let body_at = frame.len();
        frame.put_i32(0);
        frame.put_i16(1);
        frame.put_slice(b"id\0");
        frame.put_u32(0); // table oid
        frame.put_i16(0); // attr
        frame.put_u32(23); // int4
        frame.put_i16(4);
        frame.put_i32(-1);
        frame.put_i16(1);
        let len = (frame.len() - body_at) as i32;
        frame[body_at..body_at + 4].copy_from_slice(&len.to_be_bytes());

        match BackendMessage::decode(frame.freeze()).unwrap() {
            BackendMessage::RowDescription { fields } => {
                assert_eq!(fields.len(), 1);
                assert_eq!(fields[0].name, "id");
                assert_eq!(fields[0].type_oid, Oid::INT4);
                assert_eq!(fields[0].format, 1);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn decode_data_row_with_null() {
        let mut frame = BytesMut::new();
        frame.put_u8(b'D');
        let body_at = frame.len();
        frame.put_i32(0);
        frame.put_i16(2);
        frame.put_i32(4);
        frame.put_i32(7);
        frame.put_i32(-1);
        let len = (frame.len() - body_at) as i32;
        frame[body_at..body_at + 4].copy_from_slice(&len.to_be_bytes());

        match BackendMessage::decode(frame.freeze()).unwrap() {
            BackendMessage::DataRow { values } => {
                assert_eq!(values.len(), 2);
                assert_eq!(values[0].as_deref(), Some(&7i32.to_be_bytes()[..]));
                assert!(values[1].is_none());
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn decode_error_response_fields() {
        let mut frame = BytesMut::new();
        frame.put_u8(b'E');
        let body_at = frame.len();
        frame.put_i32(0);
        frame.put_slice(b"SERROR\0C22012\0Mdivision by zero\0\0");
        let len = (frame.len() - body_at) as i32;
        frame[body_at..body_at + 4].copy_from_slice(&len.to_be_bytes());

        match BackendMessage::decode(frame.freeze()).unwrap() {
            BackendMessage::ErrorResponse { fields } => {
                assert_eq!(fields[&b'S'], "ERROR");
                assert_eq!(fields[&b'C'], "22012");
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn decode_single_byte_messages() {
        for (tag, check) in [
            (b'1', (|m: &BackendMessage| matches!(m, BackendMessage::ParseComplete)) as fn(&BackendMessage) -> bool),
            (b'2', |m: &BackendMessage| matches!(m, BackendMessage::BindComplete)),
            (b'I', |m: &BackendMessage| matches!(m, BackendMessage::EmptyQueryResponse)),
            (b'n', |m: &BackendMessage| matches!(m, BackendMessage::NoData)),
        ] {
            let mut frame = BytesMut::new();
            frame.put_u8(tag);
            frame.put_i32(4);
            let msg = BackendMessage::decode(frame.freeze()).unwrap();
            assert!(check(&msg), "tag {:?} decoded to {msg:?}", tag as char);
        }
    }
}
