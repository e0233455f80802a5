//! Prepared statement descriptions and the pool-wide cache.
//!
//! Every SQL text submitted to the pool is promoted to a named prepared
//! statement exactly once; the resulting [`Description`] is shared by all
//! queries for that SQL and by every connection the statement was replicated
//! to.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock as SyncRwLock;
use tokio::sync::RwLock;

use crate::protocol::FieldDescription;
use crate::types::{Oid, ScanPlan, TypeRegistry};

/// Statement-name prefix for cached statements; the suffix is the cache size
/// at insertion time.
pub(crate) const STATEMENT_NAME_PREFIX: &str = "pap_ps_";

/// The per-SQL schema record.
///
/// `name` and the parameter/field vectors are filled during the first
/// preparation round. `result_formats` is materialized immediately after
/// that round and never mutated; `scan_plans` is built lazily on the first
/// successful scan. Field descriptions are replaced whenever an execution
/// sees a RowDescription, so they track the live server schema.
#[derive(Debug, Default)]
pub struct Description {
    /// Server-side statement name; empty for the unnamed statement.
    pub name: String,
    pub(crate) param_oids: SyncRwLock<Vec<Oid>>,
    pub(crate) fields: SyncRwLock<Vec<FieldDescription>>,
    pub(crate) result_formats: OnceLock<Vec<i16>>,
    pub(crate) scan_plans: OnceLock<Vec<ScanPlan>>,
}

impl Description {
    pub(crate) fn named(name: String) -> Arc<Description> {
        Arc::new(Description {
            name,
            ..Description::default()
        })
    }

    /// An anonymous description for unnamed-statement round trips.
    pub(crate) fn unnamed() -> Arc<Description> {
        Arc::new(Description::default())
    }

    pub fn param_oids(&self) -> Vec<Oid> {
        self.param_oids.read().clone()
    }

    pub fn field_count(&self) -> usize {
        self.fields.read().len()
    }

    pub(crate) fn result_formats(&self) -> &[i16] {
        self.result_formats.get().map(Vec::as_slice).unwrap_or(&[])
    }

    /// Fill `result_formats` from the field descriptions by asking the
    /// registry for each column's preferred result format. First caller
    /// wins; later calls are no-ops.
    pub(crate) fn materialize_result_formats(&self, registry: &TypeRegistry) {
        self.result_formats.get_or_init(|| {
            self.fields
                .read()
                .iter()
                .map(|f| registry.result_format_for(f.type_oid).code())
                .collect()
        });
    }
}

/// SQL text -> [`Description`] map guarded by a reader/writer lock.
///
/// Entries are created lazily and never evicted. The lock is async because
/// a writer holds it across the prepare round-trip; concurrent submissions
/// of a new SQL serialize here and re-check membership after acquiring the
/// writer half.
#[derive(Debug)]
pub(crate) struct PreparedCache {
    pub(crate) entries: RwLock<HashMap<String, Arc<Description>>>,
}

impl PreparedCache {
    pub(crate) fn new() -> Self {
        PreparedCache {
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub(crate) async fn get(&self, sql: &str) -> Option<Arc<Description>> {
        self.entries.read().await.get(sql).cloned()
    }

    pub(crate) async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// The name a statement inserted now would receive.
    pub(crate) fn name_for(size: usize) -> String {
        format!("{STATEMENT_NAME_PREFIX}{size}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Format;

    fn field(name: &str, oid: Oid) -> FieldDescription {
        FieldDescription {
            name: name.to_string(),
            table_oid: 0,
            column_attr: 0,
            type_oid: oid,
            type_size: 0,
            type_modifier: -1,
            format: Format::Binary.code(),
        }
    }

    #[test]
    fn statement_names_follow_cache_size() {
        assert_eq!(PreparedCache::name_for(0), "pap_ps_0");
        assert_eq!(PreparedCache::name_for(17), "pap_ps_17");
    }

    #[test]
    fn result_formats_materialize_once() {
        let registry = TypeRegistry::new();
        let desc = Description::named("pap_ps_0".to_string());
        *desc.fields.write() = vec![field("id", Oid::INT4), field("name", Oid::TEXT)];

        desc.materialize_result_formats(&registry);
        assert_eq!(desc.result_formats(), &[1, 0]);

        // a later field change must not alter the materialized formats
        *desc.fields.write() = vec![field("id", Oid::TEXT)];
        desc.materialize_result_formats(&registry);
        assert_eq!(desc.result_formats(), &[1, 0]);
    }

    #[tokio::test]
    async fn cache_is_insert_once() {
        let cache = PreparedCache::new();
        assert!(cache.get("SELECT 1").await.is_none());

        let name = PreparedCache::name_for(cache.len().await);
        let desc = Description::named(name);
        cache
            .entries
            .write()
            .await
            .insert("SELECT 1".to_string(), desc.clone());

        let found = cache.get("SELECT 1").await.expect("entry inserted");
        assert!(Arc::ptr_eq(&found, &desc));
        assert_eq!(found.name, "pap_ps_0");
        assert_eq!(cache.len().await, 1);
    }
}
