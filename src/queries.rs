//! The preallocated query ring and its TTL recycler.
//!
//! All query objects are created up front and cycled through a bounded
//! empty channel. A ticker with the freshness TTL as its period sweeps the
//! ring whenever the free list runs low and force-returns every query whose
//! result aged out without being read; an abandoning caller therefore
//! unblocks the pool within one TTL period.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::query::Query;
use crate::types::TypeRegistry;

#[derive(Debug)]
pub(crate) struct QueryPool {
    list: Vec<Arc<Query>>,
    empty_rx: flume::Receiver<Arc<Query>>,
    ttl: Duration,
}

impl QueryPool {
    pub(crate) fn new(count: usize, ttl: Duration, registry: Arc<TypeRegistry>) -> QueryPool {
        let epoch = Instant::now();
        let (empty_tx, empty_rx) = flume::bounded(count);
        let list: Vec<Arc<Query>> = (0..count)
            .map(|_| Query::new(epoch, ttl, empty_tx.clone(), registry.clone()))
            .collect();
        for query in &list {
            // capacity equals the ring size, so priming cannot fill up
            let _ = empty_tx.try_send(Arc::clone(query));
        }
        QueryPool {
            list,
            empty_rx,
            ttl,
        }
    }

    /// Receive one ready-to-reuse query, waiting if none is free.
    pub(crate) async fn acquire(&self) -> Result<Arc<Query>> {
        self.empty_rx.recv_async().await.map_err(|_| Error::Closed)
    }

    #[cfg(test)]
    pub(crate) fn free(&self) -> usize {
        self.empty_rx.len()
    }

    /// Spawn the reclaimer task.
    pub(crate) fn spawn_recycler(&self) {
        let list = self.list.clone();
        let empty_rx = self.empty_rx.clone();
        let ttl = self.ttl;
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + ttl;
            let mut ticker = tokio::time::interval_at(start, ttl);
            loop {
                ticker.tick().await;
                if empty_rx.is_disconnected() {
                    return;
                }
                if empty_rx.len() >= list.len() / 4 {
                    continue;
                }
                let mut reclaimed = 0usize;
                for query in &list {
                    if !query.actual() {
                        query.force_return();
                        reclaimed += 1;
                    }
                }
                if reclaimed > 0 {
                    tracing::debug!(reclaimed, free = empty_rx.len(), "recycler swept query ring");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Arc<TypeRegistry> {
        Arc::new(TypeRegistry::new())
    }

    #[tokio::test]
    async fn ring_is_primed_with_every_slot() {
        let pool = QueryPool::new(8, Duration::from_secs(500), registry());
        assert_eq!(pool.free(), 8);
        let q = pool.acquire().await.unwrap();
        assert_eq!(pool.free(), 7);
        q.force_return();
        assert_eq!(pool.free(), 8);
    }

    #[tokio::test]
    async fn acquired_query_is_clean_after_begin() {
        let pool = QueryPool::new(2, Duration::from_secs(500), registry());
        let q = pool.acquire().await.unwrap();
        q.begin("SELECT 1", &[], None);
        let state = q.state.lock();
        assert!(state.args.is_empty());
        assert!(state.param_values.is_empty());
        assert!(state.param_value_bytes.is_empty());
        assert!(state.param_formats.is_empty());
        assert!(state.result.row_values.is_empty());
        assert!(state.result.err.is_none());
    }

    #[tokio::test]
    async fn recycler_returns_abandoned_queries() {
        let ttl = Duration::from_millis(50);
        let pool = QueryPool::new(8, ttl, registry());
        pool.spawn_recycler();

        // drain past the quarter threshold and abandon the queries
        let mut held = Vec::new();
        for _ in 0..7 {
            let q = pool.acquire().await.unwrap();
            q.acquire_latch().await.unwrap();
            q.begin("SELECT pg_sleep(3600)", &[], None);
            held.push(q);
        }
        assert_eq!(pool.free(), 1);

        // within a few TTL periods the sweep puts them back
        let deadline = Instant::now() + Duration::from_secs(2);
        while pool.free() < 8 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(pool.free(), 8);

        // the abandoning callers' completion handles see a stale record
        for q in &held {
            assert!(!q.actual());
        }
    }

    #[tokio::test]
    async fn recycler_skips_when_free_list_is_healthy() {
        let ttl = Duration::from_millis(50);
        let pool = QueryPool::new(8, ttl, registry());
        pool.spawn_recycler();

        let q = pool.acquire().await.unwrap();
        q.begin("SELECT 1", &[], None);
        // 7 of 8 free is above the quarter threshold; nothing is reclaimed
        tokio::time::sleep(ttl * 3).await;
        assert_eq!(pool.free(), 7);
        drop(q);
    }
}
