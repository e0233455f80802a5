//! The pool front door.
//!
//! `Pool::start` builds the fixed worker set, preallocates the query ring,
//! brings an initial batch of connections online, and spawns the dispatcher
//! that pairs submitted queries with ready workers. `query_async` is the
//! submission path: acquire a recycled query, resolve its prepared-statement
//! description (preparing and replicating it on first sight), encode the
//! arguments, and hand the query to the dispatcher.

use std::env;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;

use crate::config::Config;
use crate::connection::{
    Command, Worker, STATUS_CLOSED, STATUS_UNINITIALIZED,
};
use crate::error::{Error, Result};
use crate::queries::QueryPool;
use crate::query::{PendingQuery, Query, MAX_ARGS};
use crate::statement::{Description, PreparedCache};
use crate::types::{PgValue, TypeRegistry};

/// Fixed worker set size.
pub(crate) const WORKER_COUNT: usize = 128;
/// Connections brought online at start.
pub(crate) const INITIAL_CONNECTIONS: usize = 10;
/// Per-worker inbound command queue depth.
pub(crate) const COMMAND_QUEUE_DEPTH: usize = 16;
/// Preallocated query ring size.
pub(crate) const QUERY_POOL_SIZE: usize = 1024;

const DEFAULT_RESULT_SAVE_DURATION: Duration = Duration::from_secs(500);

/// The freshness TTL for buffered query results;
/// `PAP_MAX_RESULT_SAVE_DURATION_IN_SECONDS` overrides the 500 s default.
pub(crate) fn max_result_save_duration() -> Duration {
    env::var("PAP_MAX_RESULT_SAVE_DURATION_IN_SECONDS")
        .ok()
        .and_then(|raw| raw.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_RESULT_SAVE_DURATION)
}

#[derive(Debug)]
pub(crate) struct WorkerHandle {
    pub(crate) commands: flume::Sender<Command>,
    pub(crate) status: Arc<AtomicU8>,
}

impl WorkerHandle {
    /// Status hint for the prepare fan-out; relaxed loads, stale values
    /// tolerated.
    pub(crate) fn online_hint(&self) -> bool {
        let status = self.status.load(Ordering::Relaxed);
        status != STATUS_UNINITIALIZED && status != STATUS_CLOSED
    }
}

#[derive(Debug)]
struct PoolInner {
    workers: Vec<WorkerHandle>,
    cache: PreparedCache,
    queries: QueryPool,
    dispatch_tx: flume::Sender<Arc<Query>>,
    ready_rx: flume::Receiver<usize>,
    registry: Arc<TypeRegistry>,
}

/// A concurrent client pool for a PostgreSQL server.
#[derive(Clone, Debug)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    /// Build a pool from a connection string (URL or keyword/value DSN) and
    /// bring the initial connections online. Fails when the string does not
    /// parse or when no connection could be established.
    pub async fn start(conn_string: &str) -> Result<Pool> {
        let config = Config::parse(conn_string)?;
        Pool::start_with(config).await
    }

    /// Build a pool from parsed settings.
    pub async fn start_with(config: Config) -> Result<Pool> {
        let registry = Arc::new(TypeRegistry::new());
        let ttl = max_result_save_duration();

        let queries = QueryPool::new(QUERY_POOL_SIZE, ttl, registry.clone());
        queries.spawn_recycler();

        let (ready_tx, ready_rx) = flume::bounded(WORKER_COUNT);
        let (dispatch_tx, dispatch_rx) = flume::bounded::<Arc<Query>>(WORKER_COUNT);

        let mut workers = Vec::with_capacity(WORKER_COUNT);
        let mut command_senders = Vec::with_capacity(WORKER_COUNT);
        for index in 0..WORKER_COUNT {
            let (command_tx, command_rx) = flume::bounded(COMMAND_QUEUE_DEPTH);
            let status = Arc::new(AtomicU8::new(STATUS_UNINITIALIZED));
            Worker::spawn(index, status.clone(), command_rx, ready_tx.clone());
            command_senders.push(command_tx.clone());
            workers.push(WorkerHandle {
                commands: command_tx,
                status,
            });
        }

        // bring the initial batch online; a failed connect is fatal to its
        // worker, the pool itself fails only when nothing came up
        let mut acks = Vec::with_capacity(INITIAL_CONNECTIONS);
        for worker in workers.iter().take(INITIAL_CONNECTIONS) {
            let (done, ack) = oneshot::channel();
            worker
                .commands
                .send_async(Command::Connect {
                    config: Box::new(config.clone()),
                    done,
                })
                .await
                .map_err(|_| Error::Closed)?;
            acks.push(ack);
        }
        let mut online = 0usize;
        let mut first_err = None;
        for ack in acks {
            match ack.await {
                Ok(Ok(())) => online += 1,
                Ok(Err(err)) => {
                    if first_err.is_none() {
                        first_err = Some(err);
                    }
                }
                Err(_) => {}
            }
        }
        if online == 0 {
            return Err(first_err.unwrap_or(Error::Closed));
        }
        tracing::debug!(online, total = WORKER_COUNT, "pool started");

        tokio::spawn(dispatch(dispatch_rx, ready_rx.clone(), command_senders));

        Ok(Pool {
            inner: Arc::new(PoolInner {
                workers,
                cache: PreparedCache::new(),
                queries,
                dispatch_tx,
                ready_rx,
                registry,
            }),
        })
    }

    /// Submit a query. The returned handle resolves to the decoded rows once
    /// awaited; every failure mode is deferred onto the handle so the
    /// submission itself never fails.
    pub async fn query_async(&self, sql: &str, args: &[PgValue]) -> PendingQuery {
        if !check_args(args.len()) {
            return PendingQuery::failed(Error::ArgsLimit);
        }

        let query = match self.inner.queries.acquire().await {
            Ok(query) => query,
            Err(err) => return PendingQuery::failed(err),
        };
        if let Err(err) = query.acquire_latch().await {
            query.force_return();
            return PendingQuery::failed(err);
        }
        query.begin(sql, args, None);

        let description = match self.check_description(sql).await {
            Ok(description) => description,
            Err(err) => {
                query.close();
                return PendingQuery::failed(err);
            }
        };
        query.set_description(description);

        if let Err(err) = query.encode_params() {
            query.close();
            return PendingQuery::failed(err);
        }

        if self.inner.dispatch_tx.send_async(query.clone()).await.is_err() {
            query.close();
            return PendingQuery::failed(Error::Closed);
        }
        PendingQuery::submitted(query)
    }

    /// Number of distinct SQL texts promoted to prepared statements.
    pub async fn prepared_statements(&self) -> usize {
        self.inner.cache.len().await
    }

    /// Look the SQL up in the prepared cache; on miss, take the writer half,
    /// re-check membership, and run the preparation round. The cache is
    /// populated only after the primary prepare succeeds.
    async fn check_description(&self, sql: &str) -> Result<Arc<Description>> {
        if let Some(description) = self.inner.cache.get(sql).await {
            return Ok(description);
        }

        let mut entries = self.inner.cache.entries.write().await;
        if let Some(description) = entries.get(sql) {
            return Ok(description.clone());
        }

        let description = Description::named(PreparedCache::name_for(entries.len()));
        self.prepare(sql, &description).await?;
        entries.insert(sql.to_string(), description.clone());
        Ok(description)
    }

    /// Prepare `sql` on one ready worker and replicate the statement to
    /// every other online worker so later executions succeed anywhere. The
    /// fan-out is fire-and-forget; only the primary worker's outcome
    /// decides.
    async fn prepare(&self, sql: &str, description: &Arc<Description>) -> Result<()> {
        let inner = &self.inner;

        let primary = inner.queries.acquire().await?;
        primary.acquire_latch().await?;
        primary.begin(sql, &[], Some(description.clone()));

        let chosen = inner
            .ready_rx
            .recv_async()
            .await
            .map_err(|_| Error::Closed)?;
        inner.workers[chosen]
            .commands
            .send_async(Command::Prepare(primary.clone()))
            .await
            .map_err(|_| Error::Closed)?;

        for (index, worker) in inner.workers.iter().enumerate() {
            if index == chosen || !worker.online_hint() {
                continue;
            }
            let replica = inner.queries.acquire().await?;
            replica.acquire_latch().await?;
            replica.begin(sql, &[], Some(description.clone()));
            if worker
                .commands
                .send_async(Command::PrepareAsync(replica.clone()))
                .await
                .is_err()
            {
                replica.close();
            }
        }

        // the worker releases the latch once ReadyForQuery arrives
        primary.acquire_latch().await?;
        let outcome = if !primary.actual() {
            Err(Error::ResultNotActual)
        } else {
            description.materialize_result_formats(&inner.registry);
            primary.take_err()
        };
        primary.close();
        outcome
    }
}

/// Upper bound of the wire's 16-bit argument count.
fn check_args(len: usize) -> bool {
    len <= MAX_ARGS
}

/// Pair each submitted query with a ready worker. The pair-up guarantees no
/// query waits behind a busy connection.
async fn dispatch(
    dispatch_rx: flume::Receiver<Arc<Query>>,
    ready_rx: flume::Receiver<usize>,
    command_senders: Vec<flume::Sender<Command>>,
) {
    loop {
        let query = match dispatch_rx.recv_async().await {
            Ok(query) => query,
            Err(_) => return,
        };
        let index = match ready_rx.recv_async().await {
            Ok(index) => index,
            Err(_) => return,
        };
        if command_senders[index]
            .send_async(Command::PreparedQuery(query))
            .await
            .is_err()
        {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_limit_boundary() {
        assert!(check_args(0));
        assert!(check_args(MAX_ARGS));
        assert!(!check_args(MAX_ARGS + 1));
    }

    #[test]
    fn ttl_env_override() {
        env::remove_var("PAP_MAX_RESULT_SAVE_DURATION_IN_SECONDS");
        assert_eq!(max_result_save_duration(), Duration::from_secs(500));

        env::set_var("PAP_MAX_RESULT_SAVE_DURATION_IN_SECONDS", "7");
        assert_eq!(max_result_save_duration(), Duration::from_secs(7));

        env::set_var("PAP_MAX_RESULT_SAVE_DURATION_IN_SECONDS", "soon");
        assert_eq!(max_result_save_duration(), Duration::from_secs(500));

        env::remove_var("PAP_MAX_RESULT_SAVE_DURATION_IN_SECONDS");
    }
}
