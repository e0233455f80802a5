//! The recyclable unit of work.
//!
//! A [`Query`] is allocated once at pool start and lives forever; its
//! buffers are truncated and reused on every execution instead of freed.
//! Ownership moves with the completion latch: the submitter holds the query
//! until it is dispatched, the worker holds it until the latch is released,
//! and the submitter's completion handle holds it again until `close`
//! returns it to the empty channel. Freshness is bounded by a wall-clock
//! TTL; a query reclaimed past the TTL surfaces `ResultNotActual` to a late
//! caller.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use smallvec::SmallVec;
use tokio::sync::Semaphore;

use crate::error::{Error, Result};
use crate::statement::Description;
use crate::types::{FromRow, Oid, PgValue, Row, TypeRegistry};

/// Upper bound of the wire's 16-bit parameter count.
pub(crate) const MAX_ARGS: usize = 65_535;

/// Byte range of one encoded parameter inside the scratch buffer, or a
/// null-coded parameter.
pub(crate) type ParamRange = Option<(usize, usize)>;

/// Outcome of one command: the concatenated row bytes, the command tag, and
/// the first error observed (sticky).
#[derive(Debug, Default)]
pub struct QueryResult {
    /// Row-major flat sequence, `rows x columns` entries; `None` is NULL.
    pub row_values: Vec<Option<Bytes>>,
    pub command_tag: CommandTag,
    pub err: Option<Error>,
    pub command_concluded: bool,
}

impl QueryResult {
    fn reset(&mut self) {
        self.row_values.clear();
        self.command_tag = CommandTag::default();
        self.err = None;
        self.command_concluded = false;
    }

    /// Record the outcome of the current command. The first error sticks
    /// even when it arrives after CommandComplete; the tag of a command that
    /// already concluded is left alone. Draining continues until
    /// ReadyForQuery flips `command_concluded`.
    pub(crate) fn conclude(&mut self, tag: Option<CommandTag>, err: Option<Error>) {
        if let Some(err) = err {
            if self.err.is_none() {
                self.err = Some(err);
            }
        }
        if self.command_concluded {
            return;
        }
        if let Some(tag) = tag {
            self.command_tag = tag;
        }
    }
}

/// Mutable per-execution state, owned by whoever currently holds the query.
#[derive(Debug, Default)]
pub(crate) struct QueryState {
    pub sql: String,
    pub args: SmallVec<[PgValue; 16]>,
    pub param_formats: SmallVec<[i16; 16]>,
    pub param_values: SmallVec<[ParamRange; 16]>,
    pub param_value_bytes: Vec<u8>,
    pub description: Option<Arc<Description>>,
    pub result: QueryResult,
}

/// A preallocated, recyclable query.
#[derive(Debug)]
pub struct Query {
    pub(crate) state: Mutex<QueryState>,
    /// Single-permit completion latch: taken by the submitter, released by
    /// the worker, retaken by the completion handle, released by `close`.
    latch: Semaphore,
    /// Monotonic start stamp, nanoseconds since the pool epoch.
    start_nanos: AtomicU64,
    /// Set when a completion handle has read the result; freezes the record
    /// against TTL reclamation until the next `begin`.
    used: AtomicBool,
    epoch: Instant,
    ttl: Duration,
    empty_return: flume::Sender<Arc<Query>>,
    registry: Arc<TypeRegistry>,
}

impl Query {
    pub(crate) fn new(
        epoch: Instant,
        ttl: Duration,
        empty_return: flume::Sender<Arc<Query>>,
        registry: Arc<TypeRegistry>,
    ) -> Arc<Query> {
        Arc::new(Query {
            state: Mutex::new(QueryState {
                args: SmallVec::new(),
                param_formats: SmallVec::new(),
                param_values: SmallVec::new(),
                param_value_bytes: Vec::with_capacity(512),
                ..QueryState::default()
            }),
            latch: Semaphore::new(1),
            start_nanos: AtomicU64::new(0),
            used: AtomicBool::new(false),
            epoch,
            ttl,
            empty_return,
            registry,
        })
    }

    /// Reset all derived state and load a new execution. Only `begin`
    /// clears buffers; the TTL reclaimer never touches them, so a stale
    /// completion handle can still observe (and reject) the old record.
    pub(crate) fn begin(&self, sql: &str, args: &[PgValue], description: Option<Arc<Description>>) {
        let mut state = self.state.lock();
        state.sql.clear();
        state.sql.push_str(sql);
        state.args.clear();
        state.args.extend(args.iter().cloned());
        state.param_formats.clear();
        state.param_values.clear();
        state.param_value_bytes.clear();
        state.description = description;
        state.result.reset();
        drop(state);

        self.used.store(false, Ordering::Relaxed);
        self.start_nanos
            .store(self.epoch.elapsed().as_nanos() as u64, Ordering::Relaxed);
    }

    pub(crate) fn set_description(&self, description: Arc<Description>) {
        self.state.lock().description = Some(description);
    }

    pub(crate) fn description(&self) -> Option<Arc<Description>> {
        self.state.lock().description.clone()
    }

    /// Choose the format code for argument `i` and append its encoding to
    /// the shared scratch buffer, recording the byte range (or NULL).
    pub(crate) fn append_param(&self, i: usize) -> Result<()> {
        let mut state = self.state.lock();
        let state = &mut *state;

        let oid = state
            .description
            .as_ref()
            .map(|d| d.param_oids.read().get(i).copied().unwrap_or(Oid::UNKNOWN))
            .unwrap_or(Oid::UNKNOWN);

        let arg = &state.args[i];
        let format = arg
            .preferred_format()
            .unwrap_or_else(|| self.registry.param_format_for(oid));
        state.param_formats.push(format.code());

        let range = arg
            .encode(format, &mut state.param_value_bytes)
            .map_err(|e| match e {
                Error::Serialization(msg) => Error::Serialization(format!(
                    "cannot encode argument {i} for oid {}: {msg}",
                    oid.0
                )),
                other => other,
            })?;
        state.param_values.push(range);
        Ok(())
    }

    /// Encode every argument. Called by the submitter after the description
    /// is known.
    pub(crate) fn encode_params(&self) -> Result<()> {
        let count = self.state.lock().args.len();
        for i in 0..count {
            self.append_param(i)?;
        }
        Ok(())
    }

    /// Decode the buffered rows into `dest`, extending it by one element per
    /// row. Builds the per-column scan plans on first use. A sticky
    /// execution error is surfaced before any decoding.
    pub(crate) fn scan<T: FromRow>(&self, dest: &mut Vec<T>) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(err) = state.result.err.take() {
            return Err(err);
        }
        let Some(description) = state.description.clone() else {
            return Ok(());
        };

        let fields = description.fields.read();
        let columns = fields.len();
        if columns == 0 {
            return Ok(());
        }
        let rows = state.result.row_values.len() / columns;

        let plans = description.scan_plans.get_or_init(|| {
            fields
                .iter()
                .map(|f| self.registry.plan_scan(f.type_oid, f.format))
                .collect()
        });

        dest.reserve(rows);
        for r in 0..rows {
            let row = Row {
                values: &state.result.row_values[r * columns..(r + 1) * columns],
                plans,
            };
            dest.push(T::from_row(&row)?);
        }
        Ok(())
    }

    /// Whether the buffered result is still readable: younger than the TTL,
    /// or already read by a completion handle.
    pub(crate) fn actual(&self) -> bool {
        if self.used.load(Ordering::Relaxed) {
            return true;
        }
        let now = self.epoch.elapsed().as_nanos() as u64;
        let started = self.start_nanos.load(Ordering::Relaxed);
        now.saturating_sub(started) < self.ttl.as_nanos() as u64
    }

    /// Block until the worker (or a previous holder) releases the latch.
    pub(crate) async fn acquire_latch(&self) -> Result<()> {
        match self.latch.acquire().await {
            Ok(permit) => {
                permit.forget();
                Ok(())
            }
            Err(_) => Err(Error::Closed),
        }
    }

    /// Release the latch without recycling; the worker's "result is ready"
    /// signal.
    pub(crate) fn release_latch(&self) {
        self.latch.add_permits(1);
    }

    /// Mark the result read, release the latch, and return the query to the
    /// empty channel.
    pub(crate) fn close(self: &Arc<Self>) {
        self.used.store(true, Ordering::Relaxed);
        self.release_latch();
        self.force_return();
    }

    /// Push the query back onto the empty channel. A full channel means
    /// every slot already has an entry, so the send may be dropped.
    pub(crate) fn force_return(self: &Arc<Self>) {
        let _ = self.empty_return.try_send(Arc::clone(self));
    }

    pub(crate) fn take_err(&self) -> Result<()> {
        match self.state.lock().result.err.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

// ============================================================================
// Command tag
// ============================================================================

/// The byte string terminating a successful command, e.g. `SELECT 3` or
/// `INSERT 0 7`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandTag(Bytes);

impl CommandTag {
    pub fn new(tag: Bytes) -> Self {
        CommandTag(tag)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// The trailing decimal suffix of the tag; 0 when the command does not
    /// report a row count (e.g. `CREATE TABLE`).
    pub fn rows_affected(&self) -> u64 {
        let digits = self
            .0
            .iter()
            .rev()
            .take_while(|b| b.is_ascii_digit())
            .count();
        self.0[self.0.len() - digits..]
            .iter()
            .fold(0u64, |n, b| n * 10 + u64::from(b - b'0'))
    }

    pub fn is_insert(&self) -> bool {
        self.0.starts_with(b"INSERT")
    }

    pub fn is_update(&self) -> bool {
        self.0.starts_with(b"UPDATE")
    }

    pub fn is_delete(&self) -> bool {
        self.0.starts_with(b"DELETE")
    }

    pub fn is_select(&self) -> bool {
        self.0.starts_with(b"SELECT")
    }
}

impl std::fmt::Display for CommandTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

// ============================================================================
// Completion handle
// ============================================================================

enum Pending {
    /// The submission failed before reaching the network.
    Failed(Error),
    /// The query is in flight; the worker releases the latch when the
    /// result is buffered.
    Submitted(Arc<Query>),
}

/// Handle returned by `Pool::query_async`; awaiting [`fetch`] blocks until
/// the result arrives and decodes the rows.
///
/// [`fetch`]: PendingQuery::fetch
#[must_use = "the query result is only read when fetch is awaited"]
pub struct PendingQuery {
    inner: Pending,
}

impl PendingQuery {
    pub(crate) fn failed(err: Error) -> Self {
        PendingQuery {
            inner: Pending::Failed(err),
        }
    }

    pub(crate) fn submitted(query: Arc<Query>) -> Self {
        PendingQuery {
            inner: Pending::Submitted(query),
        }
    }

    /// Wait for the result and decode every row into `dest`, extending it.
    ///
    /// Returns `ResultNotActual` when the query outlived the freshness TTL
    /// and was reclaimed before this call.
    pub async fn fetch<T: FromRow>(self, dest: &mut Vec<T>) -> Result<()> {
        match self.inner {
            Pending::Failed(err) => Err(err),
            Pending::Submitted(query) => {
                query.acquire_latch().await?;
                let out = if !query.actual() {
                    Err(Error::ResultNotActual)
                } else {
                    query.scan(dest)
                };
                query.close();
                out
            }
        }
    }

    /// Wait for completion of a statement that returns no rows; yields the
    /// number of rows the command affected.
    pub async fn exec(self) -> Result<u64> {
        match self.inner {
            Pending::Failed(err) => Err(err),
            Pending::Submitted(query) => {
                query.acquire_latch().await?;
                let out = if !query.actual() {
                    Err(Error::ResultNotActual)
                } else {
                    query
                        .take_err()
                        .map(|_| query.state.lock().result.command_tag.rows_affected())
                };
                query.close();
                out
            }
        }
    }
}
