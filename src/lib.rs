//! A concurrent client pool for PostgreSQL built for high-throughput
//! extended-query workloads.
//!
//! The pool pushes per-query cost off the hot path:
//! - a fixed set of long-lived connections, each driven by a dedicated
//!   worker task that owns the socket and its buffers;
//! - a preallocated ring of recyclable query objects whose byte buffers are
//!   truncated and reused instead of freed, with a wall-clock TTL bounding
//!   how long a buffered result stays readable;
//! - a prepared-statement cache that promotes every submitted SQL text to a
//!   named server-side statement exactly once and replicates it to every
//!   online connection.
//!
//! Architecture:
//! - `protocol`: wire-level message encoding/decoding
//! - `types`: type registry, value encoding, scan plans
//! - `connection`: per-connection worker and startup/auth dialog
//! - `statement`: descriptions and the prepared-statement cache
//! - `query`: the recyclable query object and completion handle
//! - `queries`: the query ring and its TTL recycler
//! - `pool`: dispatch and the public entry points
//! - `config`: connection-string, environment, and pgpass resolution
//!
//! ```no_run
//! use pap::{Pool, PgValue};
//!
//! # async fn demo() -> pap::Result<()> {
//! let pool = Pool::start("postgres://app@localhost/app").await?;
//! let pending = pool
//!     .query_async(
//!         "select id, title from goods where brand_id = $1",
//!         &[PgValue::Int4(7)],
//!     )
//!     .await;
//! let mut rows: Vec<(i32, String)> = Vec::new();
//! pending.fetch(&mut rows).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
mod connection;
pub mod error;
pub mod pool;
pub mod protocol;
mod queries;
pub mod query;
pub mod scram;
pub mod statement;
mod tls;
pub mod types;


pub use config::{Config, SslMode, TargetSessionAttrs};
pub use error::{Error, PgError, Result};
pub use pool::Pool;
pub use query::{CommandTag, PendingQuery};
pub use statement::Description;
pub use types::{FromPg, FromRow, Oid, PgValue, Row, TypeRegistry};

/// Build a [`Pool`] from a PostgreSQL connection string.
pub async fn start(conn_string: &str) -> Result<Pool> {
    Pool::start(conn_string).await
}
