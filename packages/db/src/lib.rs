//! Storage drivers for the job queue system.
//!
//! A [`Driver`] persists jobs and arbitrates which owner may work on them.
//! Three implementations are provided:
//!
//! - [`InternalDriver`]: in-memory, oldest job first
//! - [`PriorityDriver`]: in-memory, highest priority first
//! - [`SurrealDriver`]: durable, backed by SurrealDB
//!
//! # Features
//!
//! - `memory` (default): SurrealDB in-memory engine (`mem://`)
//! - `rocksdb`: Use RocksDB for persistent file-based storage

mod connection;
mod driver;
mod memory;
mod schema;
mod surreal;

pub use connection::{Database, DbConfig, connect_db};
pub use driver::{Driver, DriverError, DriverOptions};
pub use memory::{ByPriority, DispatchOrder, Fifo, InternalDriver, MemoryDriver, PriorityDriver};
pub use schema::init_schema;
pub use surreal::SurrealDriver;
