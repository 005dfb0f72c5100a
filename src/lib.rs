//! framestore: a transactional update engine for frame-partitioned video
//! datasets
//!
//! A video dataset is an ordered sequence of frames split into fixed-size
//! groups. Transactions apply named frame operations (invert, grayscale,
//! contrast, ...) over frame ranges; the engine makes them atomic, durable,
//! and recoverable across process crashes with an ARIES-style write-ahead
//! log.
//!
//! ## Pieces
//!
//! - [`storage::PageStore`] persists and iterates frame groups
//! - [`buffer::BufferManager`] caches groups with LRU eviction and tags
//!   every row with the LSN of the last update applied to it
//! - [`wal::LogManager`] owns the append-only log, rollback with
//!   compensation records, and three-phase crash recovery
//! - [`txn::TransactionManager`] drives the transaction lifecycle and picks
//!   a logging mode per update: logical when the operation is reversible,
//!   hybrid (before images) otherwise, pure physical (before + after
//!   images) on request
//! - [`ops::UpdateProcessor`] applies operations and knows their inverses
//! - [`pressure`] hosts the fault-injection registry recovery tests use
//!
//! One transaction is active at a time; the log file has a single
//! appender. Commit flushes the log, never the data buffers — recovery's
//! redo phase reconstructs unflushed effects from the log.

pub mod buffer;
pub mod catalog;
pub mod error;
pub mod ops;
pub mod pressure;
pub mod storage;
pub mod txn;
pub mod types;
pub mod wal;

pub use buffer::BufferManager;
pub use catalog::VideoMeta;
pub use error::{FrameStoreError, Result};
pub use ops::{UpdateArgs, UpdateProcessor};
pub use storage::PageStore;
pub use txn::TransactionManager;
pub use types::{Batch, Frame, FrameId, Lsn, TxnId, NO_LSN};
pub use wal::{LogManager, LogRecord, LogRecordType, RecordBody};

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Rows per group; fixed for a dataset's lifetime
    pub batch_size: u64,
    /// Number of buffer manager slots
    pub buffer_capacity: usize,
    /// Never choose logical logging, even for reversible operations
    pub force_physical_logging: bool,
    /// Always log pure physically (before and after images)
    pub force_pphysical_logging: bool,
    /// Log file name inside the transaction storage directory
    pub log_file_name: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            buffer_capacity: 100,
            force_physical_logging: false,
            force_pphysical_logging: false,
            log_file_name: "transactions.log".to_string(),
        }
    }
}
