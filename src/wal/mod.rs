//! Write-ahead log: record format and the log manager

pub mod manager;
pub mod record;

pub use manager::LogManager;
pub use record::{LogRecord, LogRecordType, RecordBody};
