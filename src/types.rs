//! Core row and batch types
//!
//! A dataset is an ordered sequence of frames partitioned into fixed-size
//! groups; the group is the unit of buffer residency and I/O.

use serde::{Deserialize, Serialize};

/// Log sequence number: the byte offset of a record's first byte in the
/// log file. Negative values mean "no record".
pub type Lsn = i32;

/// Transaction ID, persisted across restarts in the counter file
pub type TxnId = u32;

/// Stable frame identifier (the frame number within its dataset)
pub type FrameId = u64;

/// Sentinel LSN for rows that have never seen an update and for the
/// `prev_lsn` of a transaction's first log record
pub const NO_LSN: Lsn = -1;

/// Group number a frame belongs to
pub fn group_of(frame_id: FrameId, batch_size: u64) -> u64 {
    frame_id / batch_size
}

/// A single video frame row: id, raw image bytes, and the LSN of the most
/// recent update applied to it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub id: FrameId,
    pub data: Vec<u8>,
    pub lsn: Lsn,
}

/// A contiguous block of frames from one group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    /// Group number these frames belong to
    pub group: u64,
    /// Frames in ascending id order
    pub frames: Vec<Frame>,
}

impl Batch {
    pub fn new(group: u64, frames: Vec<Frame>) -> Self {
        Self { group, frames }
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Highest row LSN in the batch, or `NO_LSN` when no row was ever
    /// stamped (or the batch is empty)
    pub fn max_lsn(&self) -> Lsn {
        self.frames.iter().map(|f| f.lsn).max().unwrap_or(NO_LSN)
    }

    /// Look up a frame by id
    pub fn frame(&self, id: FrameId) -> Option<&Frame> {
        self.frames.iter().find(|f| f.id == id)
    }
}
