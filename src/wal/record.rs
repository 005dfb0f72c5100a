//! Log record types and their binary encoding
//!
//! Structure common to all log records:
//!
//! ```text
//! total_len  record_type  txn_id  prev_lsn  [fields]
//!  u32 LE        u8       u32 LE   i32 LE
//! ```
//!
//! where each field is serialized as `len (u32 LE) | bytes`. `total_len`
//! includes its own four bytes, so a reader can seek over any record
//! without understanding its payload. An LSN is the file offset of the
//! record's first byte; `prev_lsn` is -1 for a transaction's first record.
//!
//! Dataset metadata and update arguments travel as JSON fields;
//! `undo_next_lsn` is the final field of every CLR and holds 4 signed
//! little-endian bytes.

use bytes::{Buf, BufMut};

use crate::catalog::VideoMeta;
use crate::error::{FrameStoreError, Result};
use crate::ops::UpdateArgs;
use crate::types::{Lsn, TxnId};

/// Bytes of the fixed record header after `total_len`
pub const HEADER_LEN: usize = 9;

/// On-disk record type tags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LogRecordType {
    Unknown = 1,
    Begin = 2,
    LogicalUpdate = 3,
    PhysicalUpdate = 4,
    PPhysicalUpdate = 5,
    Commit = 6,
    Abort = 7,
    TxnEnd = 8,
    LogicalClr = 9,
    PhysicalClr = 10,
    PPhysicalClr = 11,
}

impl LogRecordType {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            1 => Ok(LogRecordType::Unknown),
            2 => Ok(LogRecordType::Begin),
            3 => Ok(LogRecordType::LogicalUpdate),
            4 => Ok(LogRecordType::PhysicalUpdate),
            5 => Ok(LogRecordType::PPhysicalUpdate),
            6 => Ok(LogRecordType::Commit),
            7 => Ok(LogRecordType::Abort),
            8 => Ok(LogRecordType::TxnEnd),
            9 => Ok(LogRecordType::LogicalClr),
            10 => Ok(LogRecordType::PhysicalClr),
            11 => Ok(LogRecordType::PPhysicalClr),
            other => Err(FrameStoreError::Log(format!(
                "Unknown log record type {}",
                other
            ))),
        }
    }
}

/// Per-type record payload
#[derive(Debug, Clone, PartialEq)]
pub enum RecordBody {
    Begin,
    /// Records the operation; redo and undo re-execute it
    LogicalUpdate {
        meta: VideoMeta,
        args: UpdateArgs,
    },
    /// Records the operation plus a before-image delta base path for undo
    PhysicalUpdate {
        meta: VideoMeta,
        args: UpdateArgs,
        before_path: String,
    },
    /// Records only before- and after-image delta base paths
    PPhysicalUpdate {
        meta: VideoMeta,
        before_path: String,
        after_path: String,
    },
    Commit,
    Abort,
    TxnEnd,
    /// Compensation for a logical update; carries the reversed arguments
    LogicalClr {
        meta: VideoMeta,
        args: UpdateArgs,
        undo_next_lsn: Lsn,
    },
    PhysicalClr {
        meta: VideoMeta,
        before_path: String,
        undo_next_lsn: Lsn,
    },
    PPhysicalClr {
        meta: VideoMeta,
        before_path: String,
        undo_next_lsn: Lsn,
    },
}

impl RecordBody {
    pub fn record_type(&self) -> LogRecordType {
        match self {
            RecordBody::Begin => LogRecordType::Begin,
            RecordBody::LogicalUpdate { .. } => LogRecordType::LogicalUpdate,
            RecordBody::PhysicalUpdate { .. } => LogRecordType::PhysicalUpdate,
            RecordBody::PPhysicalUpdate { .. } => LogRecordType::PPhysicalUpdate,
            RecordBody::Commit => LogRecordType::Commit,
            RecordBody::Abort => LogRecordType::Abort,
            RecordBody::TxnEnd => LogRecordType::TxnEnd,
            RecordBody::LogicalClr { .. } => LogRecordType::LogicalClr,
            RecordBody::PhysicalClr { .. } => LogRecordType::PhysicalClr,
            RecordBody::PPhysicalClr { .. } => LogRecordType::PPhysicalClr,
        }
    }
}

/// One decoded log record
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub txn_id: TxnId,
    pub prev_lsn: Lsn,
    pub body: RecordBody,
}

impl LogRecord {
    pub fn record_type(&self) -> LogRecordType {
        self.body.record_type()
    }

    /// Where rollback continues after processing this record, for CLRs
    pub fn undo_next_lsn(&self) -> Option<Lsn> {
        match &self.body {
            RecordBody::LogicalClr { undo_next_lsn, .. }
            | RecordBody::PhysicalClr { undo_next_lsn, .. }
            | RecordBody::PPhysicalClr { undo_next_lsn, .. } => Some(*undo_next_lsn),
            _ => None,
        }
    }

    /// Serialize to the on-disk layout, `total_len` prefix included
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut fields: Vec<Vec<u8>> = Vec::new();
        match &self.body {
            RecordBody::Begin | RecordBody::Commit | RecordBody::Abort | RecordBody::TxnEnd => {}
            RecordBody::LogicalUpdate { meta, args } => {
                fields.push(meta.serialize()?);
                fields.push(args.serialize()?);
            }
            RecordBody::PhysicalUpdate { meta, args, before_path } => {
                fields.push(meta.serialize()?);
                fields.push(args.serialize()?);
                fields.push(before_path.as_bytes().to_vec());
            }
            RecordBody::PPhysicalUpdate { meta, before_path, after_path } => {
                fields.push(meta.serialize()?);
                fields.push(before_path.as_bytes().to_vec());
                fields.push(after_path.as_bytes().to_vec());
            }
            RecordBody::LogicalClr { meta, args, undo_next_lsn } => {
                fields.push(meta.serialize()?);
                fields.push(args.serialize()?);
                fields.push(undo_next_lsn.to_le_bytes().to_vec());
            }
            RecordBody::PhysicalClr { meta, before_path, undo_next_lsn }
            | RecordBody::PPhysicalClr { meta, before_path, undo_next_lsn } => {
                fields.push(meta.serialize()?);
                fields.push(before_path.as_bytes().to_vec());
                fields.push(undo_next_lsn.to_le_bytes().to_vec());
            }
        }

        let body_len = HEADER_LEN + fields.iter().map(|f| 4 + f.len()).sum::<usize>();
        let mut out = Vec::with_capacity(4 + body_len);
        out.put_u32_le((body_len + 4) as u32);
        out.put_u8(self.record_type() as u8);
        out.put_u32_le(self.txn_id);
        out.put_i32_le(self.prev_lsn);
        for field in fields {
            out.put_u32_le(field.len() as u32);
            out.extend_from_slice(&field);
        }
        Ok(out)
    }

    /// Decode a record from everything after its `total_len` prefix
    pub fn decode(body: &[u8]) -> Result<LogRecord> {
        let mut buf = body;
        if buf.remaining() < HEADER_LEN {
            return Err(FrameStoreError::Log(format!(
                "Log record body of {} bytes is shorter than the header",
                body.len()
            )));
        }
        let record_type = LogRecordType::from_u8(buf.get_u8())?;
        let txn_id = buf.get_u32_le();
        let prev_lsn = buf.get_i32_le();

        let body = match record_type {
            LogRecordType::Begin => RecordBody::Begin,
            LogRecordType::Commit => RecordBody::Commit,
            LogRecordType::Abort => RecordBody::Abort,
            LogRecordType::TxnEnd => RecordBody::TxnEnd,
            LogRecordType::LogicalUpdate => {
                let meta = VideoMeta::deserialize(&next_field(&mut buf)?)?;
                let args = UpdateArgs::deserialize(&next_field(&mut buf)?)?;
                RecordBody::LogicalUpdate { meta, args }
            }
            LogRecordType::PhysicalUpdate => {
                let meta = VideoMeta::deserialize(&next_field(&mut buf)?)?;
                let args = UpdateArgs::deserialize(&next_field(&mut buf)?)?;
                let before_path = string_field(&mut buf)?;
                RecordBody::PhysicalUpdate { meta, args, before_path }
            }
            LogRecordType::PPhysicalUpdate => {
                let meta = VideoMeta::deserialize(&next_field(&mut buf)?)?;
                let before_path = string_field(&mut buf)?;
                let after_path = string_field(&mut buf)?;
                RecordBody::PPhysicalUpdate { meta, before_path, after_path }
            }
            LogRecordType::LogicalClr => {
                let meta = VideoMeta::deserialize(&next_field(&mut buf)?)?;
                let args = UpdateArgs::deserialize(&next_field(&mut buf)?)?;
                let undo_next_lsn = lsn_field(&mut buf)?;
                RecordBody::LogicalClr { meta, args, undo_next_lsn }
            }
            LogRecordType::PhysicalClr => {
                let meta = VideoMeta::deserialize(&next_field(&mut buf)?)?;
                let before_path = string_field(&mut buf)?;
                let undo_next_lsn = lsn_field(&mut buf)?;
                RecordBody::PhysicalClr { meta, before_path, undo_next_lsn }
            }
            LogRecordType::PPhysicalClr => {
                let meta = VideoMeta::deserialize(&next_field(&mut buf)?)?;
                let before_path = string_field(&mut buf)?;
                let undo_next_lsn = lsn_field(&mut buf)?;
                RecordBody::PPhysicalClr { meta, before_path, undo_next_lsn }
            }
            LogRecordType::Unknown => {
                return Err(FrameStoreError::Log(
                    "Refusing to decode record of unknown type".to_string(),
                ));
            }
        };

        Ok(LogRecord { txn_id, prev_lsn, body })
    }
}

fn next_field(buf: &mut &[u8]) -> Result<Vec<u8>> {
    if buf.remaining() < 4 {
        return Err(FrameStoreError::Log(
            "Log record field length overruns the record".to_string(),
        ));
    }
    let len = buf.get_u32_le() as usize;
    if buf.remaining() < len {
        return Err(FrameStoreError::Log(format!(
            "Log record field of {} bytes overruns the record",
            len
        )));
    }
    let mut field = vec![0u8; len];
    buf.copy_to_slice(&mut field);
    Ok(field)
}

fn string_field(buf: &mut &[u8]) -> Result<String> {
    String::from_utf8(next_field(buf)?)
        .map_err(|_| FrameStoreError::Log("Log record path field is not UTF-8".to_string()))
}

fn lsn_field(buf: &mut &[u8]) -> Result<Lsn> {
    let field = next_field(buf)?;
    let bytes: [u8; 4] = field.as_slice().try_into().map_err(|_| {
        FrameStoreError::Log(format!("LSN field of {} bytes, expected 4", field.len()))
    })?;
    Ok(Lsn::from_le_bytes(bytes))
}
