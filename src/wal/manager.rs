//! The log manager: append-only WAL, rollback, and crash recovery
//!
//! ## Write-ahead discipline
//!
//! Every update writes its log record before its effect reaches the buffer
//! manager, and a record's LSN is its byte offset in the log file, so log
//! order equals effect order. COMMIT is the only force point: the log is
//! flushed through the preceding record before the COMMIT record is
//! appended. Buffers are never force-flushed on commit; recovery's redo
//! phase closes the gap.
//!
//! ## Rollback
//!
//! A transaction's records form a backward chain through `prev_lsn`.
//! Rollback walks that chain, appending a compensation record (CLR) before
//! undoing each update. A CLR is never itself undone; its `undo_next_lsn`
//! points past the record it compensates, so a crash in the middle of
//! rollback resumes exactly where it left off instead of undoing twice.
//!
//! ## Recovery
//!
//! Three phases, in order:
//!
//! 1. **Analysis** — scan forward, tracking each transaction's last LSN;
//!    COMMIT or TXNEND drops the transaction. Whatever remains was in
//!    flight (or mid-rollback) at the crash.
//! 2. **Redo** — scan forward again and re-apply every update and CLR whose
//!    LSN is above the target group's max row LSN. Hybrid updates replay
//!    their forward arguments; pure-physical updates re-install their
//!    after-image deltas; physical CLRs re-install before-image deltas.
//!    Row-level LSN tags make this safe on any partial-flush state.
//! 3. **Undo** — roll back the surviving transactions, most recent first.
//!
//! Trailing bytes whose length prefix overruns the end of the file are the
//! footprint of a crash during append; they are truncated away before
//! recovery proceeds. An unknown record type anywhere is fatal.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::{debug, info, warn};

use crate::buffer::{apply_update_args, BufferManager};
use crate::catalog::VideoMeta;
use crate::error::{FrameStoreError, Result};
use crate::ops::{UpdateArgs, UpdateProcessor};
use crate::pressure::{self, PressurePoint, PressurePointBehavior, PressurePointLocation};
use crate::storage;
use crate::types::{Lsn, TxnId, NO_LSN};
use crate::wal::record::{LogRecord, LogRecordType, RecordBody, HEADER_LEN};
use crate::EngineConfig;

/// Owns the log file handle and drives rollback and recovery
pub struct LogManager {
    storage_dir: PathBuf,
    log_file: File,
    /// LSN of the most recent record per in-flight transaction
    last_lsn: HashMap<TxnId, Lsn>,
    processor: UpdateProcessor,
    batch_size: u64,
}

impl LogManager {
    pub fn new(storage_dir: impl Into<PathBuf>, config: &EngineConfig) -> Result<Self> {
        let storage_dir = storage_dir.into();
        fs::create_dir_all(&storage_dir)?;
        let log_path = storage_dir.join(&config.log_file_name);

        let mut log_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&log_path)?;
        log_file.seek(SeekFrom::End(0))?;

        Ok(Self {
            storage_dir,
            log_file,
            last_lsn: HashMap::new(),
            processor: UpdateProcessor::new(),
            batch_size: config.batch_size,
        })
    }

    /// Durably flush the log file
    pub fn flush(&mut self) -> Result<()> {
        self.log_file.sync_data()?;
        Ok(())
    }

    fn append(&mut self, txn_id: TxnId, body: RecordBody) -> Result<Lsn> {
        let prev_lsn = self.last_lsn.get(&txn_id).copied().unwrap_or(NO_LSN);
        let offset = self.log_file.seek(SeekFrom::End(0))?;
        let lsn = Lsn::try_from(offset).map_err(|_| {
            FrameStoreError::Log("Log file exceeds the addressable LSN range".to_string())
        })?;

        let record = LogRecord { txn_id, prev_lsn, body };
        let bytes = record.encode()?;
        // Append errors are fatal: the log is the source of truth.
        self.log_file.write_all(&bytes)?;
        self.last_lsn.insert(txn_id, lsn);
        debug!(
            "Appended {:?} for txn {} at lsn {} (prev {})",
            record.record_type(),
            txn_id,
            lsn,
            prev_lsn
        );
        Ok(lsn)
    }

    pub fn log_begin(&mut self, txn_id: TxnId) -> Result<Lsn> {
        debug!("Begin txn {}", txn_id);
        self.append(txn_id, RecordBody::Begin)
    }

    pub fn log_logical_update(
        &mut self,
        txn_id: TxnId,
        meta: &VideoMeta,
        args: &UpdateArgs,
    ) -> Result<Lsn> {
        debug!("Update, txn {} on {} using {:?}", txn_id, meta.file_url, args);
        self.append(
            txn_id,
            RecordBody::LogicalUpdate { meta: meta.clone(), args: args.clone() },
        )
    }

    pub fn log_physical_update(
        &mut self,
        txn_id: TxnId,
        meta: &VideoMeta,
        args: &UpdateArgs,
        before_path: &str,
    ) -> Result<Lsn> {
        debug!(
            "Hybrid update, txn {} on {} with before image {}",
            txn_id, meta.file_url, before_path
        );
        self.append(
            txn_id,
            RecordBody::PhysicalUpdate {
                meta: meta.clone(),
                args: args.clone(),
                before_path: before_path.to_string(),
            },
        )
    }

    pub fn log_pphysical_update(
        &mut self,
        txn_id: TxnId,
        meta: &VideoMeta,
        before_path: &str,
        after_path: &str,
    ) -> Result<Lsn> {
        debug!(
            "Pure physical update, txn {} on {} images {} / {}",
            txn_id, meta.file_url, before_path, after_path
        );
        self.append(
            txn_id,
            RecordBody::PPhysicalUpdate {
                meta: meta.clone(),
                before_path: before_path.to_string(),
                after_path: after_path.to_string(),
            },
        )
    }

    /// Flush the log, then append COMMIT. The flush-before-append ordering
    /// is what makes a commit durable.
    pub fn log_commit(&mut self, txn_id: TxnId) -> Result<Lsn> {
        debug!("Commit txn {}", txn_id);
        self.flush()?;
        let lsn = self.append(txn_id, RecordBody::Commit)?;
        self.last_lsn.remove(&txn_id);
        Ok(lsn)
    }

    pub fn log_abort(&mut self, txn_id: TxnId) -> Result<Lsn> {
        debug!("Abort txn {}", txn_id);
        self.append(txn_id, RecordBody::Abort)
    }

    pub fn log_txnend(&mut self, txn_id: TxnId) -> Result<Lsn> {
        debug!("Txn {} fully rolled back", txn_id);
        self.append(txn_id, RecordBody::TxnEnd)
    }

    fn log_logical_clr(
        &mut self,
        txn_id: TxnId,
        meta: &VideoMeta,
        reversed_args: &UpdateArgs,
        undo_next_lsn: Lsn,
    ) -> Result<Lsn> {
        debug!(
            "CLR, txn {} on {} using {:?}, undo_next_lsn {}",
            txn_id, meta.file_url, reversed_args, undo_next_lsn
        );
        self.append(
            txn_id,
            RecordBody::LogicalClr {
                meta: meta.clone(),
                args: reversed_args.clone(),
                undo_next_lsn,
            },
        )
    }

    fn log_physical_clr(
        &mut self,
        txn_id: TxnId,
        meta: &VideoMeta,
        before_path: &str,
        undo_next_lsn: Lsn,
    ) -> Result<Lsn> {
        debug!(
            "Physical CLR, txn {} on {} before image {}, undo_next_lsn {}",
            txn_id, meta.file_url, before_path, undo_next_lsn
        );
        self.append(
            txn_id,
            RecordBody::PhysicalClr {
                meta: meta.clone(),
                before_path: before_path.to_string(),
                undo_next_lsn,
            },
        )
    }

    fn log_pphysical_clr(
        &mut self,
        txn_id: TxnId,
        meta: &VideoMeta,
        before_path: &str,
        undo_next_lsn: Lsn,
    ) -> Result<Lsn> {
        debug!(
            "Pure physical CLR, txn {} on {} before image {}, undo_next_lsn {}",
            txn_id, meta.file_url, before_path, undo_next_lsn
        );
        self.append(
            txn_id,
            RecordBody::PPhysicalClr {
                meta: meta.clone(),
                before_path: before_path.to_string(),
                undo_next_lsn,
            },
        )
    }

    fn read_record_at(&mut self, lsn: Lsn) -> Result<LogRecord> {
        if lsn < 0 {
            return Err(FrameStoreError::Log(format!("Invalid record lsn {}", lsn)));
        }
        self.log_file.seek(SeekFrom::Start(lsn as u64))?;
        let mut len_buf = [0u8; 4];
        self.log_file.read_exact(&mut len_buf)?;
        let total_len = u32::from_le_bytes(len_buf) as usize;
        if total_len < 4 + HEADER_LEN {
            return Err(FrameStoreError::Log(format!(
                "Record at lsn {} has impossible length {}",
                lsn, total_len
            )));
        }
        let mut body = vec![0u8; total_len - 4];
        self.log_file.read_exact(&mut body)?;
        LogRecord::decode(&body)
    }

    /// Undo every effect of a transaction, writing CLRs as it goes, then
    /// append TXNEND and drop the transaction's scratch directory.
    pub fn rollback(&mut self, txn_id: TxnId, buffers: &mut BufferManager) -> Result<()> {
        debug!("Rollback txn {}", txn_id);
        let mut lsn = self.last_lsn.get(&txn_id).copied().ok_or_else(|| {
            FrameStoreError::Transaction(format!(
                "Transaction {} has no log records to roll back",
                txn_id
            ))
        })?;

        while lsn != NO_LSN {
            let record = self.read_record_at(lsn)?;
            self.log_file.seek(SeekFrom::End(0))?;
            let mut next_lsn = record.prev_lsn;

            match record.body {
                RecordBody::LogicalUpdate { meta, args } => {
                    let reversed = self.processor.reverse(&args)?;
                    let clr_lsn = self.log_logical_clr(txn_id, &meta, &reversed, next_lsn)?;
                    if rollback_interrupted() {
                        debug!("Leaving rollback of txn {} unfinished after CLR", txn_id);
                        return Ok(());
                    }
                    debug!(
                        "Reverting txn {} on {} using {:?}",
                        txn_id, meta.file_url, reversed
                    );
                    apply_update_args(
                        buffers,
                        &self.processor,
                        &meta,
                        &reversed,
                        clr_lsn,
                        self.batch_size,
                    )?;
                }
                RecordBody::PhysicalUpdate { meta, before_path, .. } => {
                    let clr_lsn =
                        self.log_physical_clr(txn_id, &meta, &before_path, next_lsn)?;
                    if rollback_interrupted() {
                        debug!("Leaving rollback of txn {} unfinished after CLR", txn_id);
                        return Ok(());
                    }
                    install_deltas(buffers, &meta, &before_path, clr_lsn)?;
                }
                RecordBody::PPhysicalUpdate { meta, before_path, .. } => {
                    let clr_lsn =
                        self.log_pphysical_clr(txn_id, &meta, &before_path, next_lsn)?;
                    if rollback_interrupted() {
                        debug!("Leaving rollback of txn {} unfinished after CLR", txn_id);
                        return Ok(());
                    }
                    install_deltas(buffers, &meta, &before_path, clr_lsn)?;
                }
                RecordBody::LogicalClr { undo_next_lsn, .. }
                | RecordBody::PhysicalClr { undo_next_lsn, .. }
                | RecordBody::PPhysicalClr { undo_next_lsn, .. } => {
                    // CLRs are never undone; skip past what they compensate.
                    debug!("Found CLR, continuing rollback at lsn {}", undo_next_lsn);
                    next_lsn = undo_next_lsn;
                }
                RecordBody::Begin
                | RecordBody::Commit
                | RecordBody::Abort
                | RecordBody::TxnEnd => {}
            }

            lsn = next_lsn;
        }

        self.log_txnend(txn_id)?;
        self.last_lsn.remove(&txn_id);
        // The CLR chain may reference staged delta files; make the reverted
        // rows durable before the scratch directory disappears.
        buffers.flush_all_slots()?;
        self.cleanup_scratch(txn_id);
        Ok(())
    }

    fn cleanup_scratch(&self, txn_id: TxnId) {
        let dir = self.storage_dir.join(txn_id.to_string());
        match fs::remove_dir_all(&dir) {
            Ok(()) => debug!("Removed scratch directory for txn {}", txn_id),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Could not remove scratch for txn {}: {}", txn_id, e),
        }
    }

    /// Scan the whole log. Returns the decoded records and, when the final
    /// record overruns the end of the file, the offset of the torn tail.
    fn scan_records(&mut self) -> Result<(Vec<(Lsn, LogRecord)>, Option<u64>)> {
        let len = self.log_file.metadata()?.len();
        self.log_file.seek(SeekFrom::Start(0))?;

        let mut records = Vec::new();
        let mut offset: u64 = 0;
        while offset < len {
            if len - offset < 4 {
                return Ok((records, Some(offset)));
            }
            let mut len_buf = [0u8; 4];
            self.log_file.read_exact(&mut len_buf)?;
            let total_len = u32::from_le_bytes(len_buf) as u64;
            if total_len < (4 + HEADER_LEN) as u64 {
                return Err(FrameStoreError::Log(format!(
                    "Record at offset {} has impossible length {}",
                    offset, total_len
                )));
            }
            if offset + total_len > len {
                return Ok((records, Some(offset)));
            }
            let mut body = vec![0u8; (total_len - 4) as usize];
            self.log_file.read_exact(&mut body)?;
            let record = LogRecord::decode(&body)?;
            let lsn = Lsn::try_from(offset).map_err(|_| {
                FrameStoreError::Log("Log file exceeds the addressable LSN range".to_string())
            })?;
            debug!(
                "Got {:?} txn {} at offset {}",
                record.record_type(),
                record.txn_id,
                offset
            );
            records.push((lsn, record));
            offset += total_len;
        }
        Ok((records, None))
    }

    /// Every record in the log, in file order
    pub fn records(&mut self) -> Result<Vec<(Lsn, LogRecord)>> {
        let (records, torn) = self.scan_records()?;
        self.log_file.seek(SeekFrom::End(0))?;
        if let Some(offset) = torn {
            return Err(FrameStoreError::Log(format!(
                "Truncated log record at offset {}",
                offset
            )));
        }
        Ok(records)
    }

    /// Crash recovery: analysis, redo, undo
    pub fn recover(&mut self, buffers: &mut BufferManager) -> Result<()> {
        let (records, torn) = self.scan_records()?;
        if let Some(offset) = torn {
            warn!("Discarding torn log tail at offset {}", offset);
            self.log_file.set_len(offset)?;
        }

        info!("Recovery: analysis over {} records", records.len());
        self.last_lsn.clear();
        for (lsn, record) in &records {
            self.last_lsn.insert(record.txn_id, *lsn);
            if matches!(
                record.record_type(),
                LogRecordType::Commit | LogRecordType::TxnEnd
            ) {
                self.last_lsn.remove(&record.txn_id);
            }
        }
        debug!("Transactions in flight at crash: {:?}", self.last_lsn);

        info!("Recovery: redo");
        for (lsn, record) in &records {
            match &record.body {
                RecordBody::LogicalUpdate { meta, args } => {
                    debug!("Redoing logical update on {} at lsn {}", meta.file_url, lsn);
                    apply_update_args(buffers, &self.processor, meta, args, *lsn, self.batch_size)?;
                }
                RecordBody::LogicalClr { meta, args, .. } => {
                    // The stored arguments are already reversed.
                    debug!("Redoing logical CLR on {} at lsn {}", meta.file_url, lsn);
                    apply_update_args(buffers, &self.processor, meta, args, *lsn, self.batch_size)?;
                }
                RecordBody::PhysicalUpdate { meta, args, .. } => {
                    // Redo replays the forward arguments; the before image
                    // is only ever used for undo.
                    debug!("Redoing hybrid update on {} at lsn {}", meta.file_url, lsn);
                    apply_update_args(buffers, &self.processor, meta, args, *lsn, self.batch_size)?;
                }
                RecordBody::PPhysicalUpdate { meta, after_path, .. } => {
                    debug!(
                        "Redoing pure physical update on {} at lsn {}",
                        meta.file_url, lsn
                    );
                    install_deltas(buffers, meta, after_path, *lsn)?;
                }
                RecordBody::PhysicalClr { meta, before_path, .. }
                | RecordBody::PPhysicalClr { meta, before_path, .. } => {
                    debug!("Redoing physical CLR on {} at lsn {}", meta.file_url, lsn);
                    install_deltas(buffers, meta, before_path, *lsn)?;
                }
                RecordBody::Begin
                | RecordBody::Commit
                | RecordBody::Abort
                | RecordBody::TxnEnd => {}
            }
        }

        info!("Recovery: undo");
        // One transaction is active at a time today, but rolling back in
        // descending last-LSN order is the discipline that generalizes.
        let mut to_undo: Vec<(TxnId, Lsn)> =
            self.last_lsn.iter().map(|(t, l)| (*t, *l)).collect();
        to_undo.sort_by(|a, b| b.1.cmp(&a.1));
        debug!("Transactions to undo: {:?}", to_undo);
        for (txn_id, _) in to_undo {
            self.rollback(txn_id, buffers)?;
        }

        self.last_lsn.clear();
        self.log_file.seek(SeekFrom::End(0))?;
        Ok(())
    }
}

impl Drop for LogManager {
    fn drop(&mut self) {
        if let Err(e) = self.log_file.sync_data() {
            warn!("Could not flush log file on drop: {}", e);
        }
    }
}

fn rollback_interrupted() -> bool {
    pressure::has(PressurePoint::new(
        PressurePointLocation::RollbackAfterClr,
        PressurePointBehavior::EarlyReturn,
    ))
}

/// Re-install staged delta batches through the buffer manager, stamping
/// every row with `lsn`. Skips groups whose max row LSN already covers
/// `lsn`; a missing group ends the walk.
fn install_deltas(
    buffers: &mut BufferManager,
    meta: &VideoMeta,
    base_path: &str,
    lsn: Lsn,
) -> Result<()> {
    for (group, mut batch) in storage::read_deltas(Path::new(base_path))? {
        let max_lsn = match buffers.group_max_lsn(meta, group) {
            Ok(max_lsn) => max_lsn,
            Err(FrameStoreError::GroupMissing { .. }) => break,
            Err(e) => return Err(e),
        };
        if lsn <= max_lsn {
            continue;
        }
        for frame in &mut batch.frames {
            frame.lsn = lsn;
        }
        buffers.write_slot(meta, batch)?;
    }
    Ok(())
}
