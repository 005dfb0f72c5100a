//! The transaction manager
//!
//! Drives begin / update / commit / abort and picks the logging mode for
//! each update:
//!
//! | mode          | condition                                | staged artifacts        |
//! |---------------|------------------------------------------|-------------------------|
//! | logical       | operation reversible, no force flag      | none                    |
//! | hybrid        | otherwise                                | before-delta per group  |
//! | pure physical | `force_pphysical_logging`                | before + after deltas   |
//!
//! Reversible operations need no staged images: undo re-executes the
//! inverse. Everything else stages before-image deltas so rollback can
//! re-install the exact bytes; pure physical mode additionally stages
//! after-images so redo never re-executes the operation at all.
//!
//! Staged files live in a per-transaction scratch directory named by txn
//! id, as `{file_url}.v{version}_old_{group}` (and `..._new_{group}` in
//! pure physical mode). The version bumps once per update call so repeated
//! updates of one dataset stay distinguishable.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::debug;

use crate::buffer::{apply_update_args, BufferManager};
use crate::catalog::VideoMeta;
use crate::error::{FrameStoreError, Result};
use crate::ops::{UpdateArgs, UpdateProcessor};
use crate::storage::{self, PageStore};
use crate::txn::metadata::TransactionMetadata;
use crate::types::{group_of, Batch, Frame, TxnId};
use crate::wal::LogManager;
use crate::EngineConfig;

const TXN_COUNTER_FILE: &str = "txn_counter";

/// Owns the log and buffer managers and drives the transaction lifecycle
pub struct TransactionManager {
    storage_dir: PathBuf,
    store: Arc<PageStore>,
    log: LogManager,
    buffers: BufferManager,
    processor: UpdateProcessor,
    config: EngineConfig,
    txn_table: HashMap<TxnId, TransactionMetadata>,
    txn_counter: TxnId,
}

impl TransactionManager {
    pub fn new(
        storage_dir: impl Into<PathBuf>,
        store: Arc<PageStore>,
        config: EngineConfig,
    ) -> Result<Self> {
        let storage_dir = storage_dir.into();
        fs::create_dir_all(&storage_dir)?;

        let counter_path = storage_dir.join(TXN_COUNTER_FILE);
        let fresh = !counter_path.exists();
        let txn_counter = if fresh {
            1
        } else {
            let bytes = fs::read(&counter_path)?;
            let bytes: [u8; 4] = bytes.as_slice().try_into().map_err(|_| {
                FrameStoreError::Transaction(format!(
                    "Corrupt transaction counter file '{}'",
                    counter_path.display()
                ))
            })?;
            TxnId::from_le_bytes(bytes)
        };

        let log = LogManager::new(&storage_dir, &config)?;
        let buffers = BufferManager::new(config.buffer_capacity, Arc::clone(&store));

        let manager = Self {
            storage_dir,
            store,
            log,
            buffers,
            processor: UpdateProcessor::new(),
            config,
            txn_table: HashMap::new(),
            txn_counter,
        };
        if fresh {
            manager.write_counter()?;
        }
        Ok(manager)
    }

    fn counter_path(&self) -> PathBuf {
        self.storage_dir.join(TXN_COUNTER_FILE)
    }

    fn write_counter(&self) -> Result<()> {
        let mut tmp = tempfile::NamedTempFile::new_in(&self.storage_dir)?;
        tmp.write_all(&self.txn_counter.to_le_bytes())?;
        tmp.persist(self.counter_path())
            .map_err(|e| FrameStoreError::Io(e.error))?;
        Ok(())
    }

    /// Scratch directory holding a transaction's staged delta files
    pub fn txn_dir(&self, txn_id: TxnId) -> PathBuf {
        self.storage_dir.join(txn_id.to_string())
    }

    /// Start a transaction: bump and persist the counter, set up the
    /// scratch directory, log BEGIN.
    pub fn begin(&mut self) -> Result<TxnId> {
        let txn_id = self.txn_counter;
        self.txn_table.insert(txn_id, TransactionMetadata::new());
        self.txn_counter += 1;
        self.write_counter()?;

        let dir = self.txn_dir(txn_id);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        fs::create_dir_all(&dir)?;

        self.log.log_begin(txn_id)?;
        Ok(txn_id)
    }

    /// Apply an update operation within a transaction.
    ///
    /// Chooses the logging mode, stages whatever images the mode needs,
    /// writes the log record, and only then applies the operation forward
    /// through the buffer manager, stamping touched rows with the record's
    /// LSN.
    pub fn update(&mut self, txn_id: TxnId, meta: &VideoMeta, args: &UpdateArgs) -> Result<()> {
        if !self.txn_table.contains_key(&txn_id) {
            return Err(FrameStoreError::Transaction(format!(
                "Transaction {} is not active",
                txn_id
            )));
        }

        let lsn = if self.config.force_pphysical_logging {
            let (before_base, after_base) = self.stage_pure_physical(txn_id, meta, args)?;
            self.log
                .log_pphysical_update(txn_id, meta, &before_base, &after_base)?
        } else if !self.config.force_physical_logging && self.processor.is_reversible(args) {
            self.log.log_logical_update(txn_id, meta, args)?
        } else {
            let before_base = self.stage_before_deltas(txn_id, meta, args)?;
            self.log.log_physical_update(txn_id, meta, args, &before_base)?
        };

        apply_update_args(
            &mut self.buffers,
            &self.processor,
            meta,
            args,
            lsn,
            self.config.batch_size,
        )
    }

    /// Durably commit: the log manager flushes before appending COMMIT.
    /// Data buffers are deliberately not flushed; redo covers them.
    pub fn commit(&mut self, txn_id: TxnId) -> Result<()> {
        self.log.log_commit(txn_id)?;
        self.txn_table.remove(&txn_id);
        Ok(())
    }

    /// Abort: log ABORT, then roll the transaction's effects back
    pub fn abort(&mut self, txn_id: TxnId) -> Result<()> {
        self.log.log_abort(txn_id)?;
        self.log.rollback(txn_id, &mut self.buffers)?;
        self.txn_table.remove(&txn_id);
        Ok(())
    }

    /// Crash recovery over the whole log
    pub fn recover(&mut self) -> Result<()> {
        self.log.recover(&mut self.buffers)
    }

    fn next_version(&mut self, txn_id: TxnId, file_url: &str) -> Result<u32> {
        let txn_meta = self.txn_table.get_mut(&txn_id).ok_or_else(|| {
            FrameStoreError::Transaction(format!("Transaction {} is not active", txn_id))
        })?;
        let version = txn_meta.file_version(file_url);
        txn_meta.bump_file_version(file_url);
        Ok(version)
    }

    fn delta_base(&self, txn_id: TxnId, meta: &VideoMeta, version: u32, suffix: &str) -> String {
        self.txn_dir(txn_id)
            .join(format!("{}.v{}_{}", meta.file_url, version, suffix))
            .to_string_lossy()
            .into_owned()
    }

    /// Stage before-image deltas for every group the update touches;
    /// returns the base path recorded in the log.
    fn stage_before_deltas(
        &mut self,
        txn_id: TxnId,
        meta: &VideoMeta,
        args: &UpdateArgs,
    ) -> Result<String> {
        let version = self.next_version(txn_id, &meta.file_url)?;
        let before_base = self.delta_base(txn_id, meta, version, "old");
        debug!("Staging before images under {}", before_base);

        let start_group = group_of(args.start_frame, self.config.batch_size);
        let end_group = group_of(args.end_frame, self.config.batch_size);
        for group in start_group..=end_group {
            let batch = match self.buffers.read_slot(meta, group) {
                Ok(batch) => batch,
                Err(FrameStoreError::GroupMissing { .. }) => break,
                Err(e) => return Err(e),
            };
            let before: Vec<Frame> = batch
                .frames
                .iter()
                .filter(|f| args.contains(f.id))
                .cloned()
                .collect();
            storage::write_delta(
                Path::new(&format!("{}_{}", before_base, group)),
                &Batch::new(group, before),
            )?;
        }
        Ok(before_base)
    }

    /// Stage before- and after-image deltas; the after image is the
    /// operation's result so redo never re-executes it.
    fn stage_pure_physical(
        &mut self,
        txn_id: TxnId,
        meta: &VideoMeta,
        args: &UpdateArgs,
    ) -> Result<(String, String)> {
        let version = self.next_version(txn_id, &meta.file_url)?;
        let before_base = self.delta_base(txn_id, meta, version, "old");
        let after_base = self.delta_base(txn_id, meta, version, "new");
        debug!(
            "Staging before/after images under {} and {}",
            before_base, after_base
        );

        let start_group = group_of(args.start_frame, self.config.batch_size);
        let end_group = group_of(args.end_frame, self.config.batch_size);
        for group in start_group..=end_group {
            let batch = match self.buffers.read_slot(meta, group) {
                Ok(batch) => batch,
                Err(FrameStoreError::GroupMissing { .. }) => break,
                Err(e) => return Err(e),
            };
            let mut before = Vec::new();
            let mut after = Vec::new();
            for frame in batch.frames.iter().filter(|f| args.contains(f.id)) {
                before.push(frame.clone());
                after.push(Frame {
                    id: frame.id,
                    data: self.processor.apply(&frame.data, meta, args)?,
                    lsn: frame.lsn,
                });
            }
            storage::write_delta(
                Path::new(&format!("{}_{}", before_base, group)),
                &Batch::new(group, before),
            )?;
            storage::write_delta(
                Path::new(&format!("{}_{}", after_base, group)),
                &Batch::new(group, after),
            )?;
        }
        Ok((before_base, after_base))
    }

    /// The page store this manager writes through
    pub fn store(&self) -> Arc<PageStore> {
        Arc::clone(&self.store)
    }

    /// Direct buffer access, used by tests to inspect cached state and to
    /// simulate crashes by discarding slots
    pub fn buffers_mut(&mut self) -> &mut BufferManager {
        &mut self.buffers
    }

    /// Direct log access, used by tests to inspect the record stream
    pub fn log_mut(&mut self) -> &mut LogManager {
        &mut self.log
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}
