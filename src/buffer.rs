//! Buffer manager: cached group slots with LRU eviction
//!
//! A fixed number of slots each hold one `(dataset, group)` batch. Reads
//! load through the page store on miss; writes merge delta rows into the
//! resident batch and mark the slot dirty. Dirty slots are flushed before
//! eviction, so the store never silently loses an update.
//!
//! Every row carries an `lsn` column stamped by the log manager's callers;
//! `group_max_lsn` is what makes redo idempotent — a logged effect is
//! re-applied only when its LSN is above everything the group has seen.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;

use log::debug;

use crate::catalog::VideoMeta;
use crate::error::{FrameStoreError, Result};
use crate::ops::{UpdateArgs, UpdateProcessor};
use crate::storage::PageStore;
use crate::types::{group_of, Batch, Frame, Lsn};

struct Slot {
    meta: VideoMeta,
    batch: Batch,
    dirty: bool,
}

/// Fixed-capacity cache of group batches
pub struct BufferManager {
    slots: Vec<Option<Slot>>,
    /// Occupied slot indices, least recently used at the front
    lru: VecDeque<usize>,
    store: Arc<PageStore>,
}

impl BufferManager {
    pub fn new(capacity: usize, store: Arc<PageStore>) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            slots,
            lru: VecDeque::new(),
            store,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn find_slot(&self, meta: &VideoMeta, group: u64) -> Option<usize> {
        self.slots.iter().position(|slot| {
            slot.as_ref()
                .map(|s| s.meta.file_url == meta.file_url && s.batch.group == group)
                .unwrap_or(false)
        })
    }

    /// Index of a free slot, evicting the coldest occupied slot if needed
    fn free_slot(&mut self) -> Result<usize> {
        if let Some(free) = self.slots.iter().position(|s| s.is_none()) {
            return Ok(free);
        }
        let victim = *self.lru.front().ok_or_else(|| {
            FrameStoreError::Storage("Buffer manager has no slots".to_string())
        })?;
        debug!("Evicting slot {}", victim);
        self.flush_slot(victim)?;
        self.discard_slot(victim);
        Ok(victim)
    }

    fn touch(&mut self, slot: usize) {
        self.lru.retain(|&i| i != slot);
        self.lru.push_back(slot);
    }

    fn load_slot(&mut self, meta: &VideoMeta, group: u64) -> Result<usize> {
        let batch = self.store.read_group(meta, group)?;
        let index = self.free_slot()?;
        debug!(
            "Reading dataset {} group {} into slot {}",
            meta.file_url, group, index
        );
        self.slots[index] = Some(Slot {
            meta: meta.clone(),
            batch,
            dirty: false,
        });
        Ok(index)
    }

    /// Batch for `(meta, group)`, loading from the page store on miss
    pub fn read_slot(&mut self, meta: &VideoMeta, group: u64) -> Result<&Batch> {
        let index = match self.find_slot(meta, group) {
            Some(i) => i,
            None => self.load_slot(meta, group)?,
        };
        self.touch(index);
        match &self.slots[index] {
            Some(slot) => Ok(&slot.batch),
            None => Err(FrameStoreError::Storage(
                "Buffer slot vanished after load".to_string(),
            )),
        }
    }

    /// Merge `delta` rows into the resident batch for its group, matching
    /// by id and copying every non-id column (including `lsn`)
    pub fn write_slot(&mut self, meta: &VideoMeta, delta: Batch) -> Result<()> {
        debug!(
            "Writing dataset {} group {} ({} delta rows)",
            meta.file_url,
            delta.group,
            delta.frames.len()
        );
        let index = match self.find_slot(meta, delta.group) {
            Some(i) => i,
            None => self.load_slot(meta, delta.group)?,
        };
        if let Some(slot) = &mut self.slots[index] {
            for frame in delta.frames {
                if let Some(existing) = slot.batch.frames.iter_mut().find(|f| f.id == frame.id) {
                    existing.data = frame.data;
                    existing.lsn = frame.lsn;
                }
            }
            slot.dirty = true;
        }
        self.touch(index);
        Ok(())
    }

    /// Write a dirty slot through the page store and clear its dirty bit
    pub fn flush_slot(&mut self, index: usize) -> Result<()> {
        if let Some(slot) = self.slots.get_mut(index).and_then(|s| s.as_mut()) {
            if slot.dirty {
                debug!("Flushing slot {}", index);
                self.store.write(&slot.meta, &slot.batch)?;
                slot.dirty = false;
            }
        }
        Ok(())
    }

    /// Flush every dirty slot. Per-slot writes are dispatched to worker
    /// threads; the per-row LSN invariant makes flush order immaterial.
    pub fn flush_all_slots(&mut self) -> Result<()> {
        debug!("Flushing buffer manager");
        let store = Arc::clone(&self.store);
        let jobs: Vec<(usize, &Slot)> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().filter(|s| s.dirty).map(|s| (i, s)))
            .collect();

        let results: Vec<(usize, Result<()>)> = thread::scope(|scope| {
            let handles: Vec<_> = jobs
                .iter()
                .map(|&(index, slot)| {
                    let store = &store;
                    (
                        index,
                        scope.spawn(move || store.write(&slot.meta, &slot.batch)),
                    )
                })
                .collect();
            handles
                .into_iter()
                .map(|(index, handle)| {
                    (index, handle.join().expect("flush worker panicked"))
                })
                .collect()
        });

        let mut first_error = None;
        for (index, result) in results {
            match result {
                Ok(()) => {
                    if let Some(slot) = self.slots.get_mut(index).and_then(|s| s.as_mut()) {
                        slot.dirty = false;
                    }
                }
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Forget a slot's in-memory contents without flushing
    pub fn discard_slot(&mut self, index: usize) {
        if index < self.slots.len() {
            self.slots[index] = None;
            self.lru.retain(|&i| i != index);
        }
    }

    /// Forget every slot without flushing (crash simulation, tests)
    pub fn discard_all_slots(&mut self) {
        debug!("Resetting buffer manager");
        for slot in &mut self.slots {
            *slot = None;
        }
        self.lru.clear();
    }

    /// Highest row LSN in a group, loading the group if necessary
    pub fn group_max_lsn(&mut self, meta: &VideoMeta, group: u64) -> Result<Lsn> {
        Ok(self.read_slot(meta, group)?.max_lsn())
    }
}

/// Apply an update operation through the buffer manager, stamping every
/// touched row with `lsn`.
///
/// Groups whose `max_lsn` already covers `lsn` are skipped, which makes
/// this routine safe to call from redo over partially flushed buffers. A
/// missing group ends the walk: the range simply extends past the dataset.
pub fn apply_update_args(
    buffers: &mut BufferManager,
    processor: &UpdateProcessor,
    meta: &VideoMeta,
    args: &UpdateArgs,
    lsn: Lsn,
    batch_size: u64,
) -> Result<()> {
    let start_group = group_of(args.start_frame, batch_size);
    let end_group = group_of(args.end_frame, batch_size);

    for group in start_group..=end_group {
        let batch = match buffers.read_slot(meta, group) {
            Ok(batch) => batch,
            Err(FrameStoreError::GroupMissing { .. }) => break,
            Err(e) => return Err(e),
        };

        debug!("Applying lsn {} over group {} (max_lsn {})", lsn, group, batch.max_lsn());
        if lsn <= batch.max_lsn() {
            continue;
        }

        let mut touched = Vec::new();
        for frame in &batch.frames {
            if args.contains(frame.id) {
                touched.push(Frame {
                    id: frame.id,
                    data: processor.apply(&frame.data, meta, args)?,
                    lsn,
                });
            }
        }
        if !touched.is_empty() {
            buffers.write_slot(meta, Batch::new(group, touched))?;
        }
    }
    Ok(())
}
