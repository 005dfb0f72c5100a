//! Page store: persistence for frame-partitioned datasets
//!
//! ## Storage Format
//!
//! Each dataset lives in its own directory under the store root:
//!
//! ```text
//! store_root/
//! └── videos/traffic001/
//!     ├── meta.json     # serialized VideoMeta
//!     ├── group_0       # bincode-serialized Batch
//!     ├── group_1
//!     └── ...
//! ```
//!
//! Group files hold whole batches; a write merges incoming rows into the
//! existing group file by id and replaces the file atomically
//! (tempfile + rename). Writes are not atomic across groups — transactional
//! atomicity is the transaction manager's job, not the store's.
//!
//! Staged before/after delta files use the same bincode batch encoding, so
//! a delta read back from a transaction's scratch directory can be handed
//! straight to `write`.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::catalog::VideoMeta;
use crate::error::{FrameStoreError, Result};
use crate::pressure::{self, PressurePoint, PressurePointBehavior, PressurePointLocation};
use crate::types::Batch;

/// File-backed partitioned dataset store
#[derive(Debug)]
pub struct PageStore {
    root: PathBuf,
}

impl PageStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn dataset_dir(&self, meta: &VideoMeta) -> PathBuf {
        self.root.join(&meta.file_url)
    }

    fn group_path(&self, meta: &VideoMeta, group: u64) -> PathBuf {
        self.dataset_dir(meta).join(format!("group_{}", group))
    }

    /// Initialize an empty, partitioned dataset at `meta.file_url`,
    /// replacing any existing dataset of the same name
    pub fn create(&self, meta: &VideoMeta) -> Result<()> {
        let dir = self.dataset_dir(meta);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        fs::create_dir_all(&dir)?;

        let bytes = serde_json::to_vec_pretty(meta)?;
        write_file_atomic(&dir.join("meta.json"), &bytes)
    }

    /// Merge `batch` into its group file. Rows replace same-id rows already
    /// present; new rows are inserted in id order.
    pub fn write(&self, meta: &VideoMeta, batch: &Batch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        if pressure::has(PressurePoint::new(
            PressurePointLocation::PageStoreDuringWrite,
            PressurePointBehavior::ErrorAtStartOfWrite,
        )) {
            return Err(FrameStoreError::Storage(format!(
                "Injected failure before writing group {} of '{}'",
                batch.group, meta.file_url
            )));
        }

        debug!(
            "Writing dataset {} group {} ({} rows)",
            meta.file_url,
            batch.group,
            batch.frames.len()
        );

        let path = self.group_path(meta, batch.group);
        let merged = match self.read_group_if_exists(meta, batch.group)? {
            Some(mut resident) => {
                for frame in &batch.frames {
                    match resident.frames.iter_mut().find(|f| f.id == frame.id) {
                        Some(existing) => *existing = frame.clone(),
                        None => resident.frames.push(frame.clone()),
                    }
                }
                resident.frames.sort_by_key(|f| f.id);
                resident
            }
            None => {
                let mut fresh = batch.clone();
                fresh.frames.sort_by_key(|f| f.id);
                fresh
            }
        };

        if pressure::has(PressurePoint::new(
            PressurePointLocation::PageStoreDuringWrite,
            PressurePointBehavior::ErrorMidWrite,
        )) {
            // Model a torn write: half the rows land in the final file,
            // bypassing the atomic-replace path.
            let torn = Batch::new(
                merged.group,
                merged.frames[..merged.frames.len() / 2].to_vec(),
            );
            let bytes = bincode::serialize(&torn)?;
            File::create(&path)?.write_all(&bytes)?;
            return Err(FrameStoreError::Storage(format!(
                "Injected failure while writing group {} of '{}'",
                batch.group, meta.file_url
            )));
        }

        let bytes = bincode::serialize(&merged)?;
        write_file_atomic(&path, &bytes)
    }

    /// Lazy per-group read. With `group`, the iterator yields exactly that
    /// group or `GroupMissing`; without, it yields every existing group in
    /// order and stops at the first gap.
    pub fn read<'a>(&'a self, meta: &'a VideoMeta, group: Option<u64>) -> GroupIter<'a> {
        GroupIter {
            store: self,
            meta,
            target: group,
            next_group: group.unwrap_or(0),
            done: false,
        }
    }

    /// Read one group, failing with `GroupMissing` when it does not exist
    pub fn read_group(&self, meta: &VideoMeta, group: u64) -> Result<Batch> {
        self.read_group_if_exists(meta, group)?
            .ok_or_else(|| FrameStoreError::group_missing(&meta.file_url, group))
    }

    fn read_group_if_exists(&self, meta: &VideoMeta, group: u64) -> Result<Option<Batch>> {
        let path = self.group_path(meta, group);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path)?;
        Ok(Some(bincode::deserialize(&bytes)?))
    }
}

/// Restartable iterator over a dataset's groups
pub struct GroupIter<'a> {
    store: &'a PageStore,
    meta: &'a VideoMeta,
    target: Option<u64>,
    next_group: u64,
    done: bool,
}

impl Iterator for GroupIter<'_> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if self.target.is_some() {
            self.done = true;
            return Some(self.store.read_group(self.meta, self.next_group));
        }
        match self.store.read_group_if_exists(self.meta, self.next_group) {
            Ok(Some(batch)) => {
                self.next_group += 1;
                Some(Ok(batch))
            }
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Write a staged delta batch to `path`, creating parent directories
pub fn write_delta(path: &Path, batch: &Batch) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let bytes = bincode::serialize(batch)?;
    write_file_atomic(path, &bytes)
}

/// Read one staged delta batch
pub fn read_delta(path: &Path) -> Result<Batch> {
    let bytes = fs::read(path)?;
    Ok(bincode::deserialize(&bytes)?)
}

/// Collect every `{base}_{group}` delta file, ascending by group number
pub fn read_deltas(base: &Path) -> Result<Vec<(u64, Batch)>> {
    let parent = match base.parent() {
        Some(p) if p.exists() => p,
        _ => return Ok(Vec::new()),
    };
    let prefix = match base.file_name() {
        Some(name) => format!("{}_", name.to_string_lossy()),
        None => return Ok(Vec::new()),
    };

    let mut deltas = Vec::new();
    for entry in fs::read_dir(parent)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        let Some(suffix) = name.strip_prefix(prefix.as_str()) else {
            continue;
        };
        let Ok(group) = suffix.parse::<u64>() else {
            warn!("Ignoring unrecognized delta file '{}'", name);
            continue;
        };
        deltas.push((group, read_delta(&entry.path())?));
    }
    deltas.sort_by_key(|(group, _)| *group);
    Ok(deltas)
}

fn write_file_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path.parent().ok_or_else(|| {
        FrameStoreError::Storage(format!("Path '{}' has no parent directory", path.display()))
    })?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(bytes)?;
    tmp.persist(path).map_err(|e| FrameStoreError::Io(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Frame, NO_LSN};
    use tempfile::tempdir;

    fn frames(ids: std::ops::Range<u64>) -> Vec<Frame> {
        ids.map(|id| Frame {
            id,
            data: vec![id as u8; 4],
            lsn: NO_LSN,
        })
        .collect()
    }

    #[test]
    fn test_create_write_read_round_trip() {
        let dir = tempdir().unwrap();
        let store = PageStore::new(dir.path()).unwrap();
        let meta = VideoMeta::new("videos/clip", 1, 1, true);

        store.create(&meta).unwrap();
        store.write(&meta, &Batch::new(0, frames(0..3))).unwrap();
        store.write(&meta, &Batch::new(1, frames(100..103))).unwrap();

        let batches: Vec<Batch> = store
            .read(&meta, None)
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].group, 0);
        assert_eq!(batches[0].frames.len(), 3);
        assert_eq!(batches[1].group, 1);
    }

    #[test]
    fn test_write_merges_by_id() {
        let dir = tempdir().unwrap();
        let store = PageStore::new(dir.path()).unwrap();
        let meta = VideoMeta::new("clip", 1, 1, true);

        store.create(&meta).unwrap();
        store.write(&meta, &Batch::new(0, frames(0..4))).unwrap();

        let delta = Batch::new(
            0,
            vec![Frame { id: 2, data: vec![9, 9, 9, 9], lsn: 17 }],
        );
        store.write(&meta, &delta).unwrap();

        let batch = store.read_group(&meta, 0).unwrap();
        assert_eq!(batch.frames.len(), 4);
        let updated = batch.frame(2).unwrap();
        assert_eq!(updated.data, vec![9, 9, 9, 9]);
        assert_eq!(updated.lsn, 17);
        assert_eq!(batch.frame(1).unwrap().lsn, NO_LSN);
    }

    #[test]
    fn test_targeted_read_missing_group() {
        let dir = tempdir().unwrap();
        let store = PageStore::new(dir.path()).unwrap();
        let meta = VideoMeta::new("clip", 1, 1, true);
        store.create(&meta).unwrap();
        store.write(&meta, &Batch::new(0, frames(0..2))).unwrap();

        let mut iter = store.read(&meta, Some(5));
        match iter.next() {
            Some(Err(FrameStoreError::GroupMissing { group, .. })) => assert_eq!(group, 5),
            other => panic!("expected GroupMissing, got {:?}", other),
        }
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_iteration_stops_at_gap() {
        let dir = tempdir().unwrap();
        let store = PageStore::new(dir.path()).unwrap();
        let meta = VideoMeta::new("clip", 1, 1, true);
        store.create(&meta).unwrap();
        store.write(&meta, &Batch::new(0, frames(0..2))).unwrap();
        store.write(&meta, &Batch::new(2, frames(200..202))).unwrap();

        let batches: Vec<Batch> = store
            .read(&meta, None)
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].group, 0);
    }

    #[test]
    fn test_empty_batch_write_is_noop() {
        let dir = tempdir().unwrap();
        let store = PageStore::new(dir.path()).unwrap();
        let meta = VideoMeta::new("clip", 1, 1, true);
        store.create(&meta).unwrap();
        store.write(&meta, &Batch::new(0, Vec::new())).unwrap();
        assert!(store.read_group_if_exists(&meta, 0).unwrap().is_none());
    }

    #[test]
    fn test_delta_files_round_trip() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("txn/clip.v0_old");

        write_delta(
            &dir.path().join("txn/clip.v0_old_1"),
            &Batch::new(1, frames(100..102)),
        )
        .unwrap();
        write_delta(
            &dir.path().join("txn/clip.v0_old_0"),
            &Batch::new(0, frames(0..2)),
        )
        .unwrap();
        // A sibling from another version must not be picked up.
        write_delta(
            &dir.path().join("txn/clip.v1_old_0"),
            &Batch::new(0, frames(0..1)),
        )
        .unwrap();

        let deltas = read_deltas(&base).unwrap();
        assert_eq!(deltas.len(), 2);
        assert_eq!(deltas[0].0, 0);
        assert_eq!(deltas[1].0, 1);
        assert_eq!(deltas[1].1.frames.len(), 2);
    }

    #[test]
    fn test_read_deltas_missing_dir() {
        let dir = tempdir().unwrap();
        let deltas = read_deltas(&dir.path().join("nope/clip.v0_old")).unwrap();
        assert!(deltas.is_empty());
    }
}
