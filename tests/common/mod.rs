//! Shared fixtures for integration tests
#![allow(dead_code)]

use std::sync::{Mutex, MutexGuard, OnceLock};

use rand::{Rng, SeedableRng};

use framestore::{
    Batch, BufferManager, Frame, FrameId, PageStore, UpdateArgs, UpdateProcessor, VideoMeta,
    NO_LSN,
};

pub const FRAME_HEIGHT: u64 = 4;
pub const FRAME_WIDTH: u64 = 6;

/// Serialize tests and clear global state. The pressure-point registry is
/// process-wide, so scenarios must not interleave.
pub fn setup() -> MutexGuard<'static, ()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    let guard = LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    let _ = env_logger::builder().is_test(true).try_init();
    framestore::pressure::reset();
    guard
}

/// Deterministic per-frame payload so expected values can be regenerated
pub fn frame_data(id: FrameId, len: usize) -> Vec<u8> {
    let mut rng = rand::rngs::StdRng::seed_from_u64(id);
    (0..len).map(|_| rng.gen()).collect()
}

/// Create a dataset of `frames` rows partitioned into `batch_size` groups
pub fn write_video(
    store: &PageStore,
    file_url: &str,
    frames: u64,
    batch_size: u64,
) -> VideoMeta {
    let meta = VideoMeta::new(file_url, FRAME_HEIGHT, FRAME_WIDTH, true);
    store.create(&meta).expect("create dataset");

    let mut id = 0;
    while id < frames {
        let group = id / batch_size;
        let rows: Vec<Frame> = (id..frames.min(id + batch_size))
            .map(|id| Frame {
                id,
                data: frame_data(id, meta.frame_len()),
                lsn: NO_LSN,
            })
            .collect();
        store.write(&meta, &Batch::new(group, rows)).expect("seed group");
        id += batch_size;
    }
    meta
}

/// The dataset's frames as originally seeded
pub fn original_frames(meta: &VideoMeta, frames: u64) -> Vec<Frame> {
    (0..frames)
        .map(|id| Frame {
            id,
            data: frame_data(id, meta.frame_len()),
            lsn: NO_LSN,
        })
        .collect()
}

/// Apply an update to an expected-state vector, leaving `lsn` untouched
pub fn apply_expected(frames: &[Frame], meta: &VideoMeta, args: &UpdateArgs) -> Vec<Frame> {
    let processor = UpdateProcessor::new();
    frames
        .iter()
        .map(|frame| {
            if args.contains(frame.id) {
                Frame {
                    id: frame.id,
                    data: processor
                        .apply(&frame.data, meta, args)
                        .expect("apply expected update"),
                    lsn: frame.lsn,
                }
            } else {
                frame.clone()
            }
        })
        .collect()
}

/// Read every frame of the dataset through the buffer manager
pub fn collect_frames(buffers: &mut BufferManager, meta: &VideoMeta, groups: u64) -> Vec<Frame> {
    let mut frames = Vec::new();
    for group in 0..groups {
        frames.extend(buffers.read_slot(meta, group).expect("read group").frames.clone());
    }
    frames
}

/// Ids and payloads only, for comparisons that ignore LSN stamps
pub fn payloads(frames: &[Frame]) -> Vec<(FrameId, Vec<u8>)> {
    frames.iter().map(|f| (f.id, f.data.clone())).collect()
}
