//! Update arguments and the frame update processor
//!
//! An update is a named operation over an inclusive frame range, with
//! operation-specific named parameters. The processor applies operations to
//! raw RGB24 frame buffers and knows which operations are reversible; the
//! transaction manager consults it to choose a logging mode.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::catalog::VideoMeta;
use crate::error::{FrameStoreError, Result};
use crate::types::FrameId;

/// Arguments of one frame-range update operation.
///
/// Serializes as a flat JSON object `{function_name, start_frame,
/// end_frame, ...kwargs}` and round-trips to an equal value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateArgs {
    pub function_name: String,
    pub start_frame: FrameId,
    pub end_frame: FrameId,
    #[serde(flatten)]
    pub kwargs: BTreeMap<String, JsonValue>,
}

impl UpdateArgs {
    pub fn new(function_name: &str, start_frame: FrameId, end_frame: FrameId) -> Self {
        Self {
            function_name: function_name.to_string(),
            start_frame,
            end_frame,
            kwargs: BTreeMap::new(),
        }
    }

    /// Builder-style named parameter
    pub fn with_kwarg(mut self, key: &str, value: impl Into<JsonValue>) -> Self {
        self.kwargs.insert(key.to_string(), value.into());
        self
    }

    /// Whether a frame id falls inside the update's inclusive range
    pub fn contains(&self, id: FrameId) -> bool {
        self.start_frame <= id && id <= self.end_frame
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    fn f64_kwarg(&self, key: &str) -> Result<f64> {
        self.kwargs.get(key).and_then(|v| v.as_f64()).ok_or_else(|| {
            FrameStoreError::Transaction(format!(
                "Operation '{}' requires numeric parameter '{}'",
                self.function_name, key
            ))
        })
    }

    fn u64_kwarg(&self, key: &str) -> Result<u64> {
        self.kwargs.get(key).and_then(|v| v.as_u64()).ok_or_else(|| {
            FrameStoreError::Transaction(format!(
                "Operation '{}' requires integer parameter '{}'",
                self.function_name, key
            ))
        })
    }
}

/// Applies named operations to frames and reports their reversibility
#[derive(Debug, Default)]
pub struct UpdateProcessor;

impl UpdateProcessor {
    pub fn new() -> Self {
        Self
    }

    /// Apply the named operation to one frame's data blob
    pub fn apply(&self, data: &[u8], meta: &VideoMeta, args: &UpdateArgs) -> Result<Vec<u8>> {
        match args.function_name.as_str() {
            "invert_color" => Ok(invert_color(data)),
            "grayscale" => Ok(grayscale(data)),
            "contrast_brightness" => {
                let contrast = args.f64_kwarg("contrast")?;
                let brightness = args.f64_kwarg("brightness")?;
                Ok(contrast_brightness(data, contrast, brightness))
            }
            "gaussian_blur" => {
                let ksize = args.u64_kwarg("ksize")?;
                Ok(blur(data, meta.width as usize, meta.height as usize, ksize as usize))
            }
            "fill_white" => Ok(vec![255; data.len()]),
            other => Err(FrameStoreError::UnknownOperation(other.to_string())),
        }
    }

    /// Whether applying `reverse(args)` after `args` restores the input
    pub fn is_reversible(&self, args: &UpdateArgs) -> bool {
        args.function_name == "invert_color"
    }

    /// Arguments that undo `args`, frame by frame
    pub fn reverse(&self, args: &UpdateArgs) -> Result<UpdateArgs> {
        if !self.is_reversible(args) {
            return Err(FrameStoreError::not_reversible(&args.function_name));
        }
        // Inverting twice restores the original; the same operation with
        // the same range is its own inverse.
        Ok(UpdateArgs::new(
            &args.function_name,
            args.start_frame,
            args.end_frame,
        ))
    }
}

fn invert_color(data: &[u8]) -> Vec<u8> {
    data.iter().map(|b| !b).collect()
}

fn grayscale(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    for pixel in data.chunks(3) {
        if pixel.len() < 3 {
            out.extend_from_slice(pixel);
            break;
        }
        // ITU-R BT.601 luma, rounded
        let luma = (299 * pixel[0] as u32 + 587 * pixel[1] as u32 + 114 * pixel[2] as u32 + 500)
            / 1000;
        let luma = luma as u8;
        out.extend_from_slice(&[luma, luma, luma]);
    }
    out
}

fn contrast_brightness(data: &[u8], contrast: f64, brightness: f64) -> Vec<u8> {
    data.iter()
        .map(|&b| (b as f64 * contrast + brightness).round().clamp(0.0, 255.0) as u8)
        .collect()
}

/// Box-approximated blur over the frame plane, per channel, with clamped
/// edges. `ksize` is the kernel diameter; even sizes round down.
fn blur(data: &[u8], width: usize, height: usize, ksize: usize) -> Vec<u8> {
    let radius = (ksize / 2) as isize;
    if radius == 0 || width == 0 || height == 0 {
        return data.to_vec();
    }

    let idx = |x: usize, y: usize, c: usize| (y * width + x) * 3 + c;
    let clamp = |v: isize, max: usize| v.clamp(0, max as isize - 1) as usize;

    // Horizontal pass
    let mut horizontal = vec![0u8; data.len()];
    for y in 0..height {
        for x in 0..width {
            for c in 0..3 {
                let mut sum: u32 = 0;
                for dx in -radius..=radius {
                    sum += data[idx(clamp(x as isize + dx, width), y, c)] as u32;
                }
                horizontal[idx(x, y, c)] = (sum / (2 * radius as u32 + 1)) as u8;
            }
        }
    }

    // Vertical pass
    let mut out = vec![0u8; data.len()];
    for y in 0..height {
        for x in 0..width {
            for c in 0..3 {
                let mut sum: u32 = 0;
                for dy in -radius..=radius {
                    sum += horizontal[idx(x, clamp(y as isize + dy, height), c)] as u32;
                }
                out[idx(x, y, c)] = (sum / (2 * radius as u32 + 1)) as u8;
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_meta() -> VideoMeta {
        VideoMeta::new("clip", 2, 2, true)
    }

    #[test]
    fn test_args_round_trip() {
        let args = UpdateArgs::new("contrast_brightness", 0, 299)
            .with_kwarg("contrast", 2.0)
            .with_kwarg("brightness", 10.0);
        let bytes = args.serialize().unwrap();
        let decoded = UpdateArgs::deserialize(&bytes).unwrap();
        assert_eq!(decoded, args);
    }

    #[test]
    fn test_args_contains() {
        let args = UpdateArgs::new("invert_color", 100, 199);
        assert!(!args.contains(99));
        assert!(args.contains(100));
        assert!(args.contains(199));
        assert!(!args.contains(200));
    }

    #[test]
    fn test_invert_is_self_inverse() {
        let processor = UpdateProcessor::new();
        let meta = test_meta();
        let args = UpdateArgs::new("invert_color", 0, 10);
        let data: Vec<u8> = (0..12).map(|i| (i * 17) as u8).collect();

        let inverted = processor.apply(&data, &meta, &args).unwrap();
        assert_ne!(inverted, data);

        let reversed = processor.reverse(&args).unwrap();
        let restored = processor.apply(&inverted, &meta, &reversed).unwrap();
        assert_eq!(restored, data);
    }

    #[test]
    fn test_reverse_drops_kwargs() {
        let processor = UpdateProcessor::new();
        let args = UpdateArgs::new("invert_color", 5, 9).with_kwarg("ignored", 1);
        let reversed = processor.reverse(&args).unwrap();
        assert_eq!(reversed, UpdateArgs::new("invert_color", 5, 9));
    }

    #[test]
    fn test_grayscale_not_reversible() {
        let processor = UpdateProcessor::new();
        let args = UpdateArgs::new("grayscale", 0, 10);
        assert!(!processor.is_reversible(&args));
        match processor.reverse(&args) {
            Err(FrameStoreError::NotReversible(name)) => assert_eq!(name, "grayscale"),
            other => panic!("expected NotReversible, got {:?}", other),
        }
    }

    #[test]
    fn test_grayscale_flattens_channels() {
        let processor = UpdateProcessor::new();
        let meta = test_meta();
        let args = UpdateArgs::new("grayscale", 0, 10);
        let data = vec![255, 0, 0, 0, 255, 0];
        let gray = processor.apply(&data, &meta, &args).unwrap();
        assert_eq!(&gray[0..3], &[76, 76, 76]);
        assert_eq!(&gray[3..6], &[150, 150, 150]);
    }

    #[test]
    fn test_contrast_brightness_clamps() {
        let processor = UpdateProcessor::new();
        let meta = test_meta();
        let args = UpdateArgs::new("contrast_brightness", 0, 10)
            .with_kwarg("contrast", 2.0)
            .with_kwarg("brightness", 0.0);
        let out = processor.apply(&[10, 200, 128], &meta, &args).unwrap();
        assert_eq!(out, vec![20, 255, 255]);
    }

    #[test]
    fn test_contrast_brightness_missing_kwarg() {
        let processor = UpdateProcessor::new();
        let meta = test_meta();
        let args = UpdateArgs::new("contrast_brightness", 0, 10);
        assert!(processor.apply(&[0], &meta, &args).is_err());
    }

    #[test]
    fn test_blur_preserves_constant_frames() {
        let processor = UpdateProcessor::new();
        let meta = test_meta();
        let args = UpdateArgs::new("gaussian_blur", 0, 10).with_kwarg("ksize", 3);
        let data = vec![100; meta.frame_len()];
        let out = processor.apply(&data, &meta, &args).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn test_unknown_operation() {
        let processor = UpdateProcessor::new();
        let meta = test_meta();
        let args = UpdateArgs::new("sharpen", 0, 10);
        match processor.apply(&[0], &meta, &args) {
            Err(FrameStoreError::UnknownOperation(name)) => assert_eq!(name, "sharpen"),
            other => panic!("expected UnknownOperation, got {:?}", other),
        }
    }

    #[test]
    fn test_fill_white() {
        let processor = UpdateProcessor::new();
        let meta = test_meta();
        let args = UpdateArgs::new("fill_white", 0, 10);
        let out = processor.apply(&[1, 2, 3], &meta, &args).unwrap();
        assert_eq!(out, vec![255, 255, 255]);
    }
}
