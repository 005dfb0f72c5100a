//! Dataset metadata
//!
//! `VideoMeta` is the immutable descriptor carried by log records and handed
//! to the page store. Only `file_url`, the frame dimensions, and the
//! has-lsn flag are serialized; the column schema is reconstructed from
//! those fields on deserialize.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Column data types a dataset schema can carry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Integer,
    Blob,
}

/// A single column descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub column_type: ColumnType,
    /// Array dimensions for blob columns (height, width, channels)
    pub dimensions: Vec<u64>,
}

/// Reconstructed schema of a dataset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoSchema {
    pub dataset_name: String,
    pub columns: Vec<ColumnDef>,
}

/// Metadata describing one video dataset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoMeta {
    /// Path of the dataset relative to the page store root
    pub file_url: String,
    /// Frame height in pixels
    pub height: u64,
    /// Frame width in pixels
    pub width: u64,
    /// Whether rows carry an `lsn` column
    pub has_lsn: bool,
}

impl VideoMeta {
    pub fn new(file_url: &str, height: u64, width: u64, has_lsn: bool) -> Self {
        Self {
            file_url: file_url.to_string(),
            height,
            width,
            has_lsn,
        }
    }

    /// Dataset name: the file stem of its url
    pub fn name(&self) -> String {
        Path::new(&self.file_url)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.file_url.clone())
    }

    /// Byte length of one frame's data blob (RGB24)
    pub fn frame_len(&self) -> usize {
        (self.height * self.width * 3) as usize
    }

    /// Rebuild the column schema from the stored fields
    pub fn schema(&self) -> VideoSchema {
        let mut columns = vec![
            ColumnDef {
                name: "id".to_string(),
                column_type: ColumnType::Integer,
                dimensions: Vec::new(),
            },
            ColumnDef {
                name: "data".to_string(),
                column_type: ColumnType::Blob,
                dimensions: vec![self.height, self.width, 3],
            },
        ];
        if self.has_lsn {
            columns.push(ColumnDef {
                name: "lsn".to_string(),
                column_type: ColumnType::Integer,
                dimensions: Vec::new(),
            });
        }
        VideoSchema {
            dataset_name: self.name(),
            columns,
        }
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
