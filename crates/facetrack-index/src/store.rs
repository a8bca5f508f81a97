//! Atomic on-disk persistence for the gallery.
//!
//! Three files live in the data directory and are always written together:
//!
//!   metadata.json   entry list (face id, person id, metadata), JSON
//!   embeddings.bin  raw f32 matrix, little-endian, `FTEM` header
//!   index.bin       backend-specific structure blob, `FTIX` header
//!
//! Each file is written to a temporary sibling and renamed into place, so a
//! crash mid-checkpoint leaves the previous consistent triple on disk. The
//! index blob is an optimization only; when it is missing or fails
//! validation the backend is rebuilt from the embeddings.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use ndarray::{Array2, ArrayView2};
use thiserror::Error;
use tracing::{debug, warn};

use crate::backend::BackendKind;
use crate::types::IndexEntry;

const METADATA_FILE: &str = "metadata.json";
const EMBEDDINGS_FILE: &str = "embeddings.bin";
const INDEX_FILE: &str = "index.bin";

const EMBEDDINGS_MAGIC: &[u8; 4] = b"FTEM";
const INDEX_MAGIC: &[u8; 4] = b"FTIX";
const FORMAT_VERSION: u16 = 1;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("metadata error: {0}")]
    Serde(#[from] serde_json::Error),
    /// File did not parse: bad magic, version, or truncation.
    #[error("format error: {0}")]
    Format(String),
    /// Files parsed individually but disagree with each other.
    #[error("inconsistent state: {0}")]
    Inconsistent(String),
}

/// Everything needed to reconstruct a matcher from disk.
#[derive(Debug)]
pub struct LoadedState {
    pub entries: Vec<IndexEntry>,
    pub embeddings: Array2<f32>,
    /// Backend blob, present only when readable and matching the embeddings.
    pub index_blob: Option<(BackendKind, Vec<u8>)>,
}

#[derive(Clone)]
pub struct IndexStore {
    dir: PathBuf,
}

impl IndexStore {
    /// Open a store rooted at `dir`, creating the directory if needed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// Write `bytes` to `name` via a temp file and rename. Readers always
    /// see either the old content or the new, never a partial write.
    fn write_atomic(&self, name: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let tmp = self.path(&format!("{name}.tmp"));
        let dest = self.path(name);
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &dest)?;
        Ok(())
    }

    /// Persist a complete snapshot of the gallery.
    pub fn save(
        &self,
        entries: &[IndexEntry],
        embeddings: ArrayView2<'_, f32>,
        kind: BackendKind,
        index_blob: &[u8],
    ) -> Result<(), StoreError> {
        if entries.len() != embeddings.nrows() {
            return Err(StoreError::Inconsistent(format!(
                "{} entries but {} embedding rows",
                entries.len(),
                embeddings.nrows()
            )));
        }

        self.write_atomic(METADATA_FILE, &serde_json::to_vec_pretty(entries)?)?;
        self.write_atomic(EMBEDDINGS_FILE, &encode_embeddings(embeddings))?;
        self.write_atomic(INDEX_FILE, &encode_index(kind, index_blob))?;

        debug!(
            entries = entries.len(),
            dim = embeddings.ncols(),
            dir = %self.dir.display(),
            "gallery checkpoint written"
        );
        Ok(())
    }

    /// Load the persisted gallery, `Ok(None)` when nothing has been saved
    /// yet. A corrupt index blob is not fatal; it is dropped with a warning
    /// and the caller rebuilds the backend from the embeddings.
    pub fn load(&self, expected_dim: usize) -> Result<Option<LoadedState>, StoreError> {
        let metadata_path = self.path(METADATA_FILE);
        if !metadata_path.exists() {
            return Ok(None);
        }

        let entries: Vec<IndexEntry> = serde_json::from_slice(&fs::read(&metadata_path)?)?;
        let embeddings = decode_embeddings(&fs::read(self.path(EMBEDDINGS_FILE))?)?;

        if embeddings.nrows() != entries.len() {
            return Err(StoreError::Inconsistent(format!(
                "metadata lists {} entries, embeddings file holds {} rows",
                entries.len(),
                embeddings.nrows()
            )));
        }
        if !entries.is_empty() && embeddings.ncols() != expected_dim {
            return Err(StoreError::Inconsistent(format!(
                "embeddings have dim {}, matcher configured for {expected_dim}",
                embeddings.ncols()
            )));
        }

        let index_blob = match fs::read(self.path(INDEX_FILE)) {
            Ok(bytes) => match decode_index(&bytes) {
                Ok(blob) => Some(blob),
                Err(err) => {
                    warn!(error = %err, "index blob unreadable, will rebuild");
                    None
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(err) => return Err(err.into()),
        };

        Ok(Some(LoadedState {
            entries,
            embeddings,
            index_blob,
        }))
    }
}

fn encode_embeddings(embeddings: ArrayView2<'_, f32>) -> Vec<u8> {
    let (rows, cols) = embeddings.dim();
    let mut out = Vec::with_capacity(14 + rows * cols * 4);
    out.extend_from_slice(EMBEDDINGS_MAGIC);
    out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    out.extend_from_slice(&(rows as u32).to_le_bytes());
    out.extend_from_slice(&(cols as u32).to_le_bytes());
    for value in embeddings.iter() {
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}

fn decode_embeddings(bytes: &[u8]) -> Result<Array2<f32>, StoreError> {
    if bytes.len() < 14 {
        return Err(StoreError::Format("embeddings file truncated".into()));
    }
    if &bytes[0..4] != EMBEDDINGS_MAGIC {
        return Err(StoreError::Format("bad embeddings magic".into()));
    }
    let version = u16::from_le_bytes([bytes[4], bytes[5]]);
    if version != FORMAT_VERSION {
        return Err(StoreError::Format(format!(
            "unsupported embeddings version {version}"
        )));
    }
    let rows = u32::from_le_bytes(bytes[6..10].try_into().unwrap()) as usize;
    let cols = u32::from_le_bytes(bytes[10..14].try_into().unwrap()) as usize;

    // Header fields are untrusted; the size product must not overflow.
    let expected = rows
        .checked_mul(cols)
        .and_then(|n| n.checked_mul(4))
        .ok_or_else(|| {
            StoreError::Format(format!("embeddings header implies {rows}x{cols} matrix"))
        })?;
    let payload = &bytes[14..];
    if payload.len() != expected {
        return Err(StoreError::Format(format!(
            "embeddings payload is {} bytes, header implies {expected}",
            payload.len()
        )));
    }

    let values: Vec<f32> = payload
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes(c.try_into().unwrap()))
        .collect();
    Array2::from_shape_vec((rows, cols), values)
        .map_err(|e| StoreError::Format(format!("embeddings shape: {e}")))
}

fn encode_index(kind: BackendKind, blob: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(7 + blob.len());
    out.extend_from_slice(INDEX_MAGIC);
    out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    out.push(kind.tag());
    out.extend_from_slice(blob);
    out
}

fn decode_index(bytes: &[u8]) -> Result<(BackendKind, Vec<u8>), StoreError> {
    if bytes.len() < 7 {
        return Err(StoreError::Format("index file truncated".into()));
    }
    if &bytes[0..4] != INDEX_MAGIC {
        return Err(StoreError::Format("bad index magic".into()));
    }
    let version = u16::from_le_bytes([bytes[4], bytes[5]]);
    if version != FORMAT_VERSION {
        return Err(StoreError::Format(format!(
            "unsupported index version {version}"
        )));
    }
    let kind = BackendKind::from_tag(bytes[6])
        .ok_or_else(|| StoreError::Format(format!("unknown backend tag {}", bytes[6])))?;
    Ok((kind, bytes[7..].to_vec()))
}
