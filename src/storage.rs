//! Image persistence.
//!
//! The sequencer hands every downloaded frame to an [`ImageStore`] as an
//! [`ImageRecord`]. Stores can also hand a frame back by its (group, image)
//! position, which is how a supervisor retrieves a finished capture.
//!
//! - `FileImageStore` writes frames into an output directory
//! - `MemoryImageStore` keeps frames in memory (tests, dry runs)

use crate::imager::ImageRecord;
use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// A frame read back from a store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredImage {
    /// Name the frame was stored under
    pub filename: String,
    /// Encoded frame
    pub payload: Bytes,
    /// Container format tag
    pub format: String,
}

/// Destination for downloaded frames.
#[async_trait]
pub trait ImageStore: Send + Sync {
    /// Persist a frame, returning where it ended up.
    async fn save(&self, record: &ImageRecord) -> Result<PathBuf>;

    /// Read back the frame captured at zero-based (group, image), if any.
    async fn load(&self, group: usize, image: u32) -> Result<Option<StoredImage>>;
}

// =============================================================================
// FileImageStore
// =============================================================================

/// Writes each frame to `<output_dir>/<filename>`.
///
/// Frames are first written to a `.part` file named after the save token and
/// renamed into place, so a crash mid-write never leaves a truncated image under
/// the final name and two saves of the same name never share a scratch file.
pub struct FileImageStore {
    output_dir: PathBuf,
    index: Mutex<HashMap<(usize, u32), (String, String)>>,
}

impl FileImageStore {
    /// Create a store rooted at `output_dir`. The directory is created on first save.
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            index: Mutex::new(HashMap::new()),
        }
    }

    /// Directory frames are written to.
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }
}

#[async_trait]
impl ImageStore for FileImageStore {
    async fn save(&self, record: &ImageRecord) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.output_dir)
            .await
            .with_context(|| format!("Failed to create output directory {:?}", self.output_dir))?;

        let path = self.output_dir.join(&record.filename);
        let partial = self
            .output_dir
            .join(format!("{}.{}.part", record.filename, record.token));
        tokio::fs::write(&partial, &record.payload)
            .await
            .with_context(|| format!("Failed to write {:?}", partial))?;
        tokio::fs::rename(&partial, &path)
            .await
            .with_context(|| format!("Failed to move {:?} into place", path))?;

        self.index.lock().await.insert(
            (record.group, record.image),
            (record.filename.clone(), record.format.clone()),
        );
        info!(path = %path.display(), bytes = record.payload.len(), "Image written");
        Ok(path)
    }

    async fn load(&self, group: usize, image: u32) -> Result<Option<StoredImage>> {
        let Some((filename, format)) = self.index.lock().await.get(&(group, image)).cloned()
        else {
            debug!(group, image, "No stored image at position");
            return Ok(None);
        };
        let path = self.output_dir.join(&filename);
        let payload = tokio::fs::read(&path)
            .await
            .with_context(|| format!("Failed to read {:?}", path))?;
        Ok(Some(StoredImage {
            filename,
            payload: Bytes::from(payload),
            format,
        }))
    }
}

// =============================================================================
// MemoryImageStore
// =============================================================================

/// Keeps frames in memory, in the order they were saved.
#[derive(Default)]
pub struct MemoryImageStore {
    records: Mutex<Vec<ImageRecord>>,
    fail_next: Mutex<Option<String>>,
}

impl MemoryImageStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next save fail with `reason`.
    pub async fn fail_next_save(&self, reason: impl Into<String>) {
        *self.fail_next.lock().await = Some(reason.into());
    }

    /// Names of saved frames in save order.
    pub async fn filenames(&self) -> Vec<String> {
        self.records
            .lock()
            .await
            .iter()
            .map(|r| r.filename.clone())
            .collect()
    }

    /// Number of saved frames.
    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    /// Whether nothing has been saved.
    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }
}

#[async_trait]
impl ImageStore for MemoryImageStore {
    async fn save(&self, record: &ImageRecord) -> Result<PathBuf> {
        if let Some(reason) = self.fail_next.lock().await.take() {
            anyhow::bail!(reason);
        }
        self.records.lock().await.push(record.clone());
        Ok(PathBuf::from(&record.filename))
    }

    async fn load(&self, group: usize, image: u32) -> Result<Option<StoredImage>> {
        Ok(self
            .records
            .lock()
            .await
            .iter()
            .rev()
            .find(|r| r.group == group && r.image == image)
            .map(|r| StoredImage {
                filename: r.filename.clone(),
                payload: r.payload.clone(),
                format: r.format.clone(),
            }))
    }
}
