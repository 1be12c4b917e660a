use axum::extract::Multipart;
use std::path::PathBuf;
use thiserror::Error;
use tracing::info;

use crate::publisher::{MessagePublisher, PublisherError};

/// Errors that can occur in the upload pipeline
#[derive(Error, Debug)]
pub enum UploadError {
    #[error("no file provided")]
    NoFile,

    #[error("Failed to store file at {path}: {message}")]
    Storage { path: String, message: String },

    #[error(transparent)]
    Publish(#[from] PublisherError),
}

/// Filesystem store for uploaded files
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create the storage root if it does not exist
    pub fn ensure_root(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.root)
    }

    /// Write `data` under the storage root using the client-supplied
    /// filename as-is. An existing file with the same name is overwritten.
    pub async fn save(&self, filename: &str, data: &[u8]) -> Result<PathBuf, UploadError> {
        let path = self.root.join(filename);
        tokio::fs::write(&path, data)
            .await
            .map_err(|e| UploadError::Storage {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;
        Ok(path)
    }
}

/// Pull the uploaded file out of the multipart body and run it through
/// the store-then-publish pipeline. Returns the stored filename.
pub async fn handle_upload(
    mut multipart: Multipart,
    store: &FileStore,
    publisher: &dyn MessagePublisher,
    queue: &str,
) -> Result<String, UploadError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|_| UploadError::NoFile)?
    {
        if field.name() != Some("file") {
            continue;
        }

        let filename = match field.file_name() {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => return Err(UploadError::NoFile),
        };

        let data = field.bytes().await.map_err(|_| UploadError::NoFile)?;

        store_and_publish(store, publisher, queue, &filename, &data).await?;
        return Ok(filename);
    }

    Err(UploadError::NoFile)
}

/// Store the file, then notify the queue.
///
/// The file is on disk before the notification goes out. A publish
/// failure leaves the stored file in place.
pub async fn store_and_publish(
    store: &FileStore,
    publisher: &dyn MessagePublisher,
    queue: &str,
    filename: &str,
    data: &[u8],
) -> Result<PathBuf, UploadError> {
    let path = store.save(filename, data).await?;

    publisher.publish(queue, filename.as_bytes()).await?;

    metrics::counter!("gateway.files.stored").increment(1);
    metrics::counter!("gateway.bytes.stored").increment(data.len() as u64);
    info!(filename = %filename, bytes = data.len(), "File stored and queued");

    Ok(path)
}
