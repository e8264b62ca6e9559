//! Video payload encoding
//!
//! Turns a video blob into the inline attachment carried by the first turn of
//! an analysis: the declared content type plus the bytes as standard base64.

use crate::error::ChatError;
use base64::Engine;
use std::path::PathBuf;
use tracing::{debug, instrument};

/// Where a blob's bytes live
#[derive(Debug, Clone)]
pub(crate) enum BlobSource {
    /// Bytes already held in memory (e.g. fetched from a URL)
    Memory(Vec<u8>),
    /// Bytes read lazily from a local file
    File(PathBuf),
}

/// A single video handed to the encoder by input acquisition.
#[derive(Debug, Clone)]
pub(crate) struct VideoBlob {
    pub(crate) name: String,
    pub(crate) mime_type: String,
    pub(crate) size: u64,
    pub(crate) source: BlobSource,
}

impl VideoBlob {
    pub(crate) fn from_bytes(name: impl Into<String>, mime_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            size: bytes.len() as u64,
            source: BlobSource::Memory(bytes),
        }
    }

    pub(crate) fn from_file(
        name: impl Into<String>,
        mime_type: impl Into<String>,
        size: u64,
        path: PathBuf,
    ) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            size,
            source: BlobSource::File(path),
        }
    }

    async fn read_bytes(&self) -> Result<Vec<u8>, ChatError> {
        match &self.source {
            BlobSource::Memory(bytes) => Ok(bytes.clone()),
            BlobSource::File(path) => tokio::fs::read(path).await.map_err(|e| {
                ChatError::Encoding(format!("could not read {}: {}", path.display(), e))
            }),
        }
    }
}

/// Text-safe representation of a video for the request body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Attachment {
    /// Standard base64 of the raw bytes
    pub(crate) data: String,
    pub(crate) mime_type: String,
}

/// Encode a blob into an attachment
#[instrument(skip(blob), fields(name = %blob.name, mime_type = %blob.mime_type))]
pub(crate) async fn encode(blob: &VideoBlob) -> Result<Attachment, ChatError> {
    let bytes = blob.read_bytes().await?;
    if bytes.is_empty() {
        return Err(ChatError::Encoding(format!("{} is empty", blob.name)));
    }

    let data = base64::engine::general_purpose::STANDARD.encode(&bytes);
    debug!(raw_bytes = bytes.len(), encoded_len = data.len(), "Encoded video attachment");

    Ok(Attachment {
        data,
        mime_type: blob.mime_type.clone(),
    })
}
