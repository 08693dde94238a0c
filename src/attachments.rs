// Attachment pipeline: upload policy and data URI encoding for image files.
// Files are validated when staged and encoded only when a generation is
// submitted; a rejected file never reaches the encoded form.

use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine};
use regex::Regex;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::error::AttachmentError;

pub const ALLOWED_MIME_TYPES: [&str; 2] = ["image/jpeg", "image/png"];
pub const MAX_FILE_SIZE: u64 = 5 * 1024 * 1024;
pub const MAX_ATTACHMENTS: usize = 10;

#[derive(Debug, Clone)]
enum Contents {
    Memory(Arc<[u8]>),
    File(PathBuf),
}

/// One user-supplied file considered for upload.
#[derive(Debug, Clone)]
pub struct Attachment {
    pub name: String,
    pub mime_type: String,
    pub size_bytes: u64,
    contents: Contents,
}

impl Attachment {
    pub fn from_bytes(
        name: impl Into<String>,
        mime_type: impl Into<String>,
        bytes: impl Into<Arc<[u8]>>,
    ) -> Self {
        let bytes = bytes.into();
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            size_bytes: bytes.len() as u64,
            contents: Contents::Memory(bytes),
        }
    }

    /// Describes a file on disk without reading it; the mime type comes from
    /// the extension and the size from metadata.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, AttachmentError> {
        let path = path.as_ref();
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|source| AttachmentError::Inspect {
                path: path.display().to_string(),
                source,
            })?;

        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown")
            .to_string();
        let mime_type = mime_guess::from_path(path)
            .first_or_octet_stream()
            .essence_str()
            .to_string();

        Ok(Self {
            name,
            mime_type,
            size_bytes: metadata.len(),
            contents: Contents::File(path.to_path_buf()),
        })
    }

    async fn read(&self) -> Result<Vec<u8>, AttachmentError> {
        match &self.contents {
            Contents::Memory(bytes) => Ok(bytes.to_vec()),
            Contents::File(path) => {
                tokio::fs::read(path)
                    .await
                    .map_err(|source| AttachmentError::ReadFailure {
                        name: self.name.clone(),
                        source,
                    })
            }
        }
    }
}

/// Why a candidate file was not staged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RejectionNotice {
    #[error("{name} is not a valid image type. Please use JPEG or PNG.")]
    UnsupportedType { name: String },

    #[error("{name} is too large. Maximum size is 5MB.")]
    TooLarge { name: String },

    /// Accepted files beyond the limit were dropped.
    #[error("You can only upload up to {max} images.")]
    TooMany { max: usize, dropped: usize },
}

pub fn validate(file: &Attachment) -> Result<(), RejectionNotice> {
    if !ALLOWED_MIME_TYPES.contains(&file.mime_type.as_str()) {
        return Err(RejectionNotice::UnsupportedType {
            name: file.name.clone(),
        });
    }
    if file.size_bytes > MAX_FILE_SIZE {
        return Err(RejectionNotice::TooLarge {
            name: file.name.clone(),
        });
    }
    Ok(())
}

/// Attachments staged for the next generation, oldest first.
#[derive(Debug, Clone, Default)]
pub struct AttachmentSet {
    items: Vec<Attachment>,
}

impl AttachmentSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Attachment> {
        self.items.iter()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// Validates every candidate in order and appends the accepted ones.
    ///
    /// When the set would grow past [`MAX_ATTACHMENTS`] the accepted tail is
    /// truncated so the set ends up exactly full, and a `TooMany` notice is
    /// added after the per-file rejections.
    pub fn admit(
        &mut self,
        candidates: impl IntoIterator<Item = Attachment>,
    ) -> Vec<RejectionNotice> {
        let mut notices = Vec::new();
        let mut accepted = Vec::new();

        for candidate in candidates {
            match validate(&candidate) {
                Ok(()) => accepted.push(candidate),
                Err(notice) => {
                    debug!(file = %candidate.name, %notice, "attachment rejected");
                    notices.push(notice);
                }
            }
        }

        let room = MAX_ATTACHMENTS.saturating_sub(self.items.len());
        if accepted.len() > room {
            let dropped = accepted.len() - room;
            accepted.truncate(room);
            notices.push(RejectionNotice::TooMany {
                max: MAX_ATTACHMENTS,
                dropped,
            });
        }

        self.items.extend(accepted);
        notices
    }

    /// Removes the attachment at `index`, keeping the order of the rest.
    /// Out-of-range indices leave the set untouched.
    pub fn remove(&mut self, index: usize) -> Option<Attachment> {
        (index < self.items.len()).then(|| self.items.remove(index))
    }

    /// Encodes every staged attachment, in order.
    ///
    /// Fails as a whole on the first file that cannot be read.
    pub async fn encode(&self) -> Result<Vec<EncodedAttachment>, AttachmentError> {
        let mut encoded = Vec::with_capacity(self.items.len());
        for attachment in &self.items {
            let bytes = attachment.read().await.map_err(|e| {
                warn!(file = %attachment.name, error = %e, "attachment could not be read");
                e
            })?;
            encoded.push(EncodedAttachment::encode(&attachment.mime_type, &bytes));
        }
        Ok(encoded)
    }
}

/// A `data:<mime>;base64,<payload>` string ready for the request body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct EncodedAttachment(String);

impl EncodedAttachment {
    pub fn encode(mime_type: &str, bytes: &[u8]) -> Self {
        Self(format!(
            "data:{};base64,{}",
            mime_type,
            BASE64_STANDARD.encode(bytes)
        ))
    }

    /// Wraps an already encoded data URI (for example one pasted from a
    /// clipboard). Nothing is checked here; see [`Self::is_well_formed`].
    pub fn from_data_uri(uri: impl Into<String>) -> Self {
        Self(uri.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn mime_type(&self) -> Option<&str> {
        self.0
            .strip_prefix("data:")
            .and_then(|rest| rest.split_once(';'))
            .map(|(mime, _)| mime)
    }

    /// JPEG or PNG media type and a base64 payload whose length is a multiple of 4.
    pub fn is_well_formed(&self) -> bool {
        static DATA_URI: OnceLock<Regex> = OnceLock::new();
        let pattern = DATA_URI.get_or_init(|| {
            Regex::new(r"^data:image/(jpeg|png);base64,([A-Za-z0-9+/]*={0,2})$")
                .expect("data URI pattern is valid")
        });

        match pattern.captures(&self.0) {
            Some(caps) => caps.get(2).map_or(false, |payload| payload.len() % 4 == 0),
            None => false,
        }
    }
}
