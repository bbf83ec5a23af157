//! Image validation shared by the socket and HTTP send paths

use std::path::Path;

use base64::Engine as _;
use thiserror::Error;

use crate::error::{ChatError, ChatResult};

/// Upper bound on image size accepted by the server.
pub const MAX_IMAGE_BYTES: u64 = 5 * 1024 * 1024;

/// MIME types the server accepts for chat images.
pub const ALLOWED_IMAGE_TYPES: &[&str] = &[
    "image/jpeg",
    "image/jpg",
    "image/png",
    "image/gif",
    "image/webp",
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("unsupported image type '{0}' (allowed: JPEG, PNG, GIF, WebP)")]
    UnsupportedType(String),
    #[error("image is too large ({size} bytes, limit is {max} bytes)")]
    TooLarge { size: u64, max: u64 },
    #[error("image file is empty")]
    Empty,
}

/// Check an image's declared MIME type and size before any network call.
pub fn validate_image_file(file_type: &str, size: u64) -> Result<(), ValidationError> {
    let normalized = file_type.trim().to_ascii_lowercase();
    if !ALLOWED_IMAGE_TYPES.contains(&normalized.as_str()) {
        return Err(ValidationError::UnsupportedType(file_type.to_string()));
    }
    if size == 0 {
        return Err(ValidationError::Empty);
    }
    if size > MAX_IMAGE_BYTES {
        return Err(ValidationError::TooLarge {
            size,
            max: MAX_IMAGE_BYTES,
        });
    }
    Ok(())
}

/// Guess an image MIME type from the file extension.
pub fn mime_from_path(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "jpg" | "jpeg" => Some("image/jpeg"),
        "png" => Some("image/png"),
        "gif" => Some("image/gif"),
        "webp" => Some("image/webp"),
        _ => None,
    }
}

/// An image ready to be sent, already validated.
#[derive(Debug, Clone)]
pub struct ImageFile {
    pub file_name: String,
    pub file_type: String,
    pub data: Vec<u8>,
}

impl ImageFile {
    /// Build from in-memory bytes, validating type and size.
    pub fn new(
        file_name: impl Into<String>,
        file_type: impl Into<String>,
        data: Vec<u8>,
    ) -> ChatResult<Self> {
        let file = Self {
            file_name: file_name.into(),
            file_type: file_type.into(),
            data,
        };
        file.validate()?;
        Ok(file)
    }

    /// Read an image from disk. Size and type are checked before the file is read.
    pub async fn from_path(path: &Path) -> ChatResult<Self> {
        let file_type = mime_from_path(path).unwrap_or("application/octet-stream");
        let meta = tokio::fs::metadata(path)
            .await
            .map_err(|e| ChatError::File(format!("{}: {}", path.display(), e)))?;
        validate_image_file(file_type, meta.len())?;

        let data = tokio::fs::read(path)
            .await
            .map_err(|e| ChatError::File(format!("{}: {}", path.display(), e)))?;
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("image")
            .to_string();

        Self::new(file_name, file_type, data)
    }

    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_image_file(&self.file_type, self.size())
    }

    /// Standard base64 of the raw bytes, as carried by `send-image-message`.
    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(&self.data)
    }
}
