//! Raw image input: asserted MIME type and decoding.

use image::{DynamicImage, ImageFormat};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("unsupported image type: {0}")]
    UnsupportedType(String),
    #[error("image could not be decoded: {0}")]
    Malformed(#[from] image::ImageError),
    #[error("image has zero area ({width}x{height})")]
    Empty { width: u32, height: u32 },
}

/// Image formats accepted at the boundary.
///
/// Always spelled as a MIME type, in configuration as well as on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ImageKind {
    #[serde(rename = "image/png")]
    Png,
    #[serde(rename = "image/jpeg")]
    Jpeg,
}

impl ImageKind {
    /// Parse a MIME type such as `image/png`.
    pub fn from_mime(mime: &str) -> Option<Self> {
        match mime.trim().to_ascii_lowercase().as_str() {
            "image/png" => Some(Self::Png),
            "image/jpeg" => Some(Self::Jpeg),
            _ => None,
        }
    }

    pub fn mime(self) -> &'static str {
        match self {
            Self::Png => "image/png",
            Self::Jpeg => "image/jpeg",
        }
    }

    fn format(self) -> ImageFormat {
        match self {
            Self::Png => ImageFormat::Png,
            Self::Jpeg => ImageFormat::Jpeg,
        }
    }
}

impl fmt::Display for ImageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mime())
    }
}

impl FromStr for ImageKind {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_mime(s).ok_or_else(|| DecodeError::UnsupportedType(s.to_string()))
    }
}

/// Decode raw bytes as the asserted image kind.
///
/// The caller's MIME assertion is trusted: a PNG labelled as JPEG fails here
/// rather than being sniffed into a different decoder.
pub fn decode_image(bytes: &[u8], kind: ImageKind) -> Result<DynamicImage, DecodeError> {
    let image = image::load_from_memory_with_format(bytes, kind.format())?;
    if image.width() == 0 || image.height() == 0 {
        return Err(DecodeError::Empty {
            width: image.width(),
            height: image.height(),
        });
    }
    tracing::debug!(
        kind = %kind,
        width = image.width(),
        height = image.height(),
        "decoded input image"
    );
    Ok(image)
}
