//! Blob content and content-derived identifiers.
//!
//! A [`BlobId`] is the lower-case hex SHA-1 digest of the raw bytes followed
//! by a file extension looked up from the MIME type. The same bytes with the
//! same MIME type always produce the same id in every backend.

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use super::InvalidIdentifier;

/// MIME type assumed when a source does not declare one
pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// Fixed MIME type to extension table. Types outside it are rejected.
const EXTENSIONS: &[(&str, &str)] = &[
    ("image/jpeg", ".jpg"),
    ("image/jpg", ".jpg"),
    ("image/pjpeg", ".jpg"),
    ("image/png", ".png"),
    ("image/gif", ".gif"),
    ("image/webp", ".webp"),
    ("image/bmp", ".bmp"),
    ("image/svg+xml", ".svg"),
    ("image/tiff", ".tiff"),
    ("image/avif", ".avif"),
    ("video/mp4", ".mp4"),
    ("video/webm", ".webm"),
    ("video/quicktime", ".mov"),
    ("audio/mpeg", ".mp3"),
    ("audio/mp4", ".m4a"),
    ("audio/ogg", ".ogg"),
    ("audio/wav", ".wav"),
    ("audio/x-wav", ".wav"),
    ("audio/flac", ".flac"),
    ("application/pdf", ".pdf"),
    ("application/zip", ".zip"),
    ("application/json", ".json"),
    ("text/plain", ".txt"),
    ("text/html", ".html"),
    ("text/css", ".css"),
    ("application/octet-stream", ".bin"),
];

/// Look up the file extension (with leading dot) for a MIME type
pub fn extension_for(mime_type: &str) -> Option<&'static str> {
    let normalized = normalize_mime_type(mime_type);
    EXTENSIONS
        .iter()
        .find(|(mime, _)| *mime == normalized)
        .map(|(_, ext)| *ext)
}

/// Look up the MIME type for a blob id extension (first table match wins)
pub fn mime_type_for_extension(extension: &str) -> Option<&'static str> {
    EXTENSIONS
        .iter()
        .find(|(_, ext)| ext.trim_start_matches('.') == extension.trim_start_matches('.'))
        .map(|(mime, _)| *mime)
}

/// Lower-case a MIME type and drop parameters such as `; charset=utf-8`
pub fn normalize_mime_type(mime_type: &str) -> String {
    mime_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// Byte payload plus MIME type. Length is always derived from the bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Content {
    bytes: Bytes,
    mime_type: String,
}

impl Content {
    /// Create content; an empty MIME type falls back to [`DEFAULT_MIME_TYPE`]
    pub fn new(bytes: impl Into<Bytes>, mime_type: &str) -> Self {
        let mut mime_type = normalize_mime_type(mime_type);
        if mime_type.is_empty() {
            mime_type = DEFAULT_MIME_TYPE.to_string();
        }
        Self {
            bytes: bytes.into(),
            mime_type,
        }
    }

    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Hex SHA-1 digest of the raw bytes
    pub fn sha1_hex(&self) -> String {
        let mut hasher = Sha1::new();
        hasher.update(&self.bytes);
        hex::encode(hasher.finalize())
    }

    pub fn into_bytes(self) -> Bytes {
        self.bytes
    }
}

/// Content-addressed blob identifier: `<40 hex sha1><.ext>`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BlobId(String);

impl BlobId {
    /// Compute the id for some content. Returns `None` when the MIME type
    /// has no entry in the extension table.
    pub fn for_content(content: &Content) -> Option<Self> {
        let extension = extension_for(content.mime_type())?;
        Some(Self(format!("{}{}", content.sha1_hex(), extension)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The extension part of the id, including the leading dot
    pub fn extension(&self) -> &str {
        &self.0[40..]
    }

    /// MIME type implied by the extension
    pub fn mime_type(&self) -> &'static str {
        mime_type_for_extension(self.extension()).unwrap_or(DEFAULT_MIME_TYPE)
    }
}

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for BlobId {
    type Err = InvalidIdentifier;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidIdentifier::Blob(s.to_string());

        if s.len() <= 41 || !s.is_char_boundary(40) {
            return Err(invalid());
        }
        let (digest, extension) = s.split_at(40);
        let digest_ok = digest
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        let extension_ok = extension.starts_with('.')
            && extension[1..]
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit());

        if digest_ok && extension_ok {
            Ok(Self(s.to_string()))
        } else {
            Err(invalid())
        }
    }
}

impl TryFrom<String> for BlobId {
    type Error = InvalidIdentifier;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<BlobId> for String {
    fn from(id: BlobId) -> Self {
        id.0
    }
}
