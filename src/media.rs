//! Content-addressed image store for avatars and chat attachments.
//!
//! Files land under `{root}/{kind}/{owner}/{sha1-prefix}.{ext}`. The content
//! type is sniffed from magic bytes; the client's claimed type is ignored.

use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::error::{Result, RoomError};

/// Default upload limit: 5 MiB.
pub const DEFAULT_MAX_BYTES: usize = 5 * 1024 * 1024;

const HASH_PREFIX_LEN: usize = 16;
const MAX_OWNER_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Avatar,
    Message,
}

impl MediaKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "avatar" => Some(MediaKind::Avatar),
            "message" => Some(MediaKind::Message),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MediaKind::Avatar => "avatar",
            MediaKind::Message => "message",
        }
    }
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored object as reported to the uploader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMedia {
    /// Path relative to the store root, usable with `GET /media/{path}`.
    pub path: String,
    pub content_type: String,
    pub size: u64,
}

/// Sniff an image format from its leading bytes: `(content_type, extension)`.
pub fn detect_image(bytes: &[u8]) -> Option<(&'static str, &'static str)> {
    if bytes.starts_with(b"\x89PNG\r\n\x1a\n") {
        Some(("image/png", "png"))
    } else if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some(("image/jpeg", "jpg"))
    } else if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
        Some(("image/gif", "gif"))
    } else if bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        Some(("image/webp", "webp"))
    } else {
        None
    }
}

fn content_type_for(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("png") => "image/png",
        Some("jpg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        _ => "application/octet-stream",
    }
}

/// Restrict an owner id to `[A-Za-z0-9_-]`.
pub fn sanitize_owner(owner: &str) -> String {
    owner
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .take(MAX_OWNER_LEN)
        .collect()
}

fn sha1_hex(bytes: &[u8]) -> String {
    Sha1::digest(bytes)
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

#[derive(Debug, Clone)]
pub struct MediaStore {
    root: PathBuf,
    max_bytes: usize,
}

impl MediaStore {
    pub fn new(root: impl Into<PathBuf>, max_bytes: usize) -> Self {
        Self {
            root: root.into(),
            max_bytes,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Validate and write an upload. Identical content for the same owner
    /// maps to the same path.
    pub async fn store(&self, kind: MediaKind, owner: &str, bytes: &[u8]) -> Result<StoredMedia> {
        if bytes.len() > self.max_bytes {
            return Err(RoomError::PayloadTooLarge {
                size: bytes.len(),
                limit: self.max_bytes,
            });
        }
        let (content_type, ext) = detect_image(bytes)
            .ok_or_else(|| RoomError::UnsupportedMedia("expected png, jpeg, gif or webp".into()))?;
        let owner = sanitize_owner(owner);
        if owner.is_empty() {
            return Err(RoomError::invalid("owner must contain [A-Za-z0-9_-]"));
        }

        let hash = sha1_hex(bytes);
        let rel = format!("{kind}/{owner}/{}.{ext}", &hash[..HASH_PREFIX_LEN]);
        let full = self.root.join(&rel);
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&full, bytes).await?;
        tracing::debug!(path = %rel, size = bytes.len(), "stored media");

        Ok(StoredMedia {
            path: rel,
            content_type: content_type.to_string(),
            size: bytes.len() as u64,
        })
    }

    /// Read a stored object back: `(bytes, content_type)`.
    pub async fn load(&self, rel: &str) -> Result<(Vec<u8>, &'static str)> {
        let full = self.resolve(rel)?;
        match tokio::fs::read(&full).await {
            Ok(bytes) => Ok((bytes, content_type_for(&full))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(RoomError::NotFound(rel.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Map a relative path onto the store root, rejecting anything that
    /// could escape it.
    pub fn resolve(&self, rel: &str) -> Result<PathBuf> {
        let path = Path::new(rel);
        if rel.is_empty() || rel.contains('\\') {
            return Err(RoomError::invalid("bad media path"));
        }
        if !path.components().all(|c| matches!(c, Component::Normal(_))) {
            return Err(RoomError::invalid("bad media path"));
        }
        Ok(self.root.join(path))
    }
}
