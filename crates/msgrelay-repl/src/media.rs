//! Media download and re-upload preparation.
//!
//! Protected sources cannot be forwarded from, so every attachment is
//! downloaded and sent again as a fresh upload. The produced [`Attachment`]
//! always carries a filename with an extension matching its content; the
//! sink would otherwise show it as an anonymous file.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{ReplError, ReplResult};
use crate::item::{Item, ItemId, MediaKind};
use crate::remote::{EntityHandle, MessageSource};

/// Longest filename most filesystems and remote APIs accept, in bytes.
pub const MAX_FILENAME_BYTES: usize = 255;

/// Default cap on a single attachment (2 GiB).
pub const DEFAULT_MAX_ATTACHMENT_BYTES: u64 = 2 * 1024 * 1024 * 1024;

const FORBIDDEN_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Extensions preferred over whatever the MIME database lists first
/// (it yields `jfif` for `image/jpeg`, for instance).
const PREFERRED_EXTENSIONS: &[(&str, &str)] = &[
    ("image/jpeg", "jpg"),
    ("image/png", "png"),
    ("image/gif", "gif"),
    ("image/webp", "webp"),
    ("video/mp4", "mp4"),
    ("video/quicktime", "mov"),
    ("video/webm", "webm"),
    ("audio/mpeg", "mp3"),
    ("audio/ogg", "ogg"),
    ("audio/mp4", "m4a"),
    ("audio/wav", "wav"),
    ("application/pdf", "pdf"),
    ("application/zip", "zip"),
    ("text/plain", "txt"),
];

/// A downloaded, re-uploadable file.
#[derive(Clone, PartialEq, Eq)]
pub struct Attachment {
    /// File contents.
    pub bytes: Vec<u8>,
    /// Filename with a kind-appropriate extension. Never empty.
    pub filename: String,
    /// MIME type sent alongside the upload.
    pub mime_type: String,
    /// Media kind, which decides how the sink renders it.
    pub kind: MediaKind,
    /// Source item the media belonged to.
    pub source_item_id: ItemId,
}

impl fmt::Debug for Attachment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Attachment")
            .field("filename", &self.filename)
            .field("mime_type", &self.mime_type)
            .field("kind", &self.kind)
            .field("source_item_id", &self.source_item_id)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// Downloads media for items of one source.
pub struct MediaTransfer {
    source: Arc<dyn MessageSource>,
    handle: EntityHandle,
    max_attachment_bytes: u64,
}

impl MediaTransfer {
    /// Create a transfer bound to a resolved source.
    pub fn new(source: Arc<dyn MessageSource>, handle: EntityHandle, max_attachment_bytes: u64) -> Self {
        Self {
            source,
            handle,
            max_attachment_bytes,
        }
    }

    /// Download the media of `item` and name it.
    ///
    /// Fails with `MediaUnavailable` for permanently gone or oversized media
    /// and `StaleReference` when the handle has expired; both carry the id of
    /// `item`, whatever the binding reported.
    pub async fn fetch(&self, item: &Item) -> ReplResult<Attachment> {
        let media = item.media.as_ref().ok_or_else(|| ReplError::MediaUnavailable {
            item_id: item.id,
            reason: "item has no media".to_string(),
        })?;

        let downloaded = self
            .source
            .download(&self.handle, media)
            .await
            .map_err(|e| match e {
                ReplError::StaleReference { .. } => ReplError::StaleReference { item_id: item.id },
                ReplError::MediaUnavailable { reason, .. } => ReplError::MediaUnavailable {
                    item_id: item.id,
                    reason,
                },
                other => other,
            })?;

        if downloaded.bytes.is_empty() {
            return Err(ReplError::MediaUnavailable {
                item_id: item.id,
                reason: "download returned no data".to_string(),
            });
        }
        let size = downloaded.bytes.len() as u64;
        if size > self.max_attachment_bytes {
            warn!(
                item_id = item.id,
                size,
                limit = self.max_attachment_bytes,
                "attachment exceeds size limit"
            );
            return Err(ReplError::MediaUnavailable {
                item_id: item.id,
                reason: format!("{size} bytes exceeds limit of {}", self.max_attachment_bytes),
            });
        }

        let mime_type = downloaded
            .mime_type
            .as_deref()
            .map(normalize_mime)
            .filter(|m| !m.is_empty())
            .or_else(|| {
                downloaded
                    .filename
                    .as_deref()
                    .and_then(|name| mime_guess::from_path(name).first_raw())
                    .map(str::to_string)
            })
            .unwrap_or_else(|| default_mime(media.kind).to_string());
        let filename = attachment_filename(
            downloaded.filename.as_deref(),
            Some(&mime_type),
            media.kind,
            item.id,
        );
        debug!(item_id = item.id, %filename, %mime_type, size, "downloaded media");

        Ok(Attachment {
            bytes: downloaded.bytes,
            filename,
            mime_type,
            kind: media.kind,
            source_item_id: item.id,
        })
    }

    /// Re-fetch an item to obtain fresh media references.
    pub async fn refresh_item(&self, id: ItemId) -> ReplResult<Option<Item>> {
        self.source.fetch_item(&self.handle, id).await
    }
}

/// Filename for an attachment.
///
/// A usable original name is kept (sanitized, with an extension appended
/// when it has none); otherwise one is synthesized as `<kind>_<id>.<ext>`.
pub fn attachment_filename(
    original: Option<&str>,
    mime_type: Option<&str>,
    kind: MediaKind,
    id: ItemId,
) -> String {
    let ext = extension_for(mime_type, kind);
    match original.map(sanitize_filename).filter(|n| !n.is_empty()) {
        Some(name) if has_extension(&name) => name,
        Some(name) => cap_length(format!("{name}.{ext}")),
        None => format!("{}_{}.{}", kind.label(), id, ext),
    }
}

/// Replace characters remote filesystems reject and cap the length.
///
/// Returns an empty string when nothing usable is left.
pub fn sanitize_filename(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_control() || FORBIDDEN_CHARS.contains(&c) {
                '_'
            } else {
                c
            }
        })
        .collect();
    let trailing = |c: char| c == '.' || c.is_whitespace();
    let trimmed = cleaned.trim_start().trim_end_matches(trailing);
    let capped = cap_length(trimmed.to_string());
    let capped = capped.trim_end_matches(trailing);
    if capped.chars().all(|c| c == '_' || c == '.') {
        return String::new();
    }
    capped.to_string()
}

/// Extension for a MIME type, falling back to the kind's usual format.
pub fn extension_for(mime_type: Option<&str>, kind: MediaKind) -> String {
    let Some(mime) = mime_type.map(normalize_mime).filter(|m| !m.is_empty()) else {
        return default_extension(kind).to_string();
    };
    if let Some((_, ext)) = PREFERRED_EXTENSIONS.iter().find(|(m, _)| *m == mime) {
        return (*ext).to_string();
    }
    mime_guess::get_mime_extensions_str(&mime)
        .and_then(|exts| {
            exts.iter()
                .find(|e| {
                    e.chars().all(|c| c.is_ascii_alphanumeric()) && e.chars().any(|c| c.is_ascii_alphabetic())
                })
        })
        .map(|ext| ext.to_string())
        .unwrap_or_else(|| default_extension(kind).to_string())
}

fn default_extension(kind: MediaKind) -> &'static str {
    match kind {
        MediaKind::Image => "jpg",
        MediaKind::Video => "mp4",
        MediaKind::Audio => "ogg",
        MediaKind::Document => "bin",
    }
}

fn default_mime(kind: MediaKind) -> &'static str {
    match kind {
        MediaKind::Image => "image/jpeg",
        MediaKind::Video => "video/mp4",
        MediaKind::Audio => "audio/ogg",
        MediaKind::Document => "application/octet-stream",
    }
}

fn normalize_mime(mime: &str) -> String {
    mime.split(';').next().unwrap_or("").trim().to_ascii_lowercase()
}

/// A suffix counts as an extension only when it is a known file type, so
/// names like `scan.2024` still get one appended.
fn has_extension(name: &str) -> bool {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| {
            e.len() <= 10
                && e.chars().all(|c| c.is_ascii_alphanumeric())
                && e.chars().any(|c| c.is_ascii_alphabetic())
                && mime_guess::from_ext(e).first().is_some()
        })
}

/// Truncate to `MAX_FILENAME_BYTES`, keeping a short extension intact.
fn cap_length(name: String) -> String {
    if name.len() <= MAX_FILENAME_BYTES {
        return name;
    }
    let (stem, ext) = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && ext.len() <= 16 => (stem, Some(ext)),
        _ => (name.as_str(), None),
    };
    let budget = MAX_FILENAME_BYTES - ext.map_or(0, |e| e.len() + 1);
    let mut cut = budget.min(stem.len());
    while !stem.is_char_boundary(cut) {
        cut -= 1;
    }
    match ext {
        Some(ext) => format!("{}.{}", &stem[..cut], ext),
        None => stem[..cut].to_string(),
    }
}
