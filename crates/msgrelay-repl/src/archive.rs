//! Directory-backed source and sink.
//!
//! Source layout:
//!
//! ```text
//! <dir>/items.jsonl              one Item per line, ascending id
//! <dir>/media/<handle>           media bytes
//! <dir>/media/<handle>.meta.json optional {"filename": .., "mime_type": ..}
//! ```
//!
//! Sink layout: `<dir>/sent.jsonl` with one [`SentRecord`] per send call and
//! every uploaded file under `<dir>/media/`.

use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, AsyncWriteExt, BufReader};
use tracing::{debug, info};

use crate::error::{ReplError, ReplResult};
use crate::item::{FormattingSpan, Item, ItemId, MediaKind, MediaRef};
use crate::media::{sanitize_filename, Attachment};
use crate::remote::{
    DownloadedMedia, EntityHandle, MessageSink, MessageSource, RemoteMessageId, SendConfirmation,
};

/// Items file inside a source archive.
pub const ITEMS_FILE: &str = "items.jsonl";
/// Send log inside a sink archive.
pub const SENT_FILE: &str = "sent.jsonl";
/// Media directory inside either archive.
pub const MEDIA_DIR: &str = "media";

/// Optional sidecar describing a media file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MediaMeta {
    /// Original filename.
    #[serde(default)]
    pub filename: Option<String>,
    /// MIME type.
    #[serde(default)]
    pub mime_type: Option<String>,
}

fn map_resolve_error(identifier: &str, e: io::Error) -> ReplError {
    match e.kind() {
        io::ErrorKind::NotFound => ReplError::EntityNotFound {
            entity: identifier.to_string(),
        },
        io::ErrorKind::PermissionDenied => ReplError::AccessDenied {
            entity: identifier.to_string(),
        },
        _ => ReplError::Io(e),
    }
}

/// Reads an archive directory.
#[derive(Debug, Default)]
pub struct ArchiveSource {
    /// Byte offset just past the last item returned, keyed by that item's id,
    /// so sequential windows do not rescan the file.
    cursor: Mutex<Option<(ItemId, u64)>>,
}

impl ArchiveSource {
    /// Create a source. Directories are chosen at `resolve` time.
    pub fn new() -> Self {
        Self::default()
    }

    fn items_path(handle: &EntityHandle) -> PathBuf {
        Path::new(&handle.address).join(ITEMS_FILE)
    }

    fn resume_offset(&self, after_id: Option<ItemId>) -> u64 {
        let cursor = self.cursor.lock().map(|c| *c).unwrap_or(None);
        match (cursor, after_id) {
            (Some((id, offset)), Some(after)) if id == after => offset,
            _ => 0,
        }
    }
}

#[async_trait]
impl MessageSource for ArchiveSource {
    async fn resolve(&self, identifier: &str) -> ReplResult<EntityHandle> {
        let dir = PathBuf::from(identifier);
        let meta = tokio::fs::metadata(&dir)
            .await
            .map_err(|e| map_resolve_error(identifier, e))?;
        if !meta.is_dir() {
            return Err(ReplError::EntityNotFound {
                entity: identifier.to_string(),
            });
        }
        tokio::fs::metadata(dir.join(ITEMS_FILE))
            .await
            .map_err(|e| map_resolve_error(identifier, e))?;
        info!(source = identifier, "archive source resolved");
        Ok(EntityHandle::new(identifier, dir.to_string_lossy()))
    }

    async fn iterate(
        &self,
        source: &EntityHandle,
        after_id: Option<ItemId>,
        limit: usize,
    ) -> ReplResult<Vec<Item>> {
        let mut file = tokio::fs::File::open(Self::items_path(source)).await?;
        let mut offset = self.resume_offset(after_id);
        if offset > 0 {
            file.seek(SeekFrom::Start(offset)).await?;
        }
        let mut reader = BufReader::new(file);
        let mut line = String::new();
        let mut items = Vec::with_capacity(limit.min(1024));
        while items.len() < limit {
            line.clear();
            let read = reader.read_line(&mut line).await?;
            if read == 0 {
                break;
            }
            offset += read as u64;
            if line.trim().is_empty() {
                continue;
            }
            let item: Item = serde_json::from_str(&line)?;
            if after_id.is_some_and(|after| item.id <= after) {
                continue;
            }
            items.push(item);
        }
        if let Some(last) = items.last() {
            if let Ok(mut cursor) = self.cursor.lock() {
                *cursor = Some((last.id, offset));
            }
        }
        Ok(items)
    }

    async fn fetch_item(&self, source: &EntityHandle, id: ItemId) -> ReplResult<Option<Item>> {
        let file = tokio::fs::File::open(Self::items_path(source)).await?;
        let mut lines = BufReader::new(file).lines();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let item: Item = serde_json::from_str(&line)?;
            if item.id == id {
                return Ok(Some(item));
            }
            if item.id > id {
                break;
            }
        }
        Ok(None)
    }

    async fn download(
        &self,
        source: &EntityHandle,
        media: &MediaRef,
    ) -> ReplResult<DownloadedMedia> {
        let unavailable = |reason: String| ReplError::MediaUnavailable { item_id: 0, reason };
        if media.handle.is_empty()
            || media.handle.contains(['/', '\\'])
            || media.handle.starts_with('.')
        {
            return Err(unavailable(format!("invalid media handle {:?}", media.handle)));
        }
        let dir = Path::new(&source.address).join(MEDIA_DIR);
        let bytes = match tokio::fs::read(dir.join(&media.handle)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(unavailable(format!("media {} not in archive", media.handle)))
            }
            Err(e) => return Err(e.into()),
        };
        let meta = match tokio::fs::read(dir.join(format!("{}.meta.json", media.handle))).await {
            Ok(raw) => serde_json::from_slice::<MediaMeta>(&raw)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => MediaMeta::default(),
            Err(e) => return Err(e.into()),
        };
        debug!(handle = %media.handle, size = bytes.len(), "archive media read");
        Ok(DownloadedMedia {
            bytes,
            filename: meta.filename,
            mime_type: meta.mime_type,
        })
    }
}

/// One uploaded file as recorded by the sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentAttachment {
    /// Filename as uploaded.
    pub filename: String,
    /// MIME type as uploaded.
    pub mime_type: String,
    /// Media kind.
    pub kind: MediaKind,
    /// Size in bytes.
    pub size: u64,
    /// Path of the stored copy, relative to the sink directory.
    pub stored_as: String,
}

/// One send call as recorded by the sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentRecord {
    /// Message ids assigned.
    pub message_ids: Vec<RemoteMessageId>,
    /// Whether this was a grouped send.
    pub grouped: bool,
    /// Text or caption.
    pub text: String,
    /// Formatting spans.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub formatting: Vec<FormattingSpan>,
    /// Uploaded files.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<SentAttachment>,
}

/// Writes sends into an archive directory.
#[derive(Debug, Default)]
pub struct ArchiveSink {
    next_id: AtomicU64,
}

impl ArchiveSink {
    /// Create a sink. The directory is chosen at `resolve` time.
    pub fn new() -> Self {
        Self::default()
    }

    /// Read back every record of a sink directory.
    pub async fn read_sent(dir: &Path) -> ReplResult<Vec<SentRecord>> {
        let file = match tokio::fs::File::open(dir.join(SENT_FILE)).await {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut lines = BufReader::new(file).lines();
        let mut records = Vec::new();
        while let Some(line) = lines.next_line().await? {
            if !line.trim().is_empty() {
                records.push(serde_json::from_str(&line)?);
            }
        }
        Ok(records)
    }

    async fn record(
        &self,
        sink: &EntityHandle,
        text: &str,
        formatting: &[FormattingSpan],
        attachments: &[&Attachment],
        grouped: bool,
    ) -> ReplResult<SendConfirmation> {
        let dir = Path::new(&sink.address);
        let parts = attachments.len().max(1) as u64;
        let first = self.next_id.fetch_add(parts, Ordering::SeqCst) + 1;
        let message_ids: Vec<RemoteMessageId> = (first..first + parts).collect();

        let mut stored = Vec::with_capacity(attachments.len());
        for (attachment, id) in attachments.iter().zip(&message_ids) {
            let name = format!("{id}_{}", sanitize_filename(&attachment.filename));
            tokio::fs::write(dir.join(MEDIA_DIR).join(&name), &attachment.bytes).await?;
            stored.push(SentAttachment {
                filename: attachment.filename.clone(),
                mime_type: attachment.mime_type.clone(),
                kind: attachment.kind,
                size: attachment.bytes.len() as u64,
                stored_as: format!("{MEDIA_DIR}/{name}"),
            });
        }

        let record = SentRecord {
            message_ids: message_ids.clone(),
            grouped,
            text: text.to_string(),
            formatting: formatting.to_vec(),
            attachments: stored,
        };
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(SENT_FILE))
            .await?;
        file.write_all(&line).await?;
        file.sync_data().await?;
        Ok(SendConfirmation { message_ids })
    }
}

#[async_trait]
impl MessageSink for ArchiveSink {
    async fn resolve(&self, identifier: &str) -> ReplResult<EntityHandle> {
        let dir = PathBuf::from(identifier);
        tokio::fs::create_dir_all(dir.join(MEDIA_DIR))
            .await
            .map_err(|e| map_resolve_error(identifier, e))?;
        let existing = Self::read_sent(&dir).await?;
        let max_id = existing
            .iter()
            .flat_map(|r| r.message_ids.iter().copied())
            .max()
            .unwrap_or(0);
        self.next_id.store(max_id, Ordering::SeqCst);
        info!(sink = identifier, existing = existing.len(), "archive sink resolved");
        Ok(EntityHandle::new(identifier, dir.to_string_lossy()))
    }

    async fn send_single(
        &self,
        sink: &EntityHandle,
        text: &str,
        formatting: &[FormattingSpan],
        attachment: Option<&Attachment>,
    ) -> ReplResult<SendConfirmation> {
        let attachments: Vec<&Attachment> = attachment.into_iter().collect();
        self.record(sink, text, formatting, &attachments, false).await
    }

    async fn send_group(
        &self,
        sink: &EntityHandle,
        text: &str,
        formatting: &[FormattingSpan],
        attachments: &[Attachment],
    ) -> ReplResult<SendConfirmation> {
        let attachments: Vec<&Attachment> = attachments.iter().collect();
        self.record(sink, text, formatting, &attachments, true).await
    }
}
