//! Abstract remote binding for the message source and sink.
//!
//! The pipeline never talks to a concrete API. It drives a [`MessageSource`]
//! for reads and downloads and a [`MessageSink`] for sends; the directory
//! archive in [`crate::archive`] and the scripted doubles in the tests both
//! implement these traits.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ReplResult;
use crate::item::{FormattingSpan, Item, ItemId, MediaRef};
use crate::media::Attachment;

/// Message id assigned by the sink.
pub type RemoteMessageId = u64;

/// A resolved source or sink entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityHandle {
    /// The identifier the operator configured.
    pub identifier: String,
    /// Binding-specific resolved address.
    pub address: String,
}

impl EntityHandle {
    /// Create a handle.
    pub fn new(identifier: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            address: address.into(),
        }
    }
}

/// Raw media bytes plus whatever metadata the source had.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedMedia {
    /// File contents.
    pub bytes: Vec<u8>,
    /// Original filename, when the source recorded one.
    pub filename: Option<String>,
    /// MIME type, when the source recorded one.
    pub mime_type: Option<String>,
}

/// Sink acknowledgement for one send call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendConfirmation {
    /// Ids of the messages created on the sink, one per delivered part.
    pub message_ids: Vec<RemoteMessageId>,
}

/// Read side of the remote binding.
///
/// Implementations map remote failures onto the crate taxonomy:
/// `EntityNotFound` / `AccessDenied` from `resolve`, `MediaUnavailable` or
/// `StaleReference` from `download`, `MandatoryWait` whenever the remote
/// imposes a pause, and `Remote` for anything else.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Resolve an operator-supplied identifier.
    async fn resolve(&self, identifier: &str) -> ReplResult<EntityHandle>;

    /// Up to `limit` items with id greater than `after_id`, ascending by id.
    async fn iterate(
        &self,
        source: &EntityHandle,
        after_id: Option<ItemId>,
        limit: usize,
    ) -> ReplResult<Vec<Item>>;

    /// Re-fetch a single item by id, yielding fresh media references.
    async fn fetch_item(&self, source: &EntityHandle, id: ItemId) -> ReplResult<Option<Item>>;

    /// Download the bytes behind a media reference.
    async fn download(&self, source: &EntityHandle, media: &MediaRef)
        -> ReplResult<DownloadedMedia>;
}

/// Write side of the remote binding.
#[async_trait]
pub trait MessageSink: Send + Sync {
    /// Resolve an operator-supplied identifier.
    async fn resolve(&self, identifier: &str) -> ReplResult<EntityHandle>;

    /// Send one message with an optional attachment.
    async fn send_single(
        &self,
        sink: &EntityHandle,
        text: &str,
        formatting: &[FormattingSpan],
        attachment: Option<&Attachment>,
    ) -> ReplResult<SendConfirmation>;

    /// Send several attachments as one grouped message with a caption.
    async fn send_group(
        &self,
        sink: &EntityHandle,
        text: &str,
        formatting: &[FormattingSpan],
        attachments: &[Attachment],
    ) -> ReplResult<SendConfirmation>;
}
