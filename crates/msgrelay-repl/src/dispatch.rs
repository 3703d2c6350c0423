//! One processing unit in, one remote send out.
//!
//! A single becomes one `send_single` call. An album becomes one
//! `send_group` call carrying every attachment that could be fetched plus
//! the caption of whichever member has text. Media that is permanently gone
//! is dropped with a logged reason; the unit is only skipped when nothing at
//! all is left to send. Every remote call is preceded by a rate-limiter slot.
//!
//! The dispatcher never decides to skip on an error: stale references,
//! mandatory waits and remote failures are returned to the recovery
//! controller unchanged.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::checkpoint::CheckpointStore;
use crate::dedup::{Deduplicator, Fingerprint};
use crate::error::{ReplError, ReplResult};
use crate::item::{FormattingSpan, ItemId, ProcessingUnit, UnitDescriptor};
use crate::media::{Attachment, MediaTransfer};
use crate::rate_limit::RateLimiter;
use crate::remote::{EntityHandle, MessageSink, RemoteMessageId, SendConfirmation};

/// How a unit ended up on the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendOutcome {
    /// Everything was delivered.
    Sent,
    /// Delivered, but some attachments were unavailable and left out.
    Degraded,
    /// Every attachment was unavailable; only the text was delivered.
    TextOnly,
    /// Nothing deliverable: service item, or no media and no caption.
    Skipped,
    /// Logged instead of sent.
    DryRun,
}

impl SendOutcome {
    /// Whether a remote send happened.
    pub fn delivered(self) -> bool {
        matches!(self, SendOutcome::Sent | SendOutcome::Degraded | SendOutcome::TextOnly)
    }
}

/// An attachment left out of a send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DroppedAttachment {
    /// Item whose media was dropped.
    pub item_id: ItemId,
    /// Why.
    pub reason: String,
}

/// Result of dispatching one unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReport {
    /// Unit id range.
    pub descriptor: UnitDescriptor,
    /// Source ids of the unit's items.
    pub source_ids: Vec<ItemId>,
    /// Message ids created on the sink.
    pub target_ids: Vec<RemoteMessageId>,
    /// Number of attachments delivered.
    pub attachments: usize,
    /// Attachments left out.
    pub dropped: Vec<DroppedAttachment>,
    /// Overall result.
    pub outcome: SendOutcome,
}

impl SendReport {
    fn new(unit: &ProcessingUnit, outcome: SendOutcome) -> Self {
        Self {
            descriptor: unit.descriptor(),
            source_ids: unit.items().iter().map(|i| i.id).collect(),
            target_ids: Vec::new(),
            attachments: 0,
            dropped: Vec::new(),
            outcome,
        }
    }
}

/// Sends processing units to the sink.
pub struct Dispatcher {
    sink: Arc<dyn MessageSink>,
    sink_handle: EntityHandle,
    media: MediaTransfer,
    rate: RateLimiter,
    dry_run: bool,
    sends: u64,
}

impl Dispatcher {
    /// Create a dispatcher.
    pub fn new(
        sink: Arc<dyn MessageSink>,
        sink_handle: EntityHandle,
        media: MediaTransfer,
        rate: RateLimiter,
        dry_run: bool,
    ) -> Self {
        Self {
            sink,
            sink_handle,
            media,
            rate,
            dry_run,
            sends: 0,
        }
    }

    /// Media transfer used for downloads and item refreshes.
    pub fn media(&self) -> &MediaTransfer {
        &self.media
    }

    /// The rate limiter in front of every send.
    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate
    }

    /// Whether sends are only logged.
    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Remote send calls issued so far, retries included.
    pub fn sends(&self) -> u64 {
        self.sends
    }

    /// Dispatch one unit.
    pub async fn send(&mut self, unit: &ProcessingUnit) -> ReplResult<SendReport> {
        let descriptor = unit.descriptor();
        if unit.is_content_empty() {
            debug!(%descriptor, "service item without content, skipping");
            return Ok(SendReport::new(unit, SendOutcome::Skipped));
        }
        if self.dry_run {
            let (text, _) = unit.caption();
            info!(
                %descriptor,
                album = unit.is_album(),
                items = unit.len(),
                media = unit.items().iter().filter(|i| i.media.is_some()).count(),
                text_len = text.len(),
                "dry run: would send unit"
            );
            return Ok(SendReport::new(unit, SendOutcome::DryRun));
        }

        let mut report = SendReport::new(unit, SendOutcome::Sent);
        let mut attachments = Vec::new();
        for item in unit.items().iter().filter(|i| i.media.is_some()) {
            match self.media.fetch(item).await {
                Ok(attachment) => attachments.push(attachment),
                Err(ReplError::MediaUnavailable { item_id, reason }) => {
                    warn!(%descriptor, item_id, %reason, "dropping unavailable attachment");
                    report.dropped.push(DroppedAttachment { item_id, reason });
                }
                Err(e) => return Err(e),
            }
        }

        let (text, formatting) = unit.caption();
        if attachments.is_empty() && text.trim().is_empty() {
            warn!(%descriptor, "all media unavailable and no caption, skipping unit");
            report.outcome = SendOutcome::Skipped;
            return Ok(report);
        }

        let confirmation = self.deliver(text, formatting, &attachments).await?;
        report.target_ids = confirmation.message_ids;
        report.attachments = attachments.len();
        report.outcome = match (report.dropped.is_empty(), attachments.is_empty()) {
            (true, _) => SendOutcome::Sent,
            (false, true) => SendOutcome::TextOnly,
            (false, false) => SendOutcome::Degraded,
        };
        info!(
            %descriptor,
            attachments = report.attachments,
            dropped = report.dropped.len(),
            target_ids = ?report.target_ids,
            "dispatched unit"
        );
        Ok(report)
    }

    async fn deliver(
        &mut self,
        text: &str,
        formatting: &[FormattingSpan],
        attachments: &[Attachment],
    ) -> ReplResult<SendConfirmation> {
        self.rate.acquire().await?;
        self.sends += 1;
        match attachments {
            [] => {
                self.sink
                    .send_single(&self.sink_handle, text, formatting, None)
                    .await
            }
            [one] => {
                self.sink
                    .send_single(&self.sink_handle, text, formatting, Some(one))
                    .await
            }
            many => {
                self.sink
                    .send_group(&self.sink_handle, text, formatting, many)
                    .await
            }
        }
    }

    /// Record a completed unit: mark its fingerprint and move the cursor.
    ///
    /// `advance_to` is the highest id that is safe to checkpoint, which can be
    /// below the unit's own maximum when lower ids are still outstanding.
    /// Dry runs record nothing.
    pub fn commit(
        &self,
        unit: &ProcessingUnit,
        advance_to: Option<ItemId>,
        dedup: &mut Deduplicator,
        checkpoint: &mut CheckpointStore,
    ) -> ReplResult<()> {
        if self.dry_run {
            return Ok(());
        }
        dedup.mark_seen(Fingerprint::of(unit))?;
        checkpoint.complete(unit.descriptor(), advance_to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::{Item, MediaKind, MediaRef};
    use crate::rate_limit::RateLimitConfig;
    use crate::remote::{DownloadedMedia, MessageSource};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    struct Source;

    #[async_trait]
    impl MessageSource for Source {
        async fn resolve(&self, identifier: &str) -> ReplResult<EntityHandle> {
            Ok(EntityHandle::new(identifier, identifier))
        }

        async fn iterate(
            &self,
            _source: &EntityHandle,
            _after_id: Option<ItemId>,
            _limit: usize,
        ) -> ReplResult<Vec<Item>> {
            Ok(Vec::new())
        }

        async fn fetch_item(&self, _source: &EntityHandle, _id: ItemId) -> ReplResult<Option<Item>> {
            Ok(None)
        }

        async fn download(
            &self,
            _source: &EntityHandle,
            media: &MediaRef,
        ) -> ReplResult<DownloadedMedia> {
            if media.handle.starts_with("gone") {
                return Err(ReplError::MediaUnavailable {
                    item_id: 0,
                    reason: "deleted".into(),
                });
            }
            Ok(DownloadedMedia {
                bytes: media.handle.as_bytes().to_vec(),
                filename: None,
                mime_type: None,
            })
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Single { text: String, file: Option<String> },
        Group { text: String, files: Vec<String> },
    }

    #[derive(Default)]
    struct Sink {
        calls: Mutex<Vec<Call>>,
    }

    #[async_trait]
    impl MessageSink for Sink {
        async fn resolve(&self, identifier: &str) -> ReplResult<EntityHandle> {
            Ok(EntityHandle::new(identifier, identifier))
        }

        async fn send_single(
            &self,
            _sink: &EntityHandle,
            text: &str,
            _formatting: &[FormattingSpan],
            attachment: Option<&Attachment>,
        ) -> ReplResult<SendConfirmation> {
            let mut calls = self.calls.lock().unwrap();
            calls.push(Call::Single {
                text: text.to_string(),
                file: attachment.map(|a| a.filename.clone()),
            });
            Ok(SendConfirmation {
                message_ids: vec![calls.len() as u64],
            })
        }

        async fn send_group(
            &self,
            _sink: &EntityHandle,
            text: &str,
            _formatting: &[FormattingSpan],
            attachments: &[Attachment],
        ) -> ReplResult<SendConfirmation> {
            let mut calls = self.calls.lock().unwrap();
            calls.push(Call::Group {
                text: text.to_string(),
                files: attachments.iter().map(|a| a.filename.clone()).collect(),
            });
            Ok(SendConfirmation {
                message_ids: (0..attachments.len() as u64).collect(),
            })
        }
    }

    fn dispatcher(sink: Arc<Sink>, dry_run: bool) -> Dispatcher {
        let media = MediaTransfer::new(Arc::new(Source), EntityHandle::new("src", "src"), 1 << 20);
        let rate = RateLimiter::new(RateLimitConfig {
            max_per_window: 100,
            window: Duration::from_secs(3600),
            min_interval: Duration::from_secs(3),
        });
        Dispatcher::new(sink, EntityHandle::new("dst", "dst"), media, rate, dry_run)
    }

    fn photo(id: ItemId, handle: &str) -> Item {
        Item::text(id, id, "").with_media(MediaRef::new(handle, MediaKind::Image))
    }

    fn album(items: Vec<Item>) -> ProcessingUnit {
        ProcessingUnit::album(1, items.into_iter().map(|i| i.in_group(1)).collect()).unwrap()
    }

    mod singles {
        use super::*;

        #[tokio::test(start_paused = true)]
        async fn test_text_single() {
            let sink = Arc::new(Sink::default());
            let mut d = dispatcher(sink.clone(), false);
            let report = d
                .send(&ProcessingUnit::Single(Item::text(1, 0, "hello")))
                .await
                .unwrap();
            assert_eq!(report.outcome, SendOutcome::Sent);
            assert_eq!(report.target_ids, vec![1]);
            assert_eq!(
                sink.calls.lock().unwrap()[0],
                Call::Single {
                    text: "hello".into(),
                    file: None
                }
            );
        }

        #[tokio::test(start_paused = true)]
        async fn test_media_single_named() {
            let sink = Arc::new(Sink::default());
            let mut d = dispatcher(sink.clone(), false);
            d.send(&ProcessingUnit::Single(photo(482, "p"))).await.unwrap();
            assert_eq!(
                sink.calls.lock().unwrap()[0],
                Call::Single {
                    text: String::new(),
                    file: Some("image_482.jpg".into())
                }
            );
        }

        #[tokio::test(start_paused = true)]
        async fn test_unavailable_media_with_text_goes_text_only() {
            let sink = Arc::new(Sink::default());
            let mut d = dispatcher(sink.clone(), false);
            let mut item = photo(3, "gone");
            item.text = "still here".into();
            let report = d.send(&ProcessingUnit::Single(item)).await.unwrap();
            assert_eq!(report.outcome, SendOutcome::TextOnly);
            assert_eq!(report.dropped.len(), 1);
            assert_eq!(report.dropped[0].item_id, 3);
        }

        #[tokio::test(start_paused = true)]
        async fn test_service_item_skipped_without_send() {
            let sink = Arc::new(Sink::default());
            let mut d = dispatcher(sink.clone(), false);
            let report = d.send(&ProcessingUnit::Single(Item::text(5, 0, ""))).await.unwrap();
            assert_eq!(report.outcome, SendOutcome::Skipped);
            assert_eq!(d.sends(), 0);
            assert!(sink.calls.lock().unwrap().is_empty());
        }
    }

    mod albums {
        use super::*;

        #[tokio::test(start_paused = true)]
        async fn test_caption_from_member_with_text() {
            let sink = Arc::new(Sink::default());
            let mut d = dispatcher(sink.clone(), false);
            let mut second = photo(2, "b");
            second.text = "caption".into();
            d.send(&album(vec![photo(1, "a"), second, photo(3, "c")]))
                .await
                .unwrap();
            assert_eq!(
                sink.calls.lock().unwrap()[0],
                Call::Group {
                    text: "caption".into(),
                    files: vec!["image_1.jpg".into(), "image_2.jpg".into(), "image_3.jpg".into()]
                }
            );
        }

        #[tokio::test(start_paused = true)]
        async fn test_failed_members_dropped() {
            let sink = Arc::new(Sink::default());
            let mut d = dispatcher(sink.clone(), false);
            let report = d
                .send(&album(vec![photo(1, "a"), photo(2, "gone"), photo(3, "c")]))
                .await
                .unwrap();
            assert_eq!(report.outcome, SendOutcome::Degraded);
            assert_eq!(report.attachments, 2);
            assert!(matches!(&sink.calls.lock().unwrap()[0], Call::Group { files, .. } if files.len() == 2));
        }

        #[tokio::test(start_paused = true)]
        async fn test_single_survivor_sent_as_single() {
            let sink = Arc::new(Sink::default());
            let mut d = dispatcher(sink.clone(), false);
            d.send(&album(vec![photo(1, "gone"), photo(2, "b")])).await.unwrap();
            assert!(matches!(&sink.calls.lock().unwrap()[0], Call::Single { file: Some(_), .. }));
        }

        #[tokio::test(start_paused = true)]
        async fn test_all_failed_without_caption_skipped() {
            let sink = Arc::new(Sink::default());
            let mut d = dispatcher(sink.clone(), false);
            let report = d
                .send(&album(vec![photo(1, "gone1"), photo(2, "gone2")]))
                .await
                .unwrap();
            assert_eq!(report.outcome, SendOutcome::Skipped);
            assert_eq!(report.dropped.len(), 2);
            assert!(sink.calls.lock().unwrap().is_empty());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sends_are_spaced() {
        let sink = Arc::new(Sink::default());
        let mut d = dispatcher(sink.clone(), false);
        let start = tokio::time::Instant::now();
        for id in 1..=3 {
            d.send(&ProcessingUnit::Single(Item::text(id, 0, "x"))).await.unwrap();
        }
        assert!(start.elapsed() >= Duration::from_secs(6));
        assert_eq!(d.sends(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dry_run_sends_and_records_nothing() {
        let sink = Arc::new(Sink::default());
        let mut d = dispatcher(sink.clone(), true);
        let unit = ProcessingUnit::Single(photo(1, "a"));
        let report = d.send(&unit).await.unwrap();
        assert_eq!(report.outcome, SendOutcome::DryRun);
        assert!(sink.calls.lock().unwrap().is_empty());

        let mut dedup = Deduplicator::in_memory(10);
        let mut checkpoint = CheckpointStore::ephemeral();
        d.commit(&unit, Some(1), &mut dedup, &mut checkpoint).unwrap();
        assert!(dedup.is_empty());
        assert_eq!(checkpoint.last_completed_id(), None);
    }

    #[test]
    fn test_commit_marks_and_advances() {
        let d = dispatcher(Arc::new(Sink::default()), false);
        let unit = ProcessingUnit::Single(Item::text(9, 0, "x"));
        let mut dedup = Deduplicator::in_memory(10);
        let mut checkpoint = CheckpointStore::ephemeral();
        d.commit(&unit, Some(9), &mut dedup, &mut checkpoint).unwrap();
        assert!(dedup.seen(&Fingerprint::of(&unit)));
        assert_eq!(checkpoint.last_completed_id(), Some(9));
    }
}
