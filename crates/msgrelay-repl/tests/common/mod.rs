//! Scripted in-memory remote shared by the integration tests.

#![allow(dead_code)]

use std::collections::{HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use msgrelay_repl::item::FormattingSpan;
use msgrelay_repl::media::Attachment;
use msgrelay_repl::remote::{DownloadedMedia, SendConfirmation};
use msgrelay_repl::{
    EntityHandle, Item, ItemId, MediaKind, MediaRef, MessageSink, MessageSource, ReplConfig,
    ReplError, ReplResult,
};
use tokio_util::sync::CancellationToken;

/// Suffix given to handles returned by a re-fetch.
pub const FRESH_SUFFIX: &str = "~fresh";

/// In-memory source with stale-reference injection.
#[derive(Default)]
pub struct ScriptedSource {
    items: Vec<Item>,
    stale_handles: Mutex<HashSet<String>>,
    always_stale: Mutex<HashSet<String>>,
    iterate_waits: Mutex<VecDeque<Option<Duration>>>,
    resolve_waits: Mutex<VecDeque<Duration>>,
    pub iterate_calls: AtomicUsize,
    pub resolve_calls: AtomicUsize,
    pub refetches: AtomicUsize,
    pub downloads: AtomicUsize,
}

impl ScriptedSource {
    pub fn new(items: Vec<Item>) -> Self {
        Self {
            items,
            ..Self::default()
        }
    }

    /// The first download of `handle` is rejected as stale.
    pub fn stale_once(self, handle: &str) -> Self {
        self.stale_handles.lock().unwrap().insert(handle.to_string());
        self
    }

    /// Outcomes for the next `iterate` calls; `Some(d)` imposes a wait of
    /// `d` instead of returning items, `None` lets one through.
    pub fn with_iterate_waits(self, waits: impl IntoIterator<Item = Option<Duration>>) -> Self {
        self.iterate_waits.lock().unwrap().extend(waits);
        self
    }

    /// The next `resolve` calls impose these waits before one succeeds.
    pub fn with_resolve_waits(self, waits: impl IntoIterator<Item = Duration>) -> Self {
        self.resolve_waits.lock().unwrap().extend(waits);
        self
    }

    /// Every download of `handle` and its refreshed form is rejected.
    pub fn stale_always(self, handle: &str) -> Self {
        self.always_stale.lock().unwrap().insert(handle.to_string());
        self
    }
}

#[async_trait]
impl MessageSource for ScriptedSource {
    async fn resolve(&self, identifier: &str) -> ReplResult<EntityHandle> {
        self.resolve_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(wait) = self.resolve_waits.lock().unwrap().pop_front() {
            return Err(ReplError::MandatoryWait { wait });
        }
        if identifier == "missing" {
            return Err(ReplError::EntityNotFound {
                entity: identifier.to_string(),
            });
        }
        Ok(EntityHandle::new(identifier, format!("mem://{identifier}")))
    }

    async fn iterate(
        &self,
        _source: &EntityHandle,
        after_id: Option<ItemId>,
        limit: usize,
    ) -> ReplResult<Vec<Item>> {
        self.iterate_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(Some(wait)) = self.iterate_waits.lock().unwrap().pop_front() {
            return Err(ReplError::MandatoryWait { wait });
        }
        let start = after_id.map_or(0, |after| self.items.partition_point(|it| it.id <= after));
        Ok(self.items[start..].iter().take(limit).cloned().collect())
    }

    async fn fetch_item(&self, _source: &EntityHandle, id: ItemId) -> ReplResult<Option<Item>> {
        self.refetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.items.iter().find(|it| it.id == id).cloned().map(|mut it| {
            if let Some(media) = it.media.as_mut() {
                media.handle = format!("{}{FRESH_SUFFIX}", media.handle);
            }
            it
        }))
    }

    async fn download(&self, _source: &EntityHandle, media: &MediaRef) -> ReplResult<DownloadedMedia> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        let base = media.handle.trim_end_matches(FRESH_SUFFIX);
        if self.always_stale.lock().unwrap().contains(base)
            || self.stale_handles.lock().unwrap().remove(&media.handle)
        {
            return Err(ReplError::StaleReference { item_id: 0 });
        }
        Ok(DownloadedMedia {
            bytes: base.as_bytes().to_vec(),
            filename: None,
            mime_type: None,
        })
    }
}

/// Faults the sink can be scripted to return before a send.
#[derive(Debug, Clone)]
pub enum Fault {
    Wait(Duration),
    Remote(&'static str),
    /// The sink rejects a media reference, naming this item.
    Stale(ItemId),
}

impl Fault {
    fn into_error(self) -> ReplError {
        match self {
            Fault::Wait(wait) => ReplError::MandatoryWait { wait },
            Fault::Remote(msg) => ReplError::Remote {
                msg: msg.to_string(),
            },
            Fault::Stale(item_id) => ReplError::StaleReference { item_id },
        }
    }
}

/// One accepted send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub text: String,
    pub grouped: bool,
    pub filenames: Vec<String>,
    pub source_ids: Vec<ItemId>,
}

/// In-memory sink recording deliveries.
#[derive(Default)]
pub struct ScriptedSink {
    faults: Mutex<VecDeque<Option<Fault>>>,
    deliveries: Mutex<Vec<Delivery>>,
    next_id: AtomicU64,
    cancel_after: Mutex<Option<(usize, CancellationToken)>>,
    pub attempts: AtomicUsize,
}

impl ScriptedSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Outcomes for the next send attempts; `None` lets one through.
    pub fn with_faults(self, faults: impl IntoIterator<Item = Option<Fault>>) -> Self {
        self.faults.lock().unwrap().extend(faults);
        self
    }

    /// Cancel `token` once `n` deliveries have been accepted.
    pub fn cancel_after(self, n: usize, token: CancellationToken) -> Self {
        *self.cancel_after.lock().unwrap() = Some((n, token));
        self
    }

    pub fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries.lock().unwrap().clone()
    }

    /// Ids of every delivered item, in delivery order.
    pub fn delivered_ids(&self) -> Vec<ItemId> {
        self.deliveries()
            .into_iter()
            .flat_map(|d| d.source_ids)
            .collect()
    }

    fn accept(
        &self,
        text: &str,
        attachments: &[Attachment],
        grouped: bool,
        fallback_ids: Vec<ItemId>,
    ) -> ReplResult<SendConfirmation> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(Some(fault)) = self.faults.lock().unwrap().pop_front() {
            return Err(fault.into_error());
        }
        let source_ids = if attachments.is_empty() {
            fallback_ids
        } else {
            attachments.iter().map(|a| a.source_item_id).collect()
        };
        let count = attachments.len().max(1) as u64;
        let first = self.next_id.fetch_add(count, Ordering::SeqCst) + 1;
        let mut deliveries = self.deliveries.lock().unwrap();
        deliveries.push(Delivery {
            text: text.to_string(),
            grouped,
            filenames: attachments.iter().map(|a| a.filename.clone()).collect(),
            source_ids,
        });
        if let Some((n, token)) = self.cancel_after.lock().unwrap().as_ref() {
            if deliveries.len() >= *n {
                token.cancel();
            }
        }
        Ok(SendConfirmation {
            message_ids: (first..first + count).collect(),
        })
    }
}

/// Text-only sends carry no attachment ids; tests encode the item id in the
/// text as `"#<id>"`.
fn ids_from_text(text: &str) -> Vec<ItemId> {
    text.split_whitespace()
        .filter_map(|word| word.strip_prefix('#'))
        .filter_map(|id| id.parse().ok())
        .collect()
}

#[async_trait]
impl MessageSink for ScriptedSink {
    async fn resolve(&self, identifier: &str) -> ReplResult<EntityHandle> {
        Ok(EntityHandle::new(identifier, format!("mem://{identifier}")))
    }

    async fn send_single(
        &self,
        _sink: &EntityHandle,
        text: &str,
        _formatting: &[FormattingSpan],
        attachment: Option<&Attachment>,
    ) -> ReplResult<SendConfirmation> {
        let attachments: Vec<Attachment> = attachment.cloned().into_iter().collect();
        self.accept(text, &attachments, false, ids_from_text(text))
    }

    async fn send_group(
        &self,
        _sink: &EntityHandle,
        text: &str,
        _formatting: &[FormattingSpan],
        attachments: &[Attachment],
    ) -> ReplResult<SendConfirmation> {
        self.accept(text, attachments, true, ids_from_text(text))
    }
}

/// Text item whose text names its id.
pub fn text(id: ItemId) -> Item {
    Item::text(id, id * 10, format!("#{id}"))
}

/// Photo item without text.
pub fn photo(id: ItemId) -> Item {
    Item::text(id, id * 10, "").with_media(MediaRef::new(format!("photo-{id}"), MediaKind::Image))
}

/// Config for in-memory runs with fast sends.
pub fn config(state_dir: &Path) -> ReplConfig {
    ReplConfig {
        source: "src".into(),
        target: "dst".into(),
        window_size: 3,
        max_ops_per_hour: 10_000,
        min_interval_secs: 0,
        progress_interval_secs: 0,
        state_dir: state_dir.to_path_buf(),
        ..ReplConfig::default()
    }
}

pub fn remotes(source: ScriptedSource, sink: ScriptedSink) -> (Arc<ScriptedSource>, Arc<ScriptedSink>) {
    (Arc::new(source), Arc::new(sink))
}
