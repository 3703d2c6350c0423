#![warn(missing_docs)]

//! msgrelay: ordered, rate-limited replication of message streams.
//!
//! Items are read from a [`MessageSource`] in bounded windows, assembled
//! into single messages and albums with threaded replies spliced after
//! their parents, and re-sent one unit at a time to a [`MessageSink`] with
//! media re-uploaded under preserved filenames. Progress survives restarts
//! through a checkpoint and a bounded fingerprint set; mandatory waits are
//! served in full and never cause a skip.

pub mod archive;
pub mod checkpoint;
pub mod cli;
pub mod collector;
pub mod config;
pub mod dedup;
pub mod dispatch;
pub mod error;
pub mod grouping;
pub mod item;
pub mod ledger;
pub mod lock;
pub mod media;
pub mod persist;
pub mod pipeline;
pub mod progress;
pub mod rate_limit;
pub mod recovery;
pub mod remote;
pub mod retry;

pub use checkpoint::{Checkpoint, CheckpointStore, LoadOutcome};
pub use collector::{Collector, CollectorConfig};
pub use config::ReplConfig;
pub use dedup::{Deduplicator, Fingerprint};
pub use dispatch::{Dispatcher, SendOutcome, SendReport};
pub use error::{ReplError, ReplResult};
pub use grouping::{GroupingConfig, GroupingMerger};
pub use item::{Item, ItemId, MediaKind, MediaRef, ProcessingUnit, UnitDescriptor};
pub use media::{Attachment, MediaTransfer};
pub use pipeline::{ReplicationPipeline, StatusReport};
pub use progress::{ProgressSnapshot, RunSummary};
pub use rate_limit::{RateLimitConfig, RateLimiter};
pub use recovery::{RecoveryController, RecoveryState};
pub use remote::{EntityHandle, MessageSink, MessageSource};
