//! Durable resume cursor.
//!
//! The checkpoint is the single source of truth for where a run resumes. It
//! records the highest id below which everything has been replicated, the
//! unit in flight during a long suspension, and when that suspension ends.
//! Every mutation is persisted with an atomic rename, so a crash leaves
//! either the previous or the new record on disk.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::{ReplError, ReplResult};
use crate::item::{ItemId, UnitDescriptor};
use crate::persist::{read_optional, remove_if_exists, write_atomic};

const CHECKPOINT_MAGIC: u32 = 0x4d52_4350; // "MRCP"
const CHECKPOINT_VERSION: u32 = 1;

/// Milliseconds since the Unix epoch.
pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Replication progress as persisted on disk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Every source item with an id at or below this has been replicated.
    pub last_completed_id: Option<ItemId>,
    /// The unit that was in flight when a suspension began.
    pub pending_unit: Option<UnitDescriptor>,
    /// End of a mandatory wait, in Unix milliseconds.
    pub suspended_until_ms: Option<u64>,
    /// When the record was last written, in Unix milliseconds.
    pub updated_at_ms: u64,
}

impl Checkpoint {
    /// Time left on a persisted suspension, if it has not elapsed yet.
    pub fn remaining_suspension(&self, now_ms: u64) -> Option<Duration> {
        self.suspended_until_ms
            .filter(|&until| until > now_ms)
            .map(|until| Duration::from_millis(until - now_ms))
    }

    fn checksum(&self) -> ReplResult<u64> {
        let bytes = bincode::serialize(self)?;
        let digest = Sha256::digest(&bytes);
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        Ok(u64::from_le_bytes(prefix))
    }

    /// Encode with a magic header and checksum.
    pub fn to_bytes(&self) -> ReplResult<Vec<u8>> {
        let record = CheckpointRecord {
            magic: CHECKPOINT_MAGIC,
            version: CHECKPOINT_VERSION,
            checksum: self.checksum()?,
            checkpoint: self.clone(),
        };
        Ok(bincode::serialize(&record)?)
    }

    /// Decode, rejecting foreign, truncated or tampered data.
    pub fn from_bytes(data: &[u8]) -> ReplResult<Self> {
        let record: CheckpointRecord =
            bincode::deserialize(data).map_err(|e| ReplError::CorruptCheckpoint {
                msg: e.to_string(),
            })?;
        if record.magic != CHECKPOINT_MAGIC {
            return Err(ReplError::CorruptCheckpoint {
                msg: format!("bad magic 0x{:08x}", record.magic),
            });
        }
        if record.version != CHECKPOINT_VERSION {
            return Err(ReplError::CorruptCheckpoint {
                msg: format!("unsupported version {}", record.version),
            });
        }
        if record.checkpoint.checksum()? != record.checksum {
            return Err(ReplError::CorruptCheckpoint {
                msg: "checksum mismatch".to_string(),
            });
        }
        Ok(record.checkpoint)
    }
}

#[derive(Serialize, Deserialize)]
struct CheckpointRecord {
    magic: u32,
    version: u32,
    checksum: u64,
    checkpoint: Checkpoint,
}

/// How the store came up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    /// No checkpoint on disk.
    Fresh,
    /// A valid checkpoint was loaded.
    Resumed,
    /// The file was unreadable and has been ignored.
    Corrupt {
        /// Why the record was rejected.
        reason: String,
    },
}

/// Owner of the checkpoint record and its file.
#[derive(Debug)]
pub struct CheckpointStore {
    path: Option<PathBuf>,
    current: Checkpoint,
}

impl CheckpointStore {
    /// A store that keeps everything in memory, used for dry runs.
    pub fn ephemeral() -> Self {
        Self {
            path: None,
            current: Checkpoint::default(),
        }
    }

    /// Keep the loaded record but stop writing it, used for dry runs.
    pub fn detached(self) -> Self {
        Self {
            path: None,
            current: self.current,
        }
    }

    /// Load the checkpoint at `path`.
    ///
    /// A missing file is a fresh start. A corrupt file is logged and also
    /// treated as a fresh start; the run replays from the beginning and the
    /// deduplicator absorbs what it can.
    pub fn load(path: impl Into<PathBuf>) -> ReplResult<(Self, LoadOutcome)> {
        let path = path.into();
        let (current, outcome) = match read_optional(&path)? {
            None => {
                info!(path = %path.display(), "no checkpoint found, fresh start");
                (Checkpoint::default(), LoadOutcome::Fresh)
            }
            Some(bytes) => match Checkpoint::from_bytes(&bytes) {
                Ok(checkpoint) => {
                    info!(
                        path = %path.display(),
                        last_completed_id = ?checkpoint.last_completed_id,
                        pending = ?checkpoint.pending_unit,
                        suspended_until_ms = ?checkpoint.suspended_until_ms,
                        "checkpoint loaded"
                    );
                    (checkpoint, LoadOutcome::Resumed)
                }
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "checkpoint unreadable, starting from the beginning"
                    );
                    (
                        Checkpoint::default(),
                        LoadOutcome::Corrupt {
                            reason: e.to_string(),
                        },
                    )
                }
            },
        };
        Ok((
            Self {
                path: Some(path),
                current,
            },
            outcome,
        ))
    }

    /// The current record.
    pub fn checkpoint(&self) -> &Checkpoint {
        &self.current
    }

    /// Resume cursor: items after this id still need replicating.
    pub fn last_completed_id(&self) -> Option<ItemId> {
        self.current.last_completed_id
    }

    /// Backing file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Move the cursor forward to `id`. Never moves backwards.
    ///
    /// Returns whether the cursor moved.
    pub fn advance(&mut self, id: ItemId) -> ReplResult<bool> {
        if self.current.last_completed_id.is_some_and(|cur| cur >= id) {
            return Ok(false);
        }
        self.current.last_completed_id = Some(id);
        self.current.pending_unit = None;
        self.flush()?;
        debug!(last_completed_id = id, "checkpoint advanced");
        Ok(true)
    }

    /// Record that `unit` has been handled, then advance to `advance_to`.
    ///
    /// The pending unit is cleared when it is `unit`, even if the low
    /// watermark cannot move yet.
    pub fn complete(&mut self, unit: UnitDescriptor, advance_to: Option<ItemId>) -> ReplResult<()> {
        let served = self.current.pending_unit == Some(unit);
        if served {
            self.current.pending_unit = None;
        }
        let moved = match advance_to {
            Some(id) => self.advance(id)?,
            None => false,
        };
        if served && !moved {
            self.flush()?;
        }
        Ok(())
    }

    /// Record a suspension before sleeping through it. `pending` is the unit
    /// in flight, if the wait hit a send rather than a source read.
    pub fn suspend(&mut self, pending: Option<UnitDescriptor>, until_ms: u64) -> ReplResult<()> {
        if pending.is_some() {
            self.current.pending_unit = pending;
        }
        self.current.suspended_until_ms = Some(until_ms);
        self.flush()
    }

    /// The suspension has been served; the pending unit stays recorded until
    /// the cursor passes it.
    pub fn clear_suspension(&mut self) -> ReplResult<()> {
        if self.current.suspended_until_ms.take().is_none() {
            return Ok(());
        }
        self.flush()
    }

    /// Forget all progress, on disk too.
    pub fn reset(&mut self) -> ReplResult<()> {
        self.current = Checkpoint::default();
        if let Some(path) = &self.path {
            remove_if_exists(path)?;
        }
        Ok(())
    }

    /// Persist the current record.
    pub fn flush(&mut self) -> ReplResult<()> {
        self.current.updated_at_ms = now_unix_ms();
        let Some(path) = &self.path else {
            return Ok(());
        };
        write_atomic(path, &self.current.to_bytes()?)?;
        Ok(())
    }
}
