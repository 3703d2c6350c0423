//! Error types for the replication pipeline.

use std::time::Duration;

use thiserror::Error;

use crate::item::{ItemId, UnitDescriptor};

/// Errors that can occur in the replication pipeline.
#[derive(Debug, Error)]
pub enum ReplError {
    /// The source did not deliver a window within the configured wait.
    #[error("source timed out after {timeout_ms}ms waiting for items after id {after_id:?}")]
    SourceTimeout {
        /// Cursor the window was requested after.
        after_id: Option<ItemId>,
        /// The wait that elapsed, in milliseconds.
        timeout_ms: u64,
    },

    /// The remote imposed a wait on the whole connection.
    #[error("mandatory wait of {}s imposed by remote", .wait.as_secs())]
    MandatoryWait {
        /// How long the remote asked us to stay silent.
        wait: Duration,
    },

    /// A media handle was rejected as expired and must be re-resolved.
    #[error("stale media reference on item {item_id}")]
    StaleReference {
        /// The item whose media reference expired.
        item_id: ItemId,
    },

    /// Media is permanently gone (deleted, self-destructed, too large).
    #[error("media unavailable for item {item_id}: {reason}")]
    MediaUnavailable {
        /// The item whose media could not be obtained.
        item_id: ItemId,
        /// Why the media is unavailable.
        reason: String,
    },

    /// The remote refused access to an entity.
    #[error("access denied to {entity}")]
    AccessDenied {
        /// The identifier that was refused.
        entity: String,
    },

    /// The remote could not find an entity.
    #[error("entity not found: {entity}")]
    EntityNotFound {
        /// The identifier that could not be resolved.
        entity: String,
    },

    /// Persisted checkpoint state could not be decoded.
    #[error("checkpoint corrupted: {msg}")]
    CorruptCheckpoint {
        /// Error message describing the corruption.
        msg: String,
    },

    /// Any other failure reported by the remote binding.
    #[error("remote error: {msg}")]
    Remote {
        /// Error message from the remote.
        msg: String,
    },

    /// Configuration is invalid.
    #[error("invalid configuration: {msg}")]
    Config {
        /// What is wrong with the configuration.
        msg: String,
    },

    /// Another instance holds the state directory lock.
    #[error("another instance (pid {pid}) is already running against this state directory")]
    AlreadyRunning {
        /// Process id recorded in the lock file.
        pid: u32,
    },

    /// An operator-requested stop was observed at a suspension point.
    #[error("replication cancelled")]
    Cancelled,

    /// The pipeline stopped on an unrecoverable error while handling a unit.
    #[error("replication halted at {descriptor}: {source}")]
    Halted {
        /// Id range of the unit that could not be replicated.
        descriptor: UnitDescriptor,
        /// The underlying error.
        #[source]
        source: Box<ReplError>,
    },

    /// Binary serialization/deserialization error.
    #[error("serialization error")]
    Serialization(#[from] bincode::Error),

    /// JSON serialization/deserialization error.
    #[error("json error")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error")]
    Io(#[from] std::io::Error),
}

impl ReplError {
    /// Wraps `self` with the id range of the unit it halted.
    pub fn halted(self, descriptor: UnitDescriptor) -> Self {
        match self {
            ReplError::Halted { .. } | ReplError::Cancelled => self,
            other => ReplError::Halted {
                descriptor,
                source: Box::new(other),
            },
        }
    }

    /// Transient remote failures worth retrying with backoff.
    ///
    /// Mandatory waits and stale references are retryable too, but they have
    /// dedicated handling in the recovery controller and are excluded here.
    pub fn is_retryable(&self) -> bool {
        match self {
            ReplError::SourceTimeout { .. } => true,
            ReplError::Remote { .. } => true,
            ReplError::Io(_) => true,
            ReplError::MandatoryWait { .. } => false,
            ReplError::StaleReference { .. } => false,
            ReplError::MediaUnavailable { .. } => false,
            ReplError::AccessDenied { .. } => false,
            ReplError::EntityNotFound { .. } => false,
            ReplError::CorruptCheckpoint { .. } => false,
            ReplError::Config { .. } => false,
            ReplError::AlreadyRunning { .. } => false,
            ReplError::Cancelled => false,
            ReplError::Halted { .. } => false,
            ReplError::Serialization(_) => false,
            ReplError::Json(_) => false,
        }
    }

    /// Errors that stop the whole run and must reach the operator.
    pub fn is_unrecoverable(&self) -> bool {
        matches!(
            self,
            ReplError::AccessDenied { .. }
                | ReplError::EntityNotFound { .. }
                | ReplError::Config { .. }
                | ReplError::AlreadyRunning { .. }
                | ReplError::Halted { .. }
        )
    }
}

/// Result alias used throughout the crate.
pub type ReplResult<T> = std::result::Result<T, ReplError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(ReplError::Remote { msg: "boom".into() }.is_retryable());
        assert!(ReplError::SourceTimeout {
            after_id: None,
            timeout_ms: 10
        }
        .is_retryable());
        assert!(!ReplError::MandatoryWait {
            wait: Duration::from_secs(5)
        }
        .is_retryable());
        assert!(!ReplError::AccessDenied {
            entity: "chan".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_unrecoverable_classification() {
        assert!(ReplError::EntityNotFound {
            entity: "chan".into()
        }
        .is_unrecoverable());
        assert!(!ReplError::StaleReference { item_id: 4 }.is_unrecoverable());
        assert!(!ReplError::Cancelled.is_unrecoverable());
    }

    #[test]
    fn test_halted_wraps_once() {
        let descriptor = UnitDescriptor::new(3, 5);
        let err = ReplError::AccessDenied {
            entity: "sink".into(),
        }
        .halted(descriptor);
        let rewrapped = err.halted(UnitDescriptor::new(9, 9));
        match rewrapped {
            ReplError::Halted { descriptor, source } => {
                assert_eq!(descriptor, UnitDescriptor::new(3, 5));
                assert!(matches!(*source, ReplError::AccessDenied { .. }));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_display_mentions_range() {
        let err = ReplError::Remote { msg: "500".into() }.halted(UnitDescriptor::new(10, 12));
        assert_eq!(err.to_string(), "replication halted at items 10..=12: remote error: 500");
    }
}
