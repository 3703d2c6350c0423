//! Bounded deduplication of already-replicated units.
//!
//! The deduplicator remembers the fingerprints of the most recent
//! `retention` units that were confirmed sent and persists them next to the
//! checkpoint, so a unit re-delivered after a crash is recognised and skipped.
//! Beyond the retention horizon this is best-effort; the checkpoint cursor is
//! what guarantees completed units are not fetched again.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::ReplResult;
use crate::item::ProcessingUnit;
use crate::persist::{read_optional, remove_if_exists, write_atomic};

const DEDUP_FORMAT_VERSION: u32 = 1;

/// Content-derived identity of a processing unit.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Fingerprint a unit from its kind, item ids and texts.
    pub fn of(unit: &ProcessingUnit) -> Self {
        let mut hasher = Sha256::new();
        match unit {
            ProcessingUnit::Single(_) => hasher.update(b"single"),
            ProcessingUnit::Album { group_key, .. } => {
                hasher.update(b"album");
                hasher.update(group_key.to_le_bytes());
            }
        }
        for item in unit.items() {
            hasher.update(item.id.to_le_bytes());
            hasher.update((item.text.len() as u64).to_le_bytes());
            hasher.update(item.text.as_bytes());
        }
        Self(hasher.finalize().into())
    }

    /// Raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", &hex::encode(self.0)[..16])
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

#[derive(Serialize, Deserialize)]
struct DedupSnapshot {
    version: u32,
    fingerprints: Vec<Fingerprint>,
}

/// Deduplicator statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DedupStats {
    /// Number of `seen` lookups.
    pub checks: u64,
    /// Lookups that found a fingerprint.
    pub hits: u64,
    /// Fingerprints evicted to honour the retention bound.
    pub evictions: u64,
    /// Fingerprints currently retained.
    pub retained: usize,
}

/// Fixed-capacity fingerprint set with oldest-first eviction.
#[derive(Debug)]
pub struct Deduplicator {
    retention: usize,
    order: VecDeque<Fingerprint>,
    members: HashSet<Fingerprint>,
    path: Option<PathBuf>,
    checks: u64,
    hits: u64,
    evictions: u64,
}

impl Deduplicator {
    /// A deduplicator that never touches disk.
    pub fn in_memory(retention: usize) -> Self {
        Self {
            retention: retention.max(1),
            order: VecDeque::new(),
            members: HashSet::new(),
            path: None,
            checks: 0,
            hits: 0,
            evictions: 0,
        }
    }

    /// Load retained fingerprints from `path`.
    ///
    /// A missing file starts empty; an unreadable or corrupt file is logged
    /// and also starts empty rather than failing the run.
    pub fn open(path: impl Into<PathBuf>, retention: usize) -> ReplResult<Self> {
        let path = path.into();
        let mut dedup = Self::in_memory(retention);
        match read_optional(&path)? {
            None => debug!(path = %path.display(), "no dedup state, starting empty"),
            Some(bytes) => match bincode::deserialize::<DedupSnapshot>(&bytes) {
                Ok(snapshot) if snapshot.version == DEDUP_FORMAT_VERSION => {
                    for fp in snapshot.fingerprints {
                        dedup.insert(fp);
                    }
                    info!(
                        path = %path.display(),
                        retained = dedup.order.len(),
                        "loaded dedup state"
                    );
                }
                Ok(snapshot) => warn!(
                    path = %path.display(),
                    version = snapshot.version,
                    "unsupported dedup state version, starting empty"
                ),
                Err(e) => warn!(
                    path = %path.display(),
                    error = %e,
                    "corrupt dedup state, starting empty"
                ),
            },
        }
        dedup.path = Some(path);
        Ok(dedup)
    }

    /// Whether `fingerprint` was marked within the retention window.
    pub fn seen(&mut self, fingerprint: &Fingerprint) -> bool {
        self.checks += 1;
        let hit = self.members.contains(fingerprint);
        if hit {
            self.hits += 1;
        }
        hit
    }

    /// Record a confirmed send and persist the retained set.
    pub fn mark_seen(&mut self, fingerprint: Fingerprint) -> ReplResult<()> {
        if !self.insert(fingerprint) {
            return Ok(());
        }
        self.persist()
    }

    fn insert(&mut self, fingerprint: Fingerprint) -> bool {
        if !self.members.insert(fingerprint) {
            return false;
        }
        self.order.push_back(fingerprint);
        while self.order.len() > self.retention {
            if let Some(oldest) = self.order.pop_front() {
                self.members.remove(&oldest);
                self.evictions += 1;
            }
        }
        true
    }

    /// Write the retained set to disk, if this deduplicator is persistent.
    pub fn persist(&self) -> ReplResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let snapshot = DedupSnapshot {
            version: DEDUP_FORMAT_VERSION,
            fingerprints: self.order.iter().copied().collect(),
        };
        write_atomic(path, &bincode::serialize(&snapshot)?)?;
        Ok(())
    }

    /// Forget everything, on disk too.
    pub fn clear(&mut self) -> ReplResult<()> {
        self.order.clear();
        self.members.clear();
        if let Some(path) = &self.path {
            remove_if_exists(path)?;
        }
        Ok(())
    }

    /// Backing file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Number of retained fingerprints.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether nothing is retained.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Current statistics.
    pub fn stats(&self) -> DedupStats {
        DedupStats {
            checks: self.checks,
            hits: self.hits,
            evictions: self.evictions,
            retained: self.order.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::{Item, MediaKind, MediaRef};

    fn single(id: u64, text: &str) -> ProcessingUnit {
        ProcessingUnit::Single(Item::text(id, id * 10, text))
    }

    mod fingerprint {
        use super::*;

        #[test]
        fn test_same_ids_same_fingerprint() {
            let a = single(5, "hello");
            let mut b = single(5, "hello");
            if let ProcessingUnit::Single(item) = &mut b {
                item.media = Some(MediaRef::new("refreshed", MediaKind::Image));
            }
            assert_eq!(Fingerprint::of(&a), Fingerprint::of(&b));
        }

        #[test]
        fn test_different_ids_differ() {
            assert_ne!(Fingerprint::of(&single(5, "x")), Fingerprint::of(&single(6, "x")));
        }

        #[test]
        fn test_album_differs_from_single() {
            let album =
                ProcessingUnit::album(1, vec![Item::text(5, 0, "x").in_group(1)]).unwrap();
            assert_ne!(Fingerprint::of(&album), Fingerprint::of(&single(5, "x")));
        }

        #[test]
        fn test_display_is_hex() {
            let fp = Fingerprint::of(&single(1, ""));
            assert_eq!(fp.to_string().len(), 64);
        }
    }

    mod bounded {
        use super::*;

        #[test]
        fn test_seen_after_mark() {
            let mut dedup = Deduplicator::in_memory(10);
            let fp = Fingerprint::of(&single(1, "a"));
            assert!(!dedup.seen(&fp));
            dedup.mark_seen(fp).unwrap();
            assert!(dedup.seen(&fp));
            assert_eq!(dedup.stats().hits, 1);
            assert_eq!(dedup.stats().checks, 2);
        }

        #[test]
        fn test_oldest_evicted() {
            let mut dedup = Deduplicator::in_memory(3);
            let fps: Vec<_> = (1..=4).map(|i| Fingerprint::of(&single(i, ""))).collect();
            for fp in &fps {
                dedup.mark_seen(*fp).unwrap();
            }
            assert_eq!(dedup.len(), 3);
            assert!(!dedup.seen(&fps[0]));
            assert!(dedup.seen(&fps[3]));
            assert_eq!(dedup.stats().evictions, 1);
        }

        #[test]
        fn test_duplicate_mark_is_noop() {
            let mut dedup = Deduplicator::in_memory(2);
            let fp = Fingerprint::of(&single(1, ""));
            dedup.mark_seen(fp).unwrap();
            dedup.mark_seen(fp).unwrap();
            assert_eq!(dedup.len(), 1);
        }
    }

    mod persistence {
        use super::*;

        #[test]
        fn test_survives_reopen() {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("dedup.bin");
            let fp = Fingerprint::of(&single(42, "persisted"));
            {
                let mut dedup = Deduplicator::open(&path, 100).unwrap();
                dedup.mark_seen(fp).unwrap();
            }
            let mut reopened = Deduplicator::open(&path, 100).unwrap();
            assert!(reopened.seen(&fp));
        }

        #[test]
        fn test_reopen_with_smaller_retention_keeps_newest() {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("dedup.bin");
            let fps: Vec<_> = (1..=5).map(|i| Fingerprint::of(&single(i, ""))).collect();
            {
                let mut dedup = Deduplicator::open(&path, 10).unwrap();
                for fp in &fps {
                    dedup.mark_seen(*fp).unwrap();
                }
            }
            let mut reopened = Deduplicator::open(&path, 2).unwrap();
            assert_eq!(reopened.len(), 2);
            assert!(reopened.seen(&fps[4]));
            assert!(!reopened.seen(&fps[0]));
        }

        #[test]
        fn test_corrupt_file_starts_empty() {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("dedup.bin");
            std::fs::write(&path, b"\xff\xff not bincode").unwrap();
            let dedup = Deduplicator::open(&path, 10).unwrap();
            assert!(dedup.is_empty());
        }

        #[test]
        fn test_clear_removes_file() {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("dedup.bin");
            let mut dedup = Deduplicator::open(&path, 10).unwrap();
            dedup.mark_seen(Fingerprint::of(&single(1, ""))).unwrap();
            assert!(path.exists());
            dedup.clear().unwrap();
            assert!(!path.exists());
            assert!(dedup.is_empty());
        }
    }
}
