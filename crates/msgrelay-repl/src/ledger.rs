//! Append-only record of what was replicated where.
//!
//! One JSON object per line mapping the source ids of a unit to the message
//! ids it produced on the sink. The ledger is informational: write failures
//! are logged and never fail the unit, since the checkpoint and the
//! deduplicator are what protect correctness.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::checkpoint::now_unix_ms;
use crate::dispatch::{SendOutcome, SendReport};
use crate::error::ReplResult;
use crate::item::{ItemId, ProcessingUnit};
use crate::remote::RemoteMessageId;

/// Shape of a replicated unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitKind {
    /// One item.
    Single,
    /// A grouped album.
    Album,
}

/// One ledger line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerRecord {
    /// Source item ids, ascending.
    pub source_ids: Vec<ItemId>,
    /// Sink message ids.
    pub target_ids: Vec<RemoteMessageId>,
    /// Single or album.
    pub kind: UnitKind,
    /// How the unit was delivered.
    pub outcome: SendOutcome,
    /// Items whose media was left out.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dropped: Vec<ItemId>,
    /// When the line was written, Unix milliseconds.
    pub recorded_at_ms: u64,
}

/// Counters kept while a ledger is open, or computed from a ledger file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LedgerSummary {
    /// Units recorded.
    pub units: u64,
    /// Source items covered.
    pub items: u64,
    /// Albums among the units.
    pub albums: u64,
    /// Units delivered with some media left out.
    pub degraded: u64,
    /// Units delivered as text only.
    pub text_only: u64,
    /// Units with nothing to deliver.
    pub skipped: u64,
    /// Lowest source id recorded.
    pub first_source_id: Option<ItemId>,
    /// Highest source id recorded.
    pub last_source_id: Option<ItemId>,
    /// Lines that could not be parsed.
    pub malformed: u64,
}

impl LedgerSummary {
    fn add(&mut self, record: &LedgerRecord) {
        self.units += 1;
        self.items += record.source_ids.len() as u64;
        if record.kind == UnitKind::Album {
            self.albums += 1;
        }
        match record.outcome {
            SendOutcome::Degraded => self.degraded += 1,
            SendOutcome::TextOnly => self.text_only += 1,
            SendOutcome::Skipped => self.skipped += 1,
            SendOutcome::Sent | SendOutcome::DryRun => {}
        }
        if let Some(&first) = record.source_ids.first() {
            self.first_source_id = Some(self.first_source_id.map_or(first, |f| f.min(first)));
        }
        if let Some(&last) = record.source_ids.last() {
            self.last_source_id = Some(self.last_source_id.map_or(last, |l| l.max(last)));
        }
    }
}

/// Appends one line per replicated unit.
#[derive(Debug)]
pub struct ReplicationLedger {
    path: Option<PathBuf>,
    file: Option<File>,
    session: LedgerSummary,
}

impl ReplicationLedger {
    /// A ledger that only counts.
    pub fn disabled() -> Self {
        Self {
            path: None,
            file: None,
            session: LedgerSummary::default(),
        }
    }

    /// Open `path` for appending, creating it if needed.
    pub fn open(path: impl Into<PathBuf>) -> ReplResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        debug!(path = %path.display(), "ledger opened");
        Ok(Self {
            path: Some(path),
            file: Some(file),
            session: LedgerSummary::default(),
        })
    }

    /// Backing file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Counters for units recorded through this handle.
    pub fn session(&self) -> &LedgerSummary {
        &self.session
    }

    /// Record a dispatched unit. Never fails; write errors are logged.
    pub fn record(&mut self, unit: &ProcessingUnit, report: &SendReport) {
        let record = LedgerRecord {
            source_ids: report.source_ids.clone(),
            target_ids: report.target_ids.clone(),
            kind: if unit.is_album() {
                UnitKind::Album
            } else {
                UnitKind::Single
            },
            outcome: report.outcome,
            dropped: report.dropped.iter().map(|d| d.item_id).collect(),
            recorded_at_ms: now_unix_ms(),
        };
        self.session.add(&record);

        let Some(file) = self.file.as_mut() else {
            return;
        };
        let written = serde_json::to_vec(&record)
            .map_err(std::io::Error::from)
            .and_then(|mut line| {
                line.push(b'\n');
                file.write_all(&line)
            });
        if let Err(e) = written {
            warn!(
                descriptor = %report.descriptor,
                error = %e,
                "failed to append ledger record"
            );
        }
    }

    /// Stream a ledger file and summarize it. A missing file is empty.
    pub fn summary(path: &Path) -> ReplResult<LedgerSummary> {
        let mut summary = LedgerSummary::default();
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(summary),
            Err(e) => return Err(e.into()),
        };
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<LedgerRecord>(&line) {
                Ok(record) => summary.add(&record),
                Err(_) => summary.malformed += 1,
            }
        }
        Ok(summary)
    }

    /// Whether a ledger file exists and has content.
    pub fn exists(path: &Path) -> ReplResult<bool> {
        match std::fs::metadata(path) {
            Ok(meta) => Ok(meta.len() > 0),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
