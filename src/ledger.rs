//! Traceability ledger: one append-only entry per product.
//!
//! An append returns [`Committed`] only once the entry is durable for the
//! backend (in memory for [`MemoryLedger`], synced to disk for
//! [`JsonlLedger`]). A second append for the same product id is rejected and
//! the first entry stays authoritative.

use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::state_machine::{Disposition, LedgerEntry};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("product {0} already has a ledger entry")]
    Duplicate(String),

    #[error("ledger line {line} is unreadable: {reason}")]
    Corrupt { line: usize, reason: String },

    #[error("ledger IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ledger encoding error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Proof that an entry is durably recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Committed {
    pub product_id: String,
    /// Zero-based position in the ledger.
    pub sequence: usize,
    pub committed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerSummary {
    pub total: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub aborted: usize,
    /// Aborted products per reason code.
    pub abort_reasons: BTreeMap<String, usize>,
    pub retries: u64,
    pub warnings: usize,
    pub batches: usize,
}

impl LedgerSummary {
    pub fn from_entries<'a>(entries: impl IntoIterator<Item = &'a LedgerEntry>) -> Self {
        let mut summary = Self::default();
        let mut batches = std::collections::HashSet::new();
        for entry in entries {
            summary.total += 1;
            match entry.disposition {
                Disposition::Accepted => summary.accepted += 1,
                Disposition::Rejected => summary.rejected += 1,
                Disposition::Aborted(reason) => {
                    summary.aborted += 1;
                    *summary.abort_reasons.entry(reason.to_string()).or_default() += 1;
                }
            }
            summary.retries += u64::from(entry.retry_count);
            summary.warnings += entry.warnings.len();
            batches.insert(entry.batch_id.as_str());
        }
        summary.batches = batches.len();
        summary
    }
}

pub trait Ledger: Send + Sync {
    fn append(&self, entry: LedgerEntry) -> Result<Committed, LedgerError>;

    fn get(&self, product_id: &str) -> Option<LedgerEntry>;

    /// All entries in commit order.
    fn entries(&self) -> Vec<LedgerEntry>;

    fn len(&self) -> usize {
        self.entries().len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn by_batch(&self, batch_id: &str) -> Vec<LedgerEntry> {
        self.entries()
            .into_iter()
            .filter(|e| e.batch_id == batch_id)
            .collect()
    }

    fn summary(&self) -> LedgerSummary {
        LedgerSummary::from_entries(&self.entries())
    }

    /// Writes every entry as a pretty JSON array. Returns the entry count.
    fn export_json(&self, path: &Path) -> Result<usize, LedgerError> {
        let entries = self.entries();
        let json = serde_json::to_string_pretty(&entries)?;
        std::fs::write(path, json)?;
        Ok(entries.len())
    }
}

#[derive(Default)]
struct Index {
    entries: Vec<LedgerEntry>,
    by_id: HashMap<String, usize>,
}

impl Index {
    fn check(&self, product_id: &str) -> Result<(), LedgerError> {
        if self.by_id.contains_key(product_id) {
            return Err(LedgerError::Duplicate(product_id.to_string()));
        }
        Ok(())
    }

    fn push(&mut self, entry: LedgerEntry) -> Committed {
        let sequence = self.entries.len();
        let product_id = entry.product_id.clone();
        self.by_id.insert(product_id.clone(), sequence);
        self.entries.push(entry);
        Committed {
            product_id,
            sequence,
            committed_at: Utc::now(),
        }
    }

    fn get(&self, product_id: &str) -> Option<LedgerEntry> {
        self.by_id.get(product_id).map(|&i| self.entries[i].clone())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
pub struct MemoryLedger {
    index: Mutex<Index>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Ledger for MemoryLedger {
    fn append(&self, entry: LedgerEntry) -> Result<Committed, LedgerError> {
        let mut index = lock(&self.index);
        index.check(&entry.product_id)?;
        Ok(index.push(entry))
    }

    fn get(&self, product_id: &str) -> Option<LedgerEntry> {
        lock(&self.index).get(product_id)
    }

    fn entries(&self) -> Vec<LedgerEntry> {
        lock(&self.index).entries.clone()
    }

    fn len(&self) -> usize {
        lock(&self.index).entries.len()
    }
}

/// One JSON object per line, fsynced on every append.
pub struct JsonlLedger {
    path: PathBuf,
    state: Mutex<(File, Index)>,
}

impl JsonlLedger {
    /// Opens (or creates) the ledger file and loads the existing entries.
    ///
    /// A last line without its newline is a torn append. It is kept and
    /// terminated when it parses as an entry, and cut off otherwise.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, LedgerError> {
        let path = path.into();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let contents = if path.exists() {
            std::fs::read(&path)?
        } else {
            Vec::new()
        };

        let mut index = Index::default();
        let mut lines = contents.split(|&b| b == b'\n').enumerate().peekable();
        let mut complete_len = 0u64;
        let mut repair = None;
        while let Some((i, raw)) = lines.next() {
            let is_tail = lines.peek().is_none();
            let line = String::from_utf8_lossy(raw);
            if line.trim().is_empty() {
                if !is_tail {
                    complete_len += raw.len() as u64 + 1;
                }
                continue;
            }
            let entry = match serde_json::from_str::<LedgerEntry>(&line) {
                Ok(entry) => entry,
                Err(e) if is_tail => {
                    tracing::warn!(
                        path = %path.display(),
                        line = i + 1,
                        error = %e,
                        "discarding torn ledger tail"
                    );
                    repair = Some(TailRepair::Truncate(complete_len));
                    break;
                }
                Err(e) => {
                    return Err(LedgerError::Corrupt {
                        line: i + 1,
                        reason: e.to_string(),
                    });
                }
            };
            index.check(&entry.product_id).map_err(|e| LedgerError::Corrupt {
                line: i + 1,
                reason: e.to_string(),
            })?;
            index.push(entry);
            if is_tail {
                repair = Some(TailRepair::Terminate);
            } else {
                complete_len += raw.len() as u64 + 1;
            }
        }

        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        match repair {
            Some(TailRepair::Terminate) => {
                file.write_all(b"\n")?;
                file.sync_data()?;
            }
            Some(TailRepair::Truncate(len)) => {
                file.set_len(len)?;
                file.sync_data()?;
            }
            None => {}
        }

        tracing::debug!(path = %path.display(), entries = index.entries.len(), "ledger opened");
        Ok(Self {
            path,
            state: Mutex::new((file, index)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Ledger for JsonlLedger {
    fn append(&self, entry: LedgerEntry) -> Result<Committed, LedgerError> {
        let mut state = lock(&self.state);
        let (file, index) = &mut *state;
        index.check(&entry.product_id)?;

        let mut line = serde_json::to_vec(&entry)?;
        line.push(b'\n');
        append_line(file, &line)?;

        Ok(index.push(entry))
    }

    fn get(&self, product_id: &str) -> Option<LedgerEntry> {
        lock(&self.state).1.get(product_id)
    }

    fn entries(&self) -> Vec<LedgerEntry> {
        lock(&self.state).1.entries.clone()
    }

    fn len(&self) -> usize {
        lock(&self.state).1.entries.len()
    }
}

enum TailRepair {
    /// The tail is a whole entry missing its newline.
    Terminate,
    /// The tail is a partial write; keep this many bytes.
    Truncate(u64),
}

/// Writes and syncs one line. On failure the file is cut back to its previous
/// length so a retry never leaves two lines for one entry.
fn append_line(file: &mut File, line: &[u8]) -> Result<(), LedgerError> {
    let prev = file.metadata()?.len();
    if let Err(e) = file.write_all(line).and_then(|()| file.sync_data()) {
        rollback(file, prev);
        return Err(e.into());
    }
    Ok(())
}

fn rollback(file: &File, len: u64) {
    if let Err(e) = file.set_len(len).and_then(|()| file.sync_data()) {
        tracing::error!(error = %e, len, "ledger rollback failed");
    }
}
