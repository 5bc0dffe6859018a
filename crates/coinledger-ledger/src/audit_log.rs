//! Append-only audit log storage.
//!
//! The ledger hands each committed batch to an [`AuditSink`] *before* any
//! balance is written back. A sink that returns `Ok` has made the entries
//! durable to the degree it promises; the file sink calls `sync_data`.
//!
//! Changes to an account's non-balance fields (deposit addresses, staking
//! mode) go to the same sink as [`AccountChange`] records, kept apart from
//! the hash chain.

use std::{
    fs::{File, OpenOptions},
    io::{BufRead, BufReader, Write},
    path::{Path, PathBuf},
};

use coinledger_types::{AccountChange, AuditEntry, CoinledgerError, GENESIS_HASH, Result};

/// Durable destination for audit entries. Entries are never rewritten.
pub trait AuditSink: Send {
    /// Append a batch of entries atomically with respect to readers.
    fn append(&mut self, entries: &[AuditEntry]) -> Result<()>;

    /// Every entry appended so far, oldest first.
    fn entries(&self) -> Result<Vec<AuditEntry>>;

    /// Persist one account metadata change.
    fn record_change(&mut self, change: &AccountChange) -> Result<()>;

    /// Every recorded account change, oldest first.
    fn changes(&self) -> Result<Vec<AccountChange>>;
}

// ---------------------------------------------------------------------------
// MemorySink
// ---------------------------------------------------------------------------

/// Keeps entries in a `Vec`. Not durable across restarts.
#[derive(Debug, Default)]
pub struct MemorySink {
    entries: Vec<AuditEntry>,
    changes: Vec<AccountChange>,
}

impl MemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl AuditSink for MemorySink {
    fn append(&mut self, entries: &[AuditEntry]) -> Result<()> {
        self.entries.extend_from_slice(entries);
        Ok(())
    }

    fn entries(&self) -> Result<Vec<AuditEntry>> {
        Ok(self.entries.clone())
    }

    fn record_change(&mut self, change: &AccountChange) -> Result<()> {
        self.changes.push(change.clone());
        Ok(())
    }

    fn changes(&self) -> Result<Vec<AccountChange>> {
        Ok(self.changes.clone())
    }
}

// ---------------------------------------------------------------------------
// JsonlFileSink
// ---------------------------------------------------------------------------

/// One JSON object per line, fsync'd on every append.
///
/// Account changes live in a sibling file: `audit.jsonl` keeps its
/// metadata in `audit.accounts.jsonl`.
#[derive(Debug)]
pub struct JsonlFileSink {
    path: PathBuf,
    file: File,
    accounts_path: PathBuf,
    accounts_file: File,
}

fn append_only(path: &Path) -> Result<File> {
    Ok(OpenOptions::new().create(true).append(true).open(path)?)
}

fn read_lines<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let reader = BufReader::new(File::open(path)?);
    let mut out = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        out.push(serde_json::from_str(&line)?);
    }
    Ok(out)
}

impl JsonlFileSink {
    /// Open (or create) the log at `path` for appending.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let accounts_path = path.with_extension("accounts.jsonl");
        Ok(Self {
            file: append_only(&path)?,
            accounts_file: append_only(&accounts_path)?,
            path,
            accounts_path,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn accounts_path(&self) -> &Path {
        &self.accounts_path
    }
}

impl AuditSink for JsonlFileSink {
    fn append(&mut self, entries: &[AuditEntry]) -> Result<()> {
        let mut buf = Vec::new();
        for entry in entries {
            serde_json::to_writer(&mut buf, entry)?;
            buf.push(b'\n');
        }
        self.file.write_all(&buf)?;
        self.file.sync_data()?;
        Ok(())
    }

    fn entries(&self) -> Result<Vec<AuditEntry>> {
        read_lines(&self.path)
    }

    fn record_change(&mut self, change: &AccountChange) -> Result<()> {
        let mut buf = serde_json::to_vec(change)?;
        buf.push(b'\n');
        self.accounts_file.write_all(&buf)?;
        self.accounts_file.sync_data()?;
        Ok(())
    }

    fn changes(&self) -> Result<Vec<AccountChange>> {
        read_lines(&self.accounts_path)
    }
}

// ---------------------------------------------------------------------------
// Chain verification
// ---------------------------------------------------------------------------

/// Verify sequence continuity, hash linkage and per-entry integrity.
///
/// # Errors
/// Returns [`CoinledgerError::AuditChainBroken`] at the first bad entry.
pub fn verify_chain(entries: &[AuditEntry]) -> Result<()> {
    let mut prev_hash = GENESIS_HASH;
    for (expected_seq, entry) in (0u64..).zip(entries) {
        if entry.seq != expected_seq || entry.prev_hash != prev_hash || !entry.is_intact() {
            return Err(CoinledgerError::AuditChainBroken { seq: entry.seq });
        }
        prev_hash = entry.hash.as_str();
    }
    Ok(())
}
