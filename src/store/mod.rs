//! Durable transaction storage.
//!
//! Records are keyed by `(connector_id, tx_nr)`. The `tx_nr` counter is part
//! of the store so it survives reboots: a replayed session never reuses an
//! ordinal, which is what makes retransmissions idempotent from the server's
//! point of view.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use tracing::{debug, warn};

use crate::transaction::Transaction;

/// Durable append/replace storage for [`Transaction`] records.
///
/// `save` must replace the record atomically: a reader after a crash sees
/// either the previous or the new state, never a torn one.
pub trait TransactionStore {
    fn save(&mut self, tx: &Transaction) -> bool;
    fn load(&mut self, connector_id: u32, tx_nr: u32) -> Option<Transaction>;
    fn remove(&mut self, connector_id: u32, tx_nr: u32) -> bool;
    /// All records for one connector, ordered by `tx_nr`.
    fn load_all(&mut self, connector_id: u32) -> Vec<Transaction>;
    /// Allocate the next per-connector ordinal. Monotonic across reboots.
    fn next_tx_nr(&mut self, connector_id: u32) -> u32;
}

/// In-memory store for development and testing.
#[derive(Default)]
pub struct MemoryTransactionStore {
    records: HashMap<(u32, u32), Transaction>,
    counters: HashMap<u32, u32>,
}

impl MemoryTransactionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }
}

impl TransactionStore for MemoryTransactionStore {
    fn save(&mut self, tx: &Transaction) -> bool {
        self.records
            .insert((tx.connector_id(), tx.tx_nr()), tx.clone());
        true
    }

    fn load(&mut self, connector_id: u32, tx_nr: u32) -> Option<Transaction> {
        self.records.get(&(connector_id, tx_nr)).cloned()
    }

    fn remove(&mut self, connector_id: u32, tx_nr: u32) -> bool {
        self.records.remove(&(connector_id, tx_nr)).is_some()
    }

    fn load_all(&mut self, connector_id: u32) -> Vec<Transaction> {
        let mut txs: Vec<_> = self
            .records
            .values()
            .filter(|t| t.connector_id() == connector_id)
            .cloned()
            .collect();
        txs.sort_by_key(Transaction::tx_nr);
        txs
    }

    fn next_tx_nr(&mut self, connector_id: u32) -> u32 {
        let counter = self.counters.entry(connector_id).or_insert(0);
        *counter += 1;
        *counter
    }
}

/// File-backed store: one JSON file per record, replaced atomically via a
/// temporary file and rename.
pub struct FileTransactionStore {
    dir: PathBuf,
}

impl FileTransactionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        if let Err(e) = fs::create_dir_all(&dir) {
            warn!(dir = %dir.display(), error = %e, "Failed to create transaction store directory");
        }
        Self { dir }
    }

    fn record_path(&self, connector_id: u32, tx_nr: u32) -> PathBuf {
        self.dir.join(format!("tx-{connector_id}-{tx_nr}.json"))
    }

    fn counter_path(&self, connector_id: u32) -> PathBuf {
        self.dir.join(format!("txseq-{connector_id}.json"))
    }

    fn write_atomic(&self, path: &PathBuf, text: &str) -> bool {
        let tmp = path.with_extension("tmp");
        match fs::write(&tmp, text).and_then(|_| fs::rename(&tmp, path)) {
            Ok(()) => true,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to persist record");
                false
            }
        }
    }
}

impl TransactionStore for FileTransactionStore {
    fn save(&mut self, tx: &Transaction) -> bool {
        let path = self.record_path(tx.connector_id(), tx.tx_nr());
        let Ok(text) = serde_json::to_string(tx) else {
            return false;
        };
        let ok = self.write_atomic(&path, &text);
        if ok {
            debug!(
                connector_id = tx.connector_id(),
                tx_nr = tx.tx_nr(),
                write_count = tx.write_count(),
                "Transaction record committed"
            );
        }
        ok
    }

    fn load(&mut self, connector_id: u32, tx_nr: u32) -> Option<Transaction> {
        let text = fs::read_to_string(self.record_path(connector_id, tx_nr)).ok()?;
        match serde_json::from_str(&text) {
            Ok(tx) => Some(tx),
            Err(e) => {
                warn!(connector_id, tx_nr, error = %e, "Corrupt transaction record ignored");
                None
            }
        }
    }

    fn remove(&mut self, connector_id: u32, tx_nr: u32) -> bool {
        fs::remove_file(self.record_path(connector_id, tx_nr)).is_ok()
    }

    fn load_all(&mut self, connector_id: u32) -> Vec<Transaction> {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let prefix = format!("tx-{connector_id}-");
        let mut txs: Vec<Transaction> = entries
            .filter_map(|e| e.ok())
            .filter(|e| {
                e.file_name()
                    .to_str()
                    .is_some_and(|n| n.starts_with(&prefix) && n.ends_with(".json"))
            })
            .filter_map(|e| fs::read_to_string(e.path()).ok())
            .filter_map(|text| serde_json::from_str(&text).ok())
            .collect();
        txs.sort_by_key(Transaction::tx_nr);
        txs
    }

    fn next_tx_nr(&mut self, connector_id: u32) -> u32 {
        let path = self.counter_path(connector_id);
        let current: u32 = fs::read_to_string(&path)
            .ok()
            .and_then(|text| serde_json::from_str(&text).ok())
            .unwrap_or(0);
        let next = current + 1;
        self.write_atomic(&path, &next.to_string());
        next
    }
}
