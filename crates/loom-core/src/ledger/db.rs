//! Embedded ledger store on redb.
//!
//! # Table design
//!
//! A single `LEDGERS` table keyed by ceremony id; values are JSON-encoded
//! [`Ledger`] documents. A ledger write is one redb write transaction, and
//! redb serializes write transactions, so the revision check and the
//! mutation happen under the same exclusive section.
//!
//! redb holds an exclusive file lock, so this store serves a single
//! coordinator process (lightweight transport only).

use std::path::{Path, PathBuf};

use redb::{Database, ReadableTable, TableDefinition};
use tokio::sync::broadcast;

use super::store::{LedgerStore, Mutation};
use super::Ledger;
use crate::error::{LoomError, Result};
use crate::paths;

/// Key: ceremony id. Value: JSON-encoded Ledger.
const LEDGERS: TableDefinition<&str, &[u8]> = TableDefinition::new("ledgers");

fn db_err(e: impl std::fmt::Display) -> LoomError {
    LoomError::Store(e.to_string())
}

pub struct RedbLedgerStore {
    db: Database,
    path: PathBuf,
    changes: broadcast::Sender<String>,
}

impl RedbLedgerStore {
    /// Open or create the database at `path`, creating the table if needed.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            crate::io::ensure_dir(parent)?;
        }
        let db = Database::create(path).map_err(db_err)?;
        let wt = db.begin_write().map_err(db_err)?;
        wt.open_table(LEDGERS).map_err(db_err)?;
        wt.commit().map_err(db_err)?;
        let (changes, _) = broadcast::channel(256);
        Ok(Self {
            db,
            path: path.to_path_buf(),
            changes,
        })
    }

    /// Store at `<root>/.loom/ledger.redb`.
    pub fn open_root(root: &Path) -> Result<Self> {
        Self::open(&paths::ledger_db_path(root))
    }
}

impl LedgerStore for RedbLedgerStore {
    fn create(&self, ledger: &Ledger) -> Result<u64> {
        paths::validate_id(ledger.id())?;
        let mut ledger = ledger.clone();
        ledger.ceremony.revision = 1;
        let value = serde_json::to_vec(&ledger)?;
        let wt = self.db.begin_write().map_err(db_err)?;
        {
            let mut table = wt.open_table(LEDGERS).map_err(db_err)?;
            if table.get(ledger.id()).map_err(db_err)?.is_some() {
                return Err(LoomError::CeremonyExists(ledger.id().to_string()));
            }
            table
                .insert(ledger.id(), value.as_slice())
                .map_err(db_err)?;
        }
        wt.commit().map_err(db_err)?;
        let _ = self.changes.send(ledger.id().to_string());
        Ok(1)
    }

    fn read(&self, ceremony_id: &str) -> Result<(Ledger, u64)> {
        let rt = self.db.begin_read().map_err(db_err)?;
        let table = rt.open_table(LEDGERS).map_err(db_err)?;
        let guard = table
            .get(ceremony_id)
            .map_err(db_err)?
            .ok_or_else(|| LoomError::CeremonyNotFound(ceremony_id.to_string()))?;
        let ledger: Ledger = serde_json::from_slice(guard.value())?;
        let revision = ledger.ceremony.revision;
        Ok((ledger, revision))
    }

    fn write(
        &self,
        ceremony_id: &str,
        expected_revision: u64,
        mutation: Mutation<'_>,
    ) -> Result<u64> {
        let wt = self.db.begin_write().map_err(db_err)?;
        let revision = {
            let mut table = wt.open_table(LEDGERS).map_err(db_err)?;
            let current = table
                .get(ceremony_id)
                .map_err(db_err)?
                .map(|g| g.value().to_vec())
                .ok_or_else(|| LoomError::CeremonyNotFound(ceremony_id.to_string()))?;
            let mut ledger: Ledger = serde_json::from_slice(&current)?;
            let actual = ledger.ceremony.revision;
            if actual != expected_revision {
                return Err(LoomError::RevisionConflict {
                    expected: expected_revision,
                    actual,
                });
            }
            mutation(&mut ledger)?;
            ledger.ceremony.revision = actual + 1;
            let value = serde_json::to_vec(&ledger)?;
            table
                .insert(ceremony_id, value.as_slice())
                .map_err(db_err)?;
            actual + 1
        };
        wt.commit().map_err(db_err)?;
        let _ = self.changes.send(ceremony_id.to_string());
        Ok(revision)
    }

    fn list(&self) -> Result<Vec<String>> {
        let rt = self.db.begin_read().map_err(db_err)?;
        let table = rt.open_table(LEDGERS).map_err(db_err)?;
        let mut ids = Vec::new();
        for entry in table.iter().map_err(db_err)? {
            let (k, _) = entry.map_err(db_err)?;
            ids.push(k.value().to_string());
        }
        Ok(ids)
    }

    fn location(&self, _ceremony_id: &str) -> PathBuf {
        self.path.clone()
    }

    fn subscribe(&self) -> broadcast::Receiver<String> {
        self.changes.subscribe()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
