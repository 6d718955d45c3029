//! YAML ledger documents on disk, one file per ceremony.
//!
//! ```text
//! .loom/ceremonies/<id>.yaml   the ledger document
//! .loom/ceremonies/<id>.lock   advisory lock, exists only during a write
//! ```
//!
//! The lock file is created exclusively, so it works across processes; this
//! is the store isolated workers use. Readers never take the lock because
//! documents are replaced atomically.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use tokio::sync::broadcast;

use super::store::{LedgerStore, Mutation};
use super::Ledger;
use crate::error::{LoomError, Result};
use crate::{io, paths};

const LOCK_POLL: Duration = Duration::from_millis(2);

pub struct FileLedgerStore {
    dir: PathBuf,
    lock_timeout: Duration,
    /// A lock older than this was left by a crashed writer.
    stale_lock_after: Duration,
    changes: broadcast::Sender<String>,
}

impl FileLedgerStore {
    /// Store under `<root>/.loom/ceremonies`.
    pub fn open(root: &Path) -> Result<Self> {
        Self::in_dir(&paths::ceremonies_dir(root))
    }

    pub fn in_dir(dir: &Path) -> Result<Self> {
        io::ensure_dir(dir)?;
        let (changes, _) = broadcast::channel(256);
        Ok(Self {
            dir: dir.to_path_buf(),
            lock_timeout: Duration::from_secs(5),
            stale_lock_after: Duration::from_secs(30),
            changes,
        })
    }

    /// Open the store holding a given ledger file, as handed to a worker.
    /// Returns the store and the ceremony id.
    pub fn for_ledger_file(path: &Path) -> Result<(Self, String)> {
        let id = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| LoomError::Store(format!("not a ledger path: {}", path.display())))?
            .to_string();
        let dir = path.parent().unwrap_or(Path::new("."));
        Ok((Self::in_dir(dir)?, id))
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_stale_lock_after(mut self, age: Duration) -> Self {
        self.stale_lock_after = age;
        self
    }

    fn load(&self, ceremony_id: &str) -> Result<Ledger> {
        let path = paths::ledger_file(&self.dir, ceremony_id);
        if !path.exists() {
            return Err(LoomError::CeremonyNotFound(ceremony_id.to_string()));
        }
        let data = std::fs::read_to_string(&path)?;
        Ledger::from_document(&data)
    }

    fn persist(&self, ledger: &Ledger) -> Result<()> {
        let path = paths::ledger_file(&self.dir, ledger.id());
        io::atomic_write(&path, ledger.to_document()?.as_bytes())
    }

    fn lock(&self, ceremony_id: &str) -> Result<LockGuard> {
        let path = paths::lock_file(&self.dir, ceremony_id);
        let started = Instant::now();
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut f) => {
                    let _ = writeln!(f, "{}", std::process::id());
                    return Ok(LockGuard { path });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if self.lock_is_stale(&path) {
                        tracing::warn!(lock = %path.display(), "breaking stale ledger lock");
                        let _ = std::fs::remove_file(&path);
                        continue;
                    }
                    if started.elapsed() >= self.lock_timeout {
                        return Err(LoomError::LockTimeout(path.display().to_string()));
                    }
                    std::thread::sleep(LOCK_POLL);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn lock_is_stale(&self, path: &Path) -> bool {
        std::fs::metadata(path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|mtime| SystemTime::now().duration_since(mtime).ok())
            .is_some_and(|age| age > self.stale_lock_after)
    }
}

struct LockGuard {
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

impl LedgerStore for FileLedgerStore {
    fn create(&self, ledger: &Ledger) -> Result<u64> {
        paths::validate_id(ledger.id())?;
        let _guard = self.lock(ledger.id())?;
        if paths::ledger_file(&self.dir, ledger.id()).exists() {
            return Err(LoomError::CeremonyExists(ledger.id().to_string()));
        }
        let mut ledger = ledger.clone();
        ledger.ceremony.revision = 1;
        self.persist(&ledger)?;
        let _ = self.changes.send(ledger.id().to_string());
        Ok(1)
    }

    fn read(&self, ceremony_id: &str) -> Result<(Ledger, u64)> {
        let ledger = self.load(ceremony_id)?;
        let revision = ledger.ceremony.revision;
        Ok((ledger, revision))
    }

    fn write(
        &self,
        ceremony_id: &str,
        expected_revision: u64,
        mutation: Mutation<'_>,
    ) -> Result<u64> {
        let _guard = self.lock(ceremony_id)?;
        let mut ledger = self.load(ceremony_id)?;
        let actual = ledger.ceremony.revision;
        if actual != expected_revision {
            return Err(LoomError::RevisionConflict {
                expected: expected_revision,
                actual,
            });
        }
        mutation(&mut ledger)?;
        ledger.ceremony.revision = actual + 1;
        self.persist(&ledger)?;
        let _ = self.changes.send(ceremony_id.to_string());
        Ok(actual + 1)
    }

    fn list(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(paths::LEDGER_EXT) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn location(&self, ceremony_id: &str) -> PathBuf {
        paths::ledger_file(&self.dir, ceremony_id)
    }

    fn subscribe(&self) -> broadcast::Receiver<String> {
        self.changes.subscribe()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
