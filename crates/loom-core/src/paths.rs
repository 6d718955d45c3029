use crate::error::{LoomError, Result};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// Directory constants
// ---------------------------------------------------------------------------

pub const LOOM_DIR: &str = ".loom";
pub const CEREMONIES_DIR: &str = ".loom/ceremonies";
pub const CONFIG_FILE: &str = ".loom/config.yaml";
pub const LEDGER_DB_FILE: &str = ".loom/ledger.redb";

pub const LEDGER_EXT: &str = "yaml";
pub const LOCK_EXT: &str = "lock";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}

pub fn ceremonies_dir(root: &Path) -> PathBuf {
    root.join(CEREMONIES_DIR)
}

pub fn ledger_db_path(root: &Path) -> PathBuf {
    root.join(LEDGER_DB_FILE)
}

/// Ledger document for one ceremony, inside a ceremonies directory.
pub fn ledger_file(dir: &Path, ceremony_id: &str) -> PathBuf {
    dir.join(format!("{ceremony_id}.{LEDGER_EXT}"))
}

pub fn lock_file(dir: &Path, ceremony_id: &str) -> PathBuf {
    dir.join(format!("{ceremony_id}.{LOCK_EXT}"))
}

// ---------------------------------------------------------------------------
// Id validation
// ---------------------------------------------------------------------------

static ID_RE: OnceLock<Regex> = OnceLock::new();

fn id_re() -> &'static Regex {
    ID_RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.\-]*$").unwrap())
}

/// Ceremony and task ids end up in file names and event records.
pub fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() || id.len() > 64 || !id_re().is_match(id) {
        return Err(LoomError::InvalidId(id.to_string()));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
