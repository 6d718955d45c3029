//! The storage seam for ledgers.
//!
//! Every write names the revision it was computed against. The store
//! re-reads the document inside its critical section, rejects the write
//! with [`LoomError::RevisionConflict`] if anyone else got there first, and
//! otherwise applies the mutation and bumps the revision. That check is the
//! only lock in the system and it is never held across worker execution.
//!
//! Store calls are synchronous and may wait on that lock. Async code reaches
//! them through [`blocking`] and [`update`], which run on tokio's blocking
//! pool so a contended lock never stalls the runtime.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::{EventKind, Ledger};
use crate::error::{LoomError, Result};

pub type Mutation<'a> = &'a mut dyn FnMut(&mut Ledger) -> Result<()>;

pub trait LedgerStore: Send + Sync {
    /// Persist a new ledger at revision 1.
    fn create(&self, ledger: &Ledger) -> Result<u64>;

    fn read(&self, ceremony_id: &str) -> Result<(Ledger, u64)>;

    /// Atomic read-modify-write, rejected unless the stored revision still
    /// equals `expected_revision`. Returns the new revision.
    fn write(&self, ceremony_id: &str, expected_revision: u64, mutation: Mutation<'_>)
        -> Result<u64>;

    /// Ceremony ids, sorted.
    fn list(&self) -> Result<Vec<String>>;

    /// Where a worker finds this ceremony's ledger.
    fn location(&self, ceremony_id: &str) -> PathBuf;

    /// Ceremony ids of successful writes made through this store instance.
    fn subscribe(&self) -> broadcast::Receiver<String>;

    /// Append one event, retrying on conflict. Blocks the calling thread.
    fn append_event(&self, ceremony_id: &str, event: EventKind) -> Result<u64> {
        update_blocking(self, ceremony_id, &RetryPolicy::default(), |ledger| {
            ledger.record(event.clone())
        })
    }
}

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

/// Bounded exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

fn default_attempts() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    10
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: default_attempts(),
            base_delay_ms: default_base_delay_ms(),
        }
    }
}

impl RetryPolicy {
    pub fn new(attempts: u32, base_delay_ms: u64) -> Self {
        Self {
            attempts,
            base_delay_ms,
        }
    }

    /// Delay before retry number `retry` (1-based), capped at 64x the base.
    pub fn delay(&self, retry: u32) -> Duration {
        let factor = 1u64 << retry.saturating_sub(1).min(6);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor))
    }
}

// ---------------------------------------------------------------------------
// update
// ---------------------------------------------------------------------------

/// Read the current revision and write `mutation` against it, re-reading
/// and retrying on conflict. The mutation always sees the freshest ledger.
/// Sleeps between retries; call it from a thread that may block.
pub fn update_blocking<S, F>(
    store: &S,
    ceremony_id: &str,
    policy: &RetryPolicy,
    mut mutation: F,
) -> Result<u64>
where
    S: LedgerStore + ?Sized,
    F: FnMut(&mut Ledger) -> Result<()>,
{
    let mut retry = 0;
    loop {
        let (_, revision) = store.read(ceremony_id)?;
        match store.write(ceremony_id, revision, &mut mutation) {
            Err(LoomError::RevisionConflict { expected, actual }) if retry + 1 < policy.attempts => {
                retry += 1;
                tracing::debug!(
                    ceremony = ceremony_id,
                    expected,
                    actual,
                    retry,
                    "ledger revision conflict, retrying"
                );
                std::thread::sleep(policy.delay(retry));
            }
            other => return other,
        }
    }
}

/// [`update_blocking`] on the blocking pool.
pub async fn update<F>(
    store: &Arc<dyn LedgerStore>,
    ceremony_id: &str,
    policy: &RetryPolicy,
    mutation: F,
) -> Result<u64>
where
    F: FnMut(&mut Ledger) -> Result<()> + Send + 'static,
{
    let id = ceremony_id.to_string();
    let policy = *policy;
    blocking(store, move |store| update_blocking(store, &id, &policy, mutation)).await
}

/// Run one synchronous store call on the blocking pool.
pub async fn blocking<T, F>(store: &Arc<dyn LedgerStore>, call: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&dyn LedgerStore) -> Result<T> + Send + 'static,
{
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || call(store.as_ref()))
        .await
        .map_err(|e| LoomError::Store(format!("ledger task failed: {e}")))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_doubles_and_caps() {
        let p = RetryPolicy::new(10, 10);
        assert_eq!(p.delay(1), Duration::from_millis(10));
        assert_eq!(p.delay(2), Duration::from_millis(20));
        assert_eq!(p.delay(3), Duration::from_millis(40));
        assert_eq!(p.delay(7), Duration::from_millis(640));
        assert_eq!(p.delay(30), Duration::from_millis(640));
    }

    #[test]
    fn policy_defaults_from_empty_yaml() {
        let p: RetryPolicy = serde_yaml::from_str("{}").unwrap();
        assert_eq!(p, RetryPolicy::default());
    }
}
