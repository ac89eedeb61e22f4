// kiln-core/src/lock.rs
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;
use tokio::sync::OwnedMutexGuard;
use tracing::debug;

type PrefixLock = Arc<tokio::sync::Mutex<()>>;

static PREFIX_LOCKS: Lazy<Mutex<HashMap<PathBuf, PrefixLock>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

fn lock_for(prefix: &Path) -> PrefixLock {
    let key = prefix
        .canonicalize()
        .unwrap_or_else(|_| prefix.to_path_buf());
    let mut locks = PREFIX_LOCKS
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    Arc::clone(locks.entry(key).or_default())
}

/// Serializes writes into one install prefix across every pipeline in this
/// process. The guard releases the prefix on drop.
pub async fn lock_prefix(prefix: &Path) -> OwnedMutexGuard<()> {
    let lock = lock_for(prefix);
    debug!("Waiting for prefix lock on {}", prefix.display());
    let guard = lock.lock_owned().await;
    debug!("Acquired prefix lock on {}", prefix.display());
    guard
}
