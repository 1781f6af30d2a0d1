//! Process-wide registry of held lock paths
//!
//! Threads of one process queue here before touching the lock file, so the
//! filesystem only ever sees one contender per process for a given path.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Condvar, Mutex, MutexGuard, OnceLock};
use std::time::Instant;

struct Registry {
    held: Mutex<HashSet<PathBuf>>,
    released: Condvar,
}

impl Registry {
    fn held(&self) -> MutexGuard<'_, HashSet<PathBuf>> {
        // The set stays consistent even if a holder panicked mid-insert
        self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(|| Registry {
        held: Mutex::new(HashSet::new()),
        released: Condvar::new(),
    })
}

/// Normalizes a lock path so aliases of the same file share one slot
pub(crate) fn registry_key(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Exclusive in-process claim on a lock path, freed on drop
#[derive(Debug)]
pub(crate) struct InProcessGuard {
    key: PathBuf,
}

impl Drop for InProcessGuard {
    fn drop(&mut self) {
        let registry = registry();
        registry.held().remove(&self.key);
        registry.released.notify_all();
    }
}

/// Waits until no other thread of this process holds `key`
///
/// Returns `None` if `deadline` passes first.
pub(crate) fn claim(key: PathBuf, deadline: Instant) -> Option<InProcessGuard> {
    let registry = registry();
    let mut held = registry.held();
    loop {
        if !held.contains(&key) {
            held.insert(key.clone());
            return Some(InProcessGuard { key });
        }
        let now = Instant::now();
        if now >= deadline {
            return None;
        }
        held = match registry.released.wait_timeout(held, deadline - now) {
            Ok((guard, _)) => guard,
            Err(poisoned) => poisoned.into_inner().0,
        };
    }
}

/// Returns true if some thread of this process holds `key`
#[cfg(test)]
pub(crate) fn is_held(key: &Path) -> bool {
    registry().held().contains(key)
}
