use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type LockMap = Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>;

/// One async lock per clip fingerprint. Runs on the same clip queue behind
/// each other; runs on different clips never wait.
#[derive(Default)]
pub(crate) struct ClipLocks {
    locks: LockMap,
}

pub(crate) struct ClipGuard {
    key: String,
    locks: LockMap,
    guard: Option<OwnedMutexGuard<()>>,
}

impl ClipLocks {
    pub(crate) async fn acquire(&self, fingerprint: &str) -> ClipGuard {
        let lock = {
            let mut map = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(map.entry(fingerprint.to_string()).or_default())
        };
        let guard = lock.lock_owned().await;
        ClipGuard {
            key: fingerprint.to_string(),
            locks: Arc::clone(&self.locks),
            guard: Some(guard),
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl Drop for ClipGuard {
    fn drop(&mut self) {
        self.guard.take();
        let mut map = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // Only the map holds it: nobody is waiting, so the slot can go.
        if map
            .get(&self.key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            map.remove(&self.key);
        }
    }
}
