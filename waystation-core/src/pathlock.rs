//! Per-path async write locks.
//!
//! Disk writes to agent metadata and session sidecar files must be
//! serialized per file so concurrent read-modify-write cycles cannot
//! interleave JSON. Locks are keyed by canonical-ish path string and
//! created on demand.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

/// Registry of per-path `tokio::sync::Mutex` guards.
pub struct PathLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl PathLocks {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch (or create) the lock guarding `path`.
    pub fn lock_for(&self, path: &Path) -> Arc<tokio::sync::Mutex<()>> {
        let key = path.to_string_lossy().to_string();
        self.locks
            .lock()
            .entry(key)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

impl Default for PathLocks {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_same_path_same_lock() {
        let locks = PathLocks::new();
        let a = locks.lock_for(&PathBuf::from("/tmp/x.json"));
        let b = locks.lock_for(&PathBuf::from("/tmp/x.json"));
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_different_paths_different_locks() {
        let locks = PathLocks::new();
        let a = locks.lock_for(&PathBuf::from("/tmp/x.json"));
        let b = locks.lock_for(&PathBuf::from("/tmp/y.json"));
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn test_lock_serializes_writers() {
        let locks = Arc::new(PathLocks::new());
        let counter = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let mut handles = Vec::new();

        for _ in 0..8 {
            let locks = locks.clone();
            let counter = counter.clone();
            handles.push(tokio::spawn(async move {
                let lock = locks.lock_for(&PathBuf::from("/tmp/shared.json"));
                let _guard = lock.lock().await;
                let v = counter.load(std::sync::atomic::Ordering::SeqCst);
                tokio::task::yield_now().await;
                counter.store(v + 1, std::sync::atomic::Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(counter.load(std::sync::atomic::Ordering::SeqCst), 8);
    }
}
