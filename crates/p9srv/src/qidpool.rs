//! Process-wide-per-connection mapping from a cleaned path string to a
//! stable [`Qid`] (§4.2).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::fcall::{Qid, QidType};

/// Assigns and remembers the `path` integer backing each file's [`Qid`].
///
/// Lookups are keyed by cleaned absolute path. A path's qid is created on
/// first reference and kept stable for as long as the path exists;
/// deleting and recreating a name must go through [`QidPool::delete`] so
/// the next `get_or_insert` mints a fresh `path` integer, per the
/// protocol's identity invariant.
pub struct QidPool {
    next_path: AtomicU64,
    paths: Mutex<HashMap<String, Qid>>,
}

impl QidPool {
    pub fn new() -> QidPool {
        QidPool {
            next_path: AtomicU64::new(1),
            paths: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the existing qid for `path`, or mints one with the given
    /// type bits and version 0.
    pub fn get_or_insert(&self, path: &str, typ: QidType) -> Qid {
        let mut paths = self.paths.lock().unwrap();
        if let Some(qid) = paths.get(path) {
            return *qid;
        }
        let qid = Qid {
            typ,
            version: 0,
            path: self.next_path.fetch_add(1, Ordering::Relaxed),
        };
        paths.insert(path.to_owned(), qid);
        qid
    }

    /// Looks up `path`'s qid without creating one.
    pub fn get(&self, path: &str) -> Option<Qid> {
        self.paths.lock().unwrap().get(path).copied()
    }

    /// Forgets `path`. A later `get_or_insert` for the same string mints
    /// a new qid rather than resurrecting the old identity.
    pub fn delete(&self, path: &str) {
        self.paths.lock().unwrap().remove(path);
    }

    /// Runs `f` with exclusive access to the whole map, for multi-key
    /// updates that must be atomic with respect to other lookups — chiefly
    /// rename, which must move an entry from its old key to its new one
    /// without a concurrent `get_or_insert` observing neither or both.
    pub fn with_lock<R>(&self, f: impl FnOnce(&mut HashMap<String, Qid>) -> R) -> R {
        let mut paths = self.paths.lock().unwrap();
        f(&mut paths)
    }

    /// Moves `old`'s qid to be reachable under `new` as well, leaving the
    /// identity unchanged. Used by the wstat demultiplexer on a
    /// successful rename (§4.7).
    pub fn rename(&self, old: &str, new: &str) {
        self.with_lock(|paths| {
            if let Some(qid) = paths.remove(old) {
                paths.insert(new.to_owned(), qid);
            }
        });
    }
}

impl Default for QidPool {
    fn default() -> QidPool {
        QidPool::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_path_returns_the_same_qid() {
        let pool = QidPool::new();
        let a = pool.get_or_insert("/a", QidType::FILE);
        let b = pool.get_or_insert("/a", QidType::FILE);
        assert_eq!(a, b);
    }

    #[test]
    fn delete_then_recreate_yields_a_fresh_path_integer() {
        let pool = QidPool::new();
        let a = pool.get_or_insert("/a", QidType::FILE);
        pool.delete("/a");
        let b = pool.get_or_insert("/a", QidType::FILE);
        assert_ne!(a.path, b.path);
    }

    #[test]
    fn rename_preserves_identity_under_the_new_name() {
        let pool = QidPool::new();
        let a = pool.get_or_insert("/a", QidType::FILE);
        pool.rename("/a", "/b");
        assert_eq!(pool.get("/a"), None);
        assert_eq!(pool.get("/b"), Some(a));
    }
}
