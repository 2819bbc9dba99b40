//! Allocator for client-chosen-shaped identifiers (§4.3).
//!
//! Used internally wherever the core itself must mint a 32-bit handle —
//! session diagnostic ids and the walker generation counter — rather than
//! accept one from the wire (fids and tags are always client-chosen and
//! never pass through this pool).

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

/// Allocates non-zero `u32`s from `[1, max)`, reusing released values.
///
/// `next` is a lock-free counter handling the common case (monotonic
/// growth, no reuse yet); `reclaimed` is a sorted free list consulted
/// only once `next` has been exhausted or a hole has opened up behind it.
pub struct IdPool {
    next: AtomicU32,
    max: u32,
    reclaimed: Mutex<BTreeSet<u32>>,
}

impl IdPool {
    pub fn new(max: u32) -> IdPool {
        IdPool {
            next: AtomicU32::new(1),
            max,
            reclaimed: Mutex::new(BTreeSet::new()),
        }
    }

    /// Allocates an id, or `None` if the pool is exhausted.
    pub fn acquire(&self) -> Option<u32> {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        if id < self.max {
            return Some(id);
        }
        // Overshot: undo and fall back to the free list.
        self.next.fetch_sub(1, Ordering::Relaxed);
        let mut reclaimed = self.reclaimed.lock().unwrap();
        reclaimed.pop_last()
    }

    /// Returns `id` to the pool. Collapses into `next` when `id` is the
    /// value immediately preceding it, so a pool that never wraps never
    /// grows a free list; otherwise the id is recorded for later reuse.
    pub fn release(&self, id: u32) {
        loop {
            let cur = self.next.load(Ordering::Relaxed);
            if id + 1 == cur {
                if self
                    .next
                    .compare_exchange(cur, id, Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
                {
                    self.collapse_tail();
                    return;
                }
                continue;
            }
            break;
        }
        self.reclaimed.lock().unwrap().insert(id);
    }

    /// After `next` moves backward, absorb any reclaimed ids that now sit
    /// directly behind it so the free list doesn't accumulate a run that
    /// `acquire` would otherwise have to pop one at a time.
    fn collapse_tail(&self) {
        let mut reclaimed = self.reclaimed.lock().unwrap();
        loop {
            let cur = self.next.load(Ordering::Relaxed);
            if cur == 0 || !reclaimed.remove(&(cur - 1)) {
                break;
            }
            self.next.store(cur - 1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquires_in_order_without_reuse() {
        let pool = IdPool::new(100);
        assert_eq!(pool.acquire(), Some(1));
        assert_eq!(pool.acquire(), Some(2));
        assert_eq!(pool.acquire(), Some(3));
    }

    #[test]
    fn released_id_is_reused() {
        let pool = IdPool::new(100);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        pool.release(a);
        // a collapses into `next` since it immediately precedes it.
        let c = pool.acquire().unwrap();
        assert_eq!(c, a);
        assert_ne!(b, c);
    }

    #[test]
    fn never_hands_out_the_same_id_twice_concurrently() {
        let pool = IdPool::new(5);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        let c = pool.acquire().unwrap();
        let d = pool.acquire().unwrap();
        assert_eq!(pool.acquire(), None);
        let mut ids = vec![a, b, c, d];
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 4);
        pool.release(b);
        let reused = pool.acquire();
        assert_eq!(reused, Some(b));
    }
}
