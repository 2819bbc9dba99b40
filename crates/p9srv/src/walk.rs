//! Walk synthesizer (§4.6): turns one `Twalk` into `n` single-element
//! sub-requests and reassembles the ordered reply.

use std::sync::Mutex;

use tokio::sync::Notify;

use crate::fcall::Qid;

/// One step of a synthesized walk, delivered to the handler in ascending
/// index order.
#[derive(Clone, Debug)]
pub struct WalkStep {
    pub index: usize,
    pub path: String,
}

/// Shared state for a single `Twalk`. Aggregates up to `n` replies that
/// may arrive out of order, and tolerates a handler answering the same
/// slot twice (first answer wins, per §9).
pub struct Walker {
    slots: Mutex<Vec<Option<Result<Qid, String>>>>,
    remaining: Mutex<usize>,
    done: Notify,
}

impl Walker {
    pub fn new(n: usize) -> Walker {
        Walker {
            slots: Mutex::new(vec![None; n]),
            remaining: Mutex::new(n),
            done: Notify::new(),
        }
    }

    /// The sub-requests the handler must observe, in order.
    pub fn steps(&self, base: &str, elems: &[String]) -> Vec<WalkStep> {
        let mut path = base.to_owned();
        let mut out = Vec::with_capacity(elems.len());
        for (index, elem) in elems.iter().enumerate() {
            path = crate::utils::join(&path, elem);
            out.push(WalkStep { index, path: path.clone() });
        }
        out
    }

    /// Records the handler's answer for slot `index`. Idempotent: a
    /// second call for the same slot is ignored.
    pub fn fill(&self, index: usize, result: Result<Qid, String>) {
        let mut slots = self.slots.lock().unwrap();
        if slots[index].is_some() {
            return;
        }
        slots[index] = Some(result);
        drop(slots);
        let mut remaining = self.remaining.lock().unwrap();
        *remaining -= 1;
        if *remaining == 0 {
            self.done.notify_waiters();
        }
    }

    /// Waits until every slot is filled or `cancelled` completes,
    /// whichever happens first.
    pub async fn wait(&self, cancelled: impl std::future::Future<Output = ()>) {
        if *self.remaining.lock().unwrap() == 0 {
            return;
        }
        tokio::select! {
            _ = self.done.notified() => {}
            _ = cancelled => {}
        }
    }

    /// The longest prefix of present qids, and the error of the first
    /// absent slot (for an all-or-nothing `Rerror`).
    pub fn outcome(&self) -> WalkOutcome {
        let slots = self.slots.lock().unwrap();
        let mut qids = Vec::new();
        for slot in slots.iter() {
            match slot {
                Some(Ok(qid)) => qids.push(*qid),
                _ => break,
            }
        }
        if qids.is_empty() {
            let first_error = slots
                .iter()
                .find_map(|s| match s {
                    Some(Err(e)) => Some(e.clone()),
                    _ => None,
                })
                .unwrap_or_else(|| "no such file or directory".to_owned());
            WalkOutcome::NotFound(first_error)
        } else {
            WalkOutcome::Found(qids)
        }
    }
}

pub enum WalkOutcome {
    Found(Vec<Qid>),
    NotFound(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fcall::QidType;

    fn qid(path: u64) -> Qid {
        Qid { typ: QidType::FILE, version: 0, path }
    }

    #[tokio::test]
    async fn all_present_yields_the_full_chain() {
        let w = Walker::new(3);
        w.fill(0, Ok(qid(1)));
        w.fill(1, Ok(qid(2)));
        w.fill(2, Ok(qid(3)));
        w.wait(std::future::pending()).await;
        match w.outcome() {
            WalkOutcome::Found(qids) => assert_eq!(qids.len(), 3),
            WalkOutcome::NotFound(_) => panic!("expected Found"),
        }
    }

    #[tokio::test]
    async fn stops_at_first_absent_element() {
        let w = Walker::new(3);
        w.fill(0, Ok(qid(1)));
        w.fill(1, Err("no such file or directory".to_owned()));
        w.fill(2, Ok(qid(3)));
        w.wait(std::future::pending()).await;
        match w.outcome() {
            WalkOutcome::Found(qids) => assert_eq!(qids, vec![qid(1)]),
            WalkOutcome::NotFound(_) => panic!("expected a one-element Found"),
        }
    }

    #[tokio::test]
    async fn first_element_absent_yields_not_found() {
        let w = Walker::new(2);
        w.fill(0, Err("boom".to_owned()));
        w.fill(1, Ok(qid(9)));
        w.wait(std::future::pending()).await;
        match w.outcome() {
            WalkOutcome::NotFound(msg) => assert_eq!(msg, "boom"),
            WalkOutcome::Found(_) => panic!("expected NotFound"),
        }
    }

    #[tokio::test]
    async fn a_slot_answered_twice_keeps_its_first_answer() {
        let w = Walker::new(1);
        w.fill(0, Ok(qid(1)));
        w.fill(0, Ok(qid(2)));
        w.wait(std::future::pending()).await;
        match w.outcome() {
            WalkOutcome::Found(qids) => assert_eq!(qids, vec![qid(1)]),
            WalkOutcome::NotFound(_) => panic!("expected Found"),
        }
    }
}
