//! Completed-result collection: many producing workers, one draining
//! consumer, deterministic ascending-id export order.

use crossbeam_channel::{Receiver, Sender, unbounded};
use licht_export::Keyed;

/// One completed result, tagged with the worker that produced it.
#[derive(Debug)]
pub struct ResultRecord<T> {
    pub payload: T,
    pub worker: usize,
}

/// Multi-producer list of completed results. `push` never blocks;
/// `drain_sorted` detaches everything present at call entry and returns it
/// ordered by sort key, so export order is independent of completion order.
///
/// Single-consumer by convention: only the orchestrator drains.
pub struct ResultList<T> {
    tx: Sender<ResultRecord<T>>,
    rx: Receiver<ResultRecord<T>>,
}

impl<T: Keyed> ResultList<T> {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self { tx, rx }
    }

    #[inline]
    pub fn push(&self, payload: T, worker: usize) {
        // Both ends live as long as self; the send cannot fail.
        let _ = self.tx.send(ResultRecord { payload, worker });
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// Detach the records present at call entry and return them sorted
    /// ascending by id. Records pushed while this runs land in the next
    /// drain. Each call does a bounded amount of work.
    pub fn drain_sorted(&self) -> Vec<ResultRecord<T>> {
        let pending = self.rx.len();
        let mut batch = Vec::with_capacity(pending);
        for _ in 0..pending {
            match self.rx.try_recv() {
                Ok(rec) => batch.push(rec),
                Err(_) => break,
            }
        }
        batch.sort_by_key(|rec| rec.payload.sort_key());
        batch
    }
}

impl<T: Keyed> Default for ResultList<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    struct Rec(Uuid);

    impl Keyed for Rec {
        fn sort_key(&self) -> Uuid {
            self.0
        }
    }

    fn id(n: u128) -> Uuid {
        Uuid::from_u128(n)
    }

    #[test]
    fn drain_is_sorted_not_arrival_ordered() {
        let list = ResultList::new();
        for n in [7u128, 2, 9, 3, 5] {
            list.push(Rec(id(n)), 0);
        }
        let out: Vec<u128> = list
            .drain_sorted()
            .iter()
            .map(|r| r.payload.0.as_u128())
            .collect();
        assert_eq!(out, vec![2, 3, 5, 7, 9]);
        assert!(list.is_empty());
    }

    #[test]
    fn empty_drain_is_empty() {
        let list: ResultList<Rec> = ResultList::new();
        assert!(list.drain_sorted().is_empty());
    }

    #[test]
    fn racing_pushes_are_never_lost() {
        use std::sync::Arc;

        let list = Arc::new(ResultList::new());
        let producers = 4;
        let per = 500;
        let mut handles = Vec::new();
        for p in 0..producers {
            let list = Arc::clone(&list);
            handles.push(std::thread::spawn(move || {
                for n in 0..per {
                    list.push(Rec(id((p * per + n) as u128)), p);
                }
            }));
        }
        let mut seen = 0usize;
        while seen < producers * per {
            let batch = list.drain_sorted();
            for w in batch.windows(2) {
                assert!(w[0].payload.0 <= w[1].payload.0, "batch not sorted");
            }
            seen += batch.len();
        }
        for h in handles {
            h.join().unwrap();
        }
        assert!(list.is_empty());
        assert_eq!(seen, producers * per);
    }
}
