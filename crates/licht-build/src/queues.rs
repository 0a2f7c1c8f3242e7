//! Scheduling primitives shared between workers: help groups for sub-tasks
//! one owner farms out, indexed task boards drained by every idle worker,
//! and the one-shot flags that mark a phase output ready for export.

use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crossbeam_channel::{Receiver, Sender, unbounded};

/// Multi-producer multi-consumer queue with non-blocking pop.
pub struct SharedQueue<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
}

impl<T> SharedQueue<T> {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self { tx, rx }
    }

    pub fn push(&self, item: T) {
        let _ = self.tx.send(item);
    }

    pub fn try_pop(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }
}

impl<T> Default for SharedQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Flag that flips true exactly once and is consumed exactly once.
#[derive(Default)]
pub struct OneShotFlag {
    raised: AtomicBool,
}

impl OneShotFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true only for the single caller that performed the flip.
    pub fn raise(&self) -> bool {
        self.raised
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Consumes the flag; true only for the single caller that observed it raised.
    pub fn take(&self) -> bool {
        self.raised.swap(false, Ordering::AcqRel)
    }

    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::Acquire)
    }
}

fn finish_one_of(outstanding: &AtomicUsize) -> usize {
    let prev = outstanding.fetch_sub(1, Ordering::AcqRel);
    assert!(prev > 0, "sub-task counter underflow");
    prev - 1
}

/// Sub-tasks a single owner enqueues on a shared queue and must see finished
/// before it can assemble its own result. The owner helps drain the queue
/// while waiting, so any worker may end up running any ticket.
pub struct HelpGroup<R> {
    outstanding: Arc<AtomicUsize>,
    done_tx: Sender<(usize, R)>,
    done_rx: Receiver<(usize, R)>,
}

impl<R> HelpGroup<R> {
    pub fn new() -> Self {
        let (done_tx, done_rx) = unbounded();
        Self {
            outstanding: Arc::new(AtomicUsize::new(0)),
            done_tx,
            done_rx,
        }
    }

    /// Completion handle carried by one enqueued sub-task.
    pub fn ticket(&self, index: usize) -> GroupTicket<R> {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        GroupTicket {
            outstanding: Arc::clone(&self.outstanding),
            slot: Some((index, self.done_tx.clone())),
        }
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    pub fn is_complete(&self) -> bool {
        self.outstanding() == 0
    }

    /// Results ordered by sub-task index. A ticket dropped mid-flight (a
    /// faulted worker unwound with it) leaves a hole rather than a hang.
    pub fn into_results(self) -> Vec<(usize, R)> {
        assert!(self.is_complete(), "help group still has outstanding sub-tasks");
        let mut out: Vec<(usize, R)> = self.done_rx.try_iter().collect();
        out.sort_by_key(|(index, _)| *index);
        out
    }
}

impl<R> Default for HelpGroup<R> {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII completion handle: finishing or dropping it decrements the group
/// counter exactly once, so a panic in the processing code cannot strand
/// the owner waiting on a count that will never reach zero.
pub struct GroupTicket<R> {
    outstanding: Arc<AtomicUsize>,
    slot: Option<(usize, Sender<(usize, R)>)>,
}

impl<R> GroupTicket<R> {
    pub fn index(&self) -> usize {
        self.slot.as_ref().map(|(index, _)| *index).unwrap_or(0)
    }

    pub fn complete(mut self, result: R) {
        if let Some((index, tx)) = self.slot.take() {
            let _ = tx.send((index, result));
            finish_one_of(&self.outstanding);
        }
    }
}

impl<R> Drop for GroupTicket<R> {
    fn drop(&mut self) {
        if self.slot.take().is_some() {
            finish_one_of(&self.outstanding);
        }
    }
}

/// Task board published once by the worker that accepted the parent task and
/// then drained cooperatively: idle workers claim ascending indices until the
/// board is exhausted. The last completion raises the ready flag, which the
/// orchestrator consumes to export the assembled output exactly once.
pub struct IndexedTasks<T, R> {
    tasks: OnceLock<Vec<T>>,
    next: AtomicUsize,
    outstanding: AtomicUsize,
    ready: OneShotFlag,
    done_tx: Sender<(usize, R)>,
    done_rx: Receiver<(usize, R)>,
}

impl<T, R> IndexedTasks<T, R> {
    pub fn new() -> Self {
        let (done_tx, done_rx) = unbounded();
        Self {
            tasks: OnceLock::new(),
            next: AtomicUsize::new(0),
            outstanding: AtomicUsize::new(0),
            ready: OneShotFlag::new(),
            done_tx,
            done_rx,
        }
    }

    /// Publishes the full task list. Returns the task count; zero tasks leave
    /// the board inert and the ready flag permanently down.
    pub fn publish(&self, tasks: Vec<T>) -> usize {
        let count = tasks.len();
        if self.tasks.set(tasks).is_err() {
            panic!("task board published twice");
        }
        self.outstanding.store(count, Ordering::Release);
        count
    }

    pub fn is_published(&self) -> bool {
        self.tasks.get().is_some()
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Claims the next unclaimed index, if any remain.
    pub fn try_claim(&self) -> Option<(usize, &T, IndexedClaim<'_, T, R>)> {
        if self.outstanding() == 0 {
            return None;
        }
        let tasks = self.tasks.get()?;
        if self.next.load(Ordering::Relaxed) >= tasks.len() {
            return None;
        }
        let index = self.next.fetch_add(1, Ordering::AcqRel);
        if index >= tasks.len() {
            return None;
        }
        Some((
            index,
            &tasks[index],
            IndexedClaim {
                board: self,
                index,
                finished: false,
            },
        ))
    }

    /// True only for the single caller that consumed the raised flag.
    pub fn take_ready(&self) -> bool {
        self.ready.take()
    }

    pub fn is_ready(&self) -> bool {
        self.ready.is_raised()
    }

    /// Completed results ordered by task index.
    pub fn collect_sorted(&self) -> Vec<(usize, R)> {
        let mut out: Vec<(usize, R)> = self.done_rx.try_iter().collect();
        out.sort_by_key(|(index, _)| *index);
        out
    }

    fn finish_one(&self) {
        if finish_one_of(&self.outstanding) == 0 {
            self.ready.raise();
        }
    }
}

impl<T, R> Default for IndexedTasks<T, R> {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII claim on one board index; drop-safe like [`GroupTicket`].
pub struct IndexedClaim<'a, T, R> {
    board: &'a IndexedTasks<T, R>,
    index: usize,
    finished: bool,
}

impl<'a, T, R> IndexedClaim<'a, T, R> {
    pub fn complete(mut self, result: R) {
        let _ = self.board.done_tx.send((self.index, result));
        self.finished = true;
        self.board.finish_one();
    }
}

impl<'a, T, R> Drop for IndexedClaim<'a, T, R> {
    fn drop(&mut self) {
        if !self.finished {
            self.board.finish_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn one_shot_raises_once_across_threads() {
        let flag = Arc::new(OneShotFlag::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let flag = Arc::clone(&flag);
            handles.push(thread::spawn(move || flag.raise()));
        }
        let raised: usize = handles
            .into_iter()
            .map(|h| h.join().unwrap() as usize)
            .sum();
        assert_eq!(raised, 1);
        assert!(flag.take());
        assert!(!flag.take());
    }

    #[test]
    fn help_group_results_come_back_in_index_order() {
        let group: HelpGroup<u32> = HelpGroup::new();
        let tickets: Vec<_> = (0..4).map(|i| group.ticket(i)).collect();
        assert_eq!(group.outstanding(), 4);
        for (i, ticket) in tickets.into_iter().enumerate().rev() {
            ticket.complete(i as u32 * 10);
        }
        assert!(group.is_complete());
        let results = group.into_results();
        assert_eq!(results, vec![(0, 0), (1, 10), (2, 20), (3, 30)]);
    }

    #[test]
    fn dropped_ticket_leaves_hole_not_hang() {
        let group: HelpGroup<u32> = HelpGroup::new();
        let a = group.ticket(0);
        let b = group.ticket(1);
        a.complete(7);
        drop(b);
        assert!(group.is_complete());
        assert_eq!(group.into_results(), vec![(0, 7)]);
    }

    #[test]
    fn board_ready_flag_raised_by_last_completion() {
        let board: IndexedTasks<u32, u32> = IndexedTasks::new();
        assert!(board.try_claim().is_none());
        assert_eq!(board.publish(vec![5, 6, 7]), 3);
        while let Some((index, task, claim)) = board.try_claim() {
            assert!(!board.is_ready());
            claim.complete(task * 2 + index as u32);
        }
        assert_eq!(board.outstanding(), 0);
        assert!(board.take_ready());
        assert!(!board.take_ready());
        let results = board.collect_sorted();
        assert_eq!(results, vec![(0, 10), (1, 13), (2, 16)]);
    }

    #[test]
    fn board_claims_race_without_duplicates() {
        let board: Arc<IndexedTasks<usize, usize>> = Arc::new(IndexedTasks::new());
        board.publish((0..64).collect());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let board = Arc::clone(&board);
            handles.push(thread::spawn(move || {
                let mut seen = Vec::new();
                while let Some((index, task, claim)) = board.try_claim() {
                    assert_eq!(index, *task);
                    seen.push(index);
                    claim.complete(index);
                }
                seen
            }));
        }
        let mut all: Vec<usize> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        assert_eq!(all, (0..64).collect::<Vec<_>>());
        assert!(board.take_ready());
    }

    #[test]
    fn dropped_claim_still_lets_board_finish() {
        let board: IndexedTasks<u32, u32> = IndexedTasks::new();
        board.publish(vec![1, 2]);
        let (_, _, first) = board.try_claim().unwrap();
        drop(first);
        let (_, task, second) = board.try_claim().unwrap();
        second.complete(*task);
        assert!(board.take_ready());
        assert_eq!(board.collect_sorted(), vec![(1, 2)]);
    }

    #[test]
    #[should_panic(expected = "published twice")]
    fn double_publish_panics() {
        let board: IndexedTasks<u32, u32> = IndexedTasks::new();
        board.publish(vec![1]);
        board.publish(vec![2]);
    }
}
