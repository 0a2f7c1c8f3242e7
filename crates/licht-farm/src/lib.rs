//! Task-distribution tier: the agent seeds the build's task ids and hands
//! them out to pulling workers; completions and rejections flow back in.
//!
//! The in-process agent stands in for a networked distribution service, so
//! the contract is written for the remote case: requests are bounded waits,
//! rejections must leave the task retryable, and failures surface on an
//! out-of-band message stream instead of as hard errors.
#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use hashbrown::HashSet;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum FarmError {
    #[error("task channel disconnected")]
    Disconnected,
}

/// Out-of-band traffic: log lines, progress ticks, phase timings.
#[derive(Clone, Debug, PartialEq)]
pub enum FarmMessage {
    Log { level: log::Level, text: String },
    Progress { completed: usize, total: usize },
    Timing { label: String, ms: f64 },
}

impl FarmMessage {
    /// Forward the message into the process logger.
    pub fn emit(&self) {
        match self {
            FarmMessage::Log { level, text } => {
                log::log!(target: "licht::farm", *level, "{text}");
            }
            FarmMessage::Progress { completed, total } => {
                log::debug!(target: "licht::farm", "progress {completed}/{total}");
            }
            FarmMessage::Timing { label, ms } => {
                log::info!(target: "licht::farm", "{label}: {ms:.1}ms");
            }
        }
    }
}

/// Client side of the distribution protocol. Every call is safe from any
/// worker thread concurrently.
pub trait TaskSource: Send + Sync {
    /// Bounded wait for the next task id. `None` on timeout, shutdown, or
    /// transport failure (the latter is reported on the message stream).
    fn request_task(&self, wait: Duration) -> Option<Uuid>;

    /// Declares this worker the sole owner of `id`; must precede any work.
    fn accept_task(&self, id: Uuid);

    /// Returns `id` to the tier after a lost local claim race. The task must
    /// remain retryable; duplicates of an owned or finished task are dropped.
    fn reject_task(&self, id: Uuid);

    /// Exactly once per processed task, after its payload reached the
    /// exporter. Completing an id twice is a contract violation.
    fn task_completed(&self, id: Uuid);

    /// All seeded tasks have completed.
    fn is_done(&self) -> bool;

    /// Cooperative cancellation was requested.
    fn received_quit_request(&self) -> bool;

    /// Push onto the out-of-band stream.
    fn send_message(&self, msg: FarmMessage);
}

struct AgentState {
    task_tx: Sender<Uuid>,
    task_rx: Receiver<Uuid>,
    msg_tx: Sender<FarmMessage>,
    msg_rx: Receiver<FarmMessage>,
    in_flight: Mutex<HashSet<Uuid>>,
    completed: Mutex<HashSet<Uuid>>,
    unique_total: usize,
    done: AtomicBool,
    quit: AtomicBool,
    accepted: AtomicUsize,
    rejected: AtomicUsize,
}

/// In-process distribution agent: owns the seeded id set and the channels
/// clients pull from.
pub struct FarmAgent {
    state: Arc<AgentState>,
}

/// Cheap handle implementing [`TaskSource`] against a [`FarmAgent`].
#[derive(Clone)]
pub struct FarmClient {
    state: Arc<AgentState>,
}

impl FarmAgent {
    /// Seed the agent with the build's task ids. Duplicate ids are allowed
    /// (they model redundant hand-outs) and count once toward completion.
    pub fn seed(ids: &[Uuid]) -> FarmAgent {
        let (task_tx, task_rx) = unbounded();
        let (msg_tx, msg_rx) = unbounded();
        let unique_total = ids.iter().copied().collect::<HashSet<_>>().len();
        for id in ids {
            // Sending on a channel we hold both ends of cannot fail.
            let _ = task_tx.send(*id);
        }
        FarmAgent {
            state: Arc::new(AgentState {
                task_tx,
                task_rx,
                msg_tx,
                msg_rx,
                in_flight: Mutex::new(HashSet::new()),
                completed: Mutex::new(HashSet::new()),
                unique_total,
                done: AtomicBool::new(unique_total == 0),
                quit: AtomicBool::new(false),
                accepted: AtomicUsize::new(0),
                rejected: AtomicUsize::new(0),
            }),
        }
    }

    pub fn client(&self) -> FarmClient {
        FarmClient {
            state: Arc::clone(&self.state),
        }
    }

    /// Ask every client to stop pulling new work.
    pub fn request_quit(&self) {
        self.state.quit.store(true, Ordering::Release);
    }

    /// Take everything currently on the message stream.
    pub fn drain_messages(&self) -> Vec<FarmMessage> {
        self.state.msg_rx.try_iter().collect()
    }

    pub fn is_done(&self) -> bool {
        self.state.done.load(Ordering::Acquire)
    }

    pub fn accepted_count(&self) -> usize {
        self.state.accepted.load(Ordering::Relaxed)
    }

    pub fn rejected_count(&self) -> usize {
        self.state.rejected.load(Ordering::Relaxed)
    }

    pub fn completed_count(&self) -> usize {
        self.state.completed.lock().unwrap().len()
    }

    pub fn unique_total(&self) -> usize {
        self.state.unique_total
    }
}

impl FarmClient {
    fn requeue(&self, id: Uuid) -> Result<(), FarmError> {
        self.state
            .task_tx
            .send(id)
            .map_err(|_| FarmError::Disconnected)
    }
}

impl TaskSource for FarmClient {
    fn request_task(&self, wait: Duration) -> Option<Uuid> {
        if self.state.quit.load(Ordering::Acquire) || self.state.done.load(Ordering::Acquire) {
            return None;
        }
        match self.state.task_rx.recv_timeout(wait) {
            Ok(id) => {
                // Quit may have landed while we were blocked; hand the id
                // back instead of delivering it.
                if self.state.quit.load(Ordering::Acquire) {
                    let _ = self.requeue(id);
                    return None;
                }
                Some(id)
            }
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => {
                self.send_message(FarmMessage::Log {
                    level: log::Level::Warn,
                    text: "task request failed: agent disconnected".to_string(),
                });
                None
            }
        }
    }

    fn accept_task(&self, id: Uuid) {
        self.state.accepted.fetch_add(1, Ordering::Relaxed);
        if !self.state.in_flight.lock().unwrap().insert(id) {
            panic!("task {id} accepted twice");
        }
    }

    fn reject_task(&self, id: Uuid) {
        self.state.rejected.fetch_add(1, Ordering::Relaxed);
        if self.state.completed.lock().unwrap().contains(&id) {
            return;
        }
        if self.state.in_flight.lock().unwrap().contains(&id) {
            return;
        }
        if self.requeue(id).is_err() {
            self.send_message(FarmMessage::Log {
                level: log::Level::Warn,
                text: format!("failed to return task {id}: agent disconnected"),
            });
        }
    }

    fn task_completed(&self, id: Uuid) {
        self.state.in_flight.lock().unwrap().remove(&id);
        let completed = {
            let mut set = self.state.completed.lock().unwrap();
            if !set.insert(id) {
                panic!("task {id} completed twice");
            }
            set.len()
        };
        if completed == self.state.unique_total {
            self.state.done.store(true, Ordering::Release);
        }
        self.send_message(FarmMessage::Progress {
            completed,
            total: self.state.unique_total,
        });
    }

    fn is_done(&self) -> bool {
        self.state.done.load(Ordering::Acquire)
    }

    fn received_quit_request(&self) -> bool {
        self.state.quit.load(Ordering::Acquire)
    }

    fn send_message(&self, msg: FarmMessage) {
        let _ = self.state.msg_tx.send(msg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn idv(n: u128) -> Uuid {
        Uuid::from_u128(n)
    }

    #[test]
    fn hands_out_and_completes() {
        let agent = FarmAgent::seed(&[idv(1), idv(2), idv(3)]);
        let client = agent.client();
        for _ in 0..3 {
            let id = client.request_task(Duration::from_millis(50)).unwrap();
            client.accept_task(id);
            client.task_completed(id);
        }
        assert!(agent.is_done());
        assert_eq!(agent.accepted_count(), 3);
        assert_eq!(agent.completed_count(), 3);
        assert_eq!(
            client.request_task(Duration::from_millis(1)),
            None,
            "done agent must not block"
        );
    }

    #[test]
    fn empty_seed_is_done_immediately() {
        let agent = FarmAgent::seed(&[]);
        assert!(agent.is_done());
        assert_eq!(agent.client().request_task(Duration::from_millis(1)), None);
    }

    #[test]
    fn request_times_out_when_drained() {
        let agent = FarmAgent::seed(&[idv(9)]);
        let client = agent.client();
        assert!(client.request_task(Duration::from_millis(20)).is_some());
        assert_eq!(client.request_task(Duration::from_millis(5)), None);
        assert!(!agent.is_done());
    }

    #[test]
    fn reject_requeues_unowned_task() {
        let agent = FarmAgent::seed(&[idv(7)]);
        let client = agent.client();
        let id = client.request_task(Duration::from_millis(20)).unwrap();
        client.reject_task(id);
        assert_eq!(
            client.request_task(Duration::from_millis(20)),
            Some(id),
            "rejected task must come back"
        );
        assert_eq!(agent.rejected_count(), 1);
    }

    #[test]
    fn reject_drops_duplicate_of_owned_task() {
        let agent = FarmAgent::seed(&[idv(4), idv(4)]);
        assert_eq!(agent.unique_total(), 1);
        let client = agent.client();
        let first = client.request_task(Duration::from_millis(20)).unwrap();
        client.accept_task(first);
        let dup = client.request_task(Duration::from_millis(20)).unwrap();
        assert_eq!(dup, first);
        client.reject_task(dup);
        assert_eq!(client.request_task(Duration::from_millis(5)), None);
        client.task_completed(first);
        assert!(agent.is_done());
    }

    #[test]
    fn reject_drops_duplicate_of_completed_task() {
        let agent = FarmAgent::seed(&[idv(5), idv(5)]);
        let client = agent.client();
        let id = client.request_task(Duration::from_millis(20)).unwrap();
        client.accept_task(id);
        client.task_completed(id);
        assert!(agent.is_done());
        // Quit/done gate means the duplicate is never even delivered.
        assert_eq!(client.request_task(Duration::from_millis(5)), None);
        client.reject_task(id);
        assert_eq!(agent.completed_count(), 1);
    }

    #[test]
    #[should_panic(expected = "completed twice")]
    fn double_completion_is_loud() {
        let agent = FarmAgent::seed(&[idv(6)]);
        let client = agent.client();
        let id = client.request_task(Duration::from_millis(20)).unwrap();
        client.accept_task(id);
        client.task_completed(id);
        client.task_completed(id);
    }

    #[test]
    #[should_panic(expected = "accepted twice")]
    fn double_accept_is_loud() {
        let agent = FarmAgent::seed(&[idv(8)]);
        let client = agent.client();
        let id = client.request_task(Duration::from_millis(20)).unwrap();
        client.accept_task(id);
        client.accept_task(id);
    }

    #[test]
    fn quit_stops_blocking_with_work_pending() {
        let ids: Vec<Uuid> = (0..32).map(idv).collect();
        let agent = FarmAgent::seed(&ids);
        let client = agent.client();
        agent.request_quit();
        assert!(client.received_quit_request());
        assert_eq!(client.request_task(Duration::from_secs(5)), None);
        assert!(!agent.is_done());
    }

    #[test]
    fn progress_reaches_total_on_message_stream() {
        let agent = FarmAgent::seed(&[idv(1), idv(2)]);
        let client = agent.client();
        for _ in 0..2 {
            let id = client.request_task(Duration::from_millis(20)).unwrap();
            client.accept_task(id);
            client.task_completed(id);
        }
        let msgs = agent.drain_messages();
        assert!(msgs.contains(&FarmMessage::Progress {
            completed: 2,
            total: 2
        }));
        assert!(agent.drain_messages().is_empty(), "drain empties the stream");
    }

    #[test]
    fn concurrent_clients_cover_all_tasks_once() {
        let ids: Vec<Uuid> = (0..200).map(idv).collect();
        let agent = FarmAgent::seed(&ids);
        let mut handles = Vec::new();
        for _ in 0..4 {
            let client = agent.client();
            handles.push(std::thread::spawn(move || {
                let mut got = Vec::new();
                loop {
                    match client.request_task(Duration::from_millis(5)) {
                        Some(id) => {
                            client.accept_task(id);
                            client.task_completed(id);
                            got.push(id);
                        }
                        None => {
                            if client.is_done() {
                                break;
                            }
                        }
                    }
                }
                got
            }));
        }
        let mut all = Vec::new();
        for h in handles {
            all.extend(h.join().unwrap());
        }
        assert_eq!(all.len(), 200);
        let unique: HashSet<_> = all.into_iter().collect();
        assert_eq!(unique.len(), 200, "no task delivered twice");
        assert!(agent.is_done());
    }
}
