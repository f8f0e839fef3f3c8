//! Archive request queues
//!
//! Requests move between four queues: `compose` (waiting for a compose
//! pass), `schedule` (waiting for resources), `wait` (parked until an
//! operator or state change releases them) and `archive` (copies running).
//! Each queue is kept in scheduling priority order, highest first, with
//! FIFO order among equal priorities.
//!
//! A request name is registered from the moment it is submitted until it
//! is released. While a worker holds a request outside any queue the name
//! stays registered as claimed, so the same request can never be queued
//! twice.

use crate::archreq::ArchReq;
use crate::error::RustArchiverError;
use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum QueueKind {
    Compose,
    Schedule,
    Wait,
    Archive,
}

impl QueueKind {
    pub const ALL: [QueueKind; 4] = [
        QueueKind::Compose,
        QueueKind::Schedule,
        QueueKind::Wait,
        QueueKind::Archive,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

impl std::fmt::Display for QueueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            QueueKind::Compose => "compose",
            QueueKind::Schedule => "schedule",
            QueueKind::Wait => "wait",
            QueueKind::Archive => "archive",
        };
        f.write_str(s)
    }
}

/// Where a registered request currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Location {
    Queued(QueueKind),
    /// Held by a worker between queues.
    Claimed,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("request {0} is already queued")]
    Duplicate(String),
}

impl From<QueueError> for RustArchiverError {
    fn from(e: QueueError) -> Self {
        RustArchiverError::queue(e.to_string())
    }
}

#[derive(Debug)]
pub enum DequeueResult {
    /// Removed before any copy started.
    Dequeued(Box<ArchReq>),
    /// Being composed or archived; cannot be withdrawn now.
    Busy,
    NotFound,
}

#[derive(Debug)]
pub struct QueueEntry {
    pub name: String,
    pub ar: ArchReq,
}

/// One priority ordered queue.
#[derive(Debug, Default)]
pub struct ArchQueue {
    entries: Vec<QueueEntry>,
}

impl ArchQueue {
    /// Insert behind every entry of equal or higher priority, so equal
    /// priorities are served in arrival order.
    fn insert(&mut self, entry: QueueEntry) {
        let priority = entry.ar.sched_priority;
        let pos = self
            .entries
            .iter()
            .position(|e| e.ar.sched_priority.total_cmp(&priority).is_lt())
            .unwrap_or(self.entries.len());
        self.entries.insert(pos, entry);
    }

    fn remove(&mut self, name: &str) -> Option<QueueEntry> {
        let pos = self.entries.iter().position(|e| e.name == name)?;
        Some(self.entries.remove(pos))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ArchReq> {
        self.entries.iter().map(|e| &e.ar)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ArchReq> {
        self.entries.iter_mut().map(|e| &mut e.ar)
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.name.clone()).collect()
    }
}

/// All queues plus the name registry. Callers hold the lock on this for
/// the length of one scheduling decision.
#[derive(Debug, Default)]
pub struct QueueSet {
    queues: [ArchQueue; 4],
    registry: HashMap<String, Location>,
    terminated: bool,
    schedule_wakeups: u64,
}

impl QueueSet {
    pub fn queue(&self, kind: QueueKind) -> &ArchQueue {
        &self.queues[kind.index()]
    }

    pub fn len(&self, kind: QueueKind) -> usize {
        self.queue(kind).len()
    }

    /// True if a request with this name is queued or claimed.
    pub fn contains(&self, name: &str) -> bool {
        self.registry.contains_key(name)
    }

    /// Requests queued or claimed anywhere in the pipeline.
    pub fn registered(&self) -> usize {
        self.registry.len()
    }

    pub fn location(&self, name: &str) -> Option<Location> {
        self.registry.get(name).copied()
    }

    /// Accept a new request into the compose queue.
    pub fn submit(&mut self, ar: ArchReq) -> Result<(), QueueError> {
        let name = ar.name();
        if self.registry.contains_key(&name) {
            debug!("Rejecting duplicate request {}", name);
            return Err(QueueError::Duplicate(name));
        }
        self.insert(QueueKind::Compose, ar);
        Ok(())
    }

    /// Queue a request. The name may already be claimed by the caller.
    pub fn insert(&mut self, kind: QueueKind, ar: ArchReq) {
        let name = ar.name();
        if let Some(Location::Queued(other)) = self.registry.get(&name) {
            if self.queues[other.index()].remove(&name).is_some() {
                debug!("{} moved from {} queue", name, other);
            }
        }
        trace!("{} -> {} queue (priority {})", name, kind, ar.sched_priority);
        self.registry.insert(name.clone(), Location::Queued(kind));
        self.queues[kind.index()].insert(QueueEntry { name, ar });
    }

    /// Return a request to compose. Its scheduling priority restarts from
    /// its file priority.
    pub fn to_compose(&mut self, mut ar: ArchReq) {
        ar.sched_priority = ar.priority;
        self.insert(QueueKind::Compose, ar);
    }

    /// Take the highest priority request.
    pub fn pop(&mut self, kind: QueueKind) -> Option<ArchReq> {
        let queue = &mut self.queues[kind.index()];
        if queue.entries.is_empty() {
            return None;
        }
        let entry = queue.entries.remove(0);
        self.registry.insert(entry.name, Location::Claimed);
        Some(entry.ar)
    }

    /// Take a named request out of a queue.
    pub fn take(&mut self, kind: QueueKind, name: &str) -> Option<ArchReq> {
        let entry = self.queues[kind.index()].remove(name)?;
        self.registry.insert(entry.name, Location::Claimed);
        Some(entry.ar)
    }

    /// Take every request in a queue, in priority order.
    pub fn drain(&mut self, kind: QueueKind) -> Vec<ArchReq> {
        let entries = std::mem::take(&mut self.queues[kind.index()].entries);
        entries
            .into_iter()
            .map(|e| {
                self.registry.insert(e.name, Location::Claimed);
                e.ar
            })
            .collect()
    }

    pub fn get_mut(&mut self, kind: QueueKind, name: &str) -> Option<&mut ArchReq> {
        self.queues[kind.index()]
            .entries
            .iter_mut()
            .find(|e| e.name == name)
            .map(|e| &mut e.ar)
    }

    pub fn iter_mut(&mut self, kind: QueueKind) -> impl Iterator<Item = &mut ArchReq> {
        self.queues[kind.index()].iter_mut()
    }

    /// Forget a request that has left the pipeline.
    pub fn release(&mut self, name: &str) {
        if self.registry.remove(name).is_some() {
            debug!("{} released", name);
        }
    }

    /// Withdraw a request that no copy has started for.
    pub fn dequeue(&mut self, name: &str) -> DequeueResult {
        match self.registry.get(name).copied() {
            None => DequeueResult::NotFound,
            Some(Location::Claimed) | Some(Location::Queued(QueueKind::Archive)) => DequeueResult::Busy,
            Some(Location::Queued(kind)) => match self.queues[kind.index()].remove(name) {
                Some(entry) => {
                    self.registry.remove(name);
                    debug!("{} dequeued from {} queue", name, kind);
                    DequeueResult::Dequeued(Box::new(entry.ar))
                }
                None => DequeueResult::NotFound,
            },
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Debug view of queue contents.
    pub fn summary(&self) -> Vec<QueueSummary> {
        QueueKind::ALL
            .iter()
            .flat_map(|&kind| {
                self.queue(kind).entries.iter().map(move |e| QueueSummary {
                    queue: kind,
                    name: e.name.clone(),
                    priority: e.ar.sched_priority,
                    state: format!("{:?}", e.ar.state),
                    files: e.ar.file_count(),
                    space: e.ar.sel_space,
                    drives_used: e.ar.drives_used,
                    active_copies: e.ar.active_copies(),
                    stall_reason: e.ar.stall_reason.clone(),
                })
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueSummary {
    pub queue: QueueKind,
    pub name: String,
    pub priority: f64,
    pub state: String,
    pub files: usize,
    pub space: u64,
    pub drives_used: usize,
    pub active_copies: usize,
    pub stall_reason: Option<String>,
}

/// Shared queues with wakeups for the compose and schedule workers.
#[derive(Debug, Default)]
pub struct Queues {
    state: Mutex<QueueSet>,
    compose_ready: Condvar,
    schedule_ready: Condvar,
}

impl Queues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> MutexGuard<'_, QueueSet> {
        self.state.lock()
    }

    /// Submit a new request for composing.
    pub fn submit(&self, ar: ArchReq) -> Result<(), QueueError> {
        self.state.lock().submit(ar)?;
        self.compose_ready.notify_one();
        Ok(())
    }

    /// Return a request to compose. Its scheduling priority restarts from
    /// its file priority.
    pub fn to_compose(&self, ar: ArchReq) {
        self.state.lock().to_compose(ar);
        self.compose_ready.notify_one();
    }

    /// Wake the compose worker after requests were queued under [`Queues::lock`].
    pub fn notify_compose(&self) {
        self.compose_ready.notify_all();
    }

    pub fn wake_scheduler(&self) {
        self.state.lock().schedule_wakeups += 1;
        self.schedule_ready.notify_one();
    }

    /// Block until a request is ready to compose; `None` after shutdown.
    pub fn next_for_compose(&self) -> Option<ArchReq> {
        let mut state = self.state.lock();
        loop {
            if state.terminated {
                return None;
            }
            if let Some(ar) = state.pop(QueueKind::Compose) {
                return Some(ar);
            }
            self.compose_ready.wait(&mut state);
        }
    }

    /// Wait up to `interval` for scheduling work. False after shutdown.
    pub fn wait_for_schedule(&self, interval: Duration) -> bool {
        let mut state = self.state.lock();
        if state.schedule_wakeups == 0 && !state.terminated {
            self.schedule_ready.wait_for(&mut state, interval);
        }
        state.schedule_wakeups = 0;
        !state.terminated
    }

    /// Hand a composed request to the scheduler.
    pub fn to_schedule(&self, ar: ArchReq) {
        let mut state = self.state.lock();
        state.insert(QueueKind::Schedule, ar);
        state.schedule_wakeups += 1;
        self.schedule_ready.notify_one();
    }

    pub fn release(&self, name: &str) {
        self.state.lock().release(name);
    }

    pub fn shutdown(&self) {
        self.state.lock().terminated = true;
        self.compose_ready.notify_all();
        self.schedule_ready.notify_all();
    }

    pub fn summary(&self) -> Vec<QueueSummary> {
        self.state.lock().summary()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archreq::FileInfo;
    use chrono::Utc;
    use std::sync::Arc;

    fn req(seq: u32, priority: f64) -> ArchReq {
        let mut ar = ArchReq::new("fs", "set.1", seq, 1);
        ar.add_file(FileInfo::new("f", 1, Utc::now()));
        ar.sched_priority = priority;
        ar
    }

    #[test]
    fn test_priority_order_with_fifo_ties() {
        let mut qs = QueueSet::default();
        for (seq, p) in [(1, 1.0), (2, 5.0), (3, 1.0), (4, 5.0), (5, -2.0)] {
            qs.insert(QueueKind::Schedule, req(seq, p));
        }
        let order: Vec<u32> = qs.queue(QueueKind::Schedule).iter().map(|a| a.seqnum).collect();
        assert_eq!(order, [2, 4, 1, 3, 5]);
        let priorities: Vec<f64> = qs.queue(QueueKind::Schedule).iter().map(|a| a.sched_priority).collect();
        assert!(priorities.windows(2).all(|w| w[0] >= w[1]));
    }

    #[test]
    fn test_requeued_request_goes_behind_equal_priorities() {
        let mut qs = QueueSet::default();
        for seq in 1..=3 {
            qs.insert(QueueKind::Schedule, req(seq, 2.0));
        }
        let first = qs.pop(QueueKind::Schedule).unwrap();
        assert_eq!(first.seqnum, 1);
        qs.insert(QueueKind::Schedule, first);
        let order: Vec<u32> = qs.queue(QueueKind::Schedule).iter().map(|a| a.seqnum).collect();
        assert_eq!(order, [2, 3, 1]);
    }

    #[test]
    fn test_duplicate_submit_rejected() {
        let mut qs = QueueSet::default();
        qs.submit(req(1, 0.0)).unwrap();
        let err = qs.submit(req(1, 9.0)).unwrap_err();
        assert_eq!(err, QueueError::Duplicate("fs.set.1.1".into()));
        assert_eq!(qs.len(QueueKind::Compose), 1);
        assert_eq!(qs.queue(QueueKind::Compose).iter().next().unwrap().sched_priority, 0.0);
    }

    #[test]
    fn test_claimed_name_blocks_submit() {
        let mut qs = QueueSet::default();
        qs.submit(req(1, 0.0)).unwrap();
        let ar = qs.pop(QueueKind::Compose).unwrap();
        assert_eq!(qs.location("fs.set.1.1"), Some(Location::Claimed));
        assert!(qs.submit(req(1, 0.0)).is_err());
        qs.insert(QueueKind::Schedule, ar);
        assert_eq!(qs.location("fs.set.1.1"), Some(Location::Queued(QueueKind::Schedule)));
        qs.release("fs.set.1.1");
        assert!(qs.submit(req(1, 0.0)).is_ok());
    }

    #[test]
    fn test_insert_moves_between_queues() {
        let mut qs = QueueSet::default();
        qs.insert(QueueKind::Wait, req(1, 0.0));
        qs.insert(QueueKind::Schedule, req(1, 0.0));
        assert_eq!(qs.len(QueueKind::Wait), 0);
        assert_eq!(qs.len(QueueKind::Schedule), 1);
    }

    #[test]
    fn test_dequeue_results() {
        let mut qs = QueueSet::default();
        qs.insert(QueueKind::Wait, req(1, 0.0));
        qs.insert(QueueKind::Archive, req(2, 0.0));
        assert!(matches!(qs.dequeue("fs.set.1.1"), DequeueResult::Dequeued(_)));
        assert!(!qs.contains("fs.set.1.1"));
        assert!(matches!(qs.dequeue("fs.set.1.2"), DequeueResult::Busy));
        assert!(matches!(qs.dequeue("nope"), DequeueResult::NotFound));
        let _ = qs.take(QueueKind::Archive, "fs.set.1.2").unwrap();
        assert!(matches!(qs.dequeue("fs.set.1.2"), DequeueResult::Busy));
    }

    #[test]
    fn test_compose_worker_wakes_and_shuts_down() {
        let queues = Arc::new(Queues::new());
        let q = queues.clone();
        let worker = std::thread::spawn(move || {
            let mut seen = Vec::new();
            while let Some(ar) = q.next_for_compose() {
                seen.push(ar.seqnum);
                q.release(&ar.name());
            }
            seen
        });
        queues.submit(req(7, 0.0)).unwrap();
        while queues.lock().contains("fs.set.1.7") {
            std::thread::sleep(Duration::from_millis(5));
        }
        queues.shutdown();
        assert_eq!(worker.join().unwrap(), [7]);
    }

    #[test]
    fn test_wait_for_schedule_consumes_wakeups() {
        let queues = Queues::new();
        queues.to_schedule(req(1, 0.0));
        assert!(queues.wait_for_schedule(Duration::from_millis(1)));
        assert_eq!(queues.lock().schedule_wakeups, 0);
        queues.shutdown();
        assert!(!queues.wait_for_schedule(Duration::from_secs(5)));
    }
}
