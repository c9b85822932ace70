//! Deferred tasks and signal queues.
//!
//! Queue 0 is the deferred-task queue: run-once closures executed in FIFO
//! order, at most [`MAX_TASK_EXECUTED`] per loop pass. Queues 1 through 63
//! are signal queues: their callbacks persist and all of them run each time
//! the queue's bit is raised. Raised bits live in an atomic word and a
//! separate locked inbox accepts closures from other threads, so both
//! `signal` and cross-thread posting are safe from any thread while the
//! queues themselves stay single-threaded.
//!
//! Canceling a task nulls its callback in place; a snapshot taken for the
//! current pass observes the cancellation before invoking.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::types::TaskId;

/// Number of task queues; queue 0 is the deferred queue, 1..63 are signal
/// queues.
pub const MAX_TASK_QUEUE: usize = 64;

/// Upper bound on deferred tasks executed per pass.
pub const MAX_TASK_EXECUTED: usize = 16;

struct TaskEntry {
    id: TaskId,
    canceled: Cell<bool>,
    func: RefCell<Option<Box<dyn FnMut()>>>,
}

impl TaskEntry {
    fn invoke(&self) {
        if self.canceled.get() {
            return;
        }
        // Taken out for the call so the task may cancel or re-add itself.
        let taken = self.func.borrow_mut().take();
        if let Some(mut f) = taken {
            f();
            if !self.canceled.get() {
                let mut slot = self.func.borrow_mut();
                if slot.is_none() {
                    *slot = Some(f);
                }
            }
        }
    }
}

type RemoteTask = Box<dyn FnOnce() + Send>;

/// Cross-thread mailbox shared with [`LoopHandle`](super::LoopHandle).
#[derive(Default)]
pub(crate) struct Inbox {
    queue: Mutex<VecDeque<RemoteTask>>,
}

impl Inbox {
    pub fn push(&self, task: RemoteTask) {
        self.queue.lock().expect("task inbox poisoned").push_back(task);
    }

    fn drain(&self, out: &mut Vec<RemoteTask>) {
        let mut queue = self.queue.lock().expect("task inbox poisoned");
        out.extend(queue.drain(..));
    }

    fn is_empty(&self) -> bool {
        self.queue.lock().expect("task inbox poisoned").is_empty()
    }
}

pub(crate) enum RunnableTask {
    Local(Rc<TaskEntry>),
    Remote(RemoteTask),
}

impl RunnableTask {
    pub fn invoke(self) {
        match self {
            RunnableTask::Local(entry) => entry.invoke(),
            RunnableTask::Remote(f) => f(),
        }
    }
}

pub(crate) struct TaskManager {
    queues: Vec<VecDeque<Rc<TaskEntry>>>,
    raised: Arc<AtomicU64>,
    inbox: Arc<Inbox>,
}

impl TaskManager {
    pub fn new() -> Self {
        TaskManager {
            queues: (0..MAX_TASK_QUEUE).map(|_| VecDeque::new()).collect(),
            raised: Arc::new(AtomicU64::new(0)),
            inbox: Arc::new(Inbox::default()),
        }
    }

    pub fn raised_bits(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.raised)
    }

    pub fn inbox(&self) -> Arc<Inbox> {
        Arc::clone(&self.inbox)
    }

    /// Queues a run-once task on queue 0.
    pub fn add_task(&mut self, id: TaskId, func: Box<dyn FnMut()>) -> TaskId {
        self.queues[0].push_back(Rc::new(TaskEntry {
            id,
            canceled: Cell::new(false),
            func: RefCell::new(Some(func)),
        }));
        id
    }

    /// Registers a persistent callback on signal queue `num` (1..63).
    pub fn add_signal(&mut self, num: usize, id: TaskId, func: Box<dyn FnMut()>) -> Option<TaskId> {
        if num == 0 || num >= MAX_TASK_QUEUE {
            return None;
        }
        self.queues[num].push_back(Rc::new(TaskEntry {
            id,
            canceled: Cell::new(false),
            func: RefCell::new(Some(func)),
        }));
        Some(id)
    }

    /// Raises signal queue `num`; every callback registered on it runs on
    /// the next pass. Callable from any thread through the shared word.
    pub fn signal(&self, num: usize) {
        if num == 0 || num >= MAX_TASK_QUEUE {
            return;
        }
        self.raised.fetch_or(1u64 << num, Ordering::AcqRel);
    }

    /// Nulls the task's callback in place. Pending executions in an
    /// already-taken snapshot are skipped.
    pub fn cancel(&mut self, id: TaskId) -> bool {
        for queue in &mut self.queues {
            if let Some(pos) = queue.iter().position(|entry| entry.id == id) {
                let entry = &queue[pos];
                entry.canceled.set(true);
                *entry.func.borrow_mut() = None;
                return true;
            }
        }
        false
    }

    /// Drops every queued task, raised bit and inbox entry. Used on loop
    /// teardown.
    pub fn clear(&mut self) {
        for queue in &mut self.queues {
            queue.clear();
        }
        self.raised.store(0, Ordering::Release);
        let mut stale = Vec::new();
        self.inbox.drain(&mut stale);
    }

    /// Nothing to run this pass?
    pub fn is_idle(&self) -> bool {
        self.queues[0].is_empty()
            && self.raised.load(Ordering::Acquire) == 0
            && self.inbox.is_empty()
    }

    /// Collects this pass's work: a bounded batch off queue 0, a snapshot
    /// of every raised signal queue, and the whole cross-thread inbox. The
    /// caller invokes with the manager unborrowed.
    pub fn take_batch(&mut self, out: &mut Vec<RunnableTask>) {
        for _ in 0..MAX_TASK_EXECUTED {
            let Some(entry) = self.queues[0].pop_front() else {
                break;
            };
            out.push(RunnableTask::Local(entry));
        }
        let raised = self.raised.swap(0, Ordering::AcqRel);
        if raised != 0 {
            for num in 1..MAX_TASK_QUEUE {
                if raised & (1u64 << num) == 0 {
                    continue;
                }
                let queue = &mut self.queues[num];
                queue.retain(|entry| !entry.canceled.get());
                for entry in queue.iter() {
                    out.push(RunnableTask::Local(Rc::clone(entry)));
                }
            }
        }
        let mut remote = Vec::new();
        self.inbox.drain(&mut remote);
        out.extend(remote.into_iter().map(RunnableTask::Remote));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_pass(mgr: &mut TaskManager) -> usize {
        let mut batch = Vec::new();
        mgr.take_batch(&mut batch);
        let n = batch.len();
        for task in batch {
            task.invoke();
        }
        n
    }

    #[test]
    fn test_deferred_queue_fifo_and_bounded() {
        let mut mgr = TaskManager::new();
        let order = Rc::new(RefCell::new(Vec::new()));
        for i in 0..(MAX_TASK_EXECUTED + 3) {
            let o = Rc::clone(&order);
            mgr.add_task(i as TaskId + 1, Box::new(move || o.borrow_mut().push(i)));
        }
        assert_eq!(run_pass(&mut mgr), MAX_TASK_EXECUTED);
        assert_eq!(order.borrow().len(), MAX_TASK_EXECUTED);
        assert_eq!(order.borrow()[0], 0);
        assert_eq!(run_pass(&mut mgr), 3);
        assert!(mgr.is_idle());
    }

    #[test]
    fn test_cancel_nulls_in_place() {
        let mut mgr = TaskManager::new();
        let hits = Rc::new(Cell::new(0));
        let h = Rc::clone(&hits);
        mgr.add_task(1, Box::new(move || h.set(h.get() + 1)));
        assert!(mgr.cancel(1));
        assert!(!mgr.cancel(1));
        run_pass(&mut mgr);
        assert_eq!(hits.get(), 0);
    }

    #[test]
    fn test_signal_queue_persists_across_raises() {
        let mut mgr = TaskManager::new();
        let hits = Rc::new(Cell::new(0));
        let h = Rc::clone(&hits);
        mgr.add_signal(5, 1, Box::new(move || h.set(h.get() + 1))).unwrap();
        run_pass(&mut mgr);
        assert_eq!(hits.get(), 0, "not raised yet");
        mgr.signal(5);
        mgr.signal(5);
        run_pass(&mut mgr);
        assert_eq!(hits.get(), 1, "coalesced raise runs callbacks once");
        mgr.signal(5);
        run_pass(&mut mgr);
        assert_eq!(hits.get(), 2, "callback persists");
    }

    #[test]
    fn test_signal_queue_bounds() {
        let mut mgr = TaskManager::new();
        assert!(mgr.add_signal(0, 1, Box::new(|| {})).is_none());
        assert!(mgr.add_signal(MAX_TASK_QUEUE, 2, Box::new(|| {})).is_none());
        assert!(mgr.add_signal(MAX_TASK_QUEUE - 1, 3, Box::new(|| {})).is_some());
    }

    #[test]
    fn test_clear_drops_all_pending_work() {
        let mut mgr = TaskManager::new();
        mgr.add_task(1, Box::new(|| {}));
        mgr.add_signal(5, 2, Box::new(|| {})).unwrap();
        mgr.signal(5);
        mgr.inbox().push(Box::new(|| {}));
        mgr.clear();
        assert!(mgr.is_idle());
        assert_eq!(run_pass(&mut mgr), 0);
    }

    #[test]
    fn test_inbox_crosses_threads() {
        let mut mgr = TaskManager::new();
        let inbox = mgr.inbox();
        let hits = Arc::new(AtomicU64::new(0));
        let h = Arc::clone(&hits);
        let worker = std::thread::spawn(move || {
            inbox.push(Box::new(move || {
                h.fetch_add(1, Ordering::SeqCst);
            }));
        });
        worker.join().unwrap();
        assert!(!mgr.is_idle());
        run_pass(&mut mgr);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_canceled_task_is_skipped() {
        let mut mgr = TaskManager::new();
        let hits = Rc::new(Cell::new(0));
        // Two tasks queued; the second is canceled before the pass runs.
        let canceled_id: TaskId = 2;
        let h = Rc::clone(&hits);
        mgr.add_task(1, Box::new(move || h.set(h.get() + 1)));
        let h2 = Rc::clone(&hits);
        mgr.add_task(canceled_id, Box::new(move || h2.set(h2.get() + 10)));
        mgr.cancel(canceled_id);
        run_pass(&mut mgr);
        assert_eq!(hits.get(), 1);
    }
}
