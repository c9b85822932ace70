//! The event loop: one poll pass, then timers, then tasks.
//!
//! A loop instance owns its poller, timer manager and task queues and must
//! only be touched from the thread that runs it. Other threads interact
//! through a [`LoopHandle`], which posts closures into a locked inbox and
//! interrupts the backend wait by writing a byte to the loop's wakeup pair.
//!
//! The backend wait is bounded: zero when tasks are already queued,
//! otherwise the time to the nearest timer capped at
//! [`MAX_BACKEND_TIMEOUT`] milliseconds.

use std::cell::{Cell, RefCell};
use std::io;
use std::io::Read;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use log::{error, info, warn};

use super::addr::{self, WakeStream};
use super::poller::{EventCallback, Poller, MAX_POLL_EVENT};
use super::task::{Inbox, RunnableTask, TaskManager, MAX_TASK_QUEUE};
use super::timer::TimerManager;
use super::{EventMask, EVENT_READABLE};
use crate::error::ErrorCode;
use crate::types::{OsSocket, TaskId, TimerId};

/// Longest the loop sleeps in the backend before re-checking timers.
pub const MAX_BACKEND_TIMEOUT: i64 = 100;

/// Milliseconds since the Unix epoch.
pub fn time_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunMode {
    /// Iterate until [`EventLoop::stop`] is called.
    Forever,
    /// One full pass, waiting in the backend.
    Once,
    /// One full pass without waiting.
    NoWait,
}

const TWEPOCH: i64 = 1_288_834_974_657;
const SEQUENCE_BITS: u32 = 12;
const WORKER_ID_BITS: u32 = 5;
const DATACENTER_ID_BITS: u32 = 5;
const SEQUENCE_MASK: i64 = (1 << SEQUENCE_BITS) - 1;
const WORKER_ID_SHIFT: u32 = SEQUENCE_BITS;
const DATACENTER_ID_SHIFT: u32 = SEQUENCE_BITS + WORKER_ID_BITS;
const TIMESTAMP_SHIFT: u32 = SEQUENCE_BITS + WORKER_ID_BITS + DATACENTER_ID_BITS;

struct AllocatorState {
    last_timestamp: i64,
    sequence: i64,
}

/// Snowflake-style unique id source: millisecond timestamp, worker and
/// datacenter bits, and a per-millisecond sequence. Ids are unique and
/// roughly time-ordered across every allocator with distinct worker ids.
pub struct IdAllocator {
    worker_id: i64,
    datacenter_id: i64,
    state: Mutex<AllocatorState>,
}

impl IdAllocator {
    pub fn new(worker_id: i64, datacenter_id: i64) -> Self {
        IdAllocator {
            worker_id: worker_id & ((1 << WORKER_ID_BITS) - 1),
            datacenter_id: datacenter_id & ((1 << DATACENTER_ID_BITS) - 1),
            state: Mutex::new(AllocatorState { last_timestamp: 0, sequence: 0 }),
        }
    }

    pub fn next_id(&self) -> i64 {
        let mut state = self.state.lock().expect("id allocator poisoned");
        let mut timestamp = time_ms();
        if timestamp < state.last_timestamp {
            // A poller thread must not sleep the regression out; reuse the
            // last timestamp and let the sequence absorb the burst.
            error!(
                "clock moved backwards by {} ms, reusing last timestamp",
                state.last_timestamp - timestamp
            );
            timestamp = state.last_timestamp;
        }
        if timestamp == state.last_timestamp {
            state.sequence = (state.sequence + 1) & SEQUENCE_MASK;
            if state.sequence == 0 {
                timestamp += 1;
            }
        } else {
            state.sequence = 0;
        }
        state.last_timestamp = timestamp;
        ((timestamp - TWEPOCH) << TIMESTAMP_SHIFT)
            | (self.datacenter_id << DATACENTER_ID_SHIFT)
            | (self.worker_id << WORKER_ID_SHIFT)
            | state.sequence
    }
}

struct WakeSender {
    stream: WakeStream,
}

impl WakeSender {
    fn wake(&self) {
        use std::io::Write;
        // A full pipe already guarantees a pending wakeup.
        let _ = (&self.stream).write(&[1u8]);
    }
}

/// Posts work into an [`EventLoop`] from any thread.
#[derive(Clone)]
pub struct LoopHandle {
    inbox: Arc<Inbox>,
    raised: Arc<AtomicU64>,
    stop: Arc<AtomicBool>,
    waker: Arc<WakeSender>,
}

impl LoopHandle {
    /// Queues `f` to run on the loop thread and wakes the loop.
    pub fn post(&self, f: impl FnOnce() + Send + 'static) {
        self.inbox.push(Box::new(f));
        self.waker.wake();
    }

    /// Raises signal queue `num` on the loop; out-of-range queues are
    /// ignored. Safe to call from OS signal context adjacent code: it only
    /// touches an atomic and a pipe write.
    pub fn signal(&self, num: usize) {
        if num == 0 || num >= MAX_TASK_QUEUE {
            return;
        }
        self.raised.fetch_or(1u64 << num, Ordering::AcqRel);
        self.waker.wake();
    }

    /// Requests the loop to leave `RunMode::Forever`.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        self.waker.wake();
    }
}

pub struct EventLoop {
    poller: RefCell<Poller>,
    timers: RefCell<TimerManager>,
    tasks: RefCell<TaskManager>,
    ids: Arc<IdAllocator>,
    time_ms: Cell<i64>,
    stop: Arc<AtomicBool>,
    waker: Arc<WakeSender>,
}

impl EventLoop {
    pub fn new() -> io::Result<Rc<EventLoop>> {
        Self::build(Poller::new()?)
    }

    /// A loop over the portable `select` backend.
    #[cfg(unix)]
    pub fn with_select_poller() -> io::Result<Rc<EventLoop>> {
        Self::build(Poller::with_select())
    }

    fn build(poller: Poller) -> io::Result<Rc<EventLoop>> {
        let backend = poller.backend_name();
        let (wake_rx, wake_tx) = addr::wake_pair()?;
        let tasks = TaskManager::new();
        let event_loop = Rc::new(EventLoop {
            poller: RefCell::new(poller),
            timers: RefCell::new(TimerManager::new()),
            tasks: RefCell::new(tasks),
            ids: Arc::new(IdAllocator::new(0, 0)),
            time_ms: Cell::new(time_ms()),
            stop: Arc::new(AtomicBool::new(false)),
            waker: Arc::new(WakeSender { stream: wake_tx }),
        });
        event_loop.register_waker(wake_rx)?;
        info!("event loop ready, backend: {}", backend);
        Ok(event_loop)
    }

    fn register_waker(self: &Rc<Self>, rx: WakeStream) -> io::Result<()> {
        #[cfg(unix)]
        let fd: OsSocket = {
            use std::os::unix::io::AsRawFd;
            rx.as_raw_fd()
        };
        #[cfg(windows)]
        let fd: OsSocket = {
            use std::os::windows::io::AsRawSocket;
            rx.as_raw_socket()
        };
        let weak = Rc::downgrade(self);
        let callback: EventCallback = Rc::new(RefCell::new(move |_fd: OsSocket, mask: EventMask| {
            if mask & EVENT_READABLE != 0 {
                let mut buf = [0u8; 128];
                loop {
                    match (&rx).read(&mut buf) {
                        Ok(0) => break,
                        Ok(_) => continue,
                        Err(_) => break,
                    }
                }
            }
            if let Some(event_loop) = weak.upgrade() {
                if let Err(err) = event_loop.poller.borrow_mut().rearm(fd, EVENT_READABLE) {
                    warn!("failed to re-arm wakeup descriptor: {}", err);
                }
            }
        }));
        self.poller.borrow_mut().add(fd, EVENT_READABLE, callback)
    }

    /// The loop's cached clock, refreshed once per pass. Callbacks within a
    /// pass observe the same value.
    pub fn now_ms(&self) -> i64 {
        self.time_ms.get()
    }

    pub fn new_unique_id(&self) -> i64 {
        self.ids.next_id()
    }

    pub fn id_allocator(&self) -> Arc<IdAllocator> {
        Arc::clone(&self.ids)
    }

    pub fn backend_name(&self) -> &'static str {
        self.poller.borrow().backend_name()
    }

    /// A cloneable, `Send` handle for posting work from other threads.
    pub fn handle(&self) -> LoopHandle {
        let tasks = self.tasks.borrow();
        LoopHandle {
            inbox: tasks.inbox(),
            raised: tasks.raised_bits(),
            stop: Arc::clone(&self.stop),
            waker: Arc::clone(&self.waker),
        }
    }

    // -- poller surface ----------------------------------------------------

    /// Subscribes `fd` with `callback`; readiness arrives edge-style, so the
    /// callback re-arms with [`rearm_event`](EventLoop::rearm_event) once it
    /// has drained.
    pub fn add_event(
        &self,
        fd: OsSocket,
        mask: EventMask,
        callback: impl FnMut(OsSocket, EventMask) + 'static,
    ) -> Result<(), ErrorCode> {
        self.poller
            .borrow_mut()
            .add(fd, mask, Rc::new(RefCell::new(callback)))
            .map_err(|err| {
                warn!("failed to register descriptor {}: {}", fd, err);
                ErrorCode::EventLoopRegister
            })
    }

    pub fn rearm_event(&self, fd: OsSocket, mask: EventMask) -> Result<(), ErrorCode> {
        self.poller
            .borrow_mut()
            .rearm(fd, mask)
            .map_err(|_| ErrorCode::EventLoopRegister)
    }

    pub fn clear_event(&self, fd: OsSocket, mask: EventMask) {
        self.poller.borrow_mut().del(fd, mask);
    }

    // -- timers ------------------------------------------------------------

    /// Schedules `callback` after `timeout_ms`; with `interval_ms > 0` it
    /// then repeats every `interval_ms`.
    pub fn add_timer(
        &self,
        timeout_ms: u64,
        interval_ms: u64,
        callback: impl FnMut() + 'static,
    ) -> TimerId {
        self.add_timer_with_stop(timeout_ms, interval_ms, callback, None)
    }

    pub fn add_timer_with_stop(
        &self,
        timeout_ms: u64,
        interval_ms: u64,
        callback: impl FnMut() + 'static,
        on_stop: Option<Box<dyn FnMut()>>,
    ) -> TimerId {
        let id = self.new_unique_id();
        self.timers.borrow_mut().add(
            id,
            time_ms() as u64,
            timeout_ms,
            interval_ms,
            Box::new(callback),
            on_stop,
        )
    }

    /// Removes a timer; safe from inside any timer callback, including the
    /// canceled timer's own. Returns whether the id was live.
    pub fn clear_timer(&self, id: TimerId) -> bool {
        let event = self.timers.borrow_mut().remove(id);
        match event {
            Some(event) => {
                if let Some(mut on_stop) = event.take_on_stop() {
                    on_stop();
                }
                true
            }
            None => false,
        }
    }

    // -- tasks -------------------------------------------------------------

    /// Defers `f` to the task phase of the current (or next) pass.
    pub fn add_task(&self, f: impl FnMut() + 'static) -> TaskId {
        let id = self.new_unique_id();
        self.tasks.borrow_mut().add_task(id, Box::new(f))
    }

    /// Registers a persistent callback on signal queue `num` (1..63).
    pub fn add_signal(&self, num: usize, f: impl FnMut() + 'static) -> Result<TaskId, ErrorCode> {
        let id = self.new_unique_id();
        self.tasks
            .borrow_mut()
            .add_signal(num, id, Box::new(f))
            .ok_or(ErrorCode::InvalidArgument)
    }

    /// Raises signal queue `num` from the loop thread.
    pub fn signal(&self, num: usize) {
        self.tasks.borrow().signal(num);
    }

    /// Cancels a pending task or removes a signal callback.
    pub fn cancel_task(&self, id: TaskId) -> bool {
        self.tasks.borrow_mut().cancel(id)
    }

    // -- driving -----------------------------------------------------------

    /// Drives the loop. A stop requested before a `Forever` run is honored
    /// on the first pass.
    pub fn run(&self, mode: RunMode) {
        loop {
            self.time_ms.set(time_ms());
            let timeout = match mode {
                RunMode::NoWait => 0,
                _ => self.backend_timeout(),
            };
            let mut fired = Vec::with_capacity(MAX_POLL_EVENT);
            let result = self.poller.borrow_mut().poll(timeout as i32, &mut fired);
            if let Err(err) = result {
                warn!("poll failed: {}", err);
            }
            for (fd, mask, callback) in fired {
                (callback.borrow_mut())(fd, mask);
            }
            self.time_ms.set(time_ms());
            self.run_timers();
            self.run_tasks();
            if mode != RunMode::Forever {
                break;
            }
            if self.stop.swap(false, Ordering::AcqRel) {
                self.shutdown();
                break;
            }
        }
    }

    /// Requests the loop to leave `RunMode::Forever` after the current
    /// pass; the loop then tears down its timers, queues and descriptors.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        self.waker.wake();
    }

    /// Teardown after a stopped `Forever` run: every remaining timer's
    /// stop callback runs, queued tasks are dropped, and the descriptor
    /// table is released, the wakeup pair included.
    fn shutdown(&self) {
        let stopped = self.timers.borrow_mut().clear_all();
        for event in stopped {
            if let Some(mut on_stop) = event.take_on_stop() {
                on_stop();
            }
        }
        self.tasks.borrow_mut().clear();
        self.poller.borrow_mut().clear();
        info!("event loop stopped");
    }

    fn backend_timeout(&self) -> i64 {
        if !self.tasks.borrow().is_idle() {
            return 0;
        }
        let now = self.time_ms.get() as u64;
        match self.timers.borrow().nearest_timeout(now) {
            Some(ms) => (ms as i64).min(MAX_BACKEND_TIMEOUT),
            None => MAX_BACKEND_TIMEOUT,
        }
    }

    fn run_timers(&self) {
        let now = self.time_ms.get() as u64;
        let mut due = Vec::new();
        self.timers.borrow_mut().pop_due(now, &mut due);
        for event in due {
            // An earlier callback in this batch may have cleared it.
            if !self.timers.borrow().contains(event.id()) {
                continue;
            }
            event.fire();
            self.timers.borrow_mut().finish(&event, now);
        }
    }

    fn run_tasks(&self) {
        let mut batch: Vec<RunnableTask> = Vec::new();
        self.tasks.borrow_mut().take_batch(&mut batch);
        for task in batch {
            task.invoke();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::collections::HashSet;
    use std::time::Duration;

    #[test]
    fn test_one_shot_timer_fires_once() {
        let event_loop = EventLoop::new().unwrap();
        let hits = Rc::new(Cell::new(0));
        let h = Rc::clone(&hits);
        event_loop.add_timer(10, 0, move || h.set(h.get() + 1));
        let deadline = time_ms() + 2000;
        while hits.get() == 0 && time_ms() < deadline {
            event_loop.run(RunMode::Once);
        }
        assert_eq!(hits.get(), 1);
        event_loop.run(RunMode::NoWait);
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn test_repeating_timer_and_clear() {
        let event_loop = EventLoop::new().unwrap();
        let hits = Rc::new(Cell::new(0));
        let h = Rc::clone(&hits);
        let id = event_loop.add_timer(5, 5, move || h.set(h.get() + 1));
        let deadline = time_ms() + 2000;
        while hits.get() < 3 && time_ms() < deadline {
            event_loop.run(RunMode::Once);
        }
        assert!(hits.get() >= 3);
        assert!(event_loop.clear_timer(id));
        assert!(!event_loop.clear_timer(id));
        let frozen = hits.get();
        for _ in 0..5 {
            event_loop.run(RunMode::NoWait);
        }
        assert_eq!(hits.get(), frozen);
    }

    #[test]
    fn test_timer_cleared_from_its_own_callback() {
        let event_loop = EventLoop::new().unwrap();
        let hits = Rc::new(Cell::new(0));
        let id_cell = Rc::new(Cell::new(0i64));
        let h = Rc::clone(&hits);
        let ic = Rc::clone(&id_cell);
        let weak = Rc::downgrade(&event_loop);
        let id = event_loop.add_timer(5, 5, move || {
            h.set(h.get() + 1);
            if let Some(event_loop) = weak.upgrade() {
                event_loop.clear_timer(ic.get());
            }
        });
        id_cell.set(id);
        let deadline = time_ms() + 2000;
        while hits.get() == 0 && time_ms() < deadline {
            event_loop.run(RunMode::Once);
        }
        for _ in 0..5 {
            event_loop.run(RunMode::NoWait);
        }
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn test_timer_cleared_by_earlier_timer_in_same_batch() {
        let event_loop = EventLoop::new().unwrap();
        let hits = Rc::new(Cell::new(0));
        let h = Rc::clone(&hits);
        let second = event_loop.add_timer(30, 0, move || h.set(h.get() + 1));
        let weak = Rc::downgrade(&event_loop);
        event_loop.add_timer(10, 0, move || {
            if let Some(event_loop) = weak.upgrade() {
                event_loop.clear_timer(second);
            }
        });
        // Let both deadlines lapse so one pass pops them together.
        std::thread::sleep(Duration::from_millis(60));
        event_loop.run(RunMode::NoWait);
        assert_eq!(hits.get(), 0);
    }

    #[test]
    fn test_stop_before_forever_run_tears_down() {
        let event_loop = EventLoop::new().unwrap();
        let stopped = Rc::new(Cell::new(false));
        let s = Rc::clone(&stopped);
        event_loop.add_timer_with_stop(
            60_000,
            0,
            || {},
            Some(Box::new(move || s.set(true))),
        );
        event_loop.stop();
        event_loop.run(RunMode::Forever);
        assert!(stopped.get());
        assert_eq!(event_loop.backend_timeout(), MAX_BACKEND_TIMEOUT);
    }

    #[test]
    fn test_clear_timer_runs_stop_callback() {
        let event_loop = EventLoop::new().unwrap();
        let stopped = Rc::new(Cell::new(false));
        let s = Rc::clone(&stopped);
        let id = event_loop.add_timer_with_stop(
            60_000,
            0,
            || {},
            Some(Box::new(move || s.set(true))),
        );
        event_loop.clear_timer(id);
        assert!(stopped.get());
    }

    #[test]
    fn test_tasks_run_in_order() {
        let event_loop = EventLoop::new().unwrap();
        let order = Rc::new(RefCell::new(Vec::new()));
        for i in 0..5 {
            let o = Rc::clone(&order);
            event_loop.add_task(move || o.borrow_mut().push(i));
        }
        event_loop.run(RunMode::NoWait);
        assert_eq!(*order.borrow(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_cancel_task() {
        let event_loop = EventLoop::new().unwrap();
        let hits = Rc::new(Cell::new(0));
        let h = Rc::clone(&hits);
        let id = event_loop.add_task(move || h.set(h.get() + 1));
        assert!(event_loop.cancel_task(id));
        event_loop.run(RunMode::NoWait);
        assert_eq!(hits.get(), 0);
    }

    #[test]
    fn test_signal_callbacks_persist() {
        let event_loop = EventLoop::new().unwrap();
        let hits = Rc::new(Cell::new(0));
        let h = Rc::clone(&hits);
        event_loop.add_signal(7, move || h.set(h.get() + 1)).unwrap();
        event_loop.signal(7);
        event_loop.run(RunMode::NoWait);
        assert_eq!(hits.get(), 1);
        event_loop.signal(7);
        event_loop.run(RunMode::NoWait);
        assert_eq!(hits.get(), 2);
    }

    #[test]
    fn test_cross_thread_post_wakes_forever_loop() {
        let event_loop = EventLoop::new().unwrap();
        let handle = event_loop.handle();
        let done = Arc::new(AtomicBool::new(false));
        let d = Arc::clone(&done);
        let poster = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            let inner = handle.clone();
            handle.post(move || {
                d.store(true, Ordering::SeqCst);
                inner.stop();
            });
        });
        event_loop.run(RunMode::Forever);
        poster.join().unwrap();
        assert!(done.load(Ordering::SeqCst));
    }

    #[test]
    fn test_id_allocator_unique_and_monotonic() {
        let ids = IdAllocator::new(1, 1);
        let mut seen = HashSet::new();
        let mut last = 0i64;
        for _ in 0..10_000 {
            let id = ids.next_id();
            assert!(id > last);
            last = id;
            assert!(seen.insert(id));
        }
    }

    #[test]
    fn test_backend_timeout_zero_with_pending_tasks() {
        let event_loop = EventLoop::new().unwrap();
        event_loop.add_task(|| {});
        assert_eq!(event_loop.backend_timeout(), 0);
        event_loop.run(RunMode::NoWait);
        assert_eq!(event_loop.backend_timeout(), MAX_BACKEND_TIMEOUT);
    }
}
