//! Timer bookkeeping for the event loop.
//!
//! Deadlines live in a `BTreeSet<(deadline, id)>` so the nearest one is the
//! first element; the events themselves are shared so a timer cleared from
//! inside its own callback (or another timer's) is observed before the
//! pending firing happens. At most [`MAX_TIMER_EVENT`] timers run per loop
//! pass; the rest keep their place for the next pass.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeSet, HashMap};
use std::rc::Rc;

use crate::types::TimerId;

/// Upper bound on timers fired per pass.
pub const MAX_TIMER_EVENT: usize = 16;

pub(crate) struct TimerEvent {
    id: TimerId,
    deadline: Cell<u64>,
    interval: u64,
    callback: RefCell<Box<dyn FnMut()>>,
    on_stop: RefCell<Option<Box<dyn FnMut()>>>,
}

impl TimerEvent {
    pub fn id(&self) -> TimerId {
        self.id
    }

    pub fn fire(&self) {
        (self.callback.borrow_mut())();
    }

    pub fn take_on_stop(&self) -> Option<Box<dyn FnMut()>> {
        self.on_stop.borrow_mut().take()
    }
}

#[derive(Default)]
pub(crate) struct TimerManager {
    timers: HashMap<TimerId, Rc<TimerEvent>>,
    schedule: BTreeSet<(u64, TimerId)>,
}

impl TimerManager {
    pub fn new() -> Self {
        TimerManager::default()
    }

    /// Registers a timer firing at `now + timeout`; `interval > 0` makes it
    /// repeat with that period after the first firing.
    pub fn add(
        &mut self,
        id: TimerId,
        now: u64,
        timeout: u64,
        interval: u64,
        callback: Box<dyn FnMut()>,
        on_stop: Option<Box<dyn FnMut()>>,
    ) -> TimerId {
        let deadline = now + timeout;
        let event = Rc::new(TimerEvent {
            id,
            deadline: Cell::new(deadline),
            interval,
            callback: RefCell::new(callback),
            on_stop: RefCell::new(on_stop),
        });
        self.timers.insert(id, event);
        self.schedule.insert((deadline, id));
        id
    }

    /// Detaches a timer. The caller runs its stop callback, if any, after
    /// releasing the manager borrow.
    pub fn remove(&mut self, id: TimerId) -> Option<Rc<TimerEvent>> {
        let event = self.timers.remove(&id)?;
        self.schedule.remove(&(event.deadline.get(), id));
        Some(event)
    }

    pub fn contains(&self, id: TimerId) -> bool {
        self.timers.contains_key(&id)
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    /// Milliseconds until the nearest deadline, zero if already due.
    pub fn nearest_timeout(&self, now: u64) -> Option<u64> {
        self.schedule
            .iter()
            .next()
            .map(|&(deadline, _)| deadline.saturating_sub(now))
    }

    /// Detaches up to [`MAX_TIMER_EVENT`] due timers from the schedule. The
    /// caller fires them with the manager unborrowed, then hands each back
    /// to [`finish`](TimerManager::finish).
    pub fn pop_due(&mut self, now: u64, out: &mut Vec<Rc<TimerEvent>>) {
        while out.len() < MAX_TIMER_EVENT {
            let Some(&(deadline, id)) = self.schedule.iter().next() else {
                break;
            };
            if deadline > now {
                break;
            }
            self.schedule.remove(&(deadline, id));
            if let Some(event) = self.timers.get(&id) {
                out.push(Rc::clone(event));
            }
        }
    }

    /// Reschedules a fired timer. A timer cleared during its own callback
    /// is gone from the map and stays gone; a one-shot is dropped after its
    /// single firing.
    pub fn finish(&mut self, event: &Rc<TimerEvent>, now: u64) {
        if !self.timers.contains_key(&event.id) {
            return;
        }
        if event.interval > 0 {
            let deadline = now + event.interval;
            event.deadline.set(deadline);
            self.schedule.insert((deadline, event.id));
        } else {
            self.timers.remove(&event.id);
        }
    }

    /// Detaches every timer, due or not. Used on loop teardown; stop
    /// callbacks run caller-side.
    pub fn clear_all(&mut self) -> Vec<Rc<TimerEvent>> {
        self.schedule.clear();
        self.timers.drain().map(|(_, event)| event).collect()
    }
}
