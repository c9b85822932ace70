//! Re-entrancy-safe callback slots.
//!
//! Sockets, channels and timers hand control to user code while the loop is
//! mid-dispatch, and that user code is allowed to replace or clear the very
//! callback that is running. `Callback` takes the closure out of its slot
//! for the duration of the call and only puts it back if the slot is still
//! empty afterwards, so a callback resetting itself wins over the restore.

use std::cell::RefCell;
use std::rc::Rc;

pub(crate) struct Callback<A = ()> {
    slot: Rc<RefCell<Option<Box<dyn FnMut(A)>>>>,
}

impl<A> Callback<A> {
    pub fn new() -> Self {
        Callback { slot: Rc::new(RefCell::new(None)) }
    }

    pub fn set(&self, f: impl FnMut(A) + 'static) {
        *self.slot.borrow_mut() = Some(Box::new(f));
    }

    pub fn clear(&self) {
        *self.slot.borrow_mut() = None;
    }

    pub fn is_set(&self) -> bool {
        self.slot.borrow().is_some()
    }

    /// Invokes the slot if set. Re-entrant invocations while the callback
    /// is running are silently dropped.
    pub fn invoke(&self, arg: A) {
        let taken = self.slot.borrow_mut().take();
        if let Some(mut f) = taken {
            f(arg);
            let mut slot = self.slot.borrow_mut();
            if slot.is_none() {
                *slot = Some(f);
            }
        }
    }
}

impl<A> Clone for Callback<A> {
    fn clone(&self) -> Self {
        Callback { slot: Rc::clone(&self.slot) }
    }
}

impl<A> Default for Callback<A> {
    fn default() -> Self {
        Callback::new()
    }
}
