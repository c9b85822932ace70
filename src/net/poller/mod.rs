//! Poller front table and platform backends.
//!
//! The front owns the descriptor table (subscription mask + callback per
//! descriptor) while a backend translates it to the OS facility: epoll on
//! Linux, kqueue on the BSDs and macOS, IOCP on Windows and `select` as the
//! portable fallback. All backends behave edge-style: a consumer that wants
//! the next event for a descriptor re-adds it after handling the current
//! one.
//!
//! Subscription masks union on `add` and subtract on `del`; the descriptor
//! leaves the table when its mask drops to zero. The first `add` for a
//! descriptor flips it non-blocking.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::rc::Rc;

use super::{EventMask, EVENT_ERROR, EVENT_NONE};
use crate::types::OsSocket;

#[cfg(target_os = "linux")]
mod epoll;
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd"
))]
mod kqueue;
#[cfg(unix)]
mod select;
#[cfg(windows)]
mod iocp;

/// Upper bound on events delivered per poll pass, so one busy descriptor
/// cannot starve timers and tasks.
pub const MAX_POLL_EVENT: usize = 16;

/// Callback dispatched with the fired mask for a descriptor.
pub type EventCallback = Rc<RefCell<dyn FnMut(OsSocket, EventMask)>>;

pub(crate) trait PollerBackend {
    /// Moves a descriptor's subscription from `old` to `new`. `old == 0`
    /// is a fresh registration, `new == 0` a removal.
    fn update(&mut self, fd: OsSocket, old: EventMask, new: EventMask) -> io::Result<()>;

    /// Waits up to `timeout_ms` and appends fired `(fd, mask)` pairs.
    fn poll(&mut self, timeout_ms: i32, out: &mut Vec<(OsSocket, EventMask)>) -> io::Result<()>;

    fn name(&self) -> &'static str;
}

fn new_backend() -> io::Result<Box<dyn PollerBackend>> {
    #[cfg(target_os = "linux")]
    {
        Ok(Box::new(epoll::EpollBackend::new()?))
    }
    #[cfg(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd"
    ))]
    {
        Ok(Box::new(kqueue::KqueueBackend::new()?))
    }
    #[cfg(all(
        unix,
        not(any(
            target_os = "linux",
            target_os = "macos",
            target_os = "ios",
            target_os = "freebsd",
            target_os = "netbsd",
            target_os = "openbsd"
        ))
    ))]
    {
        Ok(Box::new(select::SelectBackend::new()))
    }
    #[cfg(windows)]
    {
        Ok(Box::new(iocp::IocpBackend::new()?))
    }
}

struct Entry {
    mask: EventMask,
    callback: EventCallback,
}

pub struct Poller {
    backend: Box<dyn PollerBackend>,
    entries: HashMap<OsSocket, Entry>,
    fired: Vec<(OsSocket, EventMask)>,
}

impl Poller {
    pub fn new() -> io::Result<Self> {
        Ok(Poller::with_backend(new_backend()?))
    }

    pub(crate) fn with_backend(backend: Box<dyn PollerBackend>) -> Self {
        Poller {
            backend,
            entries: HashMap::new(),
            fired: Vec::with_capacity(MAX_POLL_EVENT),
        }
    }

    /// Same front table over the portable `select` backend. Useful where
    /// the platform default misbehaves (or to test the fallback).
    #[cfg(unix)]
    pub fn with_select() -> Self {
        Poller::with_backend(Box::new(select::SelectBackend::new()))
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Subscribes `fd` to `mask`, installing (or replacing) its callback.
    /// The new subscription is the union with whatever was registered.
    pub fn add(&mut self, fd: OsSocket, mask: EventMask, callback: EventCallback) -> io::Result<()> {
        let (old, new) = match self.entries.get(&fd) {
            Some(entry) => (entry.mask, entry.mask | mask),
            None => (EVENT_NONE, mask),
        };
        self.backend.update(fd, old, new)?;
        self.entries.insert(fd, Entry { mask: new, callback });
        Ok(())
    }

    /// Re-subscribes an already-registered descriptor, keeping its
    /// callback. Consumers call this after draining an edge.
    pub fn rearm(&mut self, fd: OsSocket, mask: EventMask) -> io::Result<()> {
        let entry = self
            .entries
            .get_mut(&fd)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))?;
        let old = entry.mask;
        let new = old | mask;
        self.backend.update(fd, old, new)?;
        entry.mask = new;
        Ok(())
    }

    /// Subtracts `mask` from the subscription; the descriptor is removed
    /// from the table and the backend once the mask reaches zero. Unknown
    /// descriptors are a no-op.
    pub fn del(&mut self, fd: OsSocket, mask: EventMask) {
        let Some(entry) = self.entries.get_mut(&fd) else {
            return;
        };
        let old = entry.mask;
        let new = old & !mask;
        // The descriptor may already be closed; removal failures are moot.
        let _ = self.backend.update(fd, old, new);
        if new == EVENT_NONE {
            self.entries.remove(&fd);
        } else {
            entry.mask = new;
        }
    }

    /// Unregisters every descriptor and drops its callback. Closes whatever
    /// the callbacks own, the loop's wakeup pair included.
    pub fn clear(&mut self) {
        for (fd, entry) in self.entries.drain() {
            let _ = self.backend.update(fd, entry.mask, EVENT_NONE);
        }
    }

    pub fn contains(&self, fd: OsSocket) -> bool {
        self.entries.contains_key(&fd)
    }

    pub fn mask(&self, fd: OsSocket) -> EventMask {
        self.entries.get(&fd).map(|e| e.mask).unwrap_or(EVENT_NONE)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Polls the backend and collects `(fd, mask, callback)` triples. The
    /// caller dispatches them after this borrow ends, so callbacks are free
    /// to re-enter the poller.
    pub fn poll(
        &mut self,
        timeout_ms: i32,
        out: &mut Vec<(OsSocket, EventMask, EventCallback)>,
    ) -> io::Result<usize> {
        self.fired.clear();
        self.backend.poll(timeout_ms, &mut self.fired)?;
        for &(fd, mask) in &self.fired {
            let Some(entry) = self.entries.get(&fd) else {
                // Raced with a del(); the event is stale.
                continue;
            };
            // Errors are always delivered, subscribed or not.
            let fired = mask & (entry.mask | EVENT_ERROR);
            if fired != EVENT_NONE {
                out.push((fd, fired, Rc::clone(&entry.callback)));
            }
        }
        Ok(out.len())
    }
}

#[cfg(unix)]
pub(crate) fn set_nonblocking(fd: OsSocket) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(windows)]
pub(crate) fn set_nonblocking(fd: OsSocket) -> io::Result<()> {
    use windows_sys::Win32::Networking::WinSock::{ioctlsocket, FIONBIO};
    let mut on: u32 = 1;
    if unsafe { ioctlsocket(fd as usize, FIONBIO, &mut on) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::{EVENT_READABLE, EVENT_WRITABLE};

    #[derive(Default)]
    struct MockState {
        updates: Vec<(OsSocket, EventMask, EventMask)>,
        pending: Vec<(OsSocket, EventMask)>,
    }

    struct MockBackend(Rc<RefCell<MockState>>);

    impl PollerBackend for MockBackend {
        fn update(&mut self, fd: OsSocket, old: EventMask, new: EventMask) -> io::Result<()> {
            self.0.borrow_mut().updates.push((fd, old, new));
            Ok(())
        }

        fn poll(
            &mut self,
            _timeout_ms: i32,
            out: &mut Vec<(OsSocket, EventMask)>,
        ) -> io::Result<()> {
            out.append(&mut self.0.borrow_mut().pending);
            Ok(())
        }

        fn name(&self) -> &'static str {
            "mock"
        }
    }

    fn noop_callback() -> EventCallback {
        Rc::new(RefCell::new(|_fd: OsSocket, _mask: EventMask| {}))
    }

    fn mock_poller() -> (Poller, Rc<RefCell<MockState>>) {
        let state = Rc::new(RefCell::new(MockState::default()));
        let poller = Poller::with_backend(Box::new(MockBackend(Rc::clone(&state))));
        (poller, state)
    }

    #[test]
    fn test_add_unions_masks() {
        let (mut poller, state) = mock_poller();
        poller.add(5, EVENT_READABLE, noop_callback()).unwrap();
        poller.add(5, EVENT_WRITABLE, noop_callback()).unwrap();
        assert_eq!(poller.mask(5), EVENT_READABLE | EVENT_WRITABLE);
        let updates = &state.borrow().updates;
        assert_eq!(updates[0], (5, EVENT_NONE, EVENT_READABLE));
        assert_eq!(updates[1], (5, EVENT_READABLE, EVENT_READABLE | EVENT_WRITABLE));
    }

    #[test]
    fn test_del_subtracts_and_drops_at_zero() {
        let (mut poller, _state) = mock_poller();
        poller
            .add(7, EVENT_READABLE | EVENT_WRITABLE, noop_callback())
            .unwrap();
        poller.del(7, EVENT_WRITABLE);
        assert_eq!(poller.mask(7), EVENT_READABLE);
        assert!(poller.contains(7));
        poller.del(7, EVENT_READABLE);
        assert!(!poller.contains(7));
    }

    #[test]
    fn test_clear_unregisters_every_descriptor() {
        let (mut poller, state) = mock_poller();
        poller.add(5, EVENT_READABLE, noop_callback()).unwrap();
        poller.add(6, EVENT_WRITABLE, noop_callback()).unwrap();
        poller.clear();
        assert!(poller.is_empty());
        let updates = &state.borrow().updates;
        assert!(updates.contains(&(5, EVENT_READABLE, EVENT_NONE)));
        assert!(updates.contains(&(6, EVENT_WRITABLE, EVENT_NONE)));
    }

    #[test]
    fn test_del_absent_descriptor_is_noop() {
        let (mut poller, state) = mock_poller();
        poller.del(9, EVENT_READABLE);
        assert!(state.borrow().updates.is_empty());
    }

    #[test]
    fn test_poll_skips_stale_and_filters_mask() {
        let (mut poller, state) = mock_poller();
        poller.add(3, EVENT_READABLE, noop_callback()).unwrap();
        state.borrow_mut().pending.push((3, EVENT_WRITABLE));
        state.borrow_mut().pending.push((4, EVENT_READABLE));
        let mut out = Vec::new();
        poller.poll(0, &mut out).unwrap();
        // fd 3 fired only for an unsubscribed kind, fd 4 is unknown.
        assert!(out.is_empty());
    }

    #[test]
    fn test_poll_always_delivers_errors() {
        let (mut poller, state) = mock_poller();
        poller.add(3, EVENT_READABLE, noop_callback()).unwrap();
        state
            .borrow_mut()
            .pending
            .push((3, EVENT_READABLE | EVENT_ERROR));
        let mut out = Vec::new();
        let n = poller.poll(0, &mut out).unwrap();
        assert_eq!(n, 1);
        assert_eq!(out[0].1, EVENT_READABLE | EVENT_ERROR);
    }

    #[cfg(unix)]
    #[test]
    fn test_select_backend_reports_readable() {
        use std::io::Write;
        use std::os::unix::io::AsRawFd;
        use std::os::unix::net::UnixStream;

        let (mut tx, rx) = UnixStream::pair().unwrap();
        let fd = rx.as_raw_fd();
        let mut poller = Poller::with_select();
        let fired = Rc::new(RefCell::new(EVENT_NONE));
        let f = Rc::clone(&fired);
        poller
            .add(
                fd,
                EVENT_READABLE,
                Rc::new(RefCell::new(move |_fd: OsSocket, mask: EventMask| {
                    *f.borrow_mut() |= mask;
                })),
            )
            .unwrap();
        tx.write_all(b"x").unwrap();
        let mut out = Vec::new();
        poller.poll(1000, &mut out).unwrap();
        for (fd, mask, cb) in out {
            (cb.borrow_mut())(fd, mask);
        }
        assert_ne!(*fired.borrow() & EVENT_READABLE, EVENT_NONE);
    }

    #[test]
    fn test_rearm_keeps_callback() {
        let (mut poller, _state) = mock_poller();
        let hits = Rc::new(RefCell::new(0));
        let h = Rc::clone(&hits);
        poller
            .add(
                2,
                EVENT_READABLE,
                Rc::new(RefCell::new(move |_fd: OsSocket, _mask: EventMask| {
                    *h.borrow_mut() += 1;
                })),
            )
            .unwrap();
        poller.rearm(2, EVENT_READABLE).unwrap();
        assert!(poller.rearm(11, EVENT_READABLE).is_err());
    }
}
