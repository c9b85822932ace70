//! kqueue backend (macOS and the BSDs).
//!
//! Read and write interest are separate filters; both are registered with
//! `EV_ADD | EV_CLEAR` for edge behavior matching the epoll backend.

use std::io;
use std::ptr;

use super::{set_nonblocking, PollerBackend, MAX_POLL_EVENT};
use crate::net::{EventMask, EVENT_ERROR, EVENT_NONE, EVENT_READABLE, EVENT_WRITABLE};
use crate::types::OsSocket;

pub(crate) struct KqueueBackend {
    kq: OsSocket,
    events: Vec<libc::kevent>,
}

impl KqueueBackend {
    pub fn new() -> io::Result<Self> {
        let kq = unsafe { libc::kqueue() };
        if kq < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(KqueueBackend {
            kq,
            events: vec![unsafe { std::mem::zeroed() }; MAX_POLL_EVENT],
        })
    }

    fn change(&self, fd: OsSocket, filter: i16, flags: u16) -> io::Result<()> {
        let mut ev: libc::kevent = unsafe { std::mem::zeroed() };
        ev.ident = fd as libc::uintptr_t;
        ev.filter = filter;
        ev.flags = flags;
        if unsafe { libc::kevent(self.kq, &ev, 1, ptr::null_mut(), 0, ptr::null()) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl PollerBackend for KqueueBackend {
    fn update(&mut self, fd: OsSocket, old: EventMask, new: EventMask) -> io::Result<()> {
        if old == EVENT_NONE {
            set_nonblocking(fd)?;
        }
        let was_r = old & EVENT_READABLE != 0;
        let want_r = new & EVENT_READABLE != 0;
        if want_r {
            self.change(fd, libc::EVFILT_READ, libc::EV_ADD | libc::EV_CLEAR)?;
        } else if was_r {
            self.change(fd, libc::EVFILT_READ, libc::EV_DELETE)?;
        }
        let was_w = old & EVENT_WRITABLE != 0;
        let want_w = new & EVENT_WRITABLE != 0;
        if want_w {
            self.change(fd, libc::EVFILT_WRITE, libc::EV_ADD | libc::EV_CLEAR)?;
        } else if was_w {
            self.change(fd, libc::EVFILT_WRITE, libc::EV_DELETE)?;
        }
        Ok(())
    }

    fn poll(&mut self, timeout_ms: i32, out: &mut Vec<(OsSocket, EventMask)>) -> io::Result<()> {
        let ts = libc::timespec {
            tv_sec: (timeout_ms / 1000) as libc::time_t,
            tv_nsec: ((timeout_ms % 1000) as libc::c_long) * 1_000_000,
        };
        let n = unsafe {
            libc::kevent(
                self.kq,
                ptr::null(),
                0,
                self.events.as_mut_ptr(),
                self.events.len() as libc::c_int,
                &ts,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }
        for ev in &self.events[..n as usize] {
            let mut mask = match ev.filter {
                libc::EVFILT_READ => EVENT_READABLE,
                libc::EVFILT_WRITE => EVENT_WRITABLE,
                _ => EVENT_NONE,
            };
            // EV_EOF alone stays a plain readiness edge so pending bytes
            // drain before the consumer sees end-of-stream.
            if ev.flags & libc::EV_ERROR != 0 {
                mask |= EVENT_READABLE | EVENT_WRITABLE | EVENT_ERROR;
            }
            if mask != EVENT_NONE {
                out.push((ev.ident as OsSocket, mask));
            }
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "kqueue"
    }
}

impl Drop for KqueueBackend {
    fn drop(&mut self) {
        unsafe { libc::close(self.kq) };
    }
}
