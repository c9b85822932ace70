//! epoll backend (Linux).
//!
//! Registrations are edge-triggered (`EPOLLET`); the front re-adds a
//! descriptor whenever a consumer wants the next edge, which maps to
//! `EPOLL_CTL_MOD` here. `EPOLLHUP`/`EPOLLERR` fan out to the full mask so
//! a consumer blocked on either direction observes the failure.

use std::io;

use super::{set_nonblocking, PollerBackend, MAX_POLL_EVENT};
use crate::net::{EventMask, EVENT_ERROR, EVENT_NONE, EVENT_READABLE, EVENT_WRITABLE};
use crate::types::OsSocket;

pub(crate) struct EpollBackend {
    epfd: OsSocket,
    events: Vec<libc::epoll_event>,
}

fn to_epoll(mask: EventMask) -> u32 {
    let mut events = libc::EPOLLET as u32;
    if mask & EVENT_READABLE != 0 {
        events |= (libc::EPOLLIN | libc::EPOLLRDHUP) as u32;
    }
    if mask & EVENT_WRITABLE != 0 {
        events |= libc::EPOLLOUT as u32;
    }
    events
}

fn from_epoll(events: u32) -> EventMask {
    let mut mask = EVENT_NONE;
    if events & (libc::EPOLLIN | libc::EPOLLRDHUP | libc::EPOLLPRI) as u32 != 0 {
        mask |= EVENT_READABLE;
    }
    if events & libc::EPOLLOUT as u32 != 0 {
        mask |= EVENT_WRITABLE;
    }
    if events & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
        mask |= EVENT_READABLE | EVENT_WRITABLE | EVENT_ERROR;
    }
    mask
}

impl EpollBackend {
    pub fn new() -> io::Result<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(EpollBackend {
            epfd,
            events: vec![libc::epoll_event { events: 0, u64: 0 }; MAX_POLL_EVENT],
        })
    }

    fn ctl(&self, op: libc::c_int, fd: OsSocket, mask: EventMask) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events: to_epoll(mask),
            u64: fd as u64,
        };
        if unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl PollerBackend for EpollBackend {
    fn update(&mut self, fd: OsSocket, old: EventMask, new: EventMask) -> io::Result<()> {
        if old == EVENT_NONE {
            set_nonblocking(fd)?;
            self.ctl(libc::EPOLL_CTL_ADD, fd, new)
        } else if new == EVENT_NONE {
            self.ctl(libc::EPOLL_CTL_DEL, fd, EVENT_NONE)
        } else {
            self.ctl(libc::EPOLL_CTL_MOD, fd, new)
        }
    }

    fn poll(&mut self, timeout_ms: i32, out: &mut Vec<(OsSocket, EventMask)>) -> io::Result<()> {
        let n = unsafe {
            libc::epoll_wait(
                self.epfd,
                self.events.as_mut_ptr(),
                self.events.len() as libc::c_int,
                timeout_ms,
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
            out.push((ev.u64 as OsSocket, from_epoll(ev.events)));
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "epoll"
    }
}

impl Drop for EpollBackend {
    fn drop(&mut self) {
        unsafe { libc::close(self.epfd) };
    }
}
