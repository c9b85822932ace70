//! `select` fallback backend for Unix platforms without epoll or kqueue.
//!
//! Level-triggered underneath, but the front's re-add discipline makes it
//! look edge-style to consumers. With no registered descriptor `select`
//! cannot be used as a sleep primitive on every libc, so the backend just
//! sleeps out the timeout.

use std::collections::HashMap;
use std::io;
use std::ptr;
use std::thread;
use std::time::Duration;

use super::{set_nonblocking, PollerBackend};
use crate::net::{EventMask, EVENT_ERROR, EVENT_NONE, EVENT_READABLE, EVENT_WRITABLE};
use crate::types::OsSocket;

pub(crate) struct SelectBackend {
    masks: HashMap<OsSocket, EventMask>,
}

impl SelectBackend {
    pub fn new() -> Self {
        SelectBackend { masks: HashMap::new() }
    }
}

impl PollerBackend for SelectBackend {
    fn update(&mut self, fd: OsSocket, old: EventMask, new: EventMask) -> io::Result<()> {
        if fd as usize >= libc::FD_SETSIZE {
            return Err(io::Error::from(io::ErrorKind::InvalidInput));
        }
        if old == EVENT_NONE {
            set_nonblocking(fd)?;
        }
        if new == EVENT_NONE {
            self.masks.remove(&fd);
        } else {
            self.masks.insert(fd, new);
        }
        Ok(())
    }

    fn poll(&mut self, timeout_ms: i32, out: &mut Vec<(OsSocket, EventMask)>) -> io::Result<()> {
        if self.masks.is_empty() {
            if timeout_ms > 0 {
                thread::sleep(Duration::from_millis(timeout_ms as u64));
            }
            return Ok(());
        }
        let mut rset: libc::fd_set = unsafe { std::mem::zeroed() };
        let mut wset: libc::fd_set = unsafe { std::mem::zeroed() };
        let mut eset: libc::fd_set = unsafe { std::mem::zeroed() };
        unsafe {
            libc::FD_ZERO(&mut rset);
            libc::FD_ZERO(&mut wset);
            libc::FD_ZERO(&mut eset);
        }
        let mut max_fd: OsSocket = 0;
        for (&fd, &mask) in &self.masks {
            unsafe {
                if mask & EVENT_READABLE != 0 {
                    libc::FD_SET(fd, &mut rset);
                }
                if mask & EVENT_WRITABLE != 0 {
                    libc::FD_SET(fd, &mut wset);
                }
                libc::FD_SET(fd, &mut eset);
            }
            max_fd = max_fd.max(fd);
        }
        let mut tv = libc::timeval {
            tv_sec: (timeout_ms / 1000) as libc::time_t,
            tv_usec: ((timeout_ms % 1000) as libc::suseconds_t) * 1000,
        };
        let n = unsafe {
            libc::select(
                max_fd + 1,
                &mut rset,
                &mut wset,
                &mut eset,
                if timeout_ms < 0 { ptr::null_mut() } else { &mut tv },
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }
        if n == 0 {
            return Ok(());
        }
        for (&fd, _) in &self.masks {
            let mut mask = EVENT_NONE;
            unsafe {
                if libc::FD_ISSET(fd, &rset) {
                    mask |= EVENT_READABLE;
                }
                if libc::FD_ISSET(fd, &wset) {
                    mask |= EVENT_WRITABLE;
                }
                if libc::FD_ISSET(fd, &eset) {
                    mask |= EVENT_READABLE | EVENT_WRITABLE | EVENT_ERROR;
                }
            }
            if mask != EVENT_NONE {
                out.push((fd, mask));
            }
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "select"
    }
}
