//! IOCP backend (Windows).
//!
//! IOCP is completion-based, so readiness is synthesized with zero-byte
//! probe operations: a queued zero-byte `WSARecv` completes when the socket
//! turns readable, a zero-byte `WSASend` when it turns writable. One probe
//! per direction is in flight at a time; a delivered probe is re-queued by
//! the front's next `update` for that descriptor, which lines up with the
//! edge re-add discipline the other backends follow. Completions with a
//! negative NTSTATUS are widened to the full mask.

use std::collections::HashMap;
use std::io;
use std::ptr;

use windows_sys::Win32::Foundation::{CloseHandle, HANDLE, INVALID_HANDLE_VALUE, WAIT_TIMEOUT};
use windows_sys::Win32::Networking::WinSock::{WSAGetLastError, WSARecv, WSASend, WSABUF, WSA_IO_PENDING};
use windows_sys::Win32::System::IO::{
    CreateIoCompletionPort, GetQueuedCompletionStatusEx, OVERLAPPED, OVERLAPPED_ENTRY,
};

use super::{set_nonblocking, PollerBackend, MAX_POLL_EVENT};
use crate::net::{EventMask, EVENT_ERROR, EVENT_NONE, EVENT_READABLE, EVENT_WRITABLE};
use crate::types::OsSocket;

#[repr(C)]
struct Probe {
    // Must stay first so an OVERLAPPED pointer is a Probe pointer.
    overlapped: OVERLAPPED,
    fd: OsSocket,
    mask: EventMask,
}

#[derive(Default)]
struct State {
    mask: EventMask,
    read_queued: bool,
    write_queued: bool,
}

pub(crate) struct IocpBackend {
    port: HANDLE,
    states: HashMap<OsSocket, State>,
    // Probes that failed synchronously; reported on the next poll.
    failed: Vec<(OsSocket, EventMask)>,
}

impl IocpBackend {
    pub fn new() -> io::Result<Self> {
        let port = unsafe { CreateIoCompletionPort(INVALID_HANDLE_VALUE, 0, 0, 1) };
        if port == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(IocpBackend {
            port,
            states: HashMap::new(),
            failed: Vec::new(),
        })
    }

    fn new_probe(fd: OsSocket, mask: EventMask) -> *mut Probe {
        Box::into_raw(Box::new(Probe {
            overlapped: unsafe { std::mem::zeroed() },
            fd,
            mask,
        }))
    }

    fn queue_probe(&mut self, fd: OsSocket, mask: EventMask) {
        let probe = Self::new_probe(fd, mask);
        let mut buf = WSABUF { len: 0, buf: ptr::null_mut() };
        let rc = unsafe {
            if mask == EVENT_READABLE {
                let mut flags: u32 = 0;
                WSARecv(
                    fd as usize,
                    &mut buf,
                    1,
                    ptr::null_mut(),
                    &mut flags,
                    probe as *mut OVERLAPPED,
                    None,
                )
            } else {
                WSASend(
                    fd as usize,
                    &mut buf,
                    1,
                    ptr::null_mut(),
                    0,
                    probe as *mut OVERLAPPED,
                    None,
                )
            }
        };
        if rc != 0 && unsafe { WSAGetLastError() } != WSA_IO_PENDING {
            // The probe never entered the port; reclaim it and surface the
            // failure as an error event.
            drop(unsafe { Box::from_raw(probe) });
            if let Some(state) = self.states.get_mut(&fd) {
                if mask == EVENT_READABLE {
                    state.read_queued = false;
                } else {
                    state.write_queued = false;
                }
            }
            self.failed.push((fd, mask | EVENT_ERROR));
        }
    }

    fn ensure_probes(&mut self, fd: OsSocket, mask: EventMask) {
        let (need_r, need_w) = {
            let state = self.states.entry(fd).or_default();
            state.mask = mask;
            let need_r = mask & EVENT_READABLE != 0 && !state.read_queued;
            let need_w = mask & EVENT_WRITABLE != 0 && !state.write_queued;
            if need_r {
                state.read_queued = true;
            }
            if need_w {
                state.write_queued = true;
            }
            (need_r, need_w)
        };
        if need_r {
            self.queue_probe(fd, EVENT_READABLE);
        }
        if need_w {
            self.queue_probe(fd, EVENT_WRITABLE);
        }
    }
}

impl PollerBackend for IocpBackend {
    fn update(&mut self, fd: OsSocket, old: EventMask, new: EventMask) -> io::Result<()> {
        if old == EVENT_NONE {
            set_nonblocking(fd)?;
            let rc = unsafe { CreateIoCompletionPort(fd as HANDLE, self.port, fd as usize, 0) };
            if rc == 0 {
                return Err(io::Error::last_os_error());
            }
        }
        if new == EVENT_NONE {
            // Completions for probes still in flight are dropped as stale.
            self.states.remove(&fd);
            return Ok(());
        }
        self.ensure_probes(fd, new);
        Ok(())
    }

    fn poll(&mut self, timeout_ms: i32, out: &mut Vec<(OsSocket, EventMask)>) -> io::Result<()> {
        out.append(&mut self.failed);
        let mut entries: [OVERLAPPED_ENTRY; MAX_POLL_EVENT] = unsafe { std::mem::zeroed() };
        let mut count: u32 = 0;
        let ok = unsafe {
            GetQueuedCompletionStatusEx(
                self.port,
                entries.as_mut_ptr(),
                entries.len() as u32,
                &mut count,
                timeout_ms as u32,
                0,
            )
        };
        if ok == 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(WAIT_TIMEOUT as i32) {
                return Ok(());
            }
            return Err(err);
        }
        for entry in &entries[..count as usize] {
            if entry.lpOverlapped.is_null() {
                continue;
            }
            let probe = unsafe { Box::from_raw(entry.lpOverlapped as *mut Probe) };
            let Some(state) = self.states.get_mut(&probe.fd) else {
                continue;
            };
            if probe.mask == EVENT_READABLE {
                state.read_queued = false;
            } else {
                state.write_queued = false;
            }
            let mut mask = probe.mask;
            // Internal carries the NTSTATUS of the completed operation.
            if (probe.overlapped.Internal as isize) < 0 {
                mask |= EVENT_READABLE | EVENT_WRITABLE | EVENT_ERROR;
            }
            out.push((probe.fd, mask));
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "iocp"
    }
}

impl Drop for IocpBackend {
    fn drop(&mut self) {
        unsafe { CloseHandle(self.port) };
    }
}
