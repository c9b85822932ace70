//! Shared handle and id types.

/// OS-level socket handle the poller backends key on.
#[cfg(unix)]
pub type OsSocket = std::os::unix::io::RawFd;
#[cfg(windows)]
pub type OsSocket = std::os::windows::io::RawSocket;

/// Identifier returned by [`EventLoop::add_timer`](crate::net::EventLoop::add_timer).
pub type TimerId = i64;

/// Process-unique channel identifier.
pub type ChannelId = i64;

/// Identifier returned by [`EventLoop::add_task`](crate::net::EventLoop::add_task).
pub type TaskId = i64;

/// Never allocated; safe to keep in "no timer pending" fields.
pub const INVALID_TIMER_ID: TimerId = 0;

/// Never allocated; safe to keep in "no task pending" fields.
pub const INVALID_TASK_ID: TaskId = 0;

#[cfg(unix)]
pub(crate) fn os_socket(sock: &socket2::Socket) -> OsSocket {
    use std::os::unix::io::AsRawFd;
    sock.as_raw_fd()
}

#[cfg(windows)]
pub(crate) fn os_socket(sock: &socket2::Socket) -> OsSocket {
    use std::os::windows::io::AsRawSocket;
    sock.as_raw_socket()
}
