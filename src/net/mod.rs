//! Readiness-driven transport core.
//!
//! Everything in this module runs on a single thread around one
//! [`EventLoop`]: a [`poller::Poller`] translates OS readiness into edge
//! events, [`Socket`] turns those edges into buffered byte streams,
//! [`Listener`] accepts them, and [`SocketChannel`]/[`SocketServer`] give
//! them connection lifecycle and names. Cross-thread access goes through
//! [`LoopHandle`], never through the structures directly.

pub mod addr;
pub mod channel;
pub mod event_loop;
pub mod listener;
pub mod poller;
pub mod server;
pub mod socket;
pub mod task;
pub mod timer;
pub mod tls;

pub use channel::{ChannelOptions, ChannelState, SocketChannel};
pub use event_loop::{EventLoop, IdAllocator, LoopHandle, RunMode};
pub use listener::Listener;
pub use server::{ServerOptions, SocketServer};
pub use socket::{Socket, SocketStatus};
pub use tls::TlsContext;

/// Bitmask of readiness kinds, both as poller subscriptions and as latched
/// per-socket state.
pub type EventMask = u8;

pub const EVENT_NONE: EventMask = 0;
pub const EVENT_READABLE: EventMask = 0x1;
pub const EVENT_WRITABLE: EventMask = 0x2;
pub const EVENT_ERROR: EventMask = 0x4;
pub const EVENT_FULL_MASK: EventMask = EVENT_READABLE | EVENT_WRITABLE | EVENT_ERROR;
