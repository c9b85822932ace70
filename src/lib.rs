//! # tinynet - Embeddable Event-Driven Networking Core
//!
//! tinynet is the networking core of an embeddable application-server
//! framework: a single-threaded, readiness-driven event loop with pluggable
//! OS backends, buffered non-blocking sockets with explicit TLS handshake
//! states, named reconnectable channels, and a reliable sliding-window
//! messaging layer that resolves peers through a retry/redirect-aware
//! naming client.
//!
//! ## Quick Start
//!
//! ### Echo server
//!
//! ```rust,no_run
//! use tinynet::net::{EventLoop, RunMode, ServerOptions, SocketServer};
//!
//! fn main() -> Result<(), tinynet::ErrorCode> {
//!     let event_loop = EventLoop::new().expect("event loop");
//!     let server = SocketServer::new(event_loop.clone());
//!     server.set_channel_callback(|channel| {
//!         let reader = channel.clone();
//!         channel.set_read_callback(move |_| {
//!             if let Some(socket) = reader.socket() {
//!                 let data: Vec<u8> = socket.recv_buffer().data().to_vec();
//!                 socket.recv_buffer().consume(data.len());
//!                 let _ = reader.write(&data);
//!             }
//!         });
//!     });
//!     server.start(ServerOptions {
//!         name: "echo".into(),
//!         url: "tcp://*:8090".into(),
//!         ..Default::default()
//!     })?;
//!     event_loop.run(RunMode::Forever);
//!     Ok(())
//! }
//! ```
//!
//! ### Client channel
//!
//! ```rust,no_run
//! use tinynet::net::{ChannelOptions, EventLoop, RunMode, SocketChannel};
//!
//! fn main() -> Result<(), tinynet::ErrorCode> {
//!     let event_loop = EventLoop::new().expect("event loop");
//!     let channel = SocketChannel::new(event_loop.clone());
//!     channel.init(ChannelOptions {
//!         name: "echo-client".into(),
//!         url: "tcp://127.0.0.1:8090".into(),
//!         ..Default::default()
//!     })?;
//!     let writer = channel.clone();
//!     channel.set_open_callback(move |_| {
//!         let _ = writer.write(b"hello");
//!     });
//!     channel.open()?;
//!     event_loop.run(RunMode::Forever);
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +---------------------------------------------------------------+
//! |  TdcService / TdcChannel      reliable sliding-window messages |
//! |  NamingResolver               retry/redirect name lookup       |
//! |  RpcChannel / RpcServer       framed request/response          |
//! +---------------------------------------------------------------+
//! |  SocketChannel / SocketServer named, reconnectable sessions    |
//! |  Socket / Listener            buffered non-blocking I/O + TLS  |
//! +---------------------------------------------------------------+
//! |  EventLoop                    poll -> timers -> tasks          |
//! |  Poller                       epoll / kqueue / select / IOCP   |
//! +---------------------------------------------------------------+
//! ```
//!
//! Everything above the poller runs on the thread that calls
//! [`EventLoop::run`](net::EventLoop::run); other threads post work through
//! [`LoopHandle`](net::LoopHandle).

pub mod buffer;
pub mod error;
pub mod naming;
pub mod net;
pub mod rpc;
pub mod tdc;
pub mod types;

mod callback;

// Re-export the types nearly every consumer touches.
pub use buffer::IoBuffer;
pub use error::{strerror, ErrorCode};
pub use net::{EventLoop, LoopHandle, RunMode};
pub use types::{ChannelId, TaskId, TimerId};
