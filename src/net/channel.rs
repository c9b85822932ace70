//! Named, reconnectable session over one socket.
//!
//! A `SocketChannel` pairs a [`Socket`] with a lifecycle: a client channel
//! is configured once with [`ChannelOptions`], then `open()` builds a fresh
//! socket and walks Unspec -> Connecting (-> Handshaking for TLS) ->
//! Connected; a server-accepted channel starts Connected. `close(err)` is
//! idempotent and reports the error, then the close, exactly once. The old
//! socket is never resurrected: reconnecting means a new socket through the
//! same channel.

use std::cell::RefCell;
use std::rc::Rc;

use log::{debug, warn};

use super::addr;
use super::event_loop::EventLoop;
use super::socket::{Socket, DEFAULT_KEEPALIVE_MS};
use super::tls::TlsContext;
use crate::callback::Callback;
use crate::error::ErrorCode;
use crate::types::ChannelId;

/// Floor applied to the configured connect timeout.
pub const MIN_CHANNEL_TIMEOUT_MS: u64 = 20_000;

/// Client channel configuration; immutable once passed to `init`.
#[derive(Clone, Debug, Default)]
pub struct ChannelOptions {
    /// Logical name used in logs and registries.
    pub name: String,
    /// Endpoint as `tcp://host:port`, `ssl://host:port` or `unix://path`;
    /// a bare `host:port` is treated as `tcp`.
    pub url: String,
    /// Connect timeout in milliseconds; values below
    /// [`MIN_CHANNEL_TIMEOUT_MS`] are raised to it, 0 means the floor.
    pub timeout_ms: u64,
    /// TCP keepalive idle time and probe interval in milliseconds; 0 keeps
    /// [`DEFAULT_KEEPALIVE_MS`].
    pub keepalive_ms: u64,
    /// Ping period in milliseconds for protocol layers riding the channel;
    /// 0 disables pings. The channel itself never sends them.
    pub ping_interval_ms: u64,
    /// PEM CA bundle for TLS endpoints; `None` disables verification.
    pub tls_ca_file: Option<String>,
    pub debug: bool,
}

impl ChannelOptions {
    /// The connect timeout after applying the floor.
    pub fn effective_timeout_ms(&self) -> u64 {
        self.timeout_ms.max(MIN_CHANNEL_TIMEOUT_MS)
    }

    /// The keepalive interval after applying the default.
    pub fn effective_keepalive_ms(&self) -> u64 {
        if self.keepalive_ms == 0 {
            DEFAULT_KEEPALIVE_MS
        } else {
            self.keepalive_ms
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelState {
    Unspec,
    Connecting,
    Handshaking,
    Connected,
    Closed,
}

struct Inner {
    event_loop: Rc<EventLoop>,
    id: ChannelId,
    options: ChannelOptions,
    state: ChannelState,
    socket: Option<Socket>,
    tls: Option<TlsContext>,
    /// Set by an owning server; runs (deferred) when the channel closes.
    on_removed: Option<Box<dyn FnOnce(ChannelId)>>,
    on_open: Callback,
    on_read: Callback,
    on_error: Callback<ErrorCode>,
    on_close: Callback,
}

#[derive(Clone)]
pub struct SocketChannel {
    inner: Rc<RefCell<Inner>>,
}

impl SocketChannel {
    pub fn new(event_loop: Rc<EventLoop>) -> SocketChannel {
        let id = event_loop.new_unique_id();
        SocketChannel {
            inner: Rc::new(RefCell::new(Inner {
                event_loop,
                id,
                options: ChannelOptions::default(),
                state: ChannelState::Unspec,
                socket: None,
                tls: None,
                on_removed: None,
                on_open: Callback::new(),
                on_read: Callback::new(),
                on_error: Callback::new(),
                on_close: Callback::new(),
            })),
        }
    }

    /// Wraps a just-accepted socket in a Connected channel (Handshaking
    /// while a server TLS session is still pending).
    pub(crate) fn from_accepted(socket: Socket) -> SocketChannel {
        let channel = SocketChannel::new(socket.event_loop());
        {
            let mut inner = channel.inner.borrow_mut();
            inner.state = if socket.is_tls_handshaking() {
                ChannelState::Handshaking
            } else {
                ChannelState::Connected
            };
            inner.options.name = socket.peer_address();
            inner.socket = Some(socket);
        }
        channel.wire_socket();
        channel
    }

    // -- callbacks ------------------------------------------------------------

    pub fn set_open_callback(&self, f: impl FnMut(()) + 'static) {
        self.inner.borrow().on_open.set(f);
    }

    pub fn set_read_callback(&self, f: impl FnMut(()) + 'static) {
        self.inner.borrow().on_read.set(f);
    }

    pub fn set_error_callback(&self, f: impl FnMut(ErrorCode) + 'static) {
        self.inner.borrow().on_error.set(f);
    }

    pub fn set_close_callback(&self, f: impl FnMut(()) + 'static) {
        self.inner.borrow().on_close.set(f);
    }

    pub(crate) fn set_removed_hook(&self, f: impl FnOnce(ChannelId) + 'static) {
        self.inner.borrow_mut().on_removed = Some(Box::new(f));
    }

    // -- state ----------------------------------------------------------------

    pub fn id(&self) -> ChannelId {
        self.inner.borrow().id
    }

    pub fn name(&self) -> String {
        self.inner.borrow().options.name.clone()
    }

    pub fn state(&self) -> ChannelState {
        self.inner.borrow().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ChannelState::Connected
    }

    pub fn event_loop(&self) -> Rc<EventLoop> {
        Rc::clone(&self.inner.borrow().event_loop)
    }

    pub fn socket(&self) -> Option<Socket> {
        self.inner.borrow().socket.clone()
    }

    /// Configured ping period; 0 when disabled.
    pub fn ping_interval_ms(&self) -> u64 {
        self.inner.borrow().options.ping_interval_ms
    }

    /// Stores configuration and builds the TLS context when the URL asks
    /// for one. Must run before `open`.
    pub fn init(&self, options: ChannelOptions) -> Result<(), ErrorCode> {
        let parsed = addr::parse_address(&options.url)?;
        let tls = if parsed.is_tls() {
            Some(TlsContext::client_from_files(options.tls_ca_file.as_deref())?)
        } else {
            None
        };
        let mut inner = self.inner.borrow_mut();
        inner.options = options;
        inner.tls = tls;
        Ok(())
    }

    /// Builds a fresh socket and starts connecting. Allowed from `Unspec`
    /// and from `Closed` (reconnect).
    pub fn open(&self) -> Result<(), ErrorCode> {
        let (options, tls, event_loop) = {
            let inner = self.inner.borrow();
            match inner.state {
                ChannelState::Unspec | ChannelState::Closed => {}
                _ => return Err(ErrorCode::InvalidArgument),
            }
            (
                inner.options.clone(),
                inner.tls.clone(),
                Rc::clone(&inner.event_loop),
            )
        };
        let parsed = addr::parse_address(&options.url)?;
        let socket = Socket::new(event_loop);
        socket.set_keepalive_ms(options.effective_keepalive_ms());
        {
            let mut inner = self.inner.borrow_mut();
            inner.socket = Some(socket.clone());
            inner.state = ChannelState::Connecting;
        }
        self.wire_socket();
        let timeout = options.effective_timeout_ms();
        let result = if parsed.is_unix() {
            #[cfg(unix)]
            {
                socket.connect_unix(&parsed.host, timeout)
            }
            #[cfg(not(unix))]
            {
                Err(ErrorCode::UriUnrecognized)
            }
        } else {
            socket.connect(&parsed.host, parsed.port, timeout, tls.as_ref())
        };
        if let Err(err) = result {
            warn!("channel({}) open failed: {}", options.name, err);
            let mut inner = self.inner.borrow_mut();
            inner.state = ChannelState::Unspec;
            inner.socket = None;
            return Err(err);
        }
        Ok(())
    }

    fn wire_socket(&self) {
        let socket = match self.socket() {
            Some(socket) => socket,
            None => return,
        };
        let weak = Rc::downgrade(&self.inner);
        socket.set_connect_callback({
            let weak = weak.clone();
            move |_| {
                if let Some(inner) = weak.upgrade() {
                    SocketChannel { inner }.on_socket_connected();
                }
            }
        });
        socket.set_established_callback({
            let weak = weak.clone();
            move |_| {
                if let Some(inner) = weak.upgrade() {
                    SocketChannel { inner }.on_socket_established();
                }
            }
        });
        socket.set_read_callback({
            let weak = weak.clone();
            move |_| {
                if let Some(inner) = weak.upgrade() {
                    let on_read = inner.borrow().on_read.clone();
                    on_read.invoke(());
                }
            }
        });
        socket.set_error_callback(move |err| {
            if let Some(inner) = weak.upgrade() {
                SocketChannel { inner }.close(err);
            }
        });
    }

    fn on_socket_connected(&self) {
        let (tls, on_open) = {
            let mut inner = self.inner.borrow_mut();
            if inner.state != ChannelState::Connecting {
                return;
            }
            if inner.tls.is_some() {
                inner.state = ChannelState::Handshaking;
                (true, inner.on_open.clone())
            } else {
                inner.state = ChannelState::Connected;
                (false, inner.on_open.clone())
            }
        };
        if !tls {
            debug!("channel({}) open", self.name());
            on_open.invoke(());
        }
    }

    fn on_socket_established(&self) {
        let on_open = {
            let mut inner = self.inner.borrow_mut();
            if inner.state != ChannelState::Handshaking {
                return;
            }
            inner.state = ChannelState::Connected;
            inner.on_open.clone()
        };
        debug!("channel({}) open (TLS)", self.name());
        on_open.invoke(());
    }

    // -- data -----------------------------------------------------------------

    pub fn write(&self, data: &[u8]) -> Result<(), ErrorCode> {
        let socket = self
            .inner
            .borrow()
            .socket
            .clone()
            .ok_or(ErrorCode::SocketNotConnected)?;
        socket.write(data)
    }

    // -- teardown ---------------------------------------------------------------

    /// First call reports `err` (if any) through the error callback, then
    /// the close callback, closes the socket, and asks the owning server to
    /// drop the channel on the next task tick. Later calls are no-ops.
    pub fn close(&self, err: ErrorCode) {
        let (socket, on_error, on_close, on_removed, id, event_loop, name) = {
            let mut inner = self.inner.borrow_mut();
            if inner.state == ChannelState::Closed {
                return;
            }
            inner.state = ChannelState::Closed;
            (
                inner.socket.take(),
                inner.on_error.clone(),
                inner.on_close.clone(),
                inner.on_removed.take(),
                inner.id,
                Rc::clone(&inner.event_loop),
                inner.options.name.clone(),
            )
        };
        if !err.is_ok() {
            debug!("channel({}) closing: {}", name, err);
            on_error.invoke(err);
        }
        on_close.invoke(());
        if let Some(socket) = socket {
            socket.close();
        }
        if let Some(on_removed) = on_removed {
            // Registry mutation is deferred so a close from inside the
            // server's channel iteration cannot invalidate it.
            let mut removed = Some(on_removed);
            event_loop.add_task(move || {
                if let Some(f) = removed.take() {
                    f(id);
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::RunMode;
    use std::cell::Cell;

    #[test]
    fn test_timeout_floor() {
        let options = ChannelOptions { timeout_ms: 50, ..Default::default() };
        assert_eq!(options.effective_timeout_ms(), MIN_CHANNEL_TIMEOUT_MS);
        let options = ChannelOptions { timeout_ms: 30_000, ..Default::default() };
        assert_eq!(options.effective_timeout_ms(), 30_000);
    }

    #[test]
    fn test_keepalive_default_and_override() {
        let options = ChannelOptions::default();
        assert_eq!(options.effective_keepalive_ms(), DEFAULT_KEEPALIVE_MS);
        assert_eq!(options.ping_interval_ms, 0);
        let options = ChannelOptions { keepalive_ms: 15_000, ..Default::default() };
        assert_eq!(options.effective_keepalive_ms(), 15_000);
    }

    #[test]
    fn test_ping_interval_exposed_to_protocol_layers() {
        let event_loop = EventLoop::new().unwrap();
        let channel = SocketChannel::new(event_loop);
        assert_eq!(channel.ping_interval_ms(), 0);
        channel
            .init(ChannelOptions {
                url: "tcp://127.0.0.1:1".into(),
                ping_interval_ms: 9_000,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(channel.ping_interval_ms(), 9_000);
    }

    #[test]
    fn test_init_rejects_bad_url() {
        let event_loop = EventLoop::new().unwrap();
        let channel = SocketChannel::new(event_loop);
        let options = ChannelOptions { url: "nonsense".into(), ..Default::default() };
        assert_eq!(channel.init(options).err(), Some(ErrorCode::UriUnrecognized));
    }

    #[test]
    fn test_close_is_idempotent() {
        let event_loop = EventLoop::new().unwrap();
        let channel = SocketChannel::new(event_loop);
        let errors = Rc::new(Cell::new(0));
        let closes = Rc::new(Cell::new(0));
        let e = Rc::clone(&errors);
        let c = Rc::clone(&closes);
        channel.set_error_callback(move |_| e.set(e.get() + 1));
        channel.set_close_callback(move |_| c.set(c.get() + 1));
        channel.close(ErrorCode::SocketConnectTimeout);
        channel.close(ErrorCode::SocketRead);
        assert_eq!(errors.get(), 1);
        assert_eq!(closes.get(), 1);
        assert_eq!(channel.state(), ChannelState::Closed);
    }

    #[test]
    fn test_graceful_close_skips_error_callback() {
        let event_loop = EventLoop::new().unwrap();
        let channel = SocketChannel::new(event_loop);
        let errors = Rc::new(Cell::new(0));
        let e = Rc::clone(&errors);
        channel.set_error_callback(move |_| e.set(e.get() + 1));
        channel.close(ErrorCode::Ok);
        assert_eq!(errors.get(), 0);
    }

    #[test]
    fn test_open_connects_over_loopback() {
        let event_loop = EventLoop::new().unwrap();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let channel = SocketChannel::new(Rc::clone(&event_loop));
        channel
            .init(ChannelOptions {
                name: "test".into(),
                url: format!("tcp://127.0.0.1:{}", port),
                ..Default::default()
            })
            .unwrap();
        let opened = Rc::new(Cell::new(false));
        let o = Rc::clone(&opened);
        channel.set_open_callback(move |_| o.set(true));
        channel.open().unwrap();
        assert_eq!(channel.state(), ChannelState::Connecting);
        let deadline = crate::net::event_loop::time_ms() + 2000;
        while !opened.get() && crate::net::event_loop::time_ms() < deadline {
            event_loop.run(RunMode::Once);
        }
        assert!(channel.is_connected());
    }
}
