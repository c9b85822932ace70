//! Buffered non-blocking socket with latched readiness.
//!
//! A `Socket` turns the poller's edges into a byte-stream API. Readiness is
//! latched into an internal mask: a readable edge drains the descriptor
//! into the read buffer until `WouldBlock`, clears the latch and re-arms;
//! writes go straight to the descriptor while the writable latch is set and
//! spill into the write buffer the moment a send would block. Error state
//! is terminal: once `set_error` ran, the socket only closes.
//!
//! TLS is not a subclass but a state: a socket holding a [`TlsSession`]
//! routes the same readable/writable edges through the handshake pump
//! until the session is established, then bridges plaintext through the
//! session transparently.

use std::cell::RefCell;
use std::io::{self, Read, Write};
use std::rc::Rc;
use std::time::Duration;

use log::{debug, warn};
use socket2::{Domain, Protocol, SockAddr, TcpKeepalive, Type};

use super::addr;
use super::event_loop::EventLoop;
use super::tls::{HandshakeStatus, TlsContext, TlsSession};
use super::{EventMask, EVENT_ERROR, EVENT_FULL_MASK, EVENT_NONE, EVENT_READABLE, EVENT_WRITABLE};
use crate::buffer::IoBuffer;
use crate::callback::Callback;
use crate::error::ErrorCode;
use crate::types::{os_socket, OsSocket, TimerId, INVALID_TIMER_ID};

/// Applied when a connect is issued with a zero timeout.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 30_000;

/// TCP keepalive idle time and probe interval, unless overridden with
/// [`Socket::set_keepalive_ms`].
pub const DEFAULT_KEEPALIVE_MS: u64 = 60_000;

/// Read-buffer growth per drain step.
const READ_CHUNK: usize = 8192;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SocketStatus {
    Idle,
    Connecting,
    Connected,
    Closed,
}

struct Inner {
    event_loop: Rc<EventLoop>,
    sock: Option<socket2::Socket>,
    fd: OsSocket,
    status: SocketStatus,
    mask: EventMask,
    registered: bool,
    is_unix: bool,
    keepalive_ms: u64,
    rbuf: IoBuffer,
    wbuf: IoBuffer,
    peer_address: String,
    connect_timer: TimerId,
    tls: Option<TlsSession>,
    on_read: Callback,
    on_write: Callback,
    on_error: Callback<ErrorCode>,
    on_close: Callback,
    on_connect: Callback,
    on_established: Callback,
}

/// Cheaply cloneable handle; clones share the same connection state and
/// callback slots.
#[derive(Clone)]
pub struct Socket {
    inner: Rc<RefCell<Inner>>,
}

enum ReadRoute {
    Ignore,
    Plain,
    Handshake,
    Tls,
}

fn would_block(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
}

fn connect_in_progress(err: &io::Error) -> bool {
    if would_block(err) {
        return true;
    }
    #[cfg(unix)]
    {
        err.raw_os_error() == Some(libc::EINPROGRESS)
    }
    #[cfg(windows)]
    {
        false
    }
}

impl Socket {
    pub fn new(event_loop: Rc<EventLoop>) -> Socket {
        Socket {
            inner: Rc::new(RefCell::new(Inner {
                event_loop,
                sock: None,
                fd: 0,
                status: SocketStatus::Idle,
                mask: EVENT_NONE,
                registered: false,
                is_unix: false,
                keepalive_ms: DEFAULT_KEEPALIVE_MS,
                rbuf: IoBuffer::new(),
                wbuf: IoBuffer::new(),
                peer_address: String::new(),
                connect_timer: INVALID_TIMER_ID,
                tls: None,
                on_read: Callback::new(),
                on_write: Callback::new(),
                on_error: Callback::new(),
                on_close: Callback::new(),
                on_connect: Callback::new(),
                on_established: Callback::new(),
            })),
        }
    }

    /// Wraps a freshly accepted descriptor. With a server-side TLS context
    /// the socket starts handshaking off the peer's first bytes.
    pub(crate) fn from_accepted(
        event_loop: Rc<EventLoop>,
        sock: socket2::Socket,
        peer_address: String,
        is_unix: bool,
        keepalive_ms: u64,
        tls: Option<&TlsContext>,
    ) -> Result<Socket, ErrorCode> {
        sock.set_nonblocking(true)
            .map_err(|_| ErrorCode::SocketSetNonBlocking)?;
        let session = tls.map(TlsContext::server_session).transpose()?;
        let socket = Socket::new(event_loop);
        {
            let mut inner = socket.inner.borrow_mut();
            inner.fd = os_socket(&sock);
            inner.sock = Some(sock);
            inner.status = SocketStatus::Connected;
            inner.mask = EVENT_WRITABLE;
            inner.is_unix = is_unix;
            inner.keepalive_ms = keepalive_ms;
            inner.peer_address = peer_address;
            inner.tls = session;
        }
        socket.apply_stream_options();
        socket.register(EVENT_READABLE)?;
        Ok(socket)
    }

    // -- callbacks ----------------------------------------------------------

    pub fn set_read_callback(&self, f: impl FnMut(()) + 'static) {
        self.inner.borrow().on_read.set(f);
    }

    pub fn set_write_callback(&self, f: impl FnMut(()) + 'static) {
        self.inner.borrow().on_write.set(f);
    }

    pub fn set_error_callback(&self, f: impl FnMut(ErrorCode) + 'static) {
        self.inner.borrow().on_error.set(f);
    }

    pub fn set_close_callback(&self, f: impl FnMut(()) + 'static) {
        self.inner.borrow().on_close.set(f);
    }

    pub fn set_connect_callback(&self, f: impl FnMut(()) + 'static) {
        self.inner.borrow().on_connect.set(f);
    }

    /// Runs once a TLS session finishes its handshake.
    pub fn set_established_callback(&self, f: impl FnMut(()) + 'static) {
        self.inner.borrow().on_established.set(f);
    }

    // -- state --------------------------------------------------------------

    pub fn status(&self) -> SocketStatus {
        self.inner.borrow().status
    }

    pub fn is_connected(&self) -> bool {
        self.status() == SocketStatus::Connected
    }

    pub fn has_error(&self) -> bool {
        self.inner.borrow().mask & EVENT_ERROR != 0
    }

    pub fn is_tls(&self) -> bool {
        self.inner.borrow().tls.is_some()
    }

    pub(crate) fn is_tls_handshaking(&self) -> bool {
        matches!(
            self.inner.borrow().tls,
            Some(TlsSession { status: HandshakeStatus::Handshaking, .. })
        )
    }

    pub fn peer_address(&self) -> String {
        self.inner.borrow().peer_address.clone()
    }

    pub fn event_loop(&self) -> Rc<EventLoop> {
        Rc::clone(&self.inner.borrow().event_loop)
    }

    /// Overrides the TCP keepalive interval applied when the stream opens.
    /// Must run before the connect finishes; ignored on Unix sockets.
    pub fn set_keepalive_ms(&self, ms: u64) {
        self.inner.borrow_mut().keepalive_ms = ms;
    }

    /// Bytes buffered and not yet handed to the peer.
    pub fn pending_write(&self) -> usize {
        self.inner.borrow().wbuf.len()
    }

    /// Borrows the receive buffer; consumers take what they parsed and
    /// leave the rest. The borrow must not outlive the callback.
    pub fn recv_buffer(&self) -> std::cell::RefMut<'_, IoBuffer> {
        std::cell::RefMut::map(self.inner.borrow_mut(), |inner| &mut inner.rbuf)
    }

    // -- connecting ---------------------------------------------------------

    /// Starts a non-blocking connect; with `tls` the handshake follows as
    /// soon as the transport opens. `timeout_ms == 0` uses
    /// [`DEFAULT_CONNECT_TIMEOUT_MS`].
    pub fn connect(
        &self,
        host: &str,
        port: u16,
        timeout_ms: u64,
        tls: Option<&TlsContext>,
    ) -> Result<(), ErrorCode> {
        let target = addr::resolve(host, port)?;
        let domain = if target.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
        let sock = socket2::Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
            .map_err(|_| ErrorCode::SocketCreate)?;
        sock.set_nonblocking(true)
            .map_err(|_| ErrorCode::SocketSetNonBlocking)?;
        match sock.connect(&SockAddr::from(target)) {
            Ok(()) => {}
            Err(err) if connect_in_progress(&err) => {}
            Err(err) => {
                warn!("connect to {}:{} failed: {}", host, port, err);
                return Err(ErrorCode::SocketConnect);
            }
        }
        let session = tls.map(|ctx| ctx.client_session(host)).transpose()?;
        let scheme = if session.is_some() { "ssl" } else { "tcp" };
        self.start_connecting(sock, session, addr::format_address(scheme, host, port), false, timeout_ms)
    }

    /// Connects to a Unix domain socket path.
    #[cfg(unix)]
    pub fn connect_unix(&self, path: &str, timeout_ms: u64) -> Result<(), ErrorCode> {
        let sock = socket2::Socket::new(Domain::UNIX, Type::STREAM, None)
            .map_err(|_| ErrorCode::SocketCreate)?;
        sock.set_nonblocking(true)
            .map_err(|_| ErrorCode::SocketSetNonBlocking)?;
        let target = SockAddr::unix(path).map_err(|_| ErrorCode::UriUnrecognized)?;
        match sock.connect(&target) {
            Ok(()) => {}
            Err(err) if connect_in_progress(&err) => {}
            Err(err) => {
                warn!("connect to {} failed: {}", path, err);
                return Err(ErrorCode::SocketConnect);
            }
        }
        self.start_connecting(sock, None, format!("unix://{}", path), true, timeout_ms)
    }

    fn start_connecting(
        &self,
        sock: socket2::Socket,
        tls: Option<TlsSession>,
        peer_address: String,
        is_unix: bool,
        timeout_ms: u64,
    ) -> Result<(), ErrorCode> {
        let event_loop = {
            let mut inner = self.inner.borrow_mut();
            inner.fd = os_socket(&sock);
            inner.sock = Some(sock);
            inner.status = SocketStatus::Connecting;
            inner.mask = EVENT_NONE;
            inner.is_unix = is_unix;
            inner.peer_address = peer_address;
            inner.tls = tls;
            Rc::clone(&inner.event_loop)
        };
        self.register(EVENT_WRITABLE)?;
        let timeout = if timeout_ms == 0 { DEFAULT_CONNECT_TIMEOUT_MS } else { timeout_ms };
        let weak = Rc::downgrade(&self.inner);
        let timer = event_loop.add_timer(timeout, 0, move || {
            if let Some(inner) = weak.upgrade() {
                Socket { inner }.on_connect_timeout();
            }
        });
        self.inner.borrow_mut().connect_timer = timer;
        Ok(())
    }

    fn register(&self, mask: EventMask) -> Result<(), ErrorCode> {
        let (event_loop, fd) = {
            let inner = self.inner.borrow();
            (Rc::clone(&inner.event_loop), inner.fd)
        };
        let weak = Rc::downgrade(&self.inner);
        let result = event_loop.add_event(fd, mask, move |_fd, events| {
            if let Some(inner) = weak.upgrade() {
                Socket { inner }.handle_event(events);
            }
        });
        if result.is_ok() {
            self.inner.borrow_mut().registered = true;
        }
        result
    }

    /// Re-subscribes the descriptor after an edge has been drained.
    fn rearm(&self, mask: EventMask) -> Result<(), ErrorCode> {
        let (event_loop, fd, live) = {
            let inner = self.inner.borrow();
            (
                Rc::clone(&inner.event_loop),
                inner.fd,
                inner.registered && inner.status != SocketStatus::Closed,
            )
        };
        if !live {
            return Ok(());
        }
        event_loop.rearm_event(fd, mask)
    }

    // -- event handling -----------------------------------------------------

    fn handle_event(&self, events: EventMask) {
        if self.inner.borrow().status == SocketStatus::Closed {
            return;
        }
        if events & EVENT_ERROR != 0 {
            self.set_error(ErrorCode::SocketClosedByPeer);
            return;
        }
        if events & EVENT_READABLE != 0 {
            self.inner.borrow_mut().mask |= EVENT_READABLE;
            self.readable();
        }
        if events & EVENT_WRITABLE != 0 {
            self.inner.borrow_mut().mask |= EVENT_WRITABLE;
            self.writable();
        }
    }

    fn read_route(&self) -> ReadRoute {
        let inner = self.inner.borrow();
        if inner.status != SocketStatus::Connected {
            return ReadRoute::Ignore;
        }
        match &inner.tls {
            None => ReadRoute::Plain,
            Some(session) if session.status == HandshakeStatus::Handshaking => ReadRoute::Handshake,
            Some(_) => ReadRoute::Tls,
        }
    }

    fn readable(&self) {
        match self.read_route() {
            ReadRoute::Ignore => {}
            ReadRoute::Plain => self.stream_readable(),
            ReadRoute::Handshake => self.tls_handshake(),
            ReadRoute::Tls => self.tls_readable(),
        }
    }

    fn writable(&self) {
        if self.inner.borrow().status == SocketStatus::Connecting {
            self.finish_connect();
            return;
        }
        match self.read_route() {
            ReadRoute::Ignore => {}
            ReadRoute::Plain => self.stream_writable(),
            ReadRoute::Handshake => self.tls_handshake(),
            ReadRoute::Tls => self.tls_writable(),
        }
    }

    fn finish_connect(&self) {
        if self.inner.borrow().mask & EVENT_WRITABLE == 0 {
            return;
        }
        let refused = {
            let inner = self.inner.borrow();
            match &inner.sock {
                Some(sock) => !matches!(sock.take_error(), Ok(None)),
                None => return,
            }
        };
        if refused {
            self.set_error(ErrorCode::SocketConnectionRefused);
        } else {
            self.open();
        }
    }

    fn open(&self) {
        let timer = {
            let mut inner = self.inner.borrow_mut();
            inner.status = SocketStatus::Connected;
            inner.mask |= EVENT_WRITABLE;
            std::mem::replace(&mut inner.connect_timer, INVALID_TIMER_ID)
        };
        let event_loop = self.event_loop();
        if timer != INVALID_TIMER_ID {
            event_loop.clear_timer(timer);
        }
        self.apply_stream_options();
        if self.rearm(EVENT_READABLE).is_err() {
            self.set_error(ErrorCode::EventLoopRegister);
            return;
        }
        debug!("socket({}) connected", self.peer_address());
        let on_connect = self.inner.borrow().on_connect.clone();
        on_connect.invoke(());
        if self.inner.borrow().status != SocketStatus::Connected {
            return;
        }
        if self.is_tls() {
            // Client hello goes out on the freshly opened transport.
            self.tls_handshake();
        } else if self.inner.borrow().wbuf.len() > 0 {
            self.stream_writable();
        }
    }

    fn on_connect_timeout(&self) {
        {
            let mut inner = self.inner.borrow_mut();
            inner.connect_timer = INVALID_TIMER_ID;
            if inner.status != SocketStatus::Connecting {
                return;
            }
        }
        self.set_error(ErrorCode::SocketConnectTimeout);
    }

    fn apply_stream_options(&self) {
        let inner = self.inner.borrow();
        if inner.is_unix {
            return;
        }
        if let Some(sock) = &inner.sock {
            if let Err(err) = sock.set_nodelay(true) {
                debug!("set_nodelay failed: {}", err);
            }
            let keepalive = TcpKeepalive::new()
                .with_time(Duration::from_millis(inner.keepalive_ms))
                .with_interval(Duration::from_millis(inner.keepalive_ms));
            if let Err(err) = sock.set_tcp_keepalive(&keepalive) {
                debug!("set_tcp_keepalive failed: {}", err);
            }
        }
    }

    // -- plain stream path ----------------------------------------------------

    fn stream_readable(&self) {
        let mut err = ErrorCode::Ok;
        let mut nread = 0usize;
        {
            let mut inner = self.inner.borrow_mut();
            let Inner { sock, rbuf, .. } = &mut *inner;
            let Some(sock) = sock.as_mut() else { return };
            loop {
                match rbuf.read_from(sock, READ_CHUNK) {
                    Ok(0) => {
                        err = ErrorCode::SocketClosedByPeer;
                        break;
                    }
                    Ok(n) => nread += n,
                    Err(e) if would_block(&e) => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(_) => {
                        err = ErrorCode::SocketRead;
                        break;
                    }
                }
            }
            inner.mask &= !EVENT_READABLE;
        }
        if nread > 0 {
            let on_read = self.inner.borrow().on_read.clone();
            on_read.invoke(());
        }
        if err.is_ok() && self.rearm(EVENT_READABLE).is_err() {
            err = ErrorCode::EventLoopRegister;
        }
        if !err.is_ok() {
            self.set_error(err);
        }
    }

    fn stream_writable(&self) {
        let mut err = ErrorCode::Ok;
        let mut wrote = false;
        let need_arm;
        {
            let mut inner = self.inner.borrow_mut();
            if inner.status != SocketStatus::Connected {
                return;
            }
            let Inner { sock, wbuf, mask, .. } = &mut *inner;
            let Some(sock) = sock.as_mut() else { return };
            while !wbuf.is_empty() {
                match sock.write(wbuf.data()) {
                    Ok(0) => {
                        err = ErrorCode::SocketWrite;
                        break;
                    }
                    Ok(n) => {
                        wbuf.consume(n);
                        wrote = true;
                    }
                    Err(e) if would_block(&e) => {
                        *mask &= !EVENT_WRITABLE;
                        break;
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(_) => {
                        err = ErrorCode::SocketWrite;
                        break;
                    }
                }
            }
            need_arm = err.is_ok() && !wbuf.is_empty();
        }
        if wrote {
            let on_write = self.inner.borrow().on_write.clone();
            on_write.invoke(());
        }
        if need_arm && self.rearm(EVENT_WRITABLE).is_err() {
            err = ErrorCode::EventLoopRegister;
        }
        if !err.is_ok() {
            self.set_error(err);
        }
    }

    /// Queues (and opportunistically sends) `data`. Bytes written before a
    /// connection is up are flushed when it opens.
    pub fn write(&self, data: &[u8]) -> Result<(), ErrorCode> {
        if data.is_empty() {
            return Ok(());
        }
        let action = {
            let mut inner = self.inner.borrow_mut();
            if inner.status == SocketStatus::Closed || inner.mask & EVENT_ERROR != 0 {
                return Err(ErrorCode::SocketClosed);
            }
            if inner.tls.is_some() {
                // Plaintext always stages through the buffer; the session
                // frames it once established.
                inner.wbuf.append(data);
                let established = matches!(
                    inner.tls,
                    Some(TlsSession { status: HandshakeStatus::Established, .. })
                );
                if established { 1 } else { 0 }
            } else if inner.status != SocketStatus::Connected {
                inner.wbuf.append(data);
                0
            } else if inner.mask & EVENT_WRITABLE != 0 && inner.wbuf.is_empty() {
                inner.wbuf.append(data);
                2
            } else {
                inner.wbuf.append(data);
                if inner.mask & EVENT_WRITABLE != 0 { 2 } else { 0 }
            }
        };
        match action {
            1 => self.tls_writable(),
            2 => self.stream_writable(),
            _ => {}
        }
        Ok(())
    }

    // -- TLS path -------------------------------------------------------------

    fn tls_handshake(&self) {
        let mut err = ErrorCode::Ok;
        let mut established = false;
        let mut arm = EVENT_NONE;
        {
            let mut inner = self.inner.borrow_mut();
            if inner.status != SocketStatus::Connected {
                return;
            }
            let Inner { sock, tls, mask, .. } = &mut *inner;
            let (Some(sock), Some(tls)) = (sock.as_mut(), tls.as_mut()) else {
                return;
            };
            loop {
                if !tls.conn.is_handshaking() {
                    established = true;
                    break;
                }
                if tls.conn.wants_write() {
                    match tls.conn.write_tls(sock) {
                        Ok(_) => continue,
                        Err(e) if would_block(&e) => {
                            *mask &= !EVENT_WRITABLE;
                            arm |= EVENT_WRITABLE;
                            break;
                        }
                        Err(_) => {
                            err = ErrorCode::TlsHandshake;
                            break;
                        }
                    }
                }
                if tls.conn.wants_read() {
                    match tls.conn.read_tls(sock) {
                        Ok(0) => {
                            err = ErrorCode::SocketClosedByPeer;
                            break;
                        }
                        Ok(_) => {
                            if tls.conn.process_new_packets().is_err() {
                                err = ErrorCode::TlsHandshake;
                            }
                            if !err.is_ok() {
                                break;
                            }
                            continue;
                        }
                        Err(e) if would_block(&e) => {
                            *mask &= !EVENT_READABLE;
                            arm |= EVENT_READABLE;
                            break;
                        }
                        Err(_) => {
                            err = ErrorCode::SocketRead;
                            break;
                        }
                    }
                }
            }
            if established {
                tls.status = HandshakeStatus::Established;
            }
        }
        if err.is_ok() && arm != EVENT_NONE && self.rearm(arm).is_err() {
            err = ErrorCode::EventLoopRegister;
        }
        if !err.is_ok() {
            self.set_error(err);
            return;
        }
        if established {
            debug!("socket({}) TLS session established", self.peer_address());
            let on_established = self.inner.borrow().on_established.clone();
            on_established.invoke(());
            if self.inner.borrow().status != SocketStatus::Connected {
                return;
            }
            self.tls_writable();
            self.tls_readable();
        }
    }

    fn tls_readable(&self) {
        let mut err = ErrorCode::Ok;
        let mut nread = 0usize;
        {
            let mut inner = self.inner.borrow_mut();
            if inner.status != SocketStatus::Connected {
                return;
            }
            let Inner { sock, tls, rbuf, mask, .. } = &mut *inner;
            let (Some(sock), Some(tls)) = (sock.as_mut(), tls.as_mut()) else {
                return;
            };
            'transport: loop {
                match tls.conn.read_tls(sock) {
                    Ok(0) => {
                        err = ErrorCode::SocketClosedByPeer;
                        break;
                    }
                    Ok(_) => {
                        if tls.conn.process_new_packets().is_err() {
                            err = ErrorCode::TlsProtocol;
                            break;
                        }
                        loop {
                            let room = rbuf.prepare(READ_CHUNK);
                            match tls.conn.reader().read(room) {
                                Ok(0) => {
                                    err = ErrorCode::SocketClosedByPeer;
                                    break 'transport;
                                }
                                Ok(n) => {
                                    rbuf.commit(n);
                                    nread += n;
                                }
                                Err(e) if would_block(&e) => break,
                                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                                    err = ErrorCode::SocketClosedByPeer;
                                    break 'transport;
                                }
                                Err(_) => {
                                    err = ErrorCode::TlsProtocol;
                                    break 'transport;
                                }
                            }
                        }
                    }
                    Err(e) if would_block(&e) => {
                        *mask &= !EVENT_READABLE;
                        break;
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(_) => {
                        err = ErrorCode::SocketRead;
                        break;
                    }
                }
            }
        }
        if nread > 0 {
            let on_read = self.inner.borrow().on_read.clone();
            on_read.invoke(());
        }
        if err.is_ok() && self.rearm(EVENT_READABLE).is_err() {
            err = ErrorCode::EventLoopRegister;
        }
        if !err.is_ok() {
            self.set_error(err);
        }
    }

    fn tls_writable(&self) {
        let mut err = ErrorCode::Ok;
        let need_arm;
        {
            let mut inner = self.inner.borrow_mut();
            if inner.status != SocketStatus::Connected {
                return;
            }
            let Inner { sock, tls, wbuf, mask, .. } = &mut *inner;
            let (Some(sock), Some(tls)) = (sock.as_mut(), tls.as_mut()) else {
                return;
            };
            while !wbuf.is_empty() {
                match tls.conn.writer().write(wbuf.data()) {
                    Ok(0) => break,
                    Ok(n) => wbuf.consume(n),
                    Err(_) => {
                        err = ErrorCode::TlsProtocol;
                        break;
                    }
                }
            }
            let mut blocked = false;
            while err.is_ok() && tls.conn.wants_write() {
                match tls.conn.write_tls(sock) {
                    Ok(_) => {}
                    Err(e) if would_block(&e) => {
                        *mask &= !EVENT_WRITABLE;
                        blocked = true;
                        break;
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(_) => {
                        err = ErrorCode::SocketWrite;
                        break;
                    }
                }
            }
            need_arm = err.is_ok() && (blocked || !wbuf.is_empty());
        }
        if need_arm && self.rearm(EVENT_WRITABLE).is_err() {
            err = ErrorCode::EventLoopRegister;
        }
        if !err.is_ok() {
            self.set_error(err);
        }
    }

    // -- teardown -------------------------------------------------------------

    /// Latches the terminal error state and notifies once. The owner is
    /// expected to close the socket in response.
    pub(crate) fn set_error(&self, err: ErrorCode) {
        let on_error = {
            let mut inner = self.inner.borrow_mut();
            if inner.mask & EVENT_ERROR != 0 {
                return;
            }
            inner.mask |= EVENT_ERROR;
            inner.on_error.clone()
        };
        debug!("socket({}) error: {}", self.peer_address(), err);
        on_error.invoke(err);
    }

    /// Idempotent: unregisters, drops the descriptor, clears buffers and
    /// fires the close callback exactly once.
    pub fn close(&self) {
        let (on_close, timer, fd, registered, event_loop, sock) = {
            let mut inner = self.inner.borrow_mut();
            if inner.status == SocketStatus::Closed {
                return;
            }
            inner.status = SocketStatus::Closed;
            inner.rbuf.clear();
            inner.wbuf.clear();
            inner.tls = None;
            let timer = std::mem::replace(&mut inner.connect_timer, INVALID_TIMER_ID);
            let registered = std::mem::replace(&mut inner.registered, false);
            (
                inner.on_close.clone(),
                timer,
                inner.fd,
                registered,
                Rc::clone(&inner.event_loop),
                inner.sock.take(),
            )
        };
        if timer != INVALID_TIMER_ID {
            event_loop.clear_timer(timer);
        }
        if registered {
            event_loop.clear_event(fd, EVENT_FULL_MASK);
        }
        drop(sock);
        on_close.invoke(());
    }
}
