//! Accepting side of a listen endpoint.
//!
//! A `Listener` binds a `tcp://`, `ssl://` or `unix://` URL, subscribes its
//! descriptor for readable edges and drains `accept` until it would block,
//! handing each new connection to the accept callback as a fully registered
//! [`Socket`]. With a server TLS context every accepted socket starts its
//! handshake off the peer's first bytes.

use std::cell::RefCell;
use std::rc::Rc;

use log::{debug, info, warn};
use socket2::{Domain, Protocol, SockAddr, Type};

use super::addr::{self, ParsedAddress};
use super::event_loop::EventLoop;
use super::socket::{Socket, DEFAULT_KEEPALIVE_MS};
use super::tls::TlsContext;
use super::{EVENT_FULL_MASK, EVENT_READABLE};
use crate::callback::Callback;
use crate::error::ErrorCode;
use crate::types::{os_socket, OsSocket};

/// Pending-connection backlog handed to `listen(2)`.
const LISTEN_BACKLOG: i32 = 511;

struct Inner {
    event_loop: Rc<EventLoop>,
    sock: Option<socket2::Socket>,
    fd: OsSocket,
    registered: bool,
    address: String,
    is_unix: bool,
    local_port: u16,
    reuse_port: bool,
    ipv6_only: bool,
    keepalive_ms: u64,
    tls: Option<TlsContext>,
    on_accept: Callback<Socket>,
    on_error: Callback<ErrorCode>,
}

#[derive(Clone)]
pub struct Listener {
    inner: Rc<RefCell<Inner>>,
}

impl Listener {
    pub fn new(event_loop: Rc<EventLoop>) -> Listener {
        Listener {
            inner: Rc::new(RefCell::new(Inner {
                event_loop,
                sock: None,
                fd: 0,
                registered: false,
                address: String::new(),
                is_unix: false,
                local_port: 0,
                reuse_port: true,
                ipv6_only: false,
                keepalive_ms: DEFAULT_KEEPALIVE_MS,
                tls: None,
                on_accept: Callback::new(),
                on_error: Callback::new(),
            })),
        }
    }

    /// Runs for every accepted connection with the new socket; the receiver
    /// wires its callbacks before the next loop pass delivers data.
    pub fn set_accept_callback(&self, f: impl FnMut(Socket) + 'static) {
        self.inner.borrow().on_accept.set(f);
    }

    pub fn set_error_callback(&self, f: impl FnMut(ErrorCode) + 'static) {
        self.inner.borrow().on_error.set(f);
    }

    /// Toggles `SO_REUSEPORT` on the bound socket. Takes effect on the
    /// next `listen`; enabled by default.
    pub fn set_reuse_port(&self, on: bool) {
        self.inner.borrow_mut().reuse_port = on;
    }

    /// Restricts an IPv6 bind to IPv6 traffic only. Takes effect on the
    /// next `listen`; dual-stack by default.
    pub fn set_ipv6_only(&self, on: bool) {
        self.inner.borrow_mut().ipv6_only = on;
    }

    /// TCP keepalive interval handed to accepted sockets.
    pub fn set_keepalive_ms(&self, ms: u64) {
        self.inner.borrow_mut().keepalive_ms = ms;
    }

    /// Binds `url` and starts accepting. A TLS scheme requires a server-side
    /// `tls` context; accepted sockets then handshake before surfacing data.
    pub fn listen(&self, url: &str, tls: Option<TlsContext>) -> Result<(), ErrorCode> {
        if self.inner.borrow().sock.is_some() {
            return Err(ErrorCode::InvalidArgument);
        }
        let parsed = addr::parse_address(url)?;
        if parsed.is_tls() && !tls.as_ref().is_some_and(TlsContext::is_server) {
            return Err(ErrorCode::InvalidArgument);
        }
        let sock = if parsed.is_unix() {
            Self::bind_unix(&parsed)?
        } else {
            let (reuse_port, ipv6_only) = {
                let inner = self.inner.borrow();
                (inner.reuse_port, inner.ipv6_only)
            };
            Self::bind_tcp(&parsed, reuse_port, ipv6_only)?
        };
        let local_port = if parsed.is_unix() {
            0
        } else {
            sock.local_addr()
                .ok()
                .and_then(|a| a.as_socket())
                .map_or(parsed.port, |a| a.port())
        };
        let address = if parsed.is_unix() {
            format!("unix://{}", parsed.host)
        } else {
            addr::format_address(&parsed.scheme, &parsed.host, local_port)
        };
        {
            let mut inner = self.inner.borrow_mut();
            inner.fd = os_socket(&sock);
            inner.sock = Some(sock);
            inner.is_unix = parsed.is_unix();
            inner.local_port = local_port;
            inner.address = address.clone();
            inner.tls = tls;
        }
        self.register()?;
        info!("listening on {}", address);
        Ok(())
    }

    fn bind_tcp(
        parsed: &ParsedAddress,
        reuse_port: bool,
        ipv6_only: bool,
    ) -> Result<socket2::Socket, ErrorCode> {
        let target = addr::resolve(&parsed.host, parsed.port)?;
        let domain = if target.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
        let sock = socket2::Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
            .map_err(|_| ErrorCode::SocketCreate)?;
        sock.set_reuse_address(true)
            .map_err(|_| ErrorCode::SocketReuseAddr)?;
        #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
        if reuse_port {
            sock.set_reuse_port(true)
                .map_err(|_| ErrorCode::SocketReusePort)?;
        }
        #[cfg(not(all(unix, not(any(target_os = "solaris", target_os = "illumos")))))]
        let _ = reuse_port;
        if target.is_ipv6() {
            sock.set_only_v6(ipv6_only)
                .map_err(|_| ErrorCode::SocketSetIpv6Only)?;
        }
        sock.set_nonblocking(true)
            .map_err(|_| ErrorCode::SocketSetNonBlocking)?;
        sock.bind(&SockAddr::from(target))
            .map_err(|_| ErrorCode::SocketBind)?;
        sock.listen(LISTEN_BACKLOG)
            .map_err(|_| ErrorCode::SocketListen)?;
        Ok(sock)
    }

    #[cfg(unix)]
    fn bind_unix(parsed: &ParsedAddress) -> Result<socket2::Socket, ErrorCode> {
        // A stale socket file from a previous run blocks the bind.
        let _ = std::fs::remove_file(&parsed.host);
        let sock = socket2::Socket::new(Domain::UNIX, Type::STREAM, None)
            .map_err(|_| ErrorCode::SocketCreate)?;
        sock.set_nonblocking(true)
            .map_err(|_| ErrorCode::SocketSetNonBlocking)?;
        let target = SockAddr::unix(&parsed.host).map_err(|_| ErrorCode::UriUnrecognized)?;
        sock.bind(&target).map_err(|_| ErrorCode::SocketBind)?;
        sock.listen(LISTEN_BACKLOG)
            .map_err(|_| ErrorCode::SocketListen)?;
        Ok(sock)
    }

    #[cfg(windows)]
    fn bind_unix(_parsed: &ParsedAddress) -> Result<socket2::Socket, ErrorCode> {
        Err(ErrorCode::UriUnrecognized)
    }

    fn register(&self) -> Result<(), ErrorCode> {
        let (event_loop, fd) = {
            let inner = self.inner.borrow();
            (Rc::clone(&inner.event_loop), inner.fd)
        };
        let weak = Rc::downgrade(&self.inner);
        let result = event_loop.add_event(fd, EVENT_READABLE, move |_fd, _mask| {
            if let Some(inner) = weak.upgrade() {
                Listener { inner }.handle_accept();
            }
        });
        if result.is_ok() {
            self.inner.borrow_mut().registered = true;
        }
        result
    }

    /// The canonical `scheme://host:port` this listener is bound to.
    pub fn address(&self) -> String {
        self.inner.borrow().address.clone()
    }

    /// The bound TCP port; resolves port 0 to the kernel-assigned one.
    pub fn local_port(&self) -> u16 {
        self.inner.borrow().local_port
    }

    pub fn is_listening(&self) -> bool {
        self.inner.borrow().sock.is_some()
    }

    fn handle_accept(&self) {
        let mut accepted = Vec::new();
        {
            let inner = self.inner.borrow();
            let Some(sock) = &inner.sock else { return };
            loop {
                match sock.accept() {
                    Ok((conn, peer)) => {
                        let peer_address = match peer.as_socket() {
                            Some(a) => {
                                let scheme = if inner.tls.is_some() { "ssl" } else { "tcp" };
                                addr::format_address(scheme, &a.ip().to_string(), a.port())
                            }
                            None => inner.address.clone(),
                        };
                        accepted.push((conn, peer_address));
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        // Transient accept failures (EMFILE and friends) are
                        // logged and retried on the next edge.
                        warn!("accept on {} failed: {}", inner.address, e);
                        break;
                    }
                }
            }
        }
        let (event_loop, fd, is_unix, keepalive_ms, tls, on_accept) = {
            let inner = self.inner.borrow();
            (
                Rc::clone(&inner.event_loop),
                inner.fd,
                inner.is_unix,
                inner.keepalive_ms,
                inner.tls.clone(),
                inner.on_accept.clone(),
            )
        };
        for (conn, peer_address) in accepted {
            debug!("accepted connection from {}", peer_address);
            match Socket::from_accepted(
                Rc::clone(&event_loop),
                conn,
                peer_address,
                is_unix,
                keepalive_ms,
                tls.as_ref(),
            ) {
                Ok(socket) => on_accept.invoke(socket),
                Err(err) => {
                    warn!("failed to set up accepted connection: {}", err);
                    let on_error = self.inner.borrow().on_error.clone();
                    on_error.invoke(err);
                }
            }
        }
        if self.inner.borrow().sock.is_some() {
            if let Err(err) = self.inner.borrow().event_loop.rearm_event(fd, EVENT_READABLE) {
                let on_error = self.inner.borrow().on_error.clone();
                on_error.invoke(err);
            }
        }
    }

    /// Stops accepting and releases the descriptor. Already-accepted
    /// sockets are unaffected.
    pub fn close(&self) {
        let (event_loop, fd, registered, sock, is_unix, address) = {
            let mut inner = self.inner.borrow_mut();
            let registered = std::mem::replace(&mut inner.registered, false);
            (
                Rc::clone(&inner.event_loop),
                inner.fd,
                registered,
                inner.sock.take(),
                inner.is_unix,
                inner.address.clone(),
            )
        };
        if sock.is_none() {
            return;
        }
        if registered {
            event_loop.clear_event(fd, EVENT_FULL_MASK);
        }
        drop(sock);
        #[cfg(unix)]
        if is_unix {
            if let Some(path) = address.strip_prefix("unix://") {
                let _ = std::fs::remove_file(path);
            }
        }
        #[cfg(not(unix))]
        let _ = (is_unix, address);
    }
}
