//! Listening endpoint plus a registry of accepted channels.
//!
//! `SocketServer` binds a listen URL, wraps every accepted socket in a
//! [`SocketChannel`] and keeps the channels in an id-keyed registry. A
//! channel's removal from the registry is deferred to the next task tick,
//! so a close from inside a channel callback never mutates the registry
//! while the server (or a caller) is iterating it.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use log::{info, warn};

use super::addr;
use super::channel::SocketChannel;
use super::event_loop::EventLoop;
use super::listener::Listener;
use super::tls::TlsContext;
use crate::callback::Callback;
use crate::error::ErrorCode;
use crate::types::ChannelId;

/// Server configuration; immutable once passed to `start`.
#[derive(Clone, Debug)]
pub struct ServerOptions {
    pub name: String,
    /// Listen endpoint: `tcp://host:port`, `ssl://host:port` or
    /// `unix://path`. `*` binds all interfaces, port 0 asks the kernel.
    pub url: String,
    /// PEM certificate chain and key; required for TLS schemes.
    pub tls_cert_file: Option<String>,
    pub tls_key_file: Option<String>,
    /// When the configured port is taken, probe up to this many successors
    /// before giving up. 0 disables probing.
    pub port_probe_limit: u16,
    /// TCP keepalive interval for accepted connections; 0 keeps the
    /// socket-level default.
    pub keepalive_ms: u64,
    /// `SO_REUSEPORT` on the listening socket.
    pub reuse_port: bool,
    /// With an IPv6 bind address, restrict the socket to IPv6 traffic.
    pub ipv6_only: bool,
    pub debug: bool,
}

impl Default for ServerOptions {
    fn default() -> Self {
        ServerOptions {
            name: String::new(),
            url: String::new(),
            tls_cert_file: None,
            tls_key_file: None,
            port_probe_limit: 0,
            keepalive_ms: 0,
            reuse_port: true,
            ipv6_only: false,
            debug: false,
        }
    }
}

struct Inner {
    event_loop: Rc<EventLoop>,
    options: ServerOptions,
    listener: Option<Listener>,
    started: bool,
    channels: HashMap<ChannelId, SocketChannel>,
    on_channel: Callback<SocketChannel>,
}

#[derive(Clone)]
pub struct SocketServer {
    inner: Rc<RefCell<Inner>>,
}

impl SocketServer {
    pub fn new(event_loop: Rc<EventLoop>) -> SocketServer {
        SocketServer {
            inner: Rc::new(RefCell::new(Inner {
                event_loop,
                options: ServerOptions::default(),
                listener: None,
                started: false,
                channels: HashMap::new(),
                on_channel: Callback::new(),
            })),
        }
    }

    /// Runs once per accepted connection with the registered channel; the
    /// receiver wires read/error/close callbacks here.
    pub fn set_channel_callback(&self, f: impl FnMut(SocketChannel) + 'static) {
        self.inner.borrow().on_channel.set(f);
    }

    pub fn is_started(&self) -> bool {
        self.inner.borrow().started
    }

    pub fn channel_count(&self) -> usize {
        self.inner.borrow().channels.len()
    }

    pub fn channel(&self, id: ChannelId) -> Option<SocketChannel> {
        self.inner.borrow().channels.get(&id).cloned()
    }

    /// The bound port, once started (resolves port 0).
    pub fn local_port(&self) -> u16 {
        self.inner
            .borrow()
            .listener
            .as_ref()
            .map_or(0, Listener::local_port)
    }

    pub fn start(&self, options: ServerOptions) -> Result<(), ErrorCode> {
        if self.inner.borrow().started {
            return Err(ErrorCode::ServerStarted);
        }
        let parsed = addr::parse_address(&options.url)?;
        let tls = if parsed.is_tls() {
            let cert = options.tls_cert_file.as_deref().ok_or(ErrorCode::TlsLoadCertificate)?;
            let key = options.tls_key_file.as_deref().ok_or(ErrorCode::TlsLoadKey)?;
            Some(TlsContext::server_from_files(cert, key)?)
        } else {
            None
        };
        let event_loop = Rc::clone(&self.inner.borrow().event_loop);
        let listener = Listener::new(event_loop);
        listener.set_reuse_port(options.reuse_port);
        listener.set_ipv6_only(options.ipv6_only);
        if options.keepalive_ms > 0 {
            listener.set_keepalive_ms(options.keepalive_ms);
        }
        let weak = Rc::downgrade(&self.inner);
        listener.set_accept_callback(move |socket| {
            if let Some(inner) = weak.upgrade() {
                SocketServer { inner }.on_accepted(socket);
            }
        });
        self.listen_with_probing(&listener, &parsed, tls, options.port_probe_limit)?;
        info!("server {} started on {}", options.name, listener.address());
        let mut inner = self.inner.borrow_mut();
        inner.options = options;
        inner.listener = Some(listener);
        inner.started = true;
        Ok(())
    }

    fn listen_with_probing(
        &self,
        listener: &Listener,
        parsed: &addr::ParsedAddress,
        tls: Option<TlsContext>,
        probe_limit: u16,
    ) -> Result<(), ErrorCode> {
        let mut last = ErrorCode::SocketBind;
        for offset in 0..=probe_limit {
            let port = parsed.port.wrapping_add(offset);
            let url = if parsed.is_unix() {
                format!("unix://{}", parsed.host)
            } else {
                addr::format_address(&parsed.scheme, &parsed.host, port)
            };
            match listener.listen(&url, tls.clone()) {
                Ok(()) => return Ok(()),
                Err(ErrorCode::SocketBind) if !parsed.is_unix() && offset < probe_limit => {
                    warn!("port {} taken, probing {}", port, port.wrapping_add(1));
                    last = ErrorCode::SocketBind;
                }
                Err(err) => return Err(err),
            }
        }
        Err(last)
    }

    fn on_accepted(&self, socket: super::socket::Socket) {
        let channel = SocketChannel::from_accepted(socket);
        let id = channel.id();
        let weak = Rc::downgrade(&self.inner);
        channel.set_removed_hook(move |id| {
            if let Some(inner) = weak.upgrade() {
                inner.borrow_mut().channels.remove(&id);
            }
        });
        let on_channel = {
            let mut inner = self.inner.borrow_mut();
            inner.channels.insert(id, channel.clone());
            inner.on_channel.clone()
        };
        on_channel.invoke(channel);
    }

    /// Stops accepting and closes every registered channel.
    pub fn stop(&self) {
        let (listener, channels) = {
            let mut inner = self.inner.borrow_mut();
            if !inner.started {
                return;
            }
            inner.started = false;
            (
                inner.listener.take(),
                inner.channels.values().cloned().collect::<Vec<_>>(),
            )
        };
        if let Some(listener) = listener {
            listener.close();
        }
        for channel in channels {
            channel.close(ErrorCode::Ok);
        }
        self.inner.borrow_mut().channels.clear();
        info!("server {} stopped", self.inner.borrow().options.name);
    }
}
