//! Reliable, flow-controlled messaging over the RPC transport.
//!
//! A [`TdcChannel`] delivers application messages to a logical peer name:
//! it resolves the name through the [`NamingResolver`], opens an RPC stub
//! to the resolved address, and pushes queued messages into flight under a
//! sliding window. The window starts at 1 and doubles on every
//! acknowledgment up to [`MAX_WINDOW`]; acknowledgments must arrive in
//! send order (a mismatch is fatal for the whole channel). A "service
//! moved" response rewinds the in-flight cursor, re-resolves the name and
//! resends with quadratic backoff; a transport error resets the channel to
//! `Init` and fails every queued message back to its caller.
//!
//! [`TdcService`] is the hosting side: it answers inbound transfers
//! through an [`RpcServer`], keeps outbound channels by peer name, and
//! periodically re-registers its own listen address in the naming service.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use log::{debug, error, info, warn};

use crate::error::ErrorCode;
use crate::naming::{NamingResolver, METHOD_NAMING};
use crate::net::channel::ChannelOptions;
use crate::net::event_loop::EventLoop;
use crate::net::server::ServerOptions;
use crate::rpc::{RpcChannel, RpcServer, RpcService};
use crate::types::{TimerId, INVALID_TIMER_ID};

/// Method id message transfers travel under.
pub const METHOD_TDC_TRANSFER: u32 = 2;

/// Queue length at which the channel fails hard.
pub const MAX_QUEUE_SIZE: usize = 100_000;

/// In-flight window cap.
pub const MAX_WINDOW: usize = 16;

/// Resend ceiling after "service moved" responses.
pub const MAX_RESEND: u32 = 3;

/// Backoff cap for resend scheduling.
pub const MAX_RESEND_DELAY_MS: u64 = 10_000;

/// How often a service re-registers its address with the naming service.
pub const REGISTER_INTERVAL_MS: u64 = 10_000;

pub type TdcResult = Result<Vec<u8>, ErrorCode>;
pub type TdcCallback = Box<dyn FnOnce(TdcResult)>;

// -- transfer codec -------------------------------------------------------------

/// `guid` (i64 LE) + u16 length-prefixed sender name + raw body.
pub fn encode_transfer(guid: i64, sender: &str, body: &[u8]) -> Vec<u8> {
    let name_len = sender.len().min(u16::MAX as usize) as u16;
    let mut out = Vec::with_capacity(10 + name_len as usize + body.len());
    out.extend_from_slice(&guid.to_le_bytes());
    out.extend_from_slice(&name_len.to_le_bytes());
    out.extend_from_slice(&sender.as_bytes()[..name_len as usize]);
    out.extend_from_slice(body);
    out
}

pub fn decode_transfer(payload: &[u8]) -> Result<(i64, String, Vec<u8>), ErrorCode> {
    if payload.len() < 10 {
        return Err(ErrorCode::RpcDecodeError);
    }
    let guid = i64::from_le_bytes([
        payload[0], payload[1], payload[2], payload[3], payload[4], payload[5], payload[6],
        payload[7],
    ]);
    let name_len = u16::from_le_bytes([payload[8], payload[9]]) as usize;
    if payload.len() < 10 + name_len {
        return Err(ErrorCode::RpcDecodeError);
    }
    let sender = std::str::from_utf8(&payload[10..10 + name_len])
        .map_err(|_| ErrorCode::RpcDecodeError)?
        .to_string();
    Ok((guid, sender, payload[10 + name_len..].to_vec()))
}

// -- message queue ----------------------------------------------------------------

struct TdcMessage {
    guid: i64,
    body: Vec<u8>,
    done: TdcCallback,
}

/// Ordered send queue with two regions: `[0..next)` is sent-but-unacked,
/// `[next..len)` is not yet sent. Acknowledgments pop the front; a rewind
/// moves everything back into the unsent region without losing messages.
#[derive(Default)]
struct TdcMessageQueue {
    messages: Vec<TdcMessage>,
    next: usize,
}

impl TdcMessageQueue {
    fn push(&mut self, msg: TdcMessage) {
        self.messages.push(msg);
    }

    /// Total queued messages.
    fn size(&self) -> usize {
        self.messages.len()
    }

    /// Sent-but-unacked count.
    fn lsize(&self) -> usize {
        self.next
    }

    /// Not-yet-sent count.
    fn rsize(&self) -> usize {
        self.messages.len() - self.next
    }

    /// Marks the next unsent message as in flight.
    fn advance(&mut self) -> Option<(i64, Vec<u8>)> {
        let msg = self.messages.get(self.next)?;
        let out = (msg.guid, msg.body.clone());
        self.next += 1;
        Some(out)
    }

    fn front_guid(&self) -> Option<i64> {
        if self.next == 0 {
            None
        } else {
            self.messages.first().map(|m| m.guid)
        }
    }

    /// Removes the acknowledged head of the in-flight region.
    fn pop(&mut self) -> Option<TdcMessage> {
        if self.next == 0 {
            return None;
        }
        self.next -= 1;
        Some(self.messages.remove(0))
    }

    /// Everything in flight becomes unsent again; nothing is lost.
    fn rewind(&mut self) {
        self.next = 0;
    }

    /// Drains the whole queue, sent and unsent alike.
    fn take_all(&mut self) -> Vec<TdcMessage> {
        self.next = 0;
        std::mem::take(&mut self.messages)
    }
}

// -- stub seam ----------------------------------------------------------------------

/// Transport for one resolved peer address. The default implementation
/// rides an [`RpcChannel`]; tests substitute scripted stubs.
pub trait TdcStub {
    fn transfer(&self, guid: i64, sender: &str, body: &[u8], done: TdcCallback);
}

struct RpcTdcStub {
    rpc: RpcChannel,
}

impl TdcStub for RpcTdcStub {
    fn transfer(&self, guid: i64, sender: &str, body: &[u8], done: TdcCallback) {
        let payload = encode_transfer(guid, sender, body);
        let slot = Rc::new(RefCell::new(Some(done)));
        let cb_slot = Rc::clone(&slot);
        let result = self.rpc.call(METHOD_TDC_TRANSFER, &payload, move |result| {
            if let Some(done) = cb_slot.borrow_mut().take() {
                done(result);
            }
        });
        if let Err(err) = result {
            if let Some(done) = slot.borrow_mut().take() {
                done(Err(err));
            }
        }
    }
}

pub type TdcStubFactory = Box<dyn Fn(&str) -> Result<Rc<dyn TdcStub>, ErrorCode>>;

// -- channel ------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TdcState {
    Init,
    Resolving,
    Resolved,
}

struct ChannelInner {
    event_loop: Rc<EventLoop>,
    name: String,
    full_name: String,
    sender: String,
    resolver: NamingResolver,
    stub_factory: TdcStubFactory,
    stub: Option<Rc<dyn TdcStub>>,
    state: TdcState,
    queue: TdcMessageQueue,
    window: usize,
    retry_count: u32,
    resend_timer: TimerId,
}

#[derive(Clone)]
pub struct TdcChannel {
    inner: Rc<RefCell<ChannelInner>>,
}

/// Prefixes `name` with `namespace` unless it already is.
fn qualify(namespace: &str, name: &str) -> String {
    if namespace.is_empty() || name.starts_with(&format!("{}.", namespace)) {
        name.to_string()
    } else {
        format!("{}.{}", namespace, name)
    }
}

impl TdcChannel {
    pub fn new(
        event_loop: Rc<EventLoop>,
        name: &str,
        namespace: &str,
        sender: &str,
        resolver: NamingResolver,
        stub_factory: TdcStubFactory,
    ) -> TdcChannel {
        TdcChannel {
            inner: Rc::new(RefCell::new(ChannelInner {
                event_loop,
                name: name.to_string(),
                full_name: qualify(namespace, name),
                sender: qualify(namespace, sender),
                resolver,
                stub_factory,
                stub: None,
                state: TdcState::Init,
                queue: TdcMessageQueue::default(),
                window: 1,
                retry_count: 0,
                resend_timer: INVALID_TIMER_ID,
            })),
        }
    }

    pub fn name(&self) -> String {
        self.inner.borrow().name.clone()
    }

    pub fn state(&self) -> TdcState {
        self.inner.borrow().state
    }

    pub fn window(&self) -> usize {
        self.inner.borrow().window
    }

    pub fn queue_size(&self) -> usize {
        self.inner.borrow().queue.size()
    }

    pub fn in_flight(&self) -> usize {
        self.inner.borrow().queue.lsize()
    }

    /// Enqueues one message; delivery order is enqueue order. The callback
    /// runs exactly once with the peer's response or the channel error.
    pub fn send_msg(&self, body: &[u8], done: impl FnOnce(TdcResult) + 'static) {
        let overflow = {
            let mut inner = self.inner.borrow_mut();
            let guid = inner.event_loop.new_unique_id();
            inner.queue.push(TdcMessage {
                guid,
                body: body.to_vec(),
                done: Box::new(done),
            });
            inner.queue.size() >= MAX_QUEUE_SIZE
        };
        if overflow {
            // Backpressure failure is channel-fatal, not per-message.
            self.handle_error(ErrorCode::TdcMessageQueueOverflow);
            return;
        }
        self.update();
    }

    /// Drives the channel forward from its current state.
    pub fn update(&self) {
        match self.state() {
            TdcState::Init => self.resolve(),
            TdcState::Resolving => {}
            TdcState::Resolved => self.send(),
        }
    }

    fn resolve(&self) {
        let (resolver, full_name) = {
            let mut inner = self.inner.borrow_mut();
            if inner.queue.size() == 0 {
                return;
            }
            inner.state = TdcState::Resolving;
            (inner.resolver.clone(), inner.full_name.clone())
        };
        debug!("resolving {}", full_name);
        let this = self.clone();
        resolver.get(&full_name, move |result| this.after_resolved(result));
    }

    fn after_resolved(&self, result: crate::naming::NamingResult) {
        let reply = match result {
            Ok(reply) => reply,
            Err(err) => {
                self.handle_error(err);
                return;
            }
        };
        if reply.err != 0 {
            let err = ErrorCode::from_code(reply.err).unwrap_or(ErrorCode::TnsNameNotFound);
            self.handle_error(err);
            return;
        }
        // The reply value must be a connectable scheme://host:port string.
        if crate::net::addr::parse_address(&reply.value).is_err() {
            self.handle_error(ErrorCode::TnsUnrecognizedFormat);
            return;
        }
        let stub = {
            let inner = self.inner.borrow();
            (inner.stub_factory)(&reply.value)
        };
        let stub = match stub {
            Ok(stub) => stub,
            Err(err) => {
                self.handle_error(err);
                return;
            }
        };
        {
            let mut inner = self.inner.borrow_mut();
            debug!("{} resolved to {}", inner.full_name, reply.value);
            inner.stub = Some(stub);
            inner.state = TdcState::Resolved;
        }
        self.update();
    }

    fn send(&self) {
        loop {
            let (stub, guid, sender, body) = {
                let mut inner = self.inner.borrow_mut();
                if inner.state != TdcState::Resolved {
                    return;
                }
                if inner.queue.rsize() == 0 || inner.queue.lsize() >= inner.window {
                    return;
                }
                let Some(stub) = inner.stub.clone() else { return };
                let Some((guid, body)) = inner.queue.advance() else { return };
                (stub, guid, inner.sender.clone(), body)
            };
            let this = self.clone();
            stub.transfer(
                guid,
                &sender,
                &body,
                Box::new(move |result| this.after_send(guid, result)),
            );
        }
    }

    fn after_send(&self, guid: i64, result: TdcResult) {
        {
            let inner = self.inner.borrow();
            if inner.state != TdcState::Resolved {
                // The channel was reset while this transfer was in flight;
                // the reset already failed or rewound everything.
                return;
            }
            match inner.queue.front_guid() {
                None => {
                    drop(inner);
                    // An ack with nothing in flight means a double ack or a
                    // peer answering out of band.
                    self.handle_error(ErrorCode::TdcMessageOutOfSequence);
                    return;
                }
                Some(front) if front != guid => {
                    drop(inner);
                    self.handle_error(ErrorCode::TdcMessageOutOfSequence);
                    return;
                }
                Some(_) => {}
            }
        }
        match result {
            Err(ErrorCode::TdcServiceMoved) => {
                info!("{} moved, rescheduling", self.inner.borrow().full_name);
                self.inner.borrow_mut().queue.rewind();
                self.resend();
            }
            Err(err) => self.handle_error(err),
            Ok(response) => {
                let done = {
                    let mut inner = self.inner.borrow_mut();
                    let msg = inner.queue.pop();
                    inner.window = (inner.window * 2).min(MAX_WINDOW);
                    inner.retry_count = 0;
                    msg.map(|m| m.done)
                };
                if let Some(done) = done {
                    done(Ok(response));
                }
                self.send();
            }
        }
    }

    /// Schedules another delivery attempt after a quadratic backoff; the
    /// resend ceiling turns into a hard channel failure.
    fn resend(&self) {
        let schedule = {
            let mut inner = self.inner.borrow_mut();
            inner.retry_count += 1;
            if inner.retry_count > MAX_RESEND {
                None
            } else if inner.resend_timer != INVALID_TIMER_ID {
                // A resend is already pending; the rewind above is enough.
                Some(None)
            } else {
                inner.state = TdcState::Init;
                inner.stub = None;
                let delay = (u64::from(inner.retry_count) * u64::from(inner.retry_count) * 1000)
                    .min(MAX_RESEND_DELAY_MS);
                Some(Some((Rc::clone(&inner.event_loop), delay)))
            }
        };
        match schedule {
            None => self.handle_error(ErrorCode::TdcServiceMoved),
            Some(None) => {}
            Some(Some((event_loop, delay))) => {
                let weak = Rc::downgrade(&self.inner);
                let timer = event_loop.add_timer(delay, 0, move || {
                    if let Some(inner) = weak.upgrade() {
                        let channel = TdcChannel { inner };
                        channel.inner.borrow_mut().resend_timer = INVALID_TIMER_ID;
                        channel.update();
                    }
                });
                self.inner.borrow_mut().resend_timer = timer;
            }
        }
    }

    /// Terminal failure: resets to `Init`, drops the stub and fails every
    /// queued message (sent and unsent) back with `err`. The window keeps
    /// its current size.
    fn handle_error(&self, err: ErrorCode) {
        let (messages, timer, event_loop) = {
            let mut inner = self.inner.borrow_mut();
            error!("tdc channel {} failed: {}", inner.full_name, err);
            inner.state = TdcState::Init;
            inner.stub = None;
            let timer = std::mem::replace(&mut inner.resend_timer, INVALID_TIMER_ID);
            (
                inner.queue.take_all(),
                timer,
                Rc::clone(&inner.event_loop),
            )
        };
        if timer != INVALID_TIMER_ID {
            event_loop.clear_timer(timer);
        }
        for msg in messages {
            (msg.done)(Err(err));
        }
    }
}

// -- hosting service -----------------------------------------------------------------

/// Inbound transfer handler: `(sender, body) -> response body`.
pub type TdcHandler = Box<dyn FnMut(&str, &[u8]) -> Result<Vec<u8>, ErrorCode>>;

struct TdcReceiveService {
    naming: crate::naming::MemoryNamingService,
    handler: TdcHandler,
}

impl RpcService for TdcReceiveService {
    fn call(&mut self, method: u32, payload: &[u8]) -> Result<Vec<u8>, ErrorCode> {
        match method {
            METHOD_TDC_TRANSFER => {
                let (_guid, sender, body) = decode_transfer(payload)?;
                (self.handler)(&sender, &body)
            }
            METHOD_NAMING => self.naming.call(method, payload),
            _ => Err(ErrorCode::RpcMethodNotFound),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct TdcServiceOptions {
    /// Logical service name registered with the naming service.
    pub name: String,
    /// Listen URL answered for inbound transfers.
    pub url: String,
    /// Name prefix shared by every service in this deployment.
    pub namespace: String,
    /// Naming-service replica URLs. Empty means self-hosted: this service
    /// answers naming requests itself on its own listen URL.
    pub naming_addrs: Vec<String>,
    pub debug: bool,
}

struct ServiceInner {
    event_loop: Rc<EventLoop>,
    options: TdcServiceOptions,
    resolver: Option<NamingResolver>,
    server: Option<RpcServer>,
    channels: HashMap<String, TdcChannel>,
    register_timer: TimerId,
    started: bool,
}

/// One node: answers inbound transfers, owns outbound channels by peer
/// name, and keeps its own name registered with the naming service.
#[derive(Clone)]
pub struct TdcService {
    inner: Rc<RefCell<ServiceInner>>,
}

impl TdcService {
    pub fn new(event_loop: Rc<EventLoop>) -> TdcService {
        TdcService {
            inner: Rc::new(RefCell::new(ServiceInner {
                event_loop,
                options: TdcServiceOptions::default(),
                resolver: None,
                server: None,
                channels: HashMap::new(),
                register_timer: INVALID_TIMER_ID,
                started: false,
            })),
        }
    }

    pub fn start(&self, options: TdcServiceOptions, handler: TdcHandler) -> Result<(), ErrorCode> {
        if self.inner.borrow().started {
            return Err(ErrorCode::ServerStarted);
        }
        let event_loop = Rc::clone(&self.inner.borrow().event_loop);
        let server = RpcServer::new(Rc::clone(&event_loop));
        server.start(
            ServerOptions {
                name: options.name.clone(),
                url: options.url.clone(),
                debug: options.debug,
                ..Default::default()
            },
            Rc::new(RefCell::new(TdcReceiveService {
                naming: crate::naming::MemoryNamingService::new(),
                handler,
            })),
        )?;
        // With port 0 the kernel picked the port; register the real one.
        let listen_url = {
            let parsed = crate::net::addr::parse_address(&options.url)?;
            if parsed.is_unix() || parsed.port != 0 {
                options.url.clone()
            } else {
                crate::net::addr::format_address(&parsed.scheme, &parsed.host, server.local_port())
            }
        };
        let naming_addrs = if options.naming_addrs.is_empty() {
            vec![listen_url.clone()]
        } else {
            options.naming_addrs.clone()
        };
        let resolver = NamingResolver::new(Rc::clone(&event_loop), naming_addrs);
        {
            let mut inner = self.inner.borrow_mut();
            inner.options = options;
            inner.resolver = Some(resolver);
            inner.server = Some(server);
            inner.started = true;
        }
        self.register(&listen_url);
        let weak = Rc::downgrade(&self.inner);
        let timer = event_loop.add_timer(REGISTER_INTERVAL_MS, REGISTER_INTERVAL_MS, move || {
            if let Some(inner) = weak.upgrade() {
                TdcService { inner }.register(&listen_url);
            }
        });
        self.inner.borrow_mut().register_timer = timer;
        Ok(())
    }

    fn register(&self, listen_url: &str) {
        let (resolver, full_name) = {
            let inner = self.inner.borrow();
            let Some(resolver) = inner.resolver.clone() else { return };
            (resolver, qualify(&inner.options.namespace, &inner.options.name))
        };
        let name = full_name.clone();
        resolver.put(&full_name, listen_url, move |result| {
            if let Err(err) = result {
                warn!("failed to register {}: {}", name, err);
            }
        });
    }

    pub fn local_port(&self) -> u16 {
        self.inner.borrow().server.as_ref().map_or(0, RpcServer::local_port)
    }

    /// The outbound channel for `peer`, created on first use.
    pub fn channel(&self, peer: &str) -> TdcChannel {
        if let Some(channel) = self.inner.borrow().channels.get(peer) {
            return channel.clone();
        }
        let (event_loop, namespace, sender, resolver) = {
            let inner = self.inner.borrow();
            (
                Rc::clone(&inner.event_loop),
                inner.options.namespace.clone(),
                inner.options.name.clone(),
                inner.resolver.clone().expect("service not started"),
            )
        };
        let factory_loop = Rc::clone(&event_loop);
        let factory: TdcStubFactory = Box::new(move |addr| {
            let rpc = RpcChannel::new(
                Rc::clone(&factory_loop),
                ChannelOptions {
                    name: format!("tdc:{}", addr),
                    url: addr.to_string(),
                    ..Default::default()
                },
            )?;
            Ok(Rc::new(RpcTdcStub { rpc }) as Rc<dyn TdcStub>)
        });
        let channel = TdcChannel::new(event_loop, peer, &namespace, &sender, resolver, factory);
        self.inner
            .borrow_mut()
            .channels
            .insert(peer.to_string(), channel.clone());
        channel
    }

    /// Sends `body` to the logical peer `peer`; shorthand for
    /// `channel(peer).send_msg(..)`.
    pub fn send_msg(&self, peer: &str, body: &[u8], done: impl FnOnce(TdcResult) + 'static) {
        self.channel(peer).send_msg(body, done);
    }

    /// Stops serving and fails every queued outbound message back.
    pub fn stop(&self) {
        let (server, channels, timer, event_loop) = {
            let mut inner = self.inner.borrow_mut();
            if !inner.started {
                return;
            }
            inner.started = false;
            inner.resolver = None;
            let timer = std::mem::replace(&mut inner.register_timer, INVALID_TIMER_ID);
            (
                inner.server.take(),
                std::mem::take(&mut inner.channels),
                timer,
                Rc::clone(&inner.event_loop),
            )
        };
        if timer != INVALID_TIMER_ID {
            event_loop.clear_timer(timer);
        }
        for (_, channel) in channels {
            channel.handle_error(ErrorCode::RpcRequestCanceled);
        }
        if let Some(server) = server {
            server.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::naming::{NamingOp, NamingReply, NamingStub, StubFactory};
    use std::cell::Cell;

    fn resolver_answering(addr: &str) -> NamingResolver {
        struct FixedStub {
            addr: String,
        }
        impl NamingStub for FixedStub {
            fn invoke(&self, request: crate::naming::NamingRequest, done: crate::naming::NamingCallback) {
                done(Ok(NamingReply {
                    err: 0,
                    op: request.op,
                    value: self.addr.clone(),
                    keys: vec![],
                }));
            }
        }
        let addr = addr.to_string();
        let factory: StubFactory = Box::new(move |_| {
            Ok(Rc::new(FixedStub { addr: addr.clone() }) as Rc<dyn NamingStub>)
        });
        NamingResolver::with_factory(vec!["tcp://naming:1".into()], factory)
    }

    /// Stub that parks transfer completions for the test to release.
    #[derive(Default)]
    struct ParkedStub {
        parked: RefCell<Vec<(i64, TdcCallback)>>,
    }

    impl ParkedStub {
        fn complete_front(&self, result: TdcResult) {
            let (_, done) = self.parked.borrow_mut().remove(0);
            done(result);
        }

        fn complete_back(&self, result: TdcResult) {
            let (_, done) = self.parked.borrow_mut().pop().unwrap();
            done(result);
        }
    }

    impl TdcStub for Rc<ParkedStub> {
        fn transfer(&self, guid: i64, _sender: &str, _body: &[u8], done: TdcCallback) {
            self.parked.borrow_mut().push((guid, done));
        }
    }

    fn parked_channel(event_loop: Rc<EventLoop>) -> (TdcChannel, Rc<ParkedStub>) {
        let stub = Rc::new(ParkedStub::default());
        let stub_for_factory = Rc::clone(&stub);
        let factory: TdcStubFactory = Box::new(move |_| {
            Ok(Rc::new(Rc::clone(&stub_for_factory)) as Rc<dyn TdcStub>)
        });
        let channel = TdcChannel::new(
            event_loop,
            "echo",
            "box",
            "source",
            resolver_answering("tcp://127.0.0.1:7000"),
            factory,
        );
        (channel, stub)
    }

    #[test]
    fn test_transfer_codec_roundtrip() {
        let bytes = encode_transfer(77, "box.a", b"payload");
        let (guid, sender, body) = decode_transfer(&bytes).unwrap();
        assert_eq!(guid, 77);
        assert_eq!(sender, "box.a");
        assert_eq!(body, b"payload");
        assert!(decode_transfer(&bytes[..5]).is_err());
    }

    #[test]
    fn test_qualify_namespace() {
        assert_eq!(qualify("box", "echo"), "box.echo");
        assert_eq!(qualify("box", "box.echo"), "box.echo");
        assert_eq!(qualify("", "echo"), "echo");
    }

    #[test]
    fn test_window_starts_at_one_and_doubles() {
        let event_loop = EventLoop::new().unwrap();
        let (channel, stub) = parked_channel(event_loop);
        for _ in 0..5 {
            channel.send_msg(b"m", |_| {});
        }
        // Resolution is synchronous through the fixed stub, so the first
        // message is already in flight and the rest wait on the window.
        assert_eq!(channel.state(), TdcState::Resolved);
        assert_eq!(channel.in_flight(), 1);
        assert_eq!(channel.window(), 1);
        stub.complete_front(Ok(vec![]));
        assert_eq!(channel.window(), 2);
        assert_eq!(channel.in_flight(), 2);
        stub.complete_front(Ok(vec![]));
        assert_eq!(channel.window(), 4);
        // All 3 remaining messages fit the window now.
        assert_eq!(channel.in_flight(), 3);
        stub.complete_front(Ok(vec![]));
        stub.complete_front(Ok(vec![]));
        stub.complete_front(Ok(vec![]));
        assert_eq!(channel.window(), 16);
        assert_eq!(channel.queue_size(), 0);
    }

    #[test]
    fn test_out_of_order_ack_is_fatal() {
        let event_loop = EventLoop::new().unwrap();
        let (channel, stub) = parked_channel(event_loop);
        let errors = Rc::new(RefCell::new(Vec::new()));
        for _ in 0..3 {
            let e = Rc::clone(&errors);
            channel.send_msg(b"m", move |result| e.borrow_mut().push(result));
        }
        stub.complete_front(Ok(vec![]));
        assert_eq!(channel.in_flight(), 2);
        // Ack the later in-flight message first.
        stub.complete_back(Ok(vec![]));
        let errors = errors.borrow();
        assert_eq!(errors.len(), 3);
        assert!(errors[0].is_ok());
        assert_eq!(errors[1].as_ref().unwrap_err(), &ErrorCode::TdcMessageOutOfSequence);
        assert_eq!(errors[2].as_ref().unwrap_err(), &ErrorCode::TdcMessageOutOfSequence);
        assert_eq!(channel.state(), TdcState::Init);
    }

    #[test]
    fn test_service_moved_rewinds_and_resends() {
        let event_loop = EventLoop::new().unwrap();
        let (channel, stub) = parked_channel(Rc::clone(&event_loop));
        let seen = Rc::new(Cell::new(false));
        let s = Rc::clone(&seen);
        channel.send_msg(b"m", move |result| s.set(result.is_ok()));
        stub.complete_front(Err(ErrorCode::TdcServiceMoved));
        // Rewound, reset, resend timer armed.
        assert_eq!(channel.state(), TdcState::Init);
        assert_eq!(channel.in_flight(), 0);
        assert_eq!(channel.queue_size(), 1);
        let deadline = crate::net::event_loop::time_ms() + 3000;
        while channel.in_flight() == 0 && crate::net::event_loop::time_ms() < deadline {
            event_loop.run(crate::net::RunMode::Once);
        }
        // Resolved again and back in flight; ack it this time.
        assert_eq!(channel.state(), TdcState::Resolved);
        stub.complete_front(Ok(vec![]));
        assert!(seen.get());
    }

    #[test]
    fn test_resend_ceiling_fails_hard() {
        let event_loop = EventLoop::new().unwrap();
        let (channel, stub) = parked_channel(event_loop);
        let seen = Rc::new(Cell::new(ErrorCode::Ok));
        let s = Rc::clone(&seen);
        channel.send_msg(b"m", move |result| s.set(result.unwrap_err()));
        stub.complete_front(Err(ErrorCode::TdcServiceMoved));
        assert_eq!(channel.state(), TdcState::Init);
        // Repeated moved responses while a resend is already pending only
        // bump the retry count until the ceiling trips.
        channel.resend();
        channel.resend();
        assert!(seen.get().is_ok());
        channel.resend();
        assert_eq!(seen.get(), ErrorCode::TdcServiceMoved);
        assert_eq!(channel.queue_size(), 0);
    }

    #[test]
    fn test_transport_error_fails_everything_back() {
        let event_loop = EventLoop::new().unwrap();
        let (channel, stub) = parked_channel(event_loop);
        let failures = Rc::new(Cell::new(0));
        for _ in 0..4 {
            let f = Rc::clone(&failures);
            channel.send_msg(b"m", move |result| {
                if result == Err(ErrorCode::SocketClosedByPeer) {
                    f.set(f.get() + 1);
                }
            });
        }
        stub.complete_front(Err(ErrorCode::SocketClosedByPeer));
        assert_eq!(failures.get(), 4);
        assert_eq!(channel.state(), TdcState::Init);
        assert_eq!(channel.queue_size(), 0);
        // The window keeps whatever the ack clock reached.
        assert_eq!(channel.window(), 1);
    }
}
