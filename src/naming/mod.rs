//! Name -> address resolution client with retry, redirect and a sticky
//! replica.
//!
//! A [`NamingResolver`] talks to one of several naming-service replicas.
//! Replica selection: the sticky address when one is cached, otherwise
//! `retry_count % replicas`. A transport failure clears the sticky address
//! and retries through the next replica up to [`MAX_RETRY`]; a
//! `TnsServiceRedirect` reply caches the redirect target as sticky and
//! retries up to an independent [`MAX_REDIRECT`]; a success that needed
//! retries promotes the answering replica to sticky. Ceilings surface the
//! last error to the caller and affect only that request.
//!
//! The wire payloads are little-endian frames (opcode byte, u16
//! length-prefixed strings) carried in the [`rpc`](crate::rpc) framing
//! under [`METHOD_NAMING`].

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use log::{debug, warn};

use crate::error::ErrorCode;
use crate::net::channel::ChannelOptions;
use crate::net::event_loop::EventLoop;
use crate::rpc::{RpcChannel, RpcService};

/// Method id naming requests travel under.
pub const METHOD_NAMING: u32 = 1;

/// Transport-retry ceiling per request.
pub const MAX_RETRY: u32 = 3;

/// Redirect-following ceiling per request, independent of retries.
pub const MAX_REDIRECT: u32 = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NamingOp {
    Get = 1,
    Put = 2,
    Del = 3,
    Keys = 4,
}

impl NamingOp {
    fn from_u8(v: u8) -> Option<NamingOp> {
        match v {
            1 => Some(NamingOp::Get),
            2 => Some(NamingOp::Put),
            3 => Some(NamingOp::Del),
            4 => Some(NamingOp::Keys),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NamingRequest {
    pub op: NamingOp,
    pub name: String,
    pub value: String,
}

/// Short-lived per-request reply; only the fields relevant to `op` are
/// filled in.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NamingReply {
    pub err: i32,
    pub op: NamingOp,
    pub value: String,
    pub keys: Vec<String>,
}

// -- wire codec ---------------------------------------------------------------

fn put_str(out: &mut Vec<u8>, s: &str) {
    let len = s.len().min(u16::MAX as usize) as u16;
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&s.as_bytes()[..len as usize]);
}

fn take_str<'a>(data: &mut &'a [u8]) -> Option<&'a str> {
    if data.len() < 2 {
        return None;
    }
    let len = u16::from_le_bytes([data[0], data[1]]) as usize;
    if data.len() < 2 + len {
        return None;
    }
    let s = std::str::from_utf8(&data[2..2 + len]).ok()?;
    *data = &data[2 + len..];
    Some(s)
}

pub fn encode_request(request: &NamingRequest) -> Vec<u8> {
    let mut out = Vec::with_capacity(5 + request.name.len() + request.value.len());
    out.push(request.op as u8);
    put_str(&mut out, &request.name);
    put_str(&mut out, &request.value);
    out
}

pub fn decode_request(payload: &[u8]) -> Result<NamingRequest, ErrorCode> {
    let mut data = payload;
    let op = data
        .first()
        .copied()
        .and_then(NamingOp::from_u8)
        .ok_or(ErrorCode::TnsMethodNotFound)?;
    data = &data[1..];
    let name = take_str(&mut data).ok_or(ErrorCode::TnsUnrecognizedFormat)?;
    let value = take_str(&mut data).ok_or(ErrorCode::TnsUnrecognizedFormat)?;
    Ok(NamingRequest { op, name: name.to_string(), value: value.to_string() })
}

pub fn encode_reply(reply: &NamingReply) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&reply.err.to_le_bytes());
    out.push(reply.op as u8);
    put_str(&mut out, &reply.value);
    let count = reply.keys.len().min(u16::MAX as usize) as u16;
    out.extend_from_slice(&count.to_le_bytes());
    for key in reply.keys.iter().take(count as usize) {
        put_str(&mut out, key);
    }
    out
}

pub fn decode_reply(payload: &[u8]) -> Result<NamingReply, ErrorCode> {
    let mut data = payload;
    if data.len() < 5 {
        return Err(ErrorCode::TnsUnrecognizedFormat);
    }
    let err = i32::from_le_bytes([data[0], data[1], data[2], data[3]]);
    let op = NamingOp::from_u8(data[4]).ok_or(ErrorCode::TnsMethodNotFound)?;
    data = &data[5..];
    let value = take_str(&mut data)
        .ok_or(ErrorCode::TnsUnrecognizedFormat)?
        .to_string();
    if data.len() < 2 {
        return Err(ErrorCode::TnsUnrecognizedFormat);
    }
    let count = u16::from_le_bytes([data[0], data[1]]) as usize;
    data = &data[2..];
    let mut keys = Vec::with_capacity(count);
    for _ in 0..count {
        keys.push(
            take_str(&mut data)
                .ok_or(ErrorCode::TnsUnrecognizedFormat)?
                .to_string(),
        );
    }
    Ok(NamingReply { err, op, value, keys })
}

// -- stub seam ------------------------------------------------------------------

pub type NamingResult = Result<NamingReply, ErrorCode>;
pub type NamingCallback = Box<dyn FnOnce(NamingResult)>;

/// One naming-service replica endpoint. The default implementation rides an
/// [`RpcChannel`]; tests substitute scripted stubs.
pub trait NamingStub {
    fn invoke(&self, request: NamingRequest, done: NamingCallback);
}

struct RpcNamingStub {
    rpc: RpcChannel,
}

impl NamingStub for RpcNamingStub {
    fn invoke(&self, request: NamingRequest, done: NamingCallback) {
        let payload = encode_request(&request);
        // The slot guarantees exactly one invocation whether the call fails
        // synchronously or completes through the RPC callback.
        let slot = Rc::new(RefCell::new(Some(done)));
        let cb_slot = Rc::clone(&slot);
        let result = self.rpc.call(METHOD_NAMING, &payload, move |result| {
            if let Some(done) = cb_slot.borrow_mut().take() {
                done(result.and_then(|bytes| decode_reply(&bytes)));
            }
        });
        if let Err(err) = result {
            warn!("naming request failed to start: {}", err);
            if let Some(done) = slot.borrow_mut().take() {
                done(Err(err));
            }
        }
    }
}

pub type StubFactory = Box<dyn Fn(&str) -> Result<Rc<dyn NamingStub>, ErrorCode>>;

struct Inner {
    addrs: Vec<String>,
    cached_addr: String,
    stubs: HashMap<String, Rc<dyn NamingStub>>,
    factory: StubFactory,
}

#[derive(Clone, Copy)]
struct RequestCtx {
    retry: u32,
    redirect: u32,
}

#[derive(Clone)]
pub struct NamingResolver {
    inner: Rc<RefCell<Inner>>,
}

impl NamingResolver {
    /// Resolver over real RPC channels, one per replica URL.
    pub fn new(event_loop: Rc<EventLoop>, addrs: Vec<String>) -> NamingResolver {
        let factory: StubFactory = Box::new(move |addr| {
            let rpc = RpcChannel::new(
                Rc::clone(&event_loop),
                ChannelOptions {
                    name: format!("naming:{}", addr),
                    url: addr.to_string(),
                    ..Default::default()
                },
            )?;
            Ok(Rc::new(RpcNamingStub { rpc }) as Rc<dyn NamingStub>)
        });
        NamingResolver::with_factory(addrs, factory)
    }

    /// Resolver with an injected stub factory; the test seam.
    pub fn with_factory(addrs: Vec<String>, factory: StubFactory) -> NamingResolver {
        NamingResolver {
            inner: Rc::new(RefCell::new(Inner {
                addrs,
                cached_addr: String::new(),
                stubs: HashMap::new(),
                factory,
            })),
        }
    }

    pub fn replica_count(&self) -> usize {
        self.inner.borrow().addrs.len()
    }

    /// The sticky replica currently preferred, empty when none.
    pub fn cached_addr(&self) -> String {
        self.inner.borrow().cached_addr.clone()
    }

    pub fn get(&self, name: &str, done: impl FnOnce(NamingResult) + 'static) {
        self.start(NamingOp::Get, name, "", done);
    }

    pub fn put(&self, name: &str, value: &str, done: impl FnOnce(NamingResult) + 'static) {
        self.start(NamingOp::Put, name, value, done);
    }

    pub fn delete(&self, name: &str, done: impl FnOnce(NamingResult) + 'static) {
        self.start(NamingOp::Del, name, "", done);
    }

    /// Enumerates names matching `pattern` (prefix match).
    pub fn keys(&self, pattern: &str, done: impl FnOnce(NamingResult) + 'static) {
        self.start(NamingOp::Keys, pattern, "", done);
    }

    fn start(&self, op: NamingOp, name: &str, value: &str, done: impl FnOnce(NamingResult) + 'static) {
        self.invoke(
            NamingRequest { op, name: name.to_string(), value: value.to_string() },
            RequestCtx { retry: 0, redirect: 0 },
            Box::new(done),
        );
    }

    fn invoke(&self, request: NamingRequest, ctx: RequestCtx, done: NamingCallback) {
        let stub = match self.select_stub(ctx.retry) {
            Ok(stub) => stub,
            Err(err) => {
                done(Err(err));
                return;
            }
        };
        let this = self.clone();
        let retry_request = request.clone();
        stub.invoke(
            request,
            Box::new(move |result| this.handle_invoke(retry_request, ctx, result, done)),
        );
    }

    fn select_stub(&self, retry: u32) -> Result<Rc<dyn NamingStub>, ErrorCode> {
        let addr = {
            let inner = self.inner.borrow();
            if !inner.cached_addr.is_empty() {
                inner.cached_addr.clone()
            } else {
                if inner.addrs.is_empty() {
                    return Err(ErrorCode::TnsNoStub);
                }
                inner.addrs[retry as usize % inner.addrs.len()].clone()
            }
        };
        let mut inner = self.inner.borrow_mut();
        if let Some(stub) = inner.stubs.get(&addr) {
            return Ok(Rc::clone(stub));
        }
        let stub = (inner.factory)(&addr)?;
        inner.stubs.insert(addr, Rc::clone(&stub));
        Ok(stub)
    }

    fn cache_addr(&self, addr: &str) {
        self.inner.borrow_mut().cached_addr = addr.to_string();
    }

    fn handle_invoke(
        &self,
        request: NamingRequest,
        ctx: RequestCtx,
        result: NamingResult,
        done: NamingCallback,
    ) {
        match result {
            Err(err) => {
                // Replica unreachable: forget the sticky address and walk
                // to the next replica.
                self.cache_addr("");
                if ctx.retry < MAX_RETRY {
                    warn!("naming request failed ({}), retry {}", err, ctx.retry + 1);
                    self.invoke(request, RequestCtx { retry: ctx.retry + 1, ..ctx }, done);
                } else {
                    done(Err(err));
                }
            }
            Ok(reply) if reply.err == ErrorCode::TnsServiceRedirect.code() => {
                self.cache_addr(&reply.value);
                if ctx.redirect < MAX_REDIRECT {
                    debug!("naming service redirected to {}", reply.value);
                    self.invoke(request, RequestCtx { redirect: ctx.redirect + 1, ..ctx }, done);
                } else {
                    done(Err(ErrorCode::TnsServiceRedirect));
                }
            }
            Ok(reply) => {
                if ctx.retry > 0 {
                    // The replica that finally answered becomes sticky.
                    let addr = {
                        let inner = self.inner.borrow();
                        inner.addrs[ctx.retry as usize % inner.addrs.len()].clone()
                    };
                    self.cache_addr(&addr);
                }
                done(Ok(reply));
            }
        }
    }
}

/// In-memory naming service over the RPC framing; used by tests and small
/// single-node deployments.
#[derive(Default)]
pub struct MemoryNamingService {
    entries: HashMap<String, String>,
}

impl MemoryNamingService {
    pub fn new() -> Self {
        Self::default()
    }

    fn handle(&mut self, request: &NamingRequest) -> NamingReply {
        let mut reply = NamingReply {
            err: 0,
            op: request.op,
            value: String::new(),
            keys: Vec::new(),
        };
        match request.op {
            NamingOp::Get => match self.entries.get(&request.name) {
                Some(value) => reply.value = value.clone(),
                None => reply.err = ErrorCode::TnsNameNotFound.code(),
            },
            NamingOp::Put => {
                self.entries.insert(request.name.clone(), request.value.clone());
            }
            NamingOp::Del => {
                if self.entries.remove(&request.name).is_none() {
                    reply.err = ErrorCode::TnsNameNotFound.code();
                }
            }
            NamingOp::Keys => {
                reply.keys = self
                    .entries
                    .keys()
                    .filter(|k| k.starts_with(&request.name))
                    .cloned()
                    .collect();
                reply.keys.sort();
            }
        }
        reply
    }
}

impl RpcService for MemoryNamingService {
    fn call(&mut self, method: u32, payload: &[u8]) -> Result<Vec<u8>, ErrorCode> {
        if method != METHOD_NAMING {
            return Err(ErrorCode::RpcMethodNotFound);
        }
        let request = decode_request(payload)?;
        Ok(encode_reply(&self.handle(&request)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_request_codec_roundtrip() {
        let request = NamingRequest {
            op: NamingOp::Put,
            name: "box.echo".into(),
            value: "tcp://10.0.0.1:9000".into(),
        };
        assert_eq!(decode_request(&encode_request(&request)).unwrap(), request);
    }

    #[test]
    fn test_reply_codec_roundtrip() {
        let reply = NamingReply {
            err: ErrorCode::TnsNameNotFound.code(),
            op: NamingOp::Keys,
            value: String::new(),
            keys: vec!["a".into(), "b".into()],
        };
        assert_eq!(decode_reply(&encode_reply(&reply)).unwrap(), reply);
    }

    #[test]
    fn test_decode_rejects_unknown_opcode() {
        let mut bytes = encode_request(&NamingRequest {
            op: NamingOp::Get,
            name: "x".into(),
            value: String::new(),
        });
        bytes[0] = 77;
        assert_eq!(decode_request(&bytes).err(), Some(ErrorCode::TnsMethodNotFound));
    }

    /// Scripted stub: each address answers from a fixed list of outcomes.
    struct ScriptedStub {
        outcomes: RefCell<Vec<NamingResult>>,
        calls: Rc<RefCell<Vec<String>>>,
        addr: String,
    }

    impl NamingStub for ScriptedStub {
        fn invoke(&self, _request: NamingRequest, done: NamingCallback) {
            self.calls.borrow_mut().push(self.addr.clone());
            let outcome = if self.outcomes.borrow().is_empty() {
                Err(ErrorCode::RpcChannelError)
            } else {
                self.outcomes.borrow_mut().remove(0)
            };
            done(outcome);
        }
    }

    fn ok_reply() -> NamingResult {
        Ok(NamingReply { err: 0, op: NamingOp::Get, value: "v".into(), keys: vec![] })
    }

    fn scripted_resolver(
        addrs: &[&str],
        scripts: HashMap<String, Vec<NamingResult>>,
        calls: Rc<RefCell<Vec<String>>>,
    ) -> NamingResolver {
        let scripts = RefCell::new(scripts);
        let factory: StubFactory = Box::new(move |addr| {
            Ok(Rc::new(ScriptedStub {
                outcomes: RefCell::new(scripts.borrow_mut().remove(addr).unwrap_or_default()),
                calls: Rc::clone(&calls),
                addr: addr.to_string(),
            }) as Rc<dyn NamingStub>)
        });
        NamingResolver::with_factory(addrs.iter().map(|s| s.to_string()).collect(), factory)
    }

    #[test]
    fn test_no_replicas_fails_with_no_stub() {
        let resolver = NamingResolver::with_factory(vec![], Box::new(|_| unreachable!()));
        let seen = Rc::new(Cell::new(ErrorCode::Ok));
        let s = Rc::clone(&seen);
        resolver.get("x", move |result| s.set(result.unwrap_err()));
        assert_eq!(seen.get(), ErrorCode::TnsNoStub);
    }

    #[test]
    fn test_retry_walks_replicas_and_promotes_sticky() {
        let calls = Rc::new(RefCell::new(Vec::new()));
        let mut scripts = HashMap::new();
        scripts.insert("a".to_string(), vec![Err(ErrorCode::RpcChannelError)]);
        scripts.insert("b".to_string(), vec![Err(ErrorCode::RpcChannelError)]);
        scripts.insert("c".to_string(), vec![ok_reply(), ok_reply()]);
        let resolver = scripted_resolver(&["a", "b", "c"], scripts, Rc::clone(&calls));
        let got = Rc::new(Cell::new(false));
        let g = Rc::clone(&got);
        resolver.get("x", move |result| g.set(result.is_ok()));
        assert!(got.get());
        assert_eq!(*calls.borrow(), vec!["a", "b", "c"]);
        // Third replica answered after 2 retries; it is sticky now.
        assert_eq!(resolver.cached_addr(), "c");
        resolver.get("y", |_| {});
        assert_eq!(calls.borrow().last().unwrap(), "c");
    }

    #[test]
    fn test_retry_ceiling_surfaces_transport_error() {
        let calls = Rc::new(RefCell::new(Vec::new()));
        let resolver = scripted_resolver(&["a"], HashMap::new(), Rc::clone(&calls));
        let seen = Rc::new(Cell::new(ErrorCode::Ok));
        let s = Rc::clone(&seen);
        resolver.get("x", move |result| s.set(result.unwrap_err()));
        assert_eq!(seen.get(), ErrorCode::RpcChannelError);
        // Initial try plus MAX_RETRY retries.
        assert_eq!(calls.borrow().len(), 1 + MAX_RETRY as usize);
    }

    #[test]
    fn test_redirect_goes_sticky_without_retrying_first() {
        let calls = Rc::new(RefCell::new(Vec::new()));
        let mut scripts = HashMap::new();
        scripts.insert(
            "a".to_string(),
            vec![Ok(NamingReply {
                err: ErrorCode::TnsServiceRedirect.code(),
                op: NamingOp::Get,
                value: "b".into(),
                keys: vec![],
            })],
        );
        scripts.insert("b".to_string(), vec![ok_reply(), ok_reply()]);
        let resolver = scripted_resolver(&["a", "b"], scripts, Rc::clone(&calls));
        let got = Rc::new(Cell::new(false));
        let g = Rc::clone(&got);
        resolver.get("x", move |result| g.set(result.is_ok()));
        assert!(got.get());
        assert_eq!(*calls.borrow(), vec!["a", "b"]);
        assert_eq!(resolver.cached_addr(), "b");
        // The next call goes straight to the redirect target.
        resolver.get("y", |_| {});
        assert_eq!(*calls.borrow(), vec!["a", "b", "b"]);
    }

    #[test]
    fn test_redirect_ceiling_surfaces_redirect_error() {
        let redirect = |to: &str| {
            Ok(NamingReply {
                err: ErrorCode::TnsServiceRedirect.code(),
                op: NamingOp::Get,
                value: to.into(),
                keys: vec![],
            })
        };
        let calls = Rc::new(RefCell::new(Vec::new()));
        let mut scripts = HashMap::new();
        scripts.insert("a".to_string(), vec![redirect("b"), redirect("b")]);
        scripts.insert("b".to_string(), vec![redirect("a"), redirect("a")]);
        let resolver = scripted_resolver(&["a", "b"], scripts, Rc::clone(&calls));
        let seen = Rc::new(Cell::new(ErrorCode::Ok));
        let s = Rc::clone(&seen);
        resolver.get("x", move |result| s.set(result.unwrap_err()));
        assert_eq!(seen.get(), ErrorCode::TnsServiceRedirect);
    }

    #[test]
    fn test_memory_service_operations() {
        let mut service = MemoryNamingService::new();
        let put = NamingRequest { op: NamingOp::Put, name: "svc.a".into(), value: "addr1".into() };
        assert_eq!(service.handle(&put).err, 0);
        let get = NamingRequest { op: NamingOp::Get, name: "svc.a".into(), value: String::new() };
        assert_eq!(service.handle(&get).value, "addr1");
        let keys = NamingRequest { op: NamingOp::Keys, name: "svc.".into(), value: String::new() };
        assert_eq!(service.handle(&keys).keys, vec!["svc.a"]);
        let del = NamingRequest { op: NamingOp::Del, name: "svc.a".into(), value: String::new() };
        assert_eq!(service.handle(&del).err, 0);
        assert_eq!(service.handle(&get).err, ErrorCode::TnsNameNotFound.code());
    }
}
