//! Framed request/response calls over a socket channel.
//!
//! Wire format, little-endian:
//!
//! ```text
//! +--------+------+---------+--------+-----------+
//! | u32    | u8   | u64     | u32    | bytes     |
//! | length | kind | seq     | code   | payload   |
//! +--------+------+---------+--------+-----------+
//! ```
//!
//! `length` counts everything after itself. `code` carries the method id in
//! requests and the status (`ErrorCode` value, 0 = ok) in responses. A
//! [`RpcChannel`] matches responses to pending calls by sequence id and
//! opens its underlying channel lazily on the first call; frames issued
//! before the connection is up are queued and flushed on open. Any channel
//! error fails every pending call back to its caller.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use log::{debug, warn};

use crate::buffer::IoBuffer;
use crate::error::ErrorCode;
use crate::net::channel::{ChannelOptions, ChannelState, SocketChannel};
use crate::net::event_loop::EventLoop;
use crate::net::server::{ServerOptions, SocketServer};
use crate::types::{TimerId, INVALID_TIMER_ID};

/// How long a call may stay unanswered before it is failed back.
pub const RPC_CHANNEL_TIMEOUT_MS: u64 = 10_000;

/// Hard cap on a frame's payload.
pub const RPC_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// Fixed bytes after the length prefix: kind + seq + code.
const FRAME_FIXED: usize = 1 + 8 + 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PacketKind {
    Request = 0,
    Response = 1,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RpcPacket {
    pub kind: PacketKind,
    pub seq: u64,
    /// Method id in requests, status code in responses.
    pub code: u32,
    pub payload: Vec<u8>,
}

fn u32_le(b: &[u8]) -> u32 {
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

fn u64_le(b: &[u8]) -> u64 {
    u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
}

/// Encodes one frame; payloads over [`RPC_MAX_PAYLOAD`] are rejected.
pub fn encode_packet(
    kind: PacketKind,
    seq: u64,
    code: u32,
    payload: &[u8],
) -> Result<Vec<u8>, ErrorCode> {
    if payload.len() > RPC_MAX_PAYLOAD {
        return Err(ErrorCode::RpcMessageTooLong);
    }
    let length = (FRAME_FIXED + payload.len()) as u32;
    let mut out = Vec::with_capacity(4 + length as usize);
    out.extend_from_slice(&length.to_le_bytes());
    out.push(kind as u8);
    out.extend_from_slice(&seq.to_le_bytes());
    out.extend_from_slice(&code.to_le_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Pulls one complete frame off `buf`, or `Ok(None)` when more bytes are
/// needed. Malformed frames are errors; the caller tears the channel down.
pub fn decode_packet(buf: &mut IoBuffer) -> Result<Option<RpcPacket>, ErrorCode> {
    let mut prefix = [0u8; 4];
    if buf.copy(&mut prefix, 0) < 4 {
        return Ok(None);
    }
    let length = u32_le(&prefix) as usize;
    if length < FRAME_FIXED {
        return Err(ErrorCode::RpcDecodeError);
    }
    if length > FRAME_FIXED + RPC_MAX_PAYLOAD {
        return Err(ErrorCode::RpcMessageTooLong);
    }
    let total = 4 + length;
    if buf.len() < total {
        return Ok(None);
    }
    let data = buf.data();
    let kind = match data[4] {
        0 => PacketKind::Request,
        1 => PacketKind::Response,
        _ => return Err(ErrorCode::RpcDecodeError),
    };
    let seq = u64_le(&data[5..13]);
    let code = u32_le(&data[13..17]);
    let payload = data[17..total].to_vec();
    buf.consume(total);
    Ok(Some(RpcPacket { kind, seq, code, payload }))
}

pub type RpcResponse = Result<Vec<u8>, ErrorCode>;

struct PendingCall {
    done: Box<dyn FnOnce(RpcResponse)>,
    timer: TimerId,
}

struct Inner {
    event_loop: Rc<EventLoop>,
    channel: SocketChannel,
    next_seq: u64,
    pending: HashMap<u64, PendingCall>,
    outbox: Vec<Vec<u8>>,
}

/// Client side: sequences requests, matches responses, survives lazy and
/// re-opened connections.
#[derive(Clone)]
pub struct RpcChannel {
    inner: Rc<RefCell<Inner>>,
}

impl RpcChannel {
    pub fn new(event_loop: Rc<EventLoop>, options: ChannelOptions) -> Result<RpcChannel, ErrorCode> {
        let channel = SocketChannel::new(Rc::clone(&event_loop));
        channel.init(options)?;
        let rpc = RpcChannel {
            inner: Rc::new(RefCell::new(Inner {
                event_loop,
                channel: channel.clone(),
                next_seq: 1,
                pending: HashMap::new(),
                outbox: Vec::new(),
            })),
        };
        let weak = Rc::downgrade(&rpc.inner);
        channel.set_open_callback({
            let weak = weak.clone();
            move |_| {
                if let Some(inner) = weak.upgrade() {
                    RpcChannel { inner }.flush_outbox();
                }
            }
        });
        channel.set_read_callback({
            let weak = weak.clone();
            move |_| {
                if let Some(inner) = weak.upgrade() {
                    RpcChannel { inner }.on_read();
                }
            }
        });
        channel.set_error_callback({
            let weak = weak.clone();
            move |err| {
                if let Some(inner) = weak.upgrade() {
                    RpcChannel { inner }.fail_all(err);
                }
            }
        });
        channel.set_close_callback(move |_| {
            if let Some(inner) = weak.upgrade() {
                RpcChannel { inner }.fail_all(ErrorCode::RpcChannelError);
            }
        });
        Ok(rpc)
    }

    pub fn name(&self) -> String {
        self.inner.borrow().channel.name()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.borrow().pending.len()
    }

    /// Issues one request. The callback always runs exactly once: with the
    /// response payload, the peer's status, or the transport error. Returns
    /// the sequence id usable with [`cancel`](RpcChannel::cancel).
    pub fn call(
        &self,
        method: u32,
        payload: &[u8],
        done: impl FnOnce(RpcResponse) + 'static,
    ) -> Result<u64, ErrorCode> {
        let (seq, frame, channel) = {
            let mut inner = self.inner.borrow_mut();
            let seq = inner.next_seq;
            inner.next_seq += 1;
            let frame = encode_packet(PacketKind::Request, seq, method, payload)?;
            (seq, frame, inner.channel.clone())
        };
        match channel.state() {
            ChannelState::Connected => {
                channel.write(&frame)?;
            }
            ChannelState::Connecting | ChannelState::Handshaking => {
                self.inner.borrow_mut().outbox.push(frame);
            }
            ChannelState::Unspec | ChannelState::Closed => {
                channel.open()?;
                self.inner.borrow_mut().outbox.push(frame);
            }
        }
        let event_loop = Rc::clone(&self.inner.borrow().event_loop);
        let weak = Rc::downgrade(&self.inner);
        let timer = event_loop.add_timer(RPC_CHANNEL_TIMEOUT_MS, 0, move || {
            if let Some(inner) = weak.upgrade() {
                RpcChannel { inner }.finish(seq, Err(ErrorCode::RpcRequestCanceled));
            }
        });
        self.inner
            .borrow_mut()
            .pending
            .insert(seq, PendingCall { done: Box::new(done), timer });
        Ok(seq)
    }

    /// Fails a single in-flight call back with `RpcRequestCanceled`.
    pub fn cancel(&self, seq: u64) -> bool {
        self.finish(seq, Err(ErrorCode::RpcRequestCanceled))
    }

    /// Closes the underlying channel; pending calls are failed back.
    pub fn close(&self) {
        let channel = self.inner.borrow().channel.clone();
        channel.close(ErrorCode::Ok);
    }

    fn finish(&self, seq: u64, result: RpcResponse) -> bool {
        let entry = {
            let mut inner = self.inner.borrow_mut();
            inner.pending.remove(&seq)
        };
        match entry {
            Some(call) => {
                if call.timer != INVALID_TIMER_ID {
                    self.inner.borrow().event_loop.clear_timer(call.timer);
                }
                (call.done)(result);
                true
            }
            None => false,
        }
    }

    fn flush_outbox(&self) {
        let (frames, channel) = {
            let mut inner = self.inner.borrow_mut();
            (std::mem::take(&mut inner.outbox), inner.channel.clone())
        };
        debug!("rpc({}) open, flushing {} queued frames", channel.name(), frames.len());
        for frame in frames {
            if let Err(err) = channel.write(&frame) {
                channel.close(err);
                return;
            }
        }
    }

    fn on_read(&self) {
        loop {
            let channel = self.inner.borrow().channel.clone();
            let Some(socket) = channel.socket() else { return };
            let decoded = {
                let mut buf = socket.recv_buffer();
                decode_packet(&mut buf)
            };
            let packet = match decoded {
                Ok(Some(packet)) => packet,
                Ok(None) => return,
                Err(err) => {
                    warn!("rpc({}) bad frame: {}", channel.name(), err);
                    channel.close(err);
                    return;
                }
            };
            if packet.kind != PacketKind::Response {
                channel.close(ErrorCode::RpcDecodeError);
                return;
            }
            if self.inner.borrow().pending.contains_key(&packet.seq) {
                let result = if packet.code == 0 {
                    Ok(packet.payload)
                } else {
                    Err(ErrorCode::from_code(packet.code as i32).unwrap_or(ErrorCode::RpcChannelError))
                };
                self.finish(packet.seq, result);
            } else {
                // A response nothing waits for means the two sides disagree
                // about sequencing; the channel is not trustworthy anymore.
                warn!("rpc({}) unexpected sequence {}", channel.name(), packet.seq);
                channel.close(ErrorCode::RpcSequenceError);
                return;
            }
        }
    }

    fn fail_all(&self, err: ErrorCode) {
        let (pending, event_loop) = {
            let mut inner = self.inner.borrow_mut();
            inner.outbox.clear();
            (
                std::mem::take(&mut inner.pending),
                Rc::clone(&inner.event_loop),
            )
        };
        for (_, call) in pending {
            if call.timer != INVALID_TIMER_ID {
                event_loop.clear_timer(call.timer);
            }
            (call.done)(Err(err));
        }
    }
}

/// Dispatch seam the serving side implements per method id.
pub trait RpcService {
    fn call(&mut self, method: u32, payload: &[u8]) -> Result<Vec<u8>, ErrorCode>;
}

/// Accepts connections and answers framed requests through an
/// [`RpcService`]. Response status carries the service's error code.
pub struct RpcServer {
    server: SocketServer,
}

impl RpcServer {
    pub fn new(event_loop: Rc<EventLoop>) -> RpcServer {
        RpcServer { server: SocketServer::new(event_loop) }
    }

    pub fn start(
        &self,
        options: ServerOptions,
        service: Rc<RefCell<dyn RpcService>>,
    ) -> Result<(), ErrorCode> {
        self.server.set_channel_callback(move |channel| {
            let service = Rc::clone(&service);
            let reader = channel.clone();
            channel.set_read_callback(move |_| serve_reads(&reader, &service));
        });
        self.server.start(options)
    }

    pub fn local_port(&self) -> u16 {
        self.server.local_port()
    }

    pub fn stop(&self) {
        self.server.stop();
    }
}

fn serve_reads(channel: &SocketChannel, service: &Rc<RefCell<dyn RpcService>>) {
    loop {
        let Some(socket) = channel.socket() else { return };
        let decoded = {
            let mut buf = socket.recv_buffer();
            decode_packet(&mut buf)
        };
        let packet = match decoded {
            Ok(Some(packet)) => packet,
            Ok(None) => return,
            Err(err) => {
                warn!("rpc server: bad frame from {}: {}", channel.name(), err);
                channel.close(err);
                return;
            }
        };
        if packet.kind != PacketKind::Request {
            channel.close(ErrorCode::RpcDecodeError);
            return;
        }
        let result = service.borrow_mut().call(packet.code, &packet.payload);
        let frame = match result {
            Ok(payload) => encode_packet(PacketKind::Response, packet.seq, 0, &payload),
            Err(err) => encode_packet(PacketKind::Response, packet.seq, err.code() as u32, &[]),
        };
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                channel.close(err);
                return;
            }
        };
        if channel.write(&frame).is_err() {
            return;
        }
    }
}
