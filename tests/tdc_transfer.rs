//! Two TDC services on one loop: the receiver hosts the naming table
//! itself, the sender resolves through it and delivers over real sockets.

use std::cell::RefCell;
use std::rc::Rc;

use tinynet::net::event_loop::time_ms;
use tinynet::net::{EventLoop, RunMode};
use tinynet::tdc::{TdcService, TdcServiceOptions};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn run_until(event_loop: &Rc<EventLoop>, deadline_ms: i64, done: impl Fn() -> bool) {
    let deadline = time_ms() + deadline_ms;
    while !done() && time_ms() < deadline {
        event_loop.run(RunMode::Once);
    }
}

#[test]
fn test_transfer_between_services() {
    init_logging();
    let event_loop = EventLoop::new().unwrap();

    let seen_sender = Rc::new(RefCell::new(String::new()));
    let sender_log = Rc::clone(&seen_sender);
    let receiver = TdcService::new(Rc::clone(&event_loop));
    receiver
        .start(
            TdcServiceOptions {
                name: "echo".into(),
                url: "tcp://127.0.0.1:0".into(),
                namespace: "it".into(),
                naming_addrs: vec![],
                ..Default::default()
            },
            Box::new(move |sender, body| {
                *sender_log.borrow_mut() = sender.to_string();
                let mut reply = body.to_vec();
                reply.reverse();
                Ok(reply)
            }),
        )
        .unwrap();
    let naming_url = format!("tcp://127.0.0.1:{}", receiver.local_port());

    let origin = TdcService::new(Rc::clone(&event_loop));
    origin
        .start(
            TdcServiceOptions {
                name: "origin".into(),
                url: "tcp://127.0.0.1:0".into(),
                namespace: "it".into(),
                naming_addrs: vec![naming_url],
                ..Default::default()
            },
            Box::new(|_, _| Ok(vec![])),
        )
        .unwrap();

    // Give the receiver's self-registration a few loop turns to land in its
    // own naming table before anyone asks for it.
    run_until(&event_loop, 500, || false);

    let result = Rc::new(RefCell::new(None));
    let slot = Rc::clone(&result);
    origin.send_msg("echo", b"ping", move |r| {
        *slot.borrow_mut() = Some(r);
    });
    run_until(&event_loop, 10_000, || result.borrow().is_some());

    let reply = result.borrow_mut().take().expect("transfer timed out");
    assert_eq!(reply.unwrap(), b"gnip");
    assert_eq!(*seen_sender.borrow(), "it.origin");

    origin.stop();
    receiver.stop();
}

#[test]
fn test_transfer_to_unknown_peer_fails() {
    init_logging();
    let event_loop = EventLoop::new().unwrap();

    let node = TdcService::new(Rc::clone(&event_loop));
    node.start(
        TdcServiceOptions {
            name: "solo".into(),
            url: "tcp://127.0.0.1:0".into(),
            namespace: "it".into(),
            naming_addrs: vec![],
            ..Default::default()
        },
        Box::new(|_, _| Ok(vec![])),
    )
    .unwrap();
    run_until(&event_loop, 500, || false);

    let result = Rc::new(RefCell::new(None));
    let slot = Rc::clone(&result);
    node.send_msg("nobody", b"hello?", move |r| {
        *slot.borrow_mut() = Some(r);
    });
    run_until(&event_loop, 10_000, || result.borrow().is_some());

    let reply = result.borrow_mut().take().expect("lookup never finished");
    assert!(reply.is_err());
    node.stop();
}
