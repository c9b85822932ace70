//! End-to-end echo over the real loop: server and client channels on one
//! thread, plaintext TCP.

use std::cell::RefCell;
use std::rc::Rc;

use tinynet::net::event_loop::time_ms;
use tinynet::net::{ChannelOptions, ChannelState, EventLoop, RunMode, ServerOptions, SocketServer};
use tinynet::net::SocketChannel;
use tinynet::ErrorCode;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn start_echo_server(event_loop: &Rc<EventLoop>) -> SocketServer {
    let server = SocketServer::new(Rc::clone(event_loop));
    server.set_channel_callback(|channel| {
        let reader = channel.clone();
        channel.set_read_callback(move |_| {
            let Some(socket) = reader.socket() else { return };
            let data: Vec<u8> = {
                let mut buf = socket.recv_buffer();
                let data = buf.data().to_vec();
                buf.consume(data.len());
                data
            };
            if !data.is_empty() {
                reader.write(&data).unwrap();
            }
        });
    });
    server
        .start(ServerOptions {
            name: "echo".into(),
            url: "tcp://127.0.0.1:0".into(),
            ..Default::default()
        })
        .unwrap();
    server
}

#[test]
fn test_echo_roundtrip() {
    init_logging();
    let event_loop = EventLoop::new().unwrap();
    let server = start_echo_server(&event_loop);

    let channel = SocketChannel::new(Rc::clone(&event_loop));
    channel
        .init(ChannelOptions {
            name: "client".into(),
            url: format!("tcp://127.0.0.1:{}", server.local_port()),
            ..Default::default()
        })
        .unwrap();
    let writer = channel.clone();
    channel.set_open_callback(move |_| {
        writer.write(b"hello tinynet").unwrap();
    });
    let received = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&received);
    let reader = channel.clone();
    channel.set_read_callback(move |_| {
        let Some(socket) = reader.socket() else { return };
        let mut buf = socket.recv_buffer();
        let data = buf.data().to_vec();
        buf.consume(data.len());
        sink.borrow_mut().extend_from_slice(&data);
    });
    channel.open().unwrap();

    let deadline = time_ms() + 5000;
    while received.borrow().len() < 13 && time_ms() < deadline {
        event_loop.run(RunMode::Once);
    }
    assert_eq!(&received.borrow()[..], b"hello tinynet");
    server.stop();
}

#[test]
fn test_connect_refused_closes_channel_once() {
    init_logging();
    let event_loop = EventLoop::new().unwrap();
    // Grab a free port and release it so nothing is listening there.
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let channel = SocketChannel::new(Rc::clone(&event_loop));
    channel
        .init(ChannelOptions {
            url: format!("tcp://127.0.0.1:{}", port),
            ..Default::default()
        })
        .unwrap();
    let errors = Rc::new(RefCell::new(Vec::new()));
    let e = Rc::clone(&errors);
    channel.set_error_callback(move |err| e.borrow_mut().push(err));
    channel.open().unwrap();

    let deadline = time_ms() + 5000;
    while errors.borrow().is_empty() && time_ms() < deadline {
        event_loop.run(RunMode::Once);
    }
    assert_eq!(errors.borrow().as_slice(), &[ErrorCode::SocketConnectionRefused]);
    assert_eq!(channel.state(), ChannelState::Closed);
    // A second close stays silent.
    channel.close(ErrorCode::SocketRead);
    assert_eq!(errors.borrow().len(), 1);
}

#[test]
fn test_many_messages_in_both_directions() {
    init_logging();
    let event_loop = EventLoop::new().unwrap();
    let server = start_echo_server(&event_loop);

    let channel = SocketChannel::new(Rc::clone(&event_loop));
    channel
        .init(ChannelOptions {
            url: format!("tcp://127.0.0.1:{}", server.local_port()),
            ..Default::default()
        })
        .unwrap();
    // Enough bytes to overflow a single kernel send buffer pass.
    let message = vec![0xabu8; 256 * 1024];
    let expected = message.len();
    let writer = channel.clone();
    let payload = message.clone();
    channel.set_open_callback(move |_| {
        writer.write(&payload).unwrap();
    });
    let received = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&received);
    let reader = channel.clone();
    channel.set_read_callback(move |_| {
        let Some(socket) = reader.socket() else { return };
        let mut buf = socket.recv_buffer();
        let data = buf.data().to_vec();
        buf.consume(data.len());
        sink.borrow_mut().extend_from_slice(&data);
    });
    channel.open().unwrap();

    let deadline = time_ms() + 10_000;
    while received.borrow().len() < expected && time_ms() < deadline {
        event_loop.run(RunMode::Once);
    }
    assert_eq!(received.borrow().len(), expected);
    assert_eq!(&received.borrow()[..], &message[..]);
}
