//! TLS echo over the real loop with a self-signed certificate minted at
//! test time.

use std::cell::RefCell;
use std::io::Write as _;
use std::rc::Rc;

use tinynet::net::event_loop::time_ms;
use tinynet::net::{ChannelOptions, EventLoop, RunMode, ServerOptions, SocketChannel, SocketServer};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Writes a fresh self-signed cert and key as PEM files and returns their
/// paths. Files land in the OS temp dir and are left behind.
fn mint_cert(tag: &str) -> (String, String) {
    let cert = rcgen::generate_simple_self_signed(vec![
        "localhost".to_string(),
        "127.0.0.1".to_string(),
    ])
    .unwrap();
    let dir = std::env::temp_dir();
    let cert_path = dir.join(format!("tinynet-{}-{}-cert.pem", tag, std::process::id()));
    let key_path = dir.join(format!("tinynet-{}-{}-key.pem", tag, std::process::id()));
    let mut cert_file = std::fs::File::create(&cert_path).unwrap();
    cert_file.write_all(cert.cert.pem().as_bytes()).unwrap();
    let mut key_file = std::fs::File::create(&key_path).unwrap();
    key_file
        .write_all(cert.key_pair.serialize_pem().as_bytes())
        .unwrap();
    (
        cert_path.to_string_lossy().into_owned(),
        key_path.to_string_lossy().into_owned(),
    )
}

fn start_tls_echo_server(event_loop: &Rc<EventLoop>, cert: &str, key: &str) -> SocketServer {
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
            name: "tls-echo".into(),
            url: "ssl://127.0.0.1:0".into(),
            tls_cert_file: Some(cert.to_string()),
            tls_key_file: Some(key.to_string()),
            ..Default::default()
        })
        .unwrap();
    server
}

fn run_echo(event_loop: &Rc<EventLoop>, port: u16, ca_file: Option<String>) -> Vec<u8> {
    let channel = SocketChannel::new(Rc::clone(event_loop));
    channel
        .init(ChannelOptions {
            name: "tls-client".into(),
            url: format!("ssl://127.0.0.1:{}", port),
            tls_ca_file: ca_file,
            ..Default::default()
        })
        .unwrap();
    let writer = channel.clone();
    channel.set_open_callback(move |_| {
        writer.write(b"over the wire, encrypted").unwrap();
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
    while received.borrow().len() < 24 && time_ms() < deadline {
        event_loop.run(RunMode::Once);
    }
    let out = received.borrow().clone();
    out
}

#[test]
fn test_tls_echo_with_verified_cert() {
    init_logging();
    let (cert, key) = mint_cert("verified");
    let event_loop = EventLoop::new().unwrap();
    let server = start_tls_echo_server(&event_loop, &cert, &key);
    // The self-signed cert doubles as the client's trust root.
    let echoed = run_echo(&event_loop, server.local_port(), Some(cert));
    assert_eq!(echoed, b"over the wire, encrypted");
    server.stop();
}

#[test]
fn test_tls_echo_without_verification() {
    init_logging();
    let (cert, key) = mint_cert("noverify");
    let event_loop = EventLoop::new().unwrap();
    let server = start_tls_echo_server(&event_loop, &cert, &key);
    let echoed = run_echo(&event_loop, server.local_port(), None);
    assert_eq!(echoed, b"over the wire, encrypted");
    server.stop();
}
