//! End-to-end tests driving a real server over loopback TCP.

#![cfg(target_os = "linux")]

use echo_ring::config::Config;
use echo_ring::runtime::Server;
use socket2::SockRef;
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

const PREFIX: &[u8] = b"Server:";
const BUFFER_SIZE: usize = 1024;

struct TestServer {
    addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<std::io::Result<()>>>,
}

impl TestServer {
    fn start() -> Self {
        let config = Config {
            listen: "127.0.0.1:0".to_string(),
            backlog: 64,
            buffer_size: BUFFER_SIZE,
            max_connections: 64,
            ring_size: 256,
            wait_timeout_ms: 50,
            log_level: "warn".to_string(),
        };

        let server = Server::bind(config).expect("bind server");
        let addr = server.local_addr();
        let shutdown = server.shutdown_handle();
        let handle = thread::spawn(move || server.run());

        Self {
            addr,
            shutdown,
            handle: Some(handle),
        }
    }

    fn connect(&self) -> TcpStream {
        let stream = TcpStream::connect(self.addr).expect("connect");
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
    }

    fn stop(&mut self) -> std::io::Result<()> {
        self.shutdown.store(true, Ordering::Relaxed);
        match self.handle.take() {
            Some(handle) => handle.join().expect("server thread panicked"),
            None => Ok(()),
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

fn read_reply(stream: &mut TcpStream, payload_len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; PREFIX.len() + payload_len];
    stream.read_exact(&mut buf).expect("read reply");
    buf
}

#[test]
fn echo_roundtrip() {
    let server = TestServer::start();
    let mut stream = server.connect();

    stream.write_all(b"hello").unwrap();
    assert_eq!(read_reply(&mut stream, 5), b"Server:hello");

    // Exchanges continue indefinitely on the same connection
    stream.write_all(b"again").unwrap();
    assert_eq!(read_reply(&mut stream, 5), b"Server:again");
}

#[test]
fn echo_binary_payload() {
    let server = TestServer::start();
    let mut stream = server.connect();

    let payload: Vec<u8> = (0..=255u8).collect();
    stream.write_all(&payload).unwrap();

    let reply = read_reply(&mut stream, payload.len());
    assert_eq!(&reply[..PREFIX.len()], PREFIX);
    assert_eq!(&reply[PREFIX.len()..], &payload[..]);
}

#[test]
fn overlength_message_is_truncated() {
    let server = TestServer::start();
    let mut stream = server.connect();

    let message: Vec<u8> = (0..1500u32).map(|i| (i % 251) as u8).collect();
    stream.write_all(&message).unwrap();

    // First reply carries exactly the buffer capacity
    let reply = read_reply(&mut stream, BUFFER_SIZE);
    assert_eq!(&reply[..PREFIX.len()], PREFIX);
    assert_eq!(&reply[PREFIX.len()..], &message[..BUFFER_SIZE]);

    // The excess is treated as the next message, not reassembled
    let rest = message.len() - BUFFER_SIZE;
    let reply = read_reply(&mut stream, rest);
    assert_eq!(&reply[PREFIX.len()..], &message[BUFFER_SIZE..]);
}

#[test]
fn rapid_connections_are_all_accepted() {
    let server = TestServer::start();

    // Connect everyone before exchanging anything, so accepts must queue
    // behind a standing accept operation.
    let mut streams: Vec<TcpStream> = (0..16).map(|_| server.connect()).collect();

    for (i, stream) in streams.iter_mut().enumerate() {
        let msg = format!("conn-{i}");
        stream.write_all(msg.as_bytes()).unwrap();
        let reply = read_reply(stream, msg.len());
        assert_eq!(reply, [PREFIX, msg.as_bytes()].concat());
    }
}

#[test]
fn connections_are_isolated() {
    let server = TestServer::start();
    let mut a = server.connect();
    let mut b = server.connect();

    a.write_all(b"from-a").unwrap();
    b.write_all(b"from-b").unwrap();

    assert_eq!(read_reply(&mut b, 6), b"Server:from-b");
    assert_eq!(read_reply(&mut a, 6), b"Server:from-a");

    // Interleave a second round in the opposite order
    b.write_all(b"b-2").unwrap();
    a.write_all(b"a-2").unwrap();

    assert_eq!(read_reply(&mut a, 3), b"Server:a-2");
    assert_eq!(read_reply(&mut b, 3), b"Server:b-2");
}

#[test]
fn graceful_close_is_observed() {
    let server = TestServer::start();
    let mut stream = server.connect();

    stream.write_all(b"bye").unwrap();
    assert_eq!(read_reply(&mut stream, 3), b"Server:bye");

    // Orderly shutdown of our send side: the server's next receive
    // reports zero bytes and it closes its side.
    stream.shutdown(Shutdown::Write).unwrap();

    let mut buf = [0u8; 16];
    let n = stream.read(&mut buf).expect("read after shutdown");
    assert_eq!(n, 0);
}

#[test]
fn reset_connection_does_not_disturb_others() {
    let server = TestServer::start();
    let mut healthy = server.connect();
    let doomed = server.connect();

    healthy.write_all(b"one").unwrap();
    assert_eq!(read_reply(&mut healthy, 3), b"Server:one");

    // Forcibly reset the doomed connection mid-exchange
    SockRef::from(&doomed)
        .set_linger(Some(Duration::from_secs(0)))
        .unwrap();
    drop(doomed);

    // Give the server a moment to observe the reset
    thread::sleep(Duration::from_millis(100));

    healthy.write_all(b"two").unwrap();
    assert_eq!(read_reply(&mut healthy, 3), b"Server:two");
}

#[test]
fn shutdown_drains_open_connections() {
    let mut server = TestServer::start();
    let mut stream = server.connect();

    stream.write_all(b"ping").unwrap();
    assert_eq!(read_reply(&mut stream, 4), b"Server:ping");

    server.stop().expect("clean shutdown");

    // The server shut our endpoint down during the drain
    let mut buf = [0u8; 16];
    let n = stream.read(&mut buf).expect("read after server stop");
    assert_eq!(n, 0);
}

#[test]
fn shutdown_with_no_connections() {
    let mut server = TestServer::start();
    server.stop().expect("clean shutdown");
}
