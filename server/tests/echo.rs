//! End-to-end echo behavior over real sockets.

mod common;

use common::{test_config, wait_until, ServerHarness};
use io_reactor::EventLoop;
use server::TcpServer;
use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn install_echo(server: &Arc<TcpServer>) {
    server.set_message_callback(|conn, input| {
        let payload = input.bytes().to_vec();
        input.pop(payload.len());
        conn.send(&payload);
    });
}

#[test]
fn test_echo_round_trip() {
    let base_loop = EventLoop::new().unwrap();
    let config = test_config("echo-test", 47811, 2);
    let server = TcpServer::new(Arc::clone(&base_loop), &config).unwrap();

    install_echo(&server);
    let closed = Arc::new(AtomicUsize::new(0));
    let closed_probe = Arc::clone(&closed);
    server.set_closed_callback(move |_conn| {
        closed_probe.fetch_add(1, Ordering::SeqCst);
    });

    let harness = ServerHarness::start(base_loop, server);

    let mut client = TcpStream::connect("127.0.0.1:47811").unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    client.write_all(b"ping\n").unwrap();

    let mut echoed = [0u8; 5];
    client.read_exact(&mut echoed).unwrap();
    assert_eq!(&echoed, b"ping\n");

    // Half-close the write side; the server tears the connection down and
    // the client observes EOF.
    client.shutdown(Shutdown::Write).unwrap();
    let mut rest = Vec::new();
    client.read_to_end(&mut rest).unwrap();
    assert!(rest.is_empty());

    assert!(wait_until(Duration::from_secs(5), || {
        closed.load(Ordering::SeqCst) == 1
    }));
    assert!(wait_until(Duration::from_secs(5), || {
        harness.server.connection_count() == 0
    }));

    harness.shutdown();
}

#[test]
fn test_echo_write_then_immediate_half_close() {
    let base_loop = EventLoop::new().unwrap();
    let config = test_config("echo-rdhup", 47812, 1);
    let server = TcpServer::new(Arc::clone(&base_loop), &config).unwrap();
    install_echo(&server);

    let harness = ServerHarness::start(base_loop, server);

    // Payload and FIN may land in the same readiness event; buffered bytes
    // are still echoed before the close.
    let mut client = TcpStream::connect("127.0.0.1:47812").unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    client.write_all(b"ping\n").unwrap();
    client.shutdown(Shutdown::Write).unwrap();

    let mut response = Vec::new();
    client.read_to_end(&mut response).unwrap();
    assert_eq!(response, b"ping\n");

    harness.shutdown();
}

#[test]
fn test_raw_data_callback_sees_same_bytes() {
    let base_loop = EventLoop::new().unwrap();
    let config = test_config("echo-raw", 47813, 1);
    let server = TcpServer::new(Arc::clone(&base_loop), &config).unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_probe = Arc::clone(&seen);
    server.set_raw_data_callback(move |_conn, bytes| {
        seen_probe.lock().unwrap().extend_from_slice(bytes);
    });
    install_echo(&server);

    let harness = ServerHarness::start(base_loop, server);

    let mut client = TcpStream::connect("127.0.0.1:47813").unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    client.write_all(b"hello raw").unwrap();

    let mut echoed = [0u8; 9];
    client.read_exact(&mut echoed).unwrap();
    assert_eq!(&echoed, b"hello raw");
    assert_eq!(seen.lock().unwrap().as_slice(), b"hello raw");

    harness.shutdown();
}

#[test]
fn test_shutdown_is_idempotent() {
    let base_loop = EventLoop::new().unwrap();
    let config = test_config("echo-close-once", 47814, 1);
    let server = TcpServer::new(Arc::clone(&base_loop), &config).unwrap();

    let conn_slot = Arc::new(Mutex::new(None));
    let slot_probe = Arc::clone(&conn_slot);
    server.set_connected_callback(move |conn| {
        *slot_probe.lock().unwrap() = Some(Arc::clone(conn));
    });
    let closed = Arc::new(AtomicUsize::new(0));
    let closed_probe = Arc::clone(&closed);
    server.set_closed_callback(move |_conn| {
        closed_probe.fetch_add(1, Ordering::SeqCst);
    });

    let harness = ServerHarness::start(base_loop, server);

    let mut client = TcpStream::connect("127.0.0.1:47814").unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    assert!(wait_until(Duration::from_secs(5), || {
        conn_slot.lock().unwrap().is_some()
    }));
    let conn = conn_slot.lock().unwrap().clone().unwrap();

    // Two shutdowns, one close callback.
    conn.shutdown();
    conn.shutdown();

    let mut rest = Vec::new();
    client.read_to_end(&mut rest).unwrap();
    drop(client);

    assert!(wait_until(Duration::from_secs(5), || {
        closed.load(Ordering::SeqCst) >= 1
    }));
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(closed.load(Ordering::SeqCst), 1);

    // Further sends fail fast once the connection is gone.
    assert!(!conn.send(b"late"));

    harness.shutdown();
}

#[test]
fn test_server_stop_is_idempotent() {
    let base_loop = EventLoop::new().unwrap();
    let config = test_config("echo-stop-twice", 47815, 1);
    let server = TcpServer::new(Arc::clone(&base_loop), &config).unwrap();
    install_echo(&server);

    let harness = ServerHarness::start(Arc::clone(&base_loop), Arc::clone(&server));

    let client = TcpStream::connect("127.0.0.1:47815").unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        server.connection_count() == 1
    }));
    drop(client);

    server.stop();
    server.stop();
    assert_eq!(server.connection_count(), 0);

    harness.shutdown();
}
