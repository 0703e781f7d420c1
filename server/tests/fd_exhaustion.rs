//! EMFILE rescue: the acceptor keeps making progress with the fd table full.
//!
//! Ignored by default: exhausting the process fd table starves anything else
//! running in the same process, including the test harness itself.

mod common;

use common::{test_config, wait_until, ServerHarness};
use io_reactor::EventLoop;
use server::TcpServer;
use std::fs::File;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

#[test]
#[ignore = "exhausts the process fd table"]
fn test_accept_survives_fd_exhaustion() {
    let base_loop = EventLoop::new().unwrap();
    let config = test_config("emfile-test", 47841, 1);
    let server = TcpServer::new(Arc::clone(&base_loop), &config).unwrap();
    server.set_message_callback(|conn, input| {
        let payload = input.bytes().to_vec();
        input.pop(payload.len());
        conn.send(&payload);
    });

    let harness = ServerHarness::start(base_loop, server);

    // Prove the server works before exhaustion.
    let mut probe = TcpStream::connect("127.0.0.1:47841").unwrap();
    probe.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    probe.write_all(b"ok").unwrap();
    let mut echoed = [0u8; 2];
    probe.read_exact(&mut echoed).unwrap();
    drop(probe);
    assert!(wait_until(Duration::from_secs(5), || {
        harness.server.connection_count() == 0
    }));

    // Occupy the fd table, keeping just enough spare for one client socket
    // per attempt. Every accept then hits EMFILE and the rescue descriptor
    // sheds the pending connection, so the readable edge never wedges.
    let mut hogs = Vec::new();
    while let Ok(file) = File::open("/dev/null") {
        hogs.push(file);
    }
    hogs.truncate(hogs.len().saturating_sub(3));

    for _ in 0..20 {
        if let Ok(mut client) = TcpStream::connect("127.0.0.1:47841") {
            client
                .set_read_timeout(Some(Duration::from_secs(2)))
                .unwrap();
            // A shed connection observes EOF or a reset; either is fine, the
            // point is that the accept loop keeps draining.
            let mut sink = Vec::new();
            let _ = client.read_to_end(&mut sink);
        }
    }

    // With the table freed, the acceptor must still be accepting.
    drop(hogs);
    let mut client = TcpStream::connect("127.0.0.1:47841").unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    client.write_all(b"after").unwrap();
    let mut echoed = [0u8; 5];
    client.read_exact(&mut echoed).unwrap();
    assert_eq!(&echoed, b"after");

    harness.shutdown();
}
