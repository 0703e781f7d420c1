//! Cross-thread send ordering: per-producer order is preserved end to end.

mod common;

use common::{test_config, wait_until, ServerHarness};
use io_reactor::EventLoop;
use server::{TcpConnection, TcpServer};
use std::io::Read;
use std::net::TcpStream;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

const PRODUCERS: usize = 10;
const LINES_PER_PRODUCER: usize = 1000;

#[test]
fn test_cross_thread_send_order() {
    let base_loop = EventLoop::new().unwrap();
    let config = test_config("order-test", 47821, 2);
    let server = TcpServer::new(Arc::clone(&base_loop), &config).unwrap();

    let conn_slot: Arc<Mutex<Option<Arc<TcpConnection>>>> = Arc::new(Mutex::new(None));
    let slot_probe = Arc::clone(&conn_slot);
    server.set_connected_callback(move |conn| {
        *slot_probe.lock().unwrap() = Some(Arc::clone(conn));
    });

    let harness = ServerHarness::start(base_loop, server);

    let mut client = TcpStream::connect("127.0.0.1:47821").unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();

    assert!(wait_until(Duration::from_secs(5), || {
        conn_slot.lock().unwrap().is_some()
    }));
    let conn = conn_slot.lock().unwrap().clone().unwrap();

    // Every line is "T<tid>-<seq 4 digits>\n": 8 bytes for single-digit tids.
    let reader = thread::spawn(move || {
        let mut buf = vec![0u8; PRODUCERS * LINES_PER_PRODUCER * 8];
        client.read_exact(&mut buf).expect("read all lines");
        buf
    });

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|tid| {
            let conn = Arc::clone(&conn);
            thread::spawn(move || {
                for seq in 0..LINES_PER_PRODUCER {
                    let line = format!("T{}-{:04}\n", tid, seq);
                    assert!(conn.send(line.as_bytes()));
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }

    let received = reader.join().unwrap();
    let text = String::from_utf8(received).unwrap();

    let mut next_seq = [0usize; PRODUCERS];
    let mut total = 0usize;
    for line in text.lines() {
        let (tid_part, seq_part) = line
            .strip_prefix('T')
            .and_then(|rest| rest.split_once('-'))
            .expect("well-formed line");
        let tid: usize = tid_part.parse().unwrap();
        let seq: usize = seq_part.parse().unwrap();
        assert_eq!(
            seq, next_seq[tid],
            "producer {} lines arrived out of order",
            tid
        );
        next_seq[tid] += 1;
        total += 1;
    }
    assert_eq!(total, PRODUCERS * LINES_PER_PRODUCER);
    assert!(next_seq.iter().all(|&n| n == LINES_PER_PRODUCER));

    harness.shutdown();
}
