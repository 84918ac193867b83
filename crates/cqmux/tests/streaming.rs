//! Streaming dispatch: ordered broadcast, fan-out, and the
//! disconnect-during-write race in both event orders.

mod common;

use std::thread;
use std::time::Duration;

use common::{MockTransport, TestServer, wait_until};
use cqmux::{Error, StreamHandle};

type Transport = MockTransport<String, String>;

fn setup() -> (
    TestServer,
    Transport,
    StreamHandle<String>,
    crossbeam_channel::Receiver<String>,
) {
    let ts = TestServer::start();
    let transport = Transport::new();
    let (connected_tx, connected_rx) = crossbeam_channel::unbounded();
    let handle = ts
        .server
        .register_streaming("updates", transport.clone(), move |req: &String| {
            let _ = connected_tx.send(req.clone());
        })
        .unwrap();
    (ts, transport, handle, connected_rx)
}

#[test]
fn broadcast_fans_out_to_every_client_once() {
    let (_ts, transport, handle, connected) = setup();

    let a = transport.connect("a".to_owned());
    let b = transport.connect("b".to_owned());
    let c = transport.connect("c".to_owned());
    wait_until("3 clients active", || handle.active_clients() == 3);

    // The on-connect callback saw each client's initial request.
    let mut seen: Vec<String> = connected.try_iter().collect();
    seen.sort();
    assert_eq!(seen, ["a", "b", "c"]);

    handle.write("scene v2".to_owned()).unwrap();
    for client in [&a, &b, &c] {
        assert_eq!(client.received(), ["scene v2"]);
    }
}

#[test]
fn accept_slot_never_starves() {
    let (_ts, transport, handle, _connected) = setup();

    // Each connect lands on a freshly re-armed slot; if activation ever
    // failed to re-arm, one of these would time out waiting for it.
    for i in 0..5 {
        transport.connect(format!("client {i}"));
    }
    wait_until("5 clients active", || handle.active_clients() == 5);
}

#[test]
fn writes_are_globally_ordered() {
    let (_ts, transport, handle, _connected) = setup();

    let fast = transport.connect("fast".to_owned());
    let slow = transport.connect("slow".to_owned());
    wait_until("2 clients active", || handle.active_clients() == 2);
    slow.set_manual_ack();

    handle.write("m1".to_owned()).unwrap();

    let (done_tx, done_rx) = crossbeam_channel::bounded(1);
    let writer = {
        let handle = handle.clone();
        thread::spawn(move || {
            handle.write("m2".to_owned()).unwrap();
            done_tx.send(()).unwrap();
        })
    };

    // m1 has not settled on the slow client, so m2 must not be issued yet.
    assert!(done_rx.recv_timeout(Duration::from_millis(100)).is_err());
    assert_eq!(slow.received(), ["m1"]);
    assert_eq!(fast.received(), ["m1"]);

    slow.ack_write(true);
    done_rx
        .recv_timeout(Duration::from_secs(2))
        .expect("second write never settled");
    writer.join().unwrap();

    assert_eq!(slow.received(), ["m1", "m2"]);
    assert_eq!(fast.received(), ["m1", "m2"]);
}

#[test]
fn write_with_no_clients_returns_immediately() {
    let (_ts, _transport, handle, _connected) = setup();
    handle.write("nobody listening".to_owned()).unwrap();
    assert_eq!(handle.outstanding_tags(), 0);
}

#[test]
fn done_arriving_before_write_completion_defers_removal() {
    let (_ts, transport, handle, _connected) = setup();

    let doomed = transport.connect("doomed".to_owned());
    let healthy = transport.connect("healthy".to_owned());
    wait_until("2 clients active", || handle.active_clients() == 2);
    doomed.set_manual_ack();

    handle.write("update".to_owned()).unwrap();

    // The client hangs up while the write is still pending: its done
    // notification lands first.
    doomed.disconnect();
    // Two tags left once the done event (and the healthy client's write
    // completion) are consumed: the pending write and the healthy client's
    // done registration.
    wait_until("done event consumed", || handle.outstanding_tags() == 2);
    // Removal was deferred: a write is still outstanding against it.
    assert_eq!(handle.active_clients(), 2);

    // The write then settles as failed and performs the removal.
    doomed.ack_write(false);
    wait_until("doomed client removed", || handle.active_clients() == 1);
    assert_eq!(handle.outstanding_tags(), 1);

    handle.write("after".to_owned()).unwrap();
    assert_eq!(healthy.received(), ["update", "after"]);
    assert_eq!(doomed.received(), ["update"]);
}

#[test]
fn write_failure_before_done_removes_once() {
    let (_ts, transport, handle, _connected) = setup();

    let doomed = transport.connect("doomed".to_owned());
    let healthy = transport.connect("healthy".to_owned());
    wait_until("2 clients active", || handle.active_clients() == 2);
    doomed.set_manual_ack();

    handle.write("update".to_owned()).unwrap();

    // The failed write lands first and removes the connection.
    doomed.ack_write(false);
    wait_until("doomed client removed", || handle.active_clients() == 1);

    // The late done notification for the already-removed connection is a
    // safe no-op, not a double free.
    doomed.disconnect();
    wait_until("done event consumed", || handle.outstanding_tags() == 1);
    assert_eq!(handle.active_clients(), 1);

    handle.write("after".to_owned()).unwrap();
    assert_eq!(healthy.received(), ["update", "after"]);
    assert_eq!(doomed.received(), ["update"]);
}

#[test]
fn bounded_write_gives_up_on_stalled_client() {
    let (_ts, transport, handle, _connected) = setup();

    let slow = transport.connect("slow".to_owned());
    wait_until("1 client active", || handle.active_clients() == 1);
    slow.set_manual_ack();

    handle.write("m1".to_owned()).unwrap();
    assert_eq!(
        handle.write_timeout("m2".to_owned(), Duration::from_millis(50)),
        Err(Error::WriteTimeout)
    );

    slow.ack_write(true);
    handle.write("m3".to_owned()).unwrap();
    // m2 was never issued.
    assert_eq!(slow.received(), ["m1", "m3"]);
}
