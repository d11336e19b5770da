use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use botlink_frame::{encode_for_link, FrameConfig, Framing, MESSAGE_BLOCKED};
use botlink_host::{
    ClientId, ClientSelector, HostConfig, HostError, HostServer, MemorySink, RobotLink,
};
use botlink_transport::LinkListener;
use bytes::BytesMut;

const A: u8 = 0x10;
const B: u8 = 0x11;
const C: u8 = 0x12;

fn config(max_clients: usize, framing: Framing) -> HostConfig {
    HostConfig {
        bind: "127.0.0.1:0".into(),
        max_clients,
        framing,
        await_timeout_ms: 3_000,
        ..HostConfig::default()
    }
}

fn frame_config(framing: Framing) -> FrameConfig {
    FrameConfig {
        framing,
        read_timeout: Some(Duration::from_secs(5)),
        ..FrameConfig::default()
    }
}

fn wait_for(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(2));
    }
}

fn connect(server: &HostServer, framing: Framing) -> RobotLink {
    RobotLink::connect(server.local_addr(), frame_config(framing)).unwrap()
}

fn recorder(server: &HostServer, type_id: u8) -> Arc<Mutex<Vec<(ClientId, Vec<u8>)>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    server.dispatcher().register(type_id, move |msg| {
        sink.lock()
            .unwrap()
            .push((msg.client, msg.payload().to_vec()));
    });
    seen
}

#[test]
fn messages_arrive_in_order_for_both_framings() {
    for framing in [Framing::LengthPrefixed, Framing::Delimited] {
        let server = HostServer::start(config(2, framing)).unwrap();
        let seen = recorder(&server, A);
        let mut robot = connect(&server, framing);

        for i in 0..20u8 {
            robot.send(A, &[i, 0x00, i]).unwrap();
        }
        wait_for("20 messages", || seen.lock().unwrap().len() == 20);

        let payloads: Vec<Vec<u8>> = seen.lock().unwrap().iter().map(|(_, p)| p.clone()).collect();
        let expected: Vec<Vec<u8>> = (0..20u8).map(|i| vec![i, 0x00, i]).collect();
        assert_eq!(payloads, expected, "framing {framing}");
    }
}

#[test]
fn fragmented_writes_reassemble() {
    let server = HostServer::start(config(1, Framing::LengthPrefixed)).unwrap();
    let seen = recorder(&server, B);
    let mut link = LinkListener::connect(server.local_addr()).unwrap();

    let mut wire = BytesMut::new();
    encode_for_link(B, b"one byte at a time", &FrameConfig::default(), &mut wire).unwrap();
    for byte in wire.iter() {
        link.write_all(&[*byte]).unwrap();
        link.flush().unwrap();
    }

    wait_for("fragmented frame", || seen.lock().unwrap().len() == 1);
    assert_eq!(seen.lock().unwrap()[0].1, b"one byte at a time");
}

#[test]
fn blocking_mode_filters_and_notifies() {
    let sink = Arc::new(MemorySink::new());
    let server = HostServer::builder(config(1, Framing::LengthPrefixed))
        .with_diagnostics(sink.clone())
        .start()
        .unwrap();
    let counts: Vec<Arc<AtomicUsize>> = [A, B, C]
        .into_iter()
        .map(|type_id| {
            let count = Arc::new(AtomicUsize::new(0));
            let seen = Arc::clone(&count);
            server.dispatcher().register(type_id, move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            });
            count
        })
        .collect();
    server.dispatcher().enter_blocking([A]);

    let mut robot = connect(&server, Framing::LengthPrefixed);
    for type_id in [A, B, A, C] {
        robot.send(type_id, b"").unwrap();
    }

    let first = robot
        .recv_type(MESSAGE_BLOCKED, Duration::from_secs(5))
        .unwrap();
    let second = robot
        .recv_type(MESSAGE_BLOCKED, Duration::from_secs(5))
        .unwrap();
    assert_eq!(first.payload.as_ref(), &[B]);
    assert_eq!(second.payload.as_ref(), &[C]);

    wait_for("two A messages", || counts[0].load(Ordering::SeqCst) == 2);
    assert_eq!(counts[1].load(Ordering::SeqCst), 0);
    assert_eq!(counts[2].load(Ordering::SeqCst), 0);
    assert_eq!(sink.count("message_blocked"), 2);
}

#[test]
fn concurrent_waits_correlate_by_type() {
    const X: u8 = 0x20;
    const Y: u8 = 0x21;

    let server = HostServer::start(config(1, Framing::LengthPrefixed)).unwrap();
    let mut robot = connect(&server, Framing::LengthPrefixed);
    wait_for("robot", || server.handle().client_count() == 1);

    let spawn_wait = |type_id: u8| {
        let handle = server.handle().clone();
        thread::spawn(move || handle.await_message(type_id))
    };
    let wait_x = spawn_wait(X);
    let wait_y = spawn_wait(Y);
    wait_for("two waits", || server.dispatcher().pending_waits() == 2);

    robot.send(Y, b"why").unwrap();
    robot.send(X, b"ex").unwrap();

    assert_eq!(wait_x.join().unwrap().unwrap().payload().as_ref(), b"ex");
    assert_eq!(wait_y.join().unwrap().unwrap().payload().as_ref(), b"why");
}

#[test]
fn corrupt_client_does_not_disturb_others() {
    let sink = Arc::new(MemorySink::new());
    let server = HostServer::builder(config(2, Framing::LengthPrefixed))
        .with_diagnostics(sink.clone())
        .start()
        .unwrap();
    let seen = recorder(&server, A);

    let mut noisy = LinkListener::connect(server.local_addr()).unwrap();
    let mut healthy = connect(&server, Framing::LengthPrefixed);
    wait_for("two robots", || server.handle().client_count() == 2);

    let mut wire = BytesMut::new();
    wire.extend_from_slice(&[0x13, 0x37, 0x00, 0xAA]);
    encode_for_link(A, b"noisy", &FrameConfig::default(), &mut wire).unwrap();
    noisy.write_all(&wire).unwrap();
    for i in 0..5u8 {
        healthy.send(A, &[i]).unwrap();
    }

    wait_for("six messages", || seen.lock().unwrap().len() == 6);
    assert!(sink.count("header_corrupted") >= 1);

    let seen = seen.lock().unwrap();
    let noisy_id = seen
        .iter()
        .find(|(_, payload)| payload == b"noisy")
        .map(|(id, _)| *id)
        .unwrap();
    let healthy_payloads: Vec<u8> = seen
        .iter()
        .filter(|(id, _)| *id != noisy_id)
        .map(|(_, payload)| payload[0])
        .collect();
    assert_eq!(healthy_payloads, vec![0, 1, 2, 3, 4]);
}

#[test]
fn corrupted_frame_with_marker_in_payload_loses_only_itself() {
    let sink = Arc::new(MemorySink::new());
    let server = HostServer::builder(config(1, Framing::LengthPrefixed))
        .with_diagnostics(sink.clone())
        .start()
        .unwrap();
    let seen = recorder(&server, A);
    let mut link = LinkListener::connect(server.local_addr()).unwrap();

    let cfg = FrameConfig::default();
    let mut wire = BytesMut::new();
    encode_for_link(A, &[0], &cfg, &mut wire).unwrap();
    let bad_start = wire.len();
    encode_for_link(A, b"\xAA\x55\x00\x20pad", &cfg, &mut wire).unwrap();
    wire[bad_start] = 0x00;
    for i in 1..=3u8 {
        encode_for_link(A, &[i], &cfg, &mut wire).unwrap();
    }
    link.write_all(&wire).unwrap();

    wait_for("four messages", || seen.lock().unwrap().len() == 4);
    let payloads: Vec<Vec<u8>> = seen.lock().unwrap().iter().map(|(_, p)| p.clone()).collect();
    assert_eq!(payloads, vec![vec![0], vec![1], vec![2], vec![3]]);
    assert!(sink.count("header_corrupted") >= 1);
    assert_eq!(sink.count("checksum_mismatch"), 0);
}

#[test]
fn disconnect_leaves_other_clients_running() {
    let server = HostServer::start(config(2, Framing::LengthPrefixed)).unwrap();
    let seen = recorder(&server, A);

    let leaving = connect(&server, Framing::LengthPrefixed);
    let mut staying = connect(&server, Framing::LengthPrefixed);
    wait_for("two robots", || server.handle().client_count() == 2);

    leaving.shutdown();
    drop(leaving);
    wait_for("one robot", || server.handle().client_count() == 1);

    staying.send(A, b"alive").unwrap();
    wait_for("message", || seen.lock().unwrap().len() == 1);

    let id = server.handle().clients()[0].id;
    assert_eq!(server.handle().send(ClientSelector::All, B, &b"ack"[..]).unwrap(), 1);
    let frame = staying.recv_type(B, Duration::from_secs(5)).unwrap();
    assert_eq!(frame.payload.as_ref(), b"ack");
    assert_eq!(seen.lock().unwrap()[0].0, id);
}

#[test]
fn capacity_defers_then_admits() {
    let server = HostServer::start(config(2, Framing::LengthPrefixed)).unwrap();
    let first = connect(&server, Framing::LengthPrefixed);
    let _second = connect(&server, Framing::LengthPrefixed);
    wait_for("two robots", || server.handle().client_count() == 2);

    // TCP completes the handshake from the backlog; the host does not
    // admit the link until a slot frees.
    let _third = connect(&server, Framing::LengthPrefixed);
    thread::sleep(Duration::from_millis(50));
    assert_eq!(server.handle().client_count(), 2);

    first.shutdown();
    drop(first);
    wait_for("third admitted", || {
        server
            .handle()
            .clients()
            .iter()
            .any(|c| c.id == ClientId::new(3))
    });
    assert_eq!(server.handle().client_count(), 2);
}

#[test]
fn await_times_out_without_reply() {
    let mut cfg = config(1, Framing::LengthPrefixed);
    cfg.await_timeout_ms = 30;
    let server = HostServer::start(cfg).unwrap();

    let err = server.handle().await_message(0x55).unwrap_err();
    assert!(matches!(err, HostError::Timeout(_)));
    assert_eq!(server.dispatcher().pending_waits(), 0);
}

#[test]
fn echo_handler_replies_through_handle() {
    let server = HostServer::start(config(1, Framing::Delimited)).unwrap();
    let handle = server.handle().clone();
    server.dispatcher().register(A, move |msg| {
        let _ = handle.send(msg.client, B, msg.payload().clone());
    });

    let mut robot = connect(&server, Framing::Delimited);
    robot.send(A, b"echo\x00me").unwrap();
    let frame = robot.recv_type(B, Duration::from_secs(5)).unwrap();
    assert_eq!(frame.payload.as_ref(), b"echo\x00me");
}
