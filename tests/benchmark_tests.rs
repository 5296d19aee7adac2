//! Performance benchmarks for the per-tick hot paths

use shared::datagram::MAX_DATAGRAM_SIZE;
use shared::session::ExportedKeys;
use shared::{
    validate_frame, DatagramChannel, Keypair, PlayerFrame, RaceServerFrame, Role, SecureSession,
    SessionContext, Vec3, ROOM_CAPACITY,
};
use std::net::TcpListener;
use std::thread;
use std::time::Instant;

fn full_frame(time: u32) -> RaceServerFrame {
    RaceServerFrame {
        time,
        player_times: vec![time; ROOM_CAPACITY],
        players: (0..ROOM_CAPACITY)
            .map(|i| PlayerFrame {
                pos: Vec3::new(i as f32 * 100.0, 20.0, -3000.0),
                internal_speed: 85.0,
                ..PlayerFrame::default()
            })
            .collect(),
    }
}

fn race_keys() -> (ExportedKeys, ExportedKeys) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let identity = Keypair::generate();
    let public = identity.public_key();

    let server = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        SecureSession::accept(stream, &identity, SessionContext::Room)
            .unwrap()
            .export_keys(SessionContext::Race)
            .unwrap()
    });
    let client = SecureSession::connect(addr, public, &Keypair::generate(), SessionContext::Room).unwrap();
    (
        client.export_keys(SessionContext::Race).unwrap(),
        server.join().unwrap(),
    )
}

/// Benchmarks validation of a full twelve-player frame
#[test]
fn benchmark_frame_validation() {
    let last = full_frame(1);
    let next = full_frame(2);

    let iterations = 100_000;
    let start = Instant::now();

    for _ in 0..iterations {
        assert!(validate_frame(&next, Some(&last), ROOM_CAPACITY).is_ok());
    }

    let duration = start.elapsed();
    println!(
        "Frame validation: {} iterations in {:?} ({:.2} ns/iter)",
        iterations,
        duration,
        duration.as_nanos() as f64 / iterations as f64
    );

    // One validation per tick, so this leaves a wide margin
    assert!(duration.as_millis() < 2000);
}

/// Benchmarks sealing and opening one full frame per iteration
#[test]
fn benchmark_datagram_round_trip() {
    let (client_keys, server_keys) = race_keys();
    let mut relay = DatagramChannel::new(&server_keys, Role::Responder);
    let mut racer = DatagramChannel::new(&client_keys, Role::Initiator);

    let iterations = 10_000;
    let start = Instant::now();

    for i in 0..iterations {
        let datagram = relay.seal(&full_frame(i)).unwrap();
        assert!(datagram.len() <= MAX_DATAGRAM_SIZE);
        let frame: RaceServerFrame = racer.open(&datagram).unwrap();
        assert_eq!(frame.time, i);
    }

    let duration = start.elapsed();
    println!(
        "Datagram seal+open: {} iterations in {:?} ({:.2} μs/iter)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    // 12 relayed frames per tick at 60 Hz is far below this
    assert!(duration.as_secs() < 10);
}

/// Benchmarks the full key exchange over loopback
#[test]
fn benchmark_handshake() {
    let iterations = 50;
    let start = Instant::now();

    for _ in 0..iterations {
        let _ = race_keys();
    }

    let duration = start.elapsed();
    println!(
        "Handshake: {} iterations in {:?} ({:.2} ms/iter)",
        iterations,
        duration,
        duration.as_millis() as f64 / iterations as f64
    );

    assert!(duration.as_secs() < 20);
}
