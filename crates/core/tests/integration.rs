//! Integration tests over real sockets.
//!
//! Each test wires a `StreamTransmitter` to one end of a Unix socket pair or
//! a loopback TCP connection and drives the other end directly.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use rtptcp::{DEFAULT_MAX_PACKET_SIZE, PacketKind, StreamTransmitter, TransmissionParams, TransmitError};

fn transmitter<T: rtptcp::StreamTransport>(thread_safe: bool) -> StreamTransmitter<T> {
    let tx = StreamTransmitter::new();
    tx.init(thread_safe).unwrap();
    tx.create(DEFAULT_MAX_PACKET_SIZE, TransmissionParams::default())
        .unwrap();
    tx
}

/// Wait and poll until `count` packets are queued or the deadline passes.
fn receive<T: rtptcp::StreamTransport>(tx: &StreamTransmitter<T>, count: usize) -> Vec<rtptcp::RawPacket> {
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut packets = Vec::new();
    while packets.len() < count && Instant::now() < deadline {
        tx.wait_for_incoming_data(Duration::from_millis(200)).unwrap();
        tx.poll().unwrap();
        while let Ok(packet) = tx.get_next_packet() {
            packets.push(packet);
        }
    }
    packets
}

#[test]
fn unix_pair_round_trip() {
    let (local, mut peer) = UnixStream::pair().unwrap();
    let tx = transmitter(false);
    let id = tx.add_destination(local).unwrap();

    tx.send_rtp_data(&[0x80, 96, 0, 1, 0xAA]).unwrap();
    let mut wire = [0u8; 7];
    peer.read_exact(&mut wire).unwrap();
    assert_eq!(wire, [0, 5, 0x80, 96, 0, 1, 0xAA]);

    // One RTP and one RTCP frame, split mid-prefix.
    let mut bytes = rtptcp::encode_frame(&[0x80, 96, 0, 2, 1, 2, 3]).unwrap();
    bytes.extend(rtptcp::encode_frame(&[0x80, 200, 0, 6, 9, 9, 9, 9]).unwrap());
    peer.write_all(&bytes[..8]).unwrap();
    tx.poll().unwrap();
    peer.write_all(&bytes[8..]).unwrap();

    let packets = receive(&tx, 2);
    assert_eq!(packets.len(), 2);
    assert_eq!(packets[0].source(), id);
    assert_eq!(packets[0].kind(), PacketKind::Rtp);
    assert_eq!(packets[0].data(), &[0x80, 96, 0, 2, 1, 2, 3]);
    assert_eq!(packets[1].kind(), PacketKind::Rtcp);
}

#[test]
fn loopback_tcp_round_trip() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let mut client = TcpStream::connect(addr).unwrap();
    let (server, _) = listener.accept().unwrap();

    let tx = transmitter(true);
    tx.add_destination(server).unwrap();

    let payload: Vec<u8> = (0..1200u32).map(|i| i as u8).collect();
    client.write_all(&rtptcp::encode_frame(&payload).unwrap()).unwrap();

    let packets = receive(&tx, 1);
    assert_eq!(packets.len(), 1);
    assert_eq!(packets[0].data(), &payload[..]);

    tx.send_rtcp_data(&payload[..100]).unwrap();
    let mut wire = vec![0u8; 102];
    client.read_exact(&mut wire).unwrap();
    assert_eq!(&wire[2..], &payload[..100]);
}

#[test]
fn peer_close_removes_destination() {
    let (local, peer) = UnixStream::pair().unwrap();
    let tx = transmitter(false);
    let id = tx.add_destination(local).unwrap();
    drop(peer);

    assert!(tx.wait_for_incoming_data(Duration::from_secs(5)).unwrap());
    tx.poll().unwrap();
    assert!(matches!(
        tx.delete_destination(id),
        Err(TransmitError::DestinationNotFound(_))
    ));
}

#[test]
fn zero_timeout_wait_returns_at_once() {
    let (local, _peer) = UnixStream::pair().unwrap();
    let tx = transmitter(false);
    tx.add_destination(local).unwrap();

    let started = Instant::now();
    assert!(!tx.wait_for_incoming_data(Duration::ZERO).unwrap());
    assert!(started.elapsed() < Duration::from_millis(500));
}

#[test]
fn abort_wait_unblocks_waiter() {
    let (local, _peer) = UnixStream::pair().unwrap();
    let tx = Arc::new(transmitter(true));
    tx.add_destination(local).unwrap();

    let waiter = {
        let tx = tx.clone();
        thread::spawn(move || {
            let started = Instant::now();
            let available = tx.wait_for_incoming_data(Duration::from_secs(30)).unwrap();
            (available, started.elapsed())
        })
    };

    thread::sleep(Duration::from_millis(50));
    tx.abort_wait().unwrap();

    let (available, elapsed) = waiter.join().unwrap();
    assert!(!available);
    assert!(elapsed < Duration::from_secs(10));

    // The signal was drained: the next wait times out normally.
    let started = Instant::now();
    assert!(!tx.wait_for_incoming_data(Duration::from_millis(50)).unwrap());
    assert!(started.elapsed() >= Duration::from_millis(40));
}

#[test]
fn destroy_wakes_blocked_waiter() {
    let tx: Arc<StreamTransmitter<UnixStream>> = Arc::new(transmitter(true));
    let (local, _peer) = UnixStream::pair().unwrap();
    tx.add_destination(local).unwrap();

    let waiter = {
        let tx = tx.clone();
        thread::spawn(move || tx.wait_for_incoming_data(Duration::from_secs(30)))
    };

    thread::sleep(Duration::from_millis(50));
    tx.destroy();

    assert!(matches!(waiter.join().unwrap(), Ok(false)));
    assert!(matches!(tx.poll(), Err(TransmitError::NotInitialized)));
}

#[test]
fn concurrent_wait_rejected_without_thread_safety() {
    let (local, _peer) = UnixStream::pair().unwrap();
    let tx = Arc::new(transmitter(false));
    tx.add_destination(local).unwrap();

    let waiter = {
        let tx = tx.clone();
        thread::spawn(move || tx.wait_for_incoming_data(Duration::from_secs(30)))
    };

    thread::sleep(Duration::from_millis(50));
    assert!(matches!(
        tx.wait_for_incoming_data(Duration::ZERO),
        Err(TransmitError::AlreadyWaiting)
    ));

    tx.abort_wait().unwrap();
    assert!(matches!(waiter.join().unwrap(), Ok(false)));

    // The first wait has left; a new one is accepted again.
    assert!(!tx.wait_for_incoming_data(Duration::ZERO).unwrap());
}
