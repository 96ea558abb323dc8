//! Drives a real UDP socket through `RtpDepacketiser`: a non-key H.264 NAL
//! is gated out before the first key frame arrives, and once a key frame is
//! seen both it and the frames after it are emitted.

use std::net::UdpSocket;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use vtbus::reactor::Reactor;
use vtbus::rtp::{AssembledFrame, DepacketiserConfig, RtpDepacketiser};

fn free_port() -> u16 {
    UdpSocket::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port()
}

fn rtp_packet(payload_type: u8, seq: u16, ssrc: u32, payload: &[u8]) -> Vec<u8> {
    let mut p = vec![0x80, payload_type];
    p.extend_from_slice(&seq.to_be_bytes());
    p.extend_from_slice(&0u32.to_be_bytes());
    p.extend_from_slice(&ssrc.to_be_bytes());
    p.extend_from_slice(payload);
    p
}

#[test]
fn non_key_frames_are_gated_until_the_first_key_frame_then_pass_through() {
    let port = free_port();
    let config = DepacketiserConfig {
        bind_addr: format!("127.0.0.1:{port}").parse().unwrap(),
        source_stale_timeout: Duration::from_secs(30),
        ..DepacketiserConfig::default()
    };

    let frames: Arc<Mutex<Vec<AssembledFrame>>> = Arc::new(Mutex::new(Vec::new()));
    let collector = frames.clone();

    let mut reactor = Reactor::new();
    let stop = reactor.signal_flag();
    let depacketiser = RtpDepacketiser::bind(&config).expect("bind");
    depacketiser.install(&mut reactor, config, move |_r, frame| {
        collector.lock().unwrap().push(frame);
    });

    let handle = std::thread::spawn(move || reactor.run());
    std::thread::sleep(Duration::from_millis(50));

    let sender = UdpSocket::bind("127.0.0.1:0").expect("sender socket");
    let ssrc = 0xC0FFEE;

    // type 1, non-IDR slice: must be gated out, no key frame seen yet
    sender.send_to(&rtp_packet(96, 1, ssrc, &[0x21, 0xAA]), ("127.0.0.1", port)).expect("send non-key");
    // type 5, IDR slice: the first frame emitted
    sender.send_to(&rtp_packet(96, 2, ssrc, &[0x65, 0xBB]), ("127.0.0.1", port)).expect("send key frame");
    // another non-IDR slice after the key frame: now passes straight through
    sender.send_to(&rtp_packet(96, 3, ssrc, &[0x21, 0xCC]), ("127.0.0.1", port)).expect("send trailing");

    std::thread::sleep(Duration::from_millis(100));

    let collected = frames.lock().unwrap();
    assert_eq!(collected.len(), 2, "the pre-key-frame NAL must be dropped, the other two pass through");
    assert!(collected[0].bytes.windows(1).any(|w| w[0] & 0x1F == 5), "first emitted frame is the key frame");
    assert_eq!(collected[0].type_str, "h264");
    assert_eq!(collected[1].type_str, "h264");
    drop(collected);

    stop.store(true, Ordering::Release);
    sender.send_to(&rtp_packet(96, 4, ssrc, &[0x21, 0xDD]), ("127.0.0.1", port)).ok(); // wake the poll
    handle.join().expect("reactor thread");
}
