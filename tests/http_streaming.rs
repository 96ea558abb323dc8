//! Exercises the HTTP server against a real TCP connection: a single-shot
//! request for a channel with a published frame returns it immediately, and
//! one with nothing published yet times out into a 503.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::Ordering;
use std::time::Duration;

use tempfile::tempdir;
use vtbus::http::{HttpServerCore, ServerConfig};
use vtbus::pubchannel::Channel;
use vtbus::reactor::Reactor;

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port()
}

fn read_response(stream: &mut TcpStream, wait_for_bytes: usize) -> Vec<u8> {
    stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buf.extend_from_slice(&chunk[..n]);
                if buf.len() >= wait_for_bytes {
                    break;
                }
            }
            Err(_) => break,
        }
    }
    buf
}

#[test]
fn single_shot_request_returns_the_published_frame() {
    let tmp = tempdir().expect("tempdir");
    let channel = Channel::create(tmp.path(), "cam0", 65536, 2, b"{}").expect("channel");
    channel.publisher().publish(b"jpeg-bytes", "jpeg", 1_700_000_000, 0).expect("publish");

    let port = free_port();
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}").parse().unwrap(),
        channels_root: tmp.path().to_path_buf(),
        data_timeout: Duration::from_secs(2),
        ..ServerConfig::default()
    };

    let mut reactor = Reactor::new();
    let stop = reactor.signal_flag();
    let server = HttpServerCore::bind(&config).expect("bind");
    server.install(&mut reactor, config).expect("install");

    let handle = std::thread::spawn(move || reactor.run());
    std::thread::sleep(Duration::from_millis(50));

    let mut stream = TcpStream::connect(("127.0.0.1", port)).expect("connect");
    stream.write_all(b"GET /_cam0 HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n").expect("write");
    let response = read_response(&mut stream, 1);
    let text = String::from_utf8_lossy(&response);

    assert!(text.starts_with("HTTP/1.1 200"), "unexpected status line: {text}");
    assert!(response.windows(b"jpeg-bytes".len()).any(|w| w == b"jpeg-bytes"));

    stop.store(true, Ordering::Release);
    let _ = TcpStream::connect(("127.0.0.1", port)); // wake the reactor's poll so it observes the stop flag
    handle.join().expect("reactor thread");
}

#[test]
fn single_shot_request_on_empty_channel_times_out_to_503() {
    let tmp = tempdir().expect("tempdir");
    let _channel = Channel::create(tmp.path(), "cam1", 65536, 2, b"{}").expect("channel");

    let port = free_port();
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}").parse().unwrap(),
        channels_root: tmp.path().to_path_buf(),
        data_timeout: Duration::from_millis(200),
        ..ServerConfig::default()
    };

    let mut reactor = Reactor::new();
    let stop = reactor.signal_flag();
    let server = HttpServerCore::bind(&config).expect("bind");
    server.install(&mut reactor, config).expect("install");

    let handle = std::thread::spawn(move || reactor.run());
    std::thread::sleep(Duration::from_millis(50));

    let mut stream = TcpStream::connect(("127.0.0.1", port)).expect("connect");
    stream.write_all(b"GET /_cam1 HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n").expect("write");
    let response = read_response(&mut stream, 1);
    let text = String::from_utf8_lossy(&response);

    assert!(text.starts_with("HTTP/1.1 503"), "expected a 503 while no frame is published, got: {text}");

    stop.store(true, Ordering::Release);
    let _ = TcpStream::connect(("127.0.0.1", port)); // wake the reactor's poll so it observes the stop flag
    handle.join().expect("reactor thread");
}
