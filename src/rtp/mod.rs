//! RTP video depacketiser: reads UDP datagrams (optionally joined to a
//! multicast group), validates the RTP header, and reassembles per-SSRC
//! payload fragments into complete frames for the ImageConverter. Grounded
//! on the original tool's `rtpserver.cpp` for the overall shape (one bound
//! port, dispatch by payload type, key-frame gate before the first emitted
//! H.264 frame) and on this crate's [`crate::http`] module for the
//! `Rc<RefCell<_>>` state-sharing pattern needed to reach shared state from
//! 'static reactor callbacks.

mod h264;
mod header;
mod jpeg;

pub use header::RtpHeader;

use std::cell::RefCell;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::os::unix::io::AsRawFd;
use std::rc::Rc;
use std::time::Duration;

use h264::{H264Outcome, H264Reassembler};
use jpeg::{JpegOutcome, JpegReassembler};

use crate::reactor::{Reactor, TimerId};
use crate::Result;

const JPEG_PAYLOAD_TYPE: u8 = 26;
const DYNAMIC_PAYLOAD_RANGE: std::ops::RangeInclusive<u8> = 96..=127;

#[derive(Debug, Clone)]
pub struct DepacketiserConfig {
    pub bind_addr: SocketAddr,
    pub multicast_group: Option<Ipv4Addr>,
    pub source_stale_timeout: Duration,
    pub jpeg_fudge_factor: i32,
    /// Frames to tolerate without a key frame before giving up waiting and
    /// emitting anyway (mirrors the original's sanity limit of 100).
    pub key_frame_sanity_limit: u32,
}

impl Default for DepacketiserConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8000".parse().unwrap(),
            multicast_group: None,
            source_stale_timeout: Duration::from_secs(10),
            jpeg_fudge_factor: 0,
            key_frame_sanity_limit: 100,
        }
    }
}

/// A fully reassembled frame ready for [`crate::image::ImageConverter`] or
/// direct publication; `type_str` is `"jpeg"` or `"h264"`.
#[derive(Debug, Clone)]
pub struct AssembledFrame {
    pub bytes: Vec<u8>,
    pub type_str: &'static str,
}

struct SourceState {
    ssrc: u32,
    last_seq: Option<u16>,
    h264: H264Reassembler,
    jpeg: JpegReassembler,
    frame_count: u32,
    had_key_frame: bool,
    stale_timer: TimerId,
}

struct Inner {
    socket: UdpSocket,
    config: DepacketiserConfig,
    source: Option<SourceState>,
}

pub struct RtpDepacketiser {
    socket: UdpSocket,
}

impl RtpDepacketiser {
    pub fn bind(config: &DepacketiserConfig) -> Result<Self> {
        let socket = UdpSocket::bind(config.bind_addr)?;
        if let Some(group) = config.multicast_group {
            socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
        }
        socket.set_nonblocking(true)?;
        Ok(Self { socket })
    }

    /// Registers this socket on `reactor`; `on_frame` is invoked once per
    /// completed frame, gated by key-frame/loss policy for H.264.
    pub fn install(
        self,
        reactor: &mut Reactor,
        config: DepacketiserConfig,
        mut on_frame: impl FnMut(&mut Reactor, AssembledFrame) + 'static,
    ) {
        let fd = self.socket.as_raw_fd();
        let inner = Rc::new(RefCell::new(Inner { socket: self.socket, config, source: None }));
        let mut buf = vec![0u8; 65536];

        reactor.add_read(fd, move |r| {
            loop {
                let received = inner.borrow().socket.recv(&mut buf);
                let n = match received {
                    Ok(n) => n,
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(_) => break,
                };
                if let Some(frame) = handle_packet(&inner, r, &buf[..n]) {
                    on_frame(r, frame);
                }
            }
            Ok(())
        });
    }
}

fn handle_packet(inner: &Rc<RefCell<Inner>>, reactor: &mut Reactor, packet: &[u8]) -> Option<AssembledFrame> {
    let (header, offset) = match RtpHeader::parse(packet) {
        Ok(parsed) => parsed,
        Err(err) => {
            log::warn!("rtp: dropping malformed packet: {err}");
            return None;
        }
    };
    let payload = &packet[offset..];

    let current_ssrc = inner.borrow().source.as_ref().map(|s| s.ssrc);
    match current_ssrc {
        None => start_source(inner, reactor, header.ssrc),
        Some(ssrc) if ssrc == header.ssrc => rearm_stale_timer(inner, reactor),
        Some(_) => return None, // a second ssrc while the current one is still live: ignored until it goes stale
    }

    let gap = {
        let mut borrowed = inner.borrow_mut();
        let source = borrowed.source.as_mut()?;
        let gap = match source.last_seq {
            Some(last) => header.sequence != last.wrapping_add(1),
            None => false,
        };
        source.last_seq = Some(header.sequence);
        gap
    };
    if gap {
        let mut borrowed = inner.borrow_mut();
        if let Some(source) = borrowed.source.as_mut() {
            source.h264.reset();
            source.jpeg.reset();
            source.had_key_frame = false;
            source.frame_count = 0;
            log::debug!("rtp: sequence gap on ssrc {}, dropping in-flight reassembly", header.ssrc);
        }
    }

    let sanity_limit = inner.borrow().config.key_frame_sanity_limit;

    if header.payload_type == JPEG_PAYLOAD_TYPE {
        let mut borrowed = inner.borrow_mut();
        let source = borrowed.source.as_mut()?;
        match source.jpeg.push(payload, header.marker) {
            JpegOutcome::Complete(bytes) => Some(AssembledFrame { bytes, type_str: "jpeg" }),
            JpegOutcome::Incomplete => None,
            JpegOutcome::Invalid => {
                log::warn!("rtp: invalid rtp/jpeg fragment on ssrc {}", header.ssrc);
                None
            }
        }
    } else if DYNAMIC_PAYLOAD_RANGE.contains(&header.payload_type) {
        let mut borrowed = inner.borrow_mut();
        let source = borrowed.source.as_mut()?;
        match source.h264.push(payload) {
            H264Outcome::Complete { bytes, key_frame } => {
                source.frame_count += 1;
                if key_frame {
                    source.had_key_frame = true;
                }
                if !source.had_key_frame && source.frame_count < sanity_limit {
                    log::debug!(
                        "rtp: frame {} on ssrc {} ignored: waiting for first key frame",
                        source.frame_count,
                        header.ssrc
                    );
                    None
                } else {
                    Some(AssembledFrame { bytes, type_str: "h264" })
                }
            }
            H264Outcome::Incomplete => None,
            H264Outcome::Invalid => {
                log::warn!("rtp: invalid h264 fragment on ssrc {}", header.ssrc);
                None
            }
        }
    } else {
        log::warn!("rtp: unsupported payload type {} on ssrc {}", header.payload_type, header.ssrc);
        None
    }
}

fn start_source(inner: &Rc<RefCell<Inner>>, reactor: &mut Reactor, ssrc: u32) {
    let timer = schedule_stale_timer(inner, reactor);
    let jpeg_fudge = inner.borrow().config.jpeg_fudge_factor;
    let mut borrowed = inner.borrow_mut();
    if let Some(old) = borrowed.source.take() {
        reactor.cancel_timeout(old.stale_timer);
    }
    borrowed.source = Some(SourceState {
        ssrc,
        last_seq: None,
        h264: H264Reassembler::new(),
        jpeg: JpegReassembler::new(jpeg_fudge),
        frame_count: 0,
        had_key_frame: false,
        stale_timer: timer,
    });
    log::info!("rtp: accepting stream from new ssrc {ssrc}");
}

fn rearm_stale_timer(inner: &Rc<RefCell<Inner>>, reactor: &mut Reactor) {
    let old = inner.borrow_mut().source.as_mut().map(|s| s.stale_timer);
    if let Some(id) = old {
        reactor.cancel_timeout(id);
    }
    let timer = schedule_stale_timer(inner, reactor);
    if let Some(source) = inner.borrow_mut().source.as_mut() {
        source.stale_timer = timer;
    } else {
        reactor.cancel_timeout(timer);
    }
}

fn schedule_stale_timer(inner: &Rc<RefCell<Inner>>, reactor: &mut Reactor) -> TimerId {
    let timeout = inner.borrow().config.source_stale_timeout;
    let inner = inner.clone();
    reactor.set_timeout(timeout, move |_r| {
        if let Some(source) = inner.borrow_mut().source.take() {
            log::warn!("rtp: ssrc {} went stale, will accept a new source", source.ssrc);
        }
    })
}
