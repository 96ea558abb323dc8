//! `vt-motion`: subscribes to a PubChannel, runs MotionCore over each
//! decoded frame, publishes the overlay image and JSON events on their own
//! channels, and accepts live `squelch=`/`threshold=`/`equalise=` tuning over
//! a CommandBus endpoint. On a motion event it can forward a one-shot `fast`
//! datagram to a recorder's CommandBus.

use std::cell::RefCell;
use std::net::UdpSocket;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use clap::Parser;
use serde::Deserialize;

use vtbus::commandbus::{Command, CommandBus};
use vtbus::image::ImageConverter;
use vtbus::motion::{MotionConfig, MotionCore};
use vtbus::pubchannel::{Channel, Subscription};
use vtbus::reactor::Reactor;

#[derive(Parser)]
#[command(name = "vt-motion", about = "Frame-to-frame motion comparator for a PubChannel")]
struct Cli {
    /// PubChannel name to analyse.
    #[arg(long)]
    channel: String,

    #[arg(long)]
    channels_root: Option<PathBuf>,

    /// Channel name the green/red overlay image is published on.
    #[arg(long)]
    overlay_channel: Option<String>,

    /// Channel name motion JSON events are published on.
    #[arg(long)]
    event_channel: Option<String>,

    #[arg(long)]
    max_payload: Option<u64>,

    #[arg(long)]
    slots: Option<u32>,

    #[arg(long)]
    scale: Option<u32>,

    #[arg(long)]
    squelch: Option<u8>,

    #[arg(long)]
    threshold: Option<u32>,

    #[arg(long)]
    log_threshold: Option<u32>,

    #[arg(long)]
    equalise: bool,

    #[arg(long)]
    plain: bool,

    #[arg(long)]
    mask: Option<PathBuf>,

    /// Minimum milliseconds between comparisons; frames arriving sooner are dropped.
    #[arg(long)]
    interval_ms: Option<u64>,

    /// Milliseconds between repeat re-emission of the last event; 0 disables it.
    #[arg(long)]
    repeat_ms: Option<u64>,

    /// CommandBus address this process listens on for live tuning.
    #[arg(long)]
    commandbus: Option<String>,

    /// CommandBus address of a recorder to send a one-shot `fast` to on a motion event.
    #[arg(long)]
    trigger: Option<String>,

    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    channels_root: Option<PathBuf>,
    overlay_channel: Option<String>,
    event_channel: Option<String>,
    max_payload: Option<u64>,
    slots: Option<u32>,
    scale: Option<u32>,
    squelch: Option<u8>,
    threshold: Option<u32>,
    log_threshold: Option<u32>,
    equalise: Option<bool>,
    plain: Option<bool>,
    mask: Option<PathBuf>,
    interval_ms: Option<u64>,
    repeat_ms: Option<u64>,
    commandbus: Option<String>,
    trigger: Option<String>,
}

struct State {
    core: MotionCore,
    scale: u32,
    interval: Duration,
    last_processed: Option<std::time::Instant>,
    overlay: Option<Arc<Channel>>,
    events: Option<Arc<Channel>>,
    trigger_socket: Option<UdpSocket>,
    trigger_addr: Option<String>,
}

fn main() {
    env_logger::init();
    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let file_config: FileConfig = match &cli.config {
        Some(path) => toml::from_str(&std::fs::read_to_string(path)?)?,
        None => FileConfig::default(),
    };

    let channels_root = cli.channels_root.or(file_config.channels_root).unwrap_or_else(|| PathBuf::from("/tmp/vtbus"));
    let max_payload = cli.max_payload.or(file_config.max_payload).unwrap_or(4 * 1024 * 1024);
    let slots = cli.slots.or(file_config.slots).unwrap_or(4);
    let scale = cli.scale.or(file_config.scale).unwrap_or(1);
    let trigger = cli.trigger.or(file_config.trigger);

    let interval_ms = cli.interval_ms.or(file_config.interval_ms).unwrap_or(MotionConfig::default().interval_ms);
    let motion_config = MotionConfig {
        interval_ms,
        scale,
        squelch: cli.squelch.or(file_config.squelch).unwrap_or(10),
        threshold: cli.threshold.or(file_config.threshold).unwrap_or(1),
        log_threshold: cli.log_threshold.or(file_config.log_threshold),
        equalise: cli.equalise || file_config.equalise.unwrap_or(false),
        mask_path: cli.mask.or(file_config.mask),
        plain: cli.plain || file_config.plain.unwrap_or(false),
    };

    let overlay_channel = cli.overlay_channel.or(file_config.overlay_channel);
    let overlay = match &overlay_channel {
        Some(name) => Some(Channel::create(&channels_root, name, max_payload, slots, b"{}")?),
        None => None,
    };
    let event_channel = cli.event_channel.or(file_config.event_channel);
    let events = match &event_channel {
        Some(name) => Some(Channel::create(&channels_root, name, max_payload, slots, b"{}")?),
        None => None,
    };
    let trigger_socket = if trigger.is_some() { Some(UdpSocket::bind("0.0.0.0:0")?) } else { None };

    let subscription = Subscription::open(&channels_root, &cli.channel)?;
    let sub_fd = subscription.fd();

    let interval = Duration::from_millis(interval_ms);
    let state = Rc::new(RefCell::new(State {
        core: MotionCore::new(motion_config),
        scale,
        interval,
        last_processed: None,
        overlay,
        events,
        trigger_socket,
        trigger_addr: trigger,
    }));

    let mut reactor = Reactor::new();

    if let Some(addr) = cli.commandbus.or(file_config.commandbus) {
        let bus = CommandBus::bind(&addr)?;
        let cmd_state = state.clone();
        bus.install(&mut reactor, move |_r, command: Command| {
            cmd_state.borrow_mut().core.apply_command(&command.verb);
        });
        log::info!("vt-motion: command bus listening on {addr}");
    }

    let repeat_ms = cli.repeat_ms.or(file_config.repeat_ms).unwrap_or(0);
    if repeat_ms > 0 {
        schedule_repeat(&mut reactor, state.clone(), Duration::from_millis(repeat_ms));
    }

    reactor.add_read(sub_fd, move |_r| {
        let _ = subscription.drain();
        if let Some((bytes, type_str, _epoch_s, _epoch_us)) = subscription.peek()? {
            handle_frame(&state, &bytes, &type_str);
        }
        Ok(())
    });

    let reason = reactor.run();
    log::info!("vt-motion: exiting ({reason:?})");
    Ok(())
}

fn schedule_repeat(reactor: &mut Reactor, state: Rc<RefCell<State>>, period: Duration) {
    reactor.set_timeout(period, move |r| {
        let now = now_epoch_s();
        if let Some(event) = state.borrow_mut().core.repeat_event(now) {
            publish_event(&state, &event);
        }
        schedule_repeat(r, state.clone(), period);
    });
}

fn handle_frame(state: &Rc<RefCell<State>>, bytes: &[u8], type_str: &str) {
    if type_str == "raw" {
        log::warn!("vt-motion: skipping frame of type raw: no embedded dimensions to decode from");
        return;
    }

    {
        let mut s = state.borrow_mut();
        let now = std::time::Instant::now();
        if let Some(last) = s.last_processed {
            if now.duration_since(last) < s.interval {
                return;
            }
        }
        s.last_processed = Some(now);
    }

    let scale = state.borrow().scale;
    let raw = match ImageConverter::to_raw(bytes, type_str, scale) {
        Ok(raw) => raw,
        Err(err) => {
            log::warn!("vt-motion: failed to decode frame: {err}");
            return;
        }
    };

    let now = now_epoch_s();
    let outcome = {
        let mut s = state.borrow_mut();
        match s.core.process(&raw.bytes, raw.dx, raw.dy, now) {
            Ok(outcome) => outcome,
            Err(err) => {
                log::warn!("vt-motion: comparator failed: {err}");
                return;
            }
        }
    };

    if let Some(overlay) = &state.borrow().overlay {
        let ppm = build_ppm(raw.dx, raw.dy, &outcome.overlay);
        if let Err(err) = overlay.publisher().publish(&ppm, "pnm", now as u64, 0) {
            log::warn!("vt-motion: failed to publish overlay frame: {err}");
        }
    }

    if let Some(event) = &outcome.event {
        publish_event(state, event);
        if let Some(addr) = &state.borrow().trigger_addr {
            send_trigger(state, addr);
        }
    } else if outcome.should_log {
        log::info!("vt-motion: below-threshold change observed (count={})", outcome.count);
    }
}

fn publish_event(state: &Rc<RefCell<State>>, event: &vtbus::motion::MotionEvent) {
    let json = match event.to_json() {
        Ok(json) => json,
        Err(err) => {
            log::warn!("vt-motion: failed to serialise event: {err}");
            return;
        }
    };
    log::info!("vt-motion: {json}");
    if let Some(events) = &state.borrow().events {
        if let Err(err) = events.publisher().publish(json.as_bytes(), "json", event.time as u64, 0) {
            log::warn!("vt-motion: failed to publish event: {err}");
        }
    }
}

fn send_trigger(state: &Rc<RefCell<State>>, addr: &str) {
    let s = state.borrow();
    let Some(socket) = &s.trigger_socket else { return };
    if socket.send_to(b"fast", addr).is_err() {
        log::warn!("vt-motion: failed to send fast trigger to {addr}");
    }
}

fn build_ppm(dx: usize, dy: usize, rgb: &[u8]) -> Vec<u8> {
    let mut out = format!("P6\n{dx} {dy}\n255\n").into_bytes();
    out.extend_from_slice(rgb);
    out
}

fn now_epoch_s() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
}
