//! `vt-rtpserver`: binds a UDP port (optionally joined to a multicast
//! group), depacketises RTP/JPEG or RTP/H.264 into complete frames, and
//! republishes them on a PubChannel for downstream recorders, motion
//! comparators, and the HTTP server to pick up.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use clap::Parser;
use serde::Deserialize;

use vtbus::pubchannel::Channel;
use vtbus::reactor::Reactor;
use vtbus::rtp::{DepacketiserConfig, RtpDepacketiser};

#[derive(Parser)]
#[command(name = "vt-rtpserver", about = "RTP/JPEG and RTP/H.264 depacketiser bridging onto a PubChannel")]
struct Cli {
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// IPv4 multicast group to join on `bind`'s interface; omit for unicast.
    #[arg(long)]
    multicast_group: Option<Ipv4Addr>,

    #[arg(long)]
    channels_root: Option<PathBuf>,

    /// PubChannel name assembled frames are published on.
    #[arg(long)]
    channel: Option<String>,

    #[arg(long)]
    max_payload: Option<u64>,

    #[arg(long)]
    slots: Option<u32>,

    /// Seconds of silence from the current ssrc before a new source is accepted.
    #[arg(long)]
    source_stale_secs: Option<u64>,

    /// Quantization-table scaling fudge factor for RTP/JPEG reassembly.
    #[arg(long)]
    jpeg_fudge_factor: Option<i32>,

    /// H.264 frames tolerated without a key frame before giving up and emitting anyway.
    #[arg(long)]
    key_frame_sanity_limit: Option<u32>,

    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    bind: Option<SocketAddr>,
    multicast_group: Option<Ipv4Addr>,
    channels_root: Option<PathBuf>,
    channel: Option<String>,
    max_payload: Option<u64>,
    slots: Option<u32>,
    source_stale_secs: Option<u64>,
    jpeg_fudge_factor: Option<i32>,
    key_frame_sanity_limit: Option<u32>,
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
    let channel_name = cli.channel.or(file_config.channel).ok_or_else(|| anyhow::anyhow!("--channel is required"))?;
    let max_payload = cli.max_payload.or(file_config.max_payload).unwrap_or(4 * 1024 * 1024);
    let slots = cli.slots.or(file_config.slots).unwrap_or(4);

    let defaults = DepacketiserConfig::default();
    let config = DepacketiserConfig {
        bind_addr: cli.bind.or(file_config.bind).unwrap_or(defaults.bind_addr),
        multicast_group: cli.multicast_group.or(file_config.multicast_group),
        source_stale_timeout: Duration::from_secs(
            cli.source_stale_secs.or(file_config.source_stale_secs).unwrap_or(defaults.source_stale_timeout.as_secs()),
        ),
        jpeg_fudge_factor: cli.jpeg_fudge_factor.or(file_config.jpeg_fudge_factor).unwrap_or(defaults.jpeg_fudge_factor),
        key_frame_sanity_limit: cli
            .key_frame_sanity_limit
            .or(file_config.key_frame_sanity_limit)
            .unwrap_or(defaults.key_frame_sanity_limit),
    };

    let channel = Channel::create(&channels_root, &channel_name, max_payload, slots, b"{}")?;
    let publisher = channel.publisher();

    let mut reactor = Reactor::new();
    let depacketiser = RtpDepacketiser::bind(&config)?;
    log::info!(
        "vt-rtpserver: listening on {}{}, publishing to {channel_name}",
        config.bind_addr,
        config.multicast_group.map(|g| format!(" (multicast {g})")).unwrap_or_default(),
    );

    depacketiser.install(&mut reactor, config, move |_r, frame| {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
        if let Err(err) = publisher.publish(&frame.bytes, frame.type_str, now.as_secs(), now.subsec_micros()) {
            log::warn!("vt-rtpserver: failed to publish {} frame: {err}", frame.type_str);
        }
    });

    let reason = reactor.run();
    log::info!("vt-rtpserver: exiting ({reason:?})");
    Ok(())
}
