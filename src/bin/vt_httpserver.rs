//! `vt-httpserver`: serves PubChannel frames over HTTP as a `multipart/
//! x-mixed-replace` stream or single-shot snapshot, plus a static file tree
//! and a `/__` channel listing, wired straight onto [`HttpServerCore`].

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;

use vtbus::http::{HttpServerCore, ServerConfig};
use vtbus::reactor::Reactor;

#[derive(Parser)]
#[command(name = "vt-httpserver", about = "HTTP streaming server for the PubChannel bus")]
struct Cli {
    #[arg(long)]
    bind: Option<SocketAddr>,

    #[arg(long)]
    channels_root: Option<PathBuf>,

    /// Directory static files are served from; omit to disable static serving.
    #[arg(long)]
    dir: Option<PathBuf>,

    /// Channel name served at `/`.
    #[arg(long)]
    default_channel: Option<String>,

    /// Disables `/__` listing and `/_N`/`/_name` wildcard routing.
    #[arg(long)]
    no_wildcard: bool,

    /// `host:port` of a gateway `send=` forwards to; omit to disable.
    #[arg(long)]
    gateway: Option<SocketAddr>,

    #[arg(long)]
    idle_timeout_secs: Option<u64>,

    #[arg(long)]
    data_timeout_secs: Option<u64>,

    /// Re-sends the last frame on a streaming connection if this long passes
    /// without a new one; omit to disable the keep-alive repeat.
    #[arg(long)]
    repeat_timeout_secs: Option<u64>,

    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    bind: Option<SocketAddr>,
    channels_root: Option<PathBuf>,
    dir: Option<PathBuf>,
    default_channel: Option<String>,
    wildcard: Option<bool>,
    gateway: Option<SocketAddr>,
    idle_timeout_secs: Option<u64>,
    data_timeout_secs: Option<u64>,
    repeat_timeout_secs: Option<u64>,
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

    let defaults = ServerConfig::default();
    let config = ServerConfig {
        bind_addr: cli.bind.or(file_config.bind).unwrap_or(defaults.bind_addr),
        channels_root: cli.channels_root.or(file_config.channels_root).unwrap_or(defaults.channels_root),
        static_dir: cli.dir.or(file_config.dir),
        default_channel: cli.default_channel.or(file_config.default_channel),
        wildcard: if cli.no_wildcard { false } else { file_config.wildcard.unwrap_or(defaults.wildcard) },
        gateway: cli.gateway.or(file_config.gateway),
        idle_timeout: Duration::from_secs(cli.idle_timeout_secs.or(file_config.idle_timeout_secs).unwrap_or(defaults.idle_timeout.as_secs())),
        data_timeout: Duration::from_secs(cli.data_timeout_secs.or(file_config.data_timeout_secs).unwrap_or(defaults.data_timeout.as_secs())),
        repeat_timeout: cli.repeat_timeout_secs.or(file_config.repeat_timeout_secs).map(Duration::from_secs),
    };

    let mut reactor = Reactor::new();
    let server = HttpServerCore::bind(&config)?;
    log::info!("vt-httpserver: listening on {}, channels under {}", config.bind_addr, config.channels_root.display());
    server.install(&mut reactor, config)?;

    let reason = reactor.run();
    log::info!("vt-httpserver: exiting ({reason:?})");
    Ok(())
}
