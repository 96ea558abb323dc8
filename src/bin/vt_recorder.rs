//! `vt-recorder`: subscribes to a PubChannel, keeps a pre-roll ring via
//! FrameCache, and persists frames to a FileStore tree once recording is
//! switched to `fast` or `slow` over a CommandBus endpoint. Fast records
//! every frame, slow one per second, stopped none (but the cache keeps
//! filling regardless, ready for a `fast` command to pre-roll it).

use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;

use clap::Parser;
use serde::Deserialize;

use vtbus::commandbus::{Command, CommandBus};
use vtbus::filestore::{ext_for_type, EpochTime, FileStore};
use vtbus::framecache::{CacheConfig, FrameCache};
use vtbus::pubchannel::Subscription;
use vtbus::reactor::Reactor;

#[derive(Parser)]
#[command(name = "vt-recorder", about = "Pre-roll frame recorder for a PubChannel")]
struct Cli {
    /// PubChannel name to subscribe to.
    #[arg(long)]
    channel: String,

    /// Directory PubChannel channels are discovered under.
    #[arg(long)]
    channels_root: Option<PathBuf>,

    /// FileStore base directory.
    #[arg(long)]
    store: Option<PathBuf>,

    /// Filename prefix written into every persisted frame; defaults to the channel name.
    #[arg(long)]
    prefix: Option<String>,

    /// Fixed UTC offset in seconds used for path derivation.
    #[arg(long)]
    tz_offset: Option<i64>,

    /// Pre-roll ring capacity; 0 disables caching.
    #[arg(long)]
    cache: Option<usize>,

    /// Starting recording mode: fast, slow or stopped.
    #[arg(long)]
    mode: Option<String>,

    /// CommandBus address (`udp://host:port`, `host:port`, or a unix socket path).
    #[arg(long)]
    commandbus: Option<String>,

    /// Optional TOML config file; CLI flags override its values.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    channels_root: Option<PathBuf>,
    store: Option<PathBuf>,
    prefix: Option<String>,
    tz_offset: Option<i64>,
    cache: Option<usize>,
    mode: Option<String>,
    commandbus: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordMode {
    Fast,
    Slow,
    Stopped,
}

impl RecordMode {
    fn parse(s: &str) -> anyhow::Result<Self> {
        match s {
            "fast" => Ok(RecordMode::Fast),
            "slow" => Ok(RecordMode::Slow),
            "stopped" => Ok(RecordMode::Stopped),
            other => anyhow::bail!("invalid recording mode {other:?}, expected fast/slow/stopped"),
        }
    }
}

struct State {
    store: FileStore,
    cache: FrameCache,
    mode: RecordMode,
    last_slow_secs: Option<i64>,
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
    let store_base = cli.store.or(file_config.store).ok_or_else(|| anyhow::anyhow!("--store is required"))?;
    let prefix = cli.prefix.or(file_config.prefix).unwrap_or_else(|| cli.channel.clone());
    let tz_offset = cli.tz_offset.or(file_config.tz_offset).unwrap_or(0);
    let cache_capacity = cli.cache.or(file_config.cache).unwrap_or(0);
    let mode = RecordMode::parse(&cli.mode.or(file_config.mode).unwrap_or_else(|| "stopped".to_string()))?;
    let commandbus_addr = cli.commandbus.or(file_config.commandbus);

    let removed = vtbus::framecache::sweep_startup(&store_base)?;
    if removed > 0 {
        log::info!("vt-recorder: swept {removed} leftover scratch file(s) from a previous run");
    }

    let subscription = Subscription::open(&channels_root, &cli.channel)?;
    let sub_fd = subscription.fd();

    let store = FileStore::new(&store_base, &prefix, tz_offset);
    let cache = FrameCache::new(&store_base, CacheConfig { capacity: cache_capacity })?;
    let state = Rc::new(RefCell::new(State { store, cache, mode, last_slow_secs: None }));

    let mut reactor = Reactor::new();

    if let Some(addr) = commandbus_addr {
        let bus = CommandBus::bind(&addr)?;
        let cmd_state = state.clone();
        bus.install(&mut reactor, move |_r, command: Command| {
            handle_command(&cmd_state, &command);
        });
        log::info!("vt-recorder: command bus listening on {addr}");
    }

    reactor.add_read(sub_fd, move |_r| {
        let _ = subscription.drain();
        if let Some((bytes, type_str, epoch_s, epoch_us)) = subscription.peek()? {
            handle_frame(&state, &bytes, &type_str, epoch_s, epoch_us);
        }
        Ok(())
    });

    let reason = reactor.run();
    log::info!("vt-recorder: exiting ({reason:?})");
    Ok(())
}

fn handle_command(state: &Rc<RefCell<State>>, command: &Command) {
    let mut s = state.borrow_mut();
    match command.verb.as_str() {
        "fast" => {
            match s.cache.commit(false) {
                Ok(stats) => log::info!("vt-recorder: fast: pre-roll committed {} frame(s), {} failed", stats.committed, stats.failed),
                Err(err) => log::warn!("vt-recorder: fast: pre-roll commit failed: {err}"),
            }
            s.mode = RecordMode::Fast;
        }
        "slow" => s.mode = RecordMode::Slow,
        "stop" => s.mode = RecordMode::Stopped,
        other => log::warn!("vt-recorder: ignoring unknown command {other:?}"),
    }
}

fn handle_frame(state: &Rc<RefCell<State>>, bytes: &[u8], type_str: &str, epoch_s: u64, epoch_us: u32) {
    let mut s = state.borrow_mut();
    let epoch_time = EpochTime { secs: epoch_s as i64, micros: epoch_us };
    let ext = ext_for_type(type_str);

    match s.mode {
        RecordMode::Fast => {
            let actual = match s.store.write(epoch_time, ext, bytes) {
                Ok(path) => path,
                Err(err) => {
                    log::warn!("vt-recorder: failed to persist frame: {err}");
                    return;
                }
            };
            if let Err(err) = s.cache.store(bytes, &actual, Some(&actual)) {
                log::warn!("vt-recorder: failed to track committed frame in cache: {err}");
            }
        }
        RecordMode::Slow => {
            let due = s.last_slow_secs != Some(epoch_time.secs);
            if due {
                s.last_slow_secs = Some(epoch_time.secs);
                if let Err(err) = s.store.write(epoch_time, ext, bytes) {
                    log::warn!("vt-recorder: failed to persist frame: {err}");
                }
            }
            let eventual = match s.store.path_for(epoch_time, ext, true) {
                Ok(p) => p,
                Err(err) => {
                    log::warn!("vt-recorder: failed to derive cache path: {err}");
                    return;
                }
            };
            if let Err(err) = s.cache.store(bytes, &eventual, None) {
                log::warn!("vt-recorder: failed to buffer frame in pre-roll ring: {err}");
            }
        }
        RecordMode::Stopped => {
            let eventual = match s.store.path_for(epoch_time, ext, true) {
                Ok(p) => p,
                Err(err) => {
                    log::warn!("vt-recorder: failed to derive cache path: {err}");
                    return;
                }
            };
            if let Err(err) = s.cache.store(bytes, &eventual, None) {
                log::warn!("vt-recorder: failed to buffer frame in pre-roll ring: {err}");
            }
        }
    }
}
