//! `vt-ctl`: small operator tool for the bus. Lists and tails channels,
//! fetches a single frame, and fires `;`-separated commands at a running
//! component's CommandBus address.

use std::error::Error;
use std::io::Write;
use std::net::UdpSocket;
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};

use vtbus::pubchannel::{self, Subscription};

#[derive(Parser)]
#[command(name = "vt-ctl", version, about = "Operator tool for the PubChannel bus")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List channels advertised under a channels root.
    List { channels_root: PathBuf },
    /// Fetch and describe the current frame on a channel, then exit.
    Peek {
        channels_root: PathBuf,
        channel: String,
    },
    /// Print one line per frame as they arrive; Ctrl-C to stop.
    Tail {
        channels_root: PathBuf,
        channel: String,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Send a command datagram to a CommandBus address.
    Send {
        /// `udp://host:port`, bare `host:port`, or a unix socket path.
        addr: String,
        /// Command verb, e.g. `fast`, `squelch=20`.
        verb: String,
        /// Extra whitespace-separated tokens appended after the verb.
        tokens: Vec<String>,
    },
    /// Remove a channel's on-disk directory; refuses while a publisher is alive.
    Purge {
        channels_root: PathBuf,
        channel: String,
    },
}

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let mut out = std::io::BufWriter::new(std::io::stdout());
    match cli.command {
        Commands::List { channels_root } => cmd_list(&channels_root, &mut out)?,
        Commands::Peek { channels_root, channel } => cmd_peek(&channels_root, &channel, &mut out)?,
        Commands::Tail { channels_root, channel, limit } => cmd_tail(&channels_root, &channel, limit, &mut out)?,
        Commands::Send { addr, verb, tokens } => cmd_send(&addr, &verb, &tokens)?,
        Commands::Purge { channels_root, channel } => cmd_purge(&channels_root, &channel)?,
    }
    Ok(())
}

fn cmd_list(channels_root: &Path, out: &mut dyn Write) -> Result<(), Box<dyn Error>> {
    let names = pubchannel::list(channels_root)?;
    if names.is_empty() {
        writeln!(out, "(no channels under {})", channels_root.display())?;
        return Ok(());
    }
    for name in names {
        writeln!(out, "{name}")?;
    }
    Ok(())
}

fn cmd_peek(channels_root: &Path, channel: &str, out: &mut dyn Write) -> Result<(), Box<dyn Error>> {
    let sub = Subscription::open(channels_root, channel)?;
    match sub.peek()? {
        Some((bytes, type_str, epoch_s, epoch_us)) => {
            writeln!(out, "type={type_str} bytes={} epoch={epoch_s}.{epoch_us:06}", bytes.len())?;
        }
        None => writeln!(out, "(no frame published yet on {channel})")?,
    }
    Ok(())
}

fn cmd_tail(channels_root: &Path, channel: &str, limit: Option<usize>, out: &mut dyn Write) -> Result<(), Box<dyn Error>> {
    let mut sub = Subscription::open(channels_root, channel)?;
    let mut count = 0usize;
    loop {
        let (bytes, type_str, epoch_s, epoch_us) = sub.receive()?;
        writeln!(out, "type={type_str} bytes={} epoch={epoch_s}.{epoch_us:06}", bytes.len())?;
        out.flush()?;
        count += 1;
        if limit.is_some_and(|limit| count >= limit) {
            break;
        }
    }
    Ok(())
}

fn cmd_send(addr: &str, verb: &str, tokens: &[String]) -> Result<(), Box<dyn Error>> {
    let mut datagram = verb.to_string();
    for token in tokens {
        datagram.push(' ');
        datagram.push_str(token);
    }

    if let Some(path) = addr.strip_prefix("unix://") {
        let socket = UnixDatagram::unbound()?;
        socket.send_to(datagram.as_bytes(), path)?;
    } else if addr.strip_prefix("udp://").is_some() || addr.parse::<std::net::SocketAddr>().is_ok() {
        let target = addr.strip_prefix("udp://").unwrap_or(addr);
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.send_to(datagram.as_bytes(), target)?;
    } else {
        let socket = UnixDatagram::unbound()?;
        socket.send_to(datagram.as_bytes(), addr)?;
    }
    Ok(())
}

fn cmd_purge(channels_root: &Path, channel: &str) -> Result<(), Box<dyn Error>> {
    pubchannel::delete(channels_root, channel)?;
    Ok(())
}
