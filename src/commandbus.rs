//! A datagram command endpoint: UDP or a local-domain socket, parsed into
//! `;`-separated commands and delivered to a per-component dispatch
//! callback. No direct teacher precedent for a UDP/Unix-datagram control
//! plane; grounded on this crate's own established pattern for wiring a raw
//! fd into the [`crate::reactor::Reactor`] (the same `add_read` + boxed
//! callback shape [`crate::pubchannel::Subscription`] and [`crate::http`]
//! use), since a command socket is just another readable fd.

use std::net::UdpSocket;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixDatagram;
use std::path::Path;

use crate::reactor::Reactor;
use crate::{Error, Result};

/// One parsed command: a verb plus its argument tokens, each either bare
/// (`"forwards"`) or `key=value` (`"squelch=20"`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub verb: String,
    pub tokens: Vec<String>,
}

impl Command {
    /// Looks up a `key=value` token's value among this command's tokens.
    pub fn arg(&self, key: &str) -> Option<&str> {
        self.tokens.iter().find_map(|t| t.strip_prefix(&format!("{key}=")))
    }

    pub fn has_flag(&self, flag: &str) -> bool {
        self.tokens.iter().any(|t| t == flag)
    }
}

enum Endpoint {
    Udp(UdpSocket),
    Unix(UnixDatagram),
}

impl Endpoint {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            Endpoint::Udp(s) => s.as_raw_fd(),
            Endpoint::Unix(s) => s.as_raw_fd(),
        }
    }

    fn recv(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Endpoint::Udp(s) => s.recv(buf),
            Endpoint::Unix(s) => s.recv(buf),
        }
    }
}

pub struct CommandBus {
    endpoint: Endpoint,
}

impl CommandBus {
    /// `addr_spec` is one of: `udp://host:port`, `host:port` (numeric port),
    /// or a filesystem path, which binds a local-domain datagram socket
    /// (removing any stale socket file left at that path first).
    pub fn bind(addr_spec: &str) -> Result<Self> {
        if let Some(rest) = addr_spec.strip_prefix("udp://") {
            let socket = UdpSocket::bind(rest)?;
            socket.set_nonblocking(true)?;
            return Ok(Self { endpoint: Endpoint::Udp(socket) });
        }
        if is_host_port(addr_spec) {
            let socket = UdpSocket::bind(addr_spec)?;
            socket.set_nonblocking(true)?;
            return Ok(Self { endpoint: Endpoint::Udp(socket) });
        }
        if !looks_like_socket_path(addr_spec) {
            return Err(unsupported_spec(addr_spec));
        }
        let path = Path::new(addr_spec);
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        let socket = UnixDatagram::bind(path)?;
        socket.set_nonblocking(true)?;
        Ok(Self { endpoint: Endpoint::Unix(socket) })
    }

    /// Registers this endpoint's fd on `reactor`; each incoming datagram is
    /// parsed into zero or more [`Command`]s and handed to `dispatch` in
    /// order. Malformed datagrams are logged and otherwise ignored — the
    /// endpoint never shuts down on bad input.
    pub fn install(self, reactor: &mut Reactor, mut dispatch: impl FnMut(&mut Reactor, Command) + 'static) {
        let fd = self.endpoint.as_raw_fd();
        let endpoint = self.endpoint;
        let mut buf = vec![0u8; 4096];
        reactor.add_read(fd, move |r| {
            loop {
                match endpoint.recv(&mut buf) {
                    Ok(n) => {
                        let text = String::from_utf8_lossy(&buf[..n]);
                        for command in parse_datagram(&text) {
                            dispatch(r, command);
                        }
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(_) => break,
                }
            }
            Ok(())
        });
    }
}

fn is_host_port(spec: &str) -> bool {
    match spec.rsplit_once(':') {
        Some((_host, port)) => port.parse::<u16>().is_ok(),
        None => false,
    }
}

/// Rejects specs that were clearly meant as a network address (an unknown
/// `scheme://` or embedded whitespace) rather than a filesystem path, so
/// they fail with a clear diagnostic instead of silently binding a Unix
/// socket at a garbage path.
fn looks_like_socket_path(spec: &str) -> bool {
    !spec.is_empty() && !spec.contains("://") && !spec.chars().any(char::is_whitespace)
}

fn parse_datagram(text: &str) -> Vec<Command> {
    text.split(';')
        .filter_map(|raw| {
            let raw = raw.trim();
            if raw.is_empty() {
                return None;
            }
            let mut parts = raw.split_whitespace();
            let verb = parts.next()?.to_string();
            let tokens = parts.map(str::to_string).collect();
            Some(Command { verb, tokens })
        })
        .collect()
}

impl std::fmt::Debug for CommandBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandBus").finish_non_exhaustive()
    }
}

fn unsupported_spec(spec: &str) -> Error {
    Error::Config(format!("unsupported command bus address {spec:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_semicolon_separated_commands() {
        let cmds = parse_datagram("squelch=20;threshold=5");
        assert_eq!(cmds, vec![
            Command { verb: "squelch=20".to_string(), tokens: vec![] },
            Command { verb: "threshold=5".to_string(), tokens: vec![] },
        ]);
    }

    #[test]
    fn parses_verb_with_flag_and_kv_tokens() {
        let cmds = parse_datagram("play --forwards --skip=10");
        assert_eq!(cmds.len(), 1);
        assert_eq!(cmds[0].verb, "play");
        assert!(cmds[0].has_flag("--forwards"));
        assert_eq!(cmds[0].arg("--skip"), Some("10"));
    }

    #[test]
    fn blank_segments_are_skipped() {
        let cmds = parse_datagram("fast;;  ;stop");
        assert_eq!(cmds.len(), 2);
        assert_eq!(cmds[0].verb, "fast");
        assert_eq!(cmds[1].verb, "stop");
    }

    #[test]
    fn host_port_spec_is_detected() {
        assert!(is_host_port("127.0.0.1:9000"));
        assert!(!is_host_port("/tmp/vt.sock"));
        assert!(!is_host_port("not-a-port:abc"));
    }

    #[test]
    fn bind_unix_socket_at_path() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("cmd.sock");
        let bus = CommandBus::bind(path.to_str().unwrap()).unwrap();
        assert!(matches!(bus.endpoint, Endpoint::Unix(_)));
        assert!(path.exists());
    }

    #[test]
    fn bind_rejects_an_unknown_address_scheme() {
        let err = CommandBus::bind("tcp://127.0.0.1:9000").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn bind_rejects_a_spec_with_embedded_whitespace() {
        let err = CommandBus::bind("not a path").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
