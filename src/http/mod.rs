//! HTTP/1.1 streaming server: multiplexes PubChannel subscriptions to remote
//! clients as `multipart/x-mixed-replace` or single-shot responses, serves
//! static files under a configured directory, and forwards `send=` commands
//! to a gateway over UDP. Wired into one [`crate::reactor::Reactor`] per
//! process the same way [`crate::pubchannel`] wires subscriptions: raw fds
//! registered with `add_read`/`add_write`, state held in `Rc<RefCell<_>>` so
//! reactor callbacks (which only see `&mut Reactor`) can still reach it.

mod multipart;
mod request;
mod response;

pub use request::Request;

use std::cell::RefCell;
use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

use crate::pubchannel::Subscription;
use crate::reactor::{Reactor, TimerId};
use crate::Result;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    /// Root directory PubChannel channels are discovered under.
    pub channels_root: PathBuf,
    /// Static files served under `/<relpath>`; `None` disables static serving.
    pub static_dir: Option<PathBuf>,
    /// Channel served at `/`.
    pub default_channel: Option<String>,
    /// Enables `/__` (JSON channel listing) and `/_N` index routing.
    pub wildcard: bool,
    /// `(gateway_ip, port)` for `send=` forwarding; `None` disables it.
    pub gateway: Option<SocketAddr>,
    pub idle_timeout: Duration,
    /// How long a single-shot or first streaming frame may take before 503.
    pub data_timeout: Duration,
    /// If no new frame arrives on a streaming connection within this long,
    /// re-send the last delivered one to keep intermediaries (proxies,
    /// multipart-aware browsers) from treating the connection as dead.
    /// `None` disables the repeat.
    pub repeat_timeout: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".parse().unwrap(),
            channels_root: PathBuf::from("/tmp/vtbus"),
            static_dir: None,
            default_channel: None,
            wildcard: true,
            gateway: None,
            idle_timeout: Duration::from_secs(30),
            data_timeout: Duration::from_secs(5),
            repeat_timeout: None,
        }
    }
}

enum Body {
    None,
    Streaming(StreamingBody),
}

struct StreamingBody {
    subscription: Subscription,
    boundary: String,
    skipped: u64,
    /// Query-string `scale`/`type` applied to every frame on this connection.
    scale: u32,
    type_param: Option<String>,
    repeat_timeout: Option<Duration>,
    repeat_timer: Option<TimerId>,
    last_frame: Option<Vec<u8>>,
}

struct Connection {
    stream: TcpStream,
    read_buf: Vec<u8>,
    body: Body,
    idle_timer: Option<TimerId>,
}

struct Shared {
    config: ServerConfig,
    gateway_socket: Option<UdpSocket>,
    connections: HashMap<RawFd, Connection>,
}

impl Shared {
    fn close(shared: &Rc<RefCell<Shared>>, reactor: &mut Reactor, fd: RawFd) {
        let conn = shared.borrow_mut().connections.remove(&fd);
        let Some(conn) = conn else { return };
        reactor.drop_read(fd);
        reactor.drop_write(fd);
        if let Body::Streaming(body) = &conn.body {
            reactor.drop_read(body.subscription.fd());
            if let Some(id) = body.repeat_timer {
                reactor.cancel_timeout(id);
            }
            if body.skipped > 0 {
                log::debug!("http: streaming connection closed after skipping {} frames", body.skipped);
            }
        }
        if let Some(id) = conn.idle_timer {
            reactor.cancel_timeout(id);
        }
    }
}

/// The bound listening socket, ready for [`Self::install`].
pub struct HttpServerCore {
    listener: TcpListener,
}

impl HttpServerCore {
    pub fn bind(config: &ServerConfig) -> Result<Self> {
        let listener = TcpListener::bind(config.bind_addr)?;
        listener.set_nonblocking(true)?;
        Ok(Self { listener })
    }

    /// Registers the accept loop and every piece of per-connection state on
    /// `reactor`. Consumes `self`; nothing further needs to be held by the
    /// caller besides `reactor` itself.
    pub fn install(self, reactor: &mut Reactor, config: ServerConfig) -> Result<()> {
        let gateway_socket = match config.gateway {
            Some(_) => {
                let sock = UdpSocket::bind("0.0.0.0:0")?;
                sock.set_nonblocking(true)?;
                Some(sock)
            }
            None => None,
        };
        let shared = Rc::new(RefCell::new(Shared { config, gateway_socket, connections: HashMap::new() }));
        let listener = Rc::new(self.listener);
        let listener_fd = listener.as_raw_fd();

        let accept_shared = shared.clone();
        let accept_listener = listener.clone();
        reactor.add_read(listener_fd, move |r| {
            loop {
                match accept_listener.accept() {
                    Ok((stream, _addr)) => {
                        if stream.set_nonblocking(true).is_ok() {
                            register_connection(r, &accept_shared, stream);
                        }
                    }
                    Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                    Err(_) => break,
                }
            }
            Ok(())
        });
        Ok(())
    }
}

fn register_connection(reactor: &mut Reactor, shared: &Rc<RefCell<Shared>>, stream: TcpStream) {
    let fd = stream.as_raw_fd();
    let conn = Connection { stream, read_buf: Vec::new(), body: Body::None, idle_timer: None };
    shared.borrow_mut().connections.insert(fd, conn);
    rearm_idle(reactor, shared, fd);

    let read_shared = shared.clone();
    reactor.add_read(fd, move |r| {
        on_readable(r, &read_shared, fd);
        Ok(())
    });
}

/// Cancels any outstanding idle timer for `fd` and arms a fresh one; closes
/// the connection if it fires before more activity resets it again.
fn rearm_idle(reactor: &mut Reactor, shared: &Rc<RefCell<Shared>>, fd: RawFd) {
    let idle_timeout = shared.borrow().config.idle_timeout;
    let old = shared.borrow_mut().connections.get_mut(&fd).and_then(|c| c.idle_timer.take());
    if let Some(id) = old {
        reactor.cancel_timeout(id);
    }
    let close_shared = shared.clone();
    let id = reactor.set_timeout(idle_timeout, move |r| Shared::close(&close_shared, r, fd));
    match shared.borrow_mut().connections.get_mut(&fd) {
        Some(conn) => conn.idle_timer = Some(id),
        None => reactor.cancel_timeout(id),
    }
}

fn on_readable(reactor: &mut Reactor, shared: &Rc<RefCell<Shared>>, fd: RawFd) {
    let mut chunk = [0u8; 8192];
    let read_result = {
        let mut s = shared.borrow_mut();
        let Some(conn) = s.connections.get_mut(&fd) else { return };
        conn.stream.read(&mut chunk)
    };
    match read_result {
        Ok(0) => return Shared::close(shared, reactor, fd),
        Ok(n) => {
            let mut s = shared.borrow_mut();
            if let Some(conn) = s.connections.get_mut(&fd) {
                conn.read_buf.extend_from_slice(&chunk[..n]);
            }
        }
        Err(err) if err.kind() == ErrorKind::WouldBlock => return,
        Err(_) => return Shared::close(shared, reactor, fd),
    }

    rearm_idle(reactor, shared, fd);

    let parsed = {
        let mut s = shared.borrow_mut();
        let Some(conn) = s.connections.get_mut(&fd) else { return };
        let buf = std::mem::take(&mut conn.read_buf);
        let parsed = request::try_parse(&buf);
        conn.read_buf = buf;
        parsed
    };

    match parsed {
        Ok(Some((req, _consumed))) => handle_request(reactor, shared, fd, req),
        Ok(None) => {}
        Err(_) => send_and_close(reactor, shared, fd, response::error_response(400, "bad request")),
    }
}

fn handle_request(reactor: &mut Reactor, shared: &Rc<RefCell<Shared>>, fd: RawFd, req: Request) {
    if req.method != "GET" {
        return send_and_close(reactor, shared, fd, response::error_response(405, "method not allowed"));
    }
    if request::is_path_traversal(&req.path) {
        return send_and_close(reactor, shared, fd, response::error_response(400, "path traversal rejected"));
    }

    let config = shared.borrow().config.clone();

    if let Some((port, msg)) = req.query_get("send").and_then(parse_send) {
        return handle_send(reactor, shared, fd, &config, port, msg);
    }

    if config.wildcard && req.path == "/__" {
        let names = crate::pubchannel::list(&config.channels_root).unwrap_or_default();
        let json = serde_json::to_string(&names).unwrap_or_else(|_| "[]".to_string());
        let resp = response::SimpleResponse { code: 200, content_type: "application/json".to_string(), refresh_seconds: None, body: json.into_bytes() };
        return send_and_close(reactor, shared, fd, resp.to_bytes());
    }

    if let Some(channel_name) = resolve_channel_name(&req.path, &config) {
        return handle_channel_request(reactor, shared, fd, &config, channel_name, &req);
    }

    if let Some(static_dir) = &config.static_dir {
        let rel = req.path.trim_start_matches('/');
        match std::fs::read(static_dir.join(rel)) {
            Ok(bytes) => {
                let content_type = guess_static_content_type(rel);
                let resp = response::SimpleResponse { code: 200, content_type, refresh_seconds: None, body: bytes };
                return send_and_close(reactor, shared, fd, resp.to_bytes());
            }
            Err(_) => return send_and_close(reactor, shared, fd, response::error_response(404, "not found")),
        }
    }

    send_and_close(reactor, shared, fd, response::error_response(404, "not found"));
}

fn resolve_channel_name(path: &str, config: &ServerConfig) -> Option<String> {
    if path == "/" {
        return config.default_channel.clone();
    }
    if !config.wildcard {
        return None;
    }
    let rest = path.strip_prefix("/_")?;
    if let Ok(index) = rest.parse::<usize>() {
        let names = crate::pubchannel::list(&config.channels_root).ok()?;
        return names.get(index).cloned();
    }
    Some(rest.to_string())
}

fn handle_channel_request(reactor: &mut Reactor, shared: &Rc<RefCell<Shared>>, fd: RawFd, config: &ServerConfig, channel_name: String, req: &Request) {
    let subscription = match Subscription::open(&config.channels_root, &channel_name) {
        Ok(s) => s,
        Err(_) => return send_and_close(reactor, shared, fd, response::error_response(404, "channel not found")),
    };

    let scale = req.query_get("scale").and_then(|v| v.parse::<u32>().ok()).unwrap_or(1);
    let type_param = req.query_get("type").map(str::to_string);

    if req.query_get("streaming") == Some("1") {
        return start_streaming(reactor, shared, fd, subscription, scale, type_param, config.repeat_timeout);
    }

    let refresh_seconds = req.query_get("refresh").and_then(|v| v.parse::<u64>().ok());
    match subscription.peek() {
        Ok(Some((bytes, type_str, _epoch_s, _epoch_us))) => {
            let (bytes, type_str) = apply_conversion(bytes, type_str, type_param.as_deref(), scale);
            let resp = response::SimpleResponse { code: 200, content_type: multipart::content_type_for(&type_str).to_string(), refresh_seconds, body: bytes };
            send_and_close(reactor, shared, fd, resp.to_bytes());
        }
        Ok(None) => wait_for_first_frame(reactor, shared, fd, subscription, refresh_seconds, config.data_timeout, scale, type_param),
        Err(_) => send_and_close(reactor, shared, fd, response::error_response(503, "channel unavailable")),
    }
}

/// Applies the `scale`/`type` query parameters to a frame just read off a
/// subscription. `type_param` of `None` or `"any"` passes bytes through
/// untouched; any other recognised type drives an on-demand
/// [`crate::image::ImageConverter`] re-encode. A conversion failure falls
/// back to serving the original bytes rather than failing the request.
fn apply_conversion(bytes: Vec<u8>, type_str: String, type_param: Option<&str>, scale: u32) -> (Vec<u8>, String) {
    if matches!(type_param, Some("any")) {
        return (bytes, type_str);
    }
    let target = type_param.unwrap_or(&type_str);
    if target == type_str && scale <= 1 {
        return (bytes, type_str);
    }
    match crate::image::ImageConverter::convert(&bytes, &type_str, target, scale) {
        Ok((out, out_type)) => (out, out_type),
        Err(err) => {
            log::warn!("http: on-demand conversion to {target} failed: {err}; serving original bytes");
            (bytes, type_str)
        }
    }
}

/// Single-shot request for a channel with no frame published yet: wait up to
/// `data_timeout` for one, otherwise 503.
fn wait_for_first_frame(
    reactor: &mut Reactor,
    shared: &Rc<RefCell<Shared>>,
    fd: RawFd,
    subscription: Subscription,
    refresh_seconds: Option<u64>,
    data_timeout: Duration,
    scale: u32,
    type_param: Option<String>,
) {
    let sub_fd = subscription.fd();
    let pending = Rc::new(RefCell::new(Some(subscription)));

    let timeout_shared = shared.clone();
    let timeout_pending = pending.clone();
    let deadline_timer = reactor.set_timeout(data_timeout, move |r| {
        if timeout_pending.borrow_mut().take().is_some() {
            r.drop_read(sub_fd);
            send_and_close(r, &timeout_shared, fd, response::error_response(503, "no frame available"));
        }
    });

    let ready_shared = shared.clone();
    reactor.add_read(sub_fd, move |r| {
        let Some(subscription) = pending.borrow_mut().take() else { return Ok(()) };
        r.drop_read(sub_fd);
        r.cancel_timeout(deadline_timer);
        let resp = match subscription.peek() {
            Ok(Some((bytes, type_str, _, _))) => {
                let (bytes, type_str) = apply_conversion(bytes, type_str, type_param.as_deref(), scale);
                response::SimpleResponse { code: 200, content_type: multipart::content_type_for(&type_str).to_string(), refresh_seconds, body: bytes }.to_bytes()
            }
            _ => response::error_response(503, "no frame available"),
        };
        send_and_close(r, &ready_shared, fd, resp);
        Ok(())
    });
}

fn start_streaming(
    reactor: &mut Reactor,
    shared: &Rc<RefCell<Shared>>,
    fd: RawFd,
    subscription: Subscription,
    scale: u32,
    type_param: Option<String>,
    repeat_timeout: Option<Duration>,
) {
    let boundary = format!("vtbus-{fd:x}");
    let sub_fd = subscription.fd();
    reactor.drop_read(fd); // no further HTTP requests expected on this connection

    let header = response::multipart_open(&boundary);
    let mut s = shared.borrow_mut();
    let Some(conn) = s.connections.get_mut(&fd) else { return };
    if conn.stream.write_all(&header).is_err() {
        drop(s);
        return Shared::close(shared, reactor, fd);
    }
    conn.body = Body::Streaming(StreamingBody {
        subscription,
        boundary,
        skipped: 0,
        scale,
        type_param,
        repeat_timeout,
        repeat_timer: None,
        last_frame: None,
    });
    drop(s);

    if let Some(timeout) = repeat_timeout {
        rearm_repeat(reactor, shared, fd, timeout);
    }

    let frame_shared = shared.clone();
    reactor.add_read(sub_fd, move |r| {
        deliver_next_frame(r, &frame_shared, fd);
        Ok(())
    });
}

/// Cancels any outstanding repeat timer for a streaming connection and arms
/// a fresh one; firing re-sends the last delivered frame verbatim and
/// rearms itself, so silence never stops the keep-alive.
fn rearm_repeat(reactor: &mut Reactor, shared: &Rc<RefCell<Shared>>, fd: RawFd, timeout: Duration) {
    let old = shared.borrow_mut().connections.get_mut(&fd).and_then(|c| match &mut c.body {
        Body::Streaming(body) => body.repeat_timer.take(),
        Body::None => None,
    });
    if let Some(id) = old {
        reactor.cancel_timeout(id);
    }
    let repeat_shared = shared.clone();
    let id = reactor.set_timeout(timeout, move |r| resend_last_frame(r, &repeat_shared, fd, timeout));
    if let Some(conn) = shared.borrow_mut().connections.get_mut(&fd) {
        if let Body::Streaming(body) = &mut conn.body {
            body.repeat_timer = Some(id);
            return;
        }
    }
    reactor.cancel_timeout(id);
}

fn resend_last_frame(reactor: &mut Reactor, shared: &Rc<RefCell<Shared>>, fd: RawFd, timeout: Duration) {
    let mut s = shared.borrow_mut();
    let Some(conn) = s.connections.get_mut(&fd) else { return };
    let Body::Streaming(body) = &mut conn.body else { return };
    body.repeat_timer = None;
    let Some(frame_bytes) = body.last_frame.clone() else { return };
    let _ = conn.stream.write(&frame_bytes);
    drop(s);
    rearm_repeat(reactor, shared, fd, timeout);
}

/// Non-blocking best-effort delivery of the latest frame on a streaming
/// connection. On backpressure (the socket can't absorb it right now) the
/// frame is dropped and the skip counter bumped, per the streaming
/// connection's backpressure policy: never stall or buffer unboundedly.
fn deliver_next_frame(reactor: &mut Reactor, shared: &Rc<RefCell<Shared>>, fd: RawFd) {
    let mut s = shared.borrow_mut();
    let Some(conn) = s.connections.get_mut(&fd) else { return };
    let Body::Streaming(body) = &mut conn.body else { return };

    let _ = body.subscription.drain();
    let Ok(Some((bytes, type_str, _, _))) = body.subscription.peek() else { return };
    let (bytes, type_str) = apply_conversion(bytes, type_str, body.type_param.as_deref(), body.scale);
    let frame_bytes = multipart::frame(&body.boundary, multipart::content_type_for(&type_str), &bytes);
    body.last_frame = Some(frame_bytes.clone());
    let repeat_timeout = body.repeat_timeout;

    match conn.stream.write(&frame_bytes) {
        Ok(n) if n == frame_bytes.len() => {}
        _ => {
            if let Body::Streaming(body) = &mut conn.body {
                body.skipped += 1;
            }
        }
    }
    drop(s);

    if let Some(timeout) = repeat_timeout {
        rearm_repeat(reactor, shared, fd, timeout);
    }
}

fn handle_send(reactor: &mut Reactor, shared: &Rc<RefCell<Shared>>, fd: RawFd, config: &ServerConfig, port: u16, msg: String) {
    let Some(gateway) = config.gateway else {
        return send_and_close(reactor, shared, fd, response::error_response(401, "gateway forwarding not enabled"));
    };
    let target = SocketAddr::new(gateway.ip(), port);
    let sent = shared.borrow().gateway_socket.as_ref().is_some_and(|sock| sock.send_to(msg.as_bytes(), target).is_ok());
    let resp = if sent {
        response::SimpleResponse { code: 204, content_type: "text/plain".to_string(), refresh_seconds: None, body: vec![] }.to_bytes()
    } else {
        response::error_response(400, "failed to enqueue gateway send")
    };
    send_and_close(reactor, shared, fd, resp);
}

fn parse_send(value: &str) -> Option<(u16, String)> {
    let (port_str, msg) = value.split_once(' ')?;
    let port: u16 = port_str.parse().ok()?;
    Some((port, msg.to_string()))
}

fn guess_static_content_type(rel_path: &str) -> String {
    let ext = std::path::Path::new(rel_path).extension().and_then(|e| e.to_str());
    match ext {
        Some("html") => "text/html",
        Some("json") => "application/json",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("txt") => "text/plain",
        _ => "application/octet-stream",
    }
    .to_string()
}

fn send_and_close(reactor: &mut Reactor, shared: &Rc<RefCell<Shared>>, fd: RawFd, bytes: Vec<u8>) {
    if let Some(conn) = shared.borrow_mut().connections.get_mut(&fd) {
        let _ = conn.stream.write_all(&bytes);
    }
    Shared::close(shared, reactor, fd);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_send_splits_port_and_message() {
        assert_eq!(parse_send("9000 hello world"), Some((9000, "hello world".to_string())));
        assert_eq!(parse_send("not-a-port msg"), None);
        assert_eq!(parse_send("9000"), None);
    }

    #[test]
    fn resolve_channel_name_handles_root_and_named_paths() {
        let config = ServerConfig { default_channel: Some("cam0".to_string()), wildcard: true, ..ServerConfig::default() };
        assert_eq!(resolve_channel_name("/", &config), Some("cam0".to_string()));
        assert_eq!(resolve_channel_name("/_cam1", &config), Some("cam1".to_string()));
    }

    #[test]
    fn resolve_channel_name_respects_wildcard_disabled() {
        let config = ServerConfig { default_channel: None, wildcard: false, ..ServerConfig::default() };
        assert_eq!(resolve_channel_name("/_cam1", &config), None);
    }

    #[test]
    fn guess_static_content_type_maps_known_extensions() {
        assert_eq!(guess_static_content_type("a.html"), "text/html");
        assert_eq!(guess_static_content_type("a.bin"), "application/octet-stream");
    }
}
