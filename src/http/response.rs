//! Response status lines and header blocks. Deliberately minimal: callers
//! build the byte buffer they hand to the connection's non-blocking writer
//! themselves (see [`super::multipart`] for the streaming body framing).

pub fn status_line(code: u16) -> &'static str {
    match code {
        200 => "HTTP/1.1 200 OK",
        204 => "HTTP/1.1 204 No Content",
        400 => "HTTP/1.1 400 Bad Request",
        401 => "HTTP/1.1 401 Unauthorized",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        503 => "HTTP/1.1 503 Service Unavailable",
        _ => "HTTP/1.1 500 Internal Server Error",
    }
}

/// A response with a known-length body, e.g. a single-shot frame, a 404, or
/// a static file.
pub struct SimpleResponse {
    pub code: u16,
    pub content_type: String,
    pub refresh_seconds: Option<u64>,
    pub body: Vec<u8>,
}

impl SimpleResponse {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.body.len() + 128);
        out.extend_from_slice(status_line(self.code).as_bytes());
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(format!("Content-Type: {}\r\n", self.content_type).as_bytes());
        out.extend_from_slice(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
        if let Some(secs) = self.refresh_seconds {
            out.extend_from_slice(format!("Refresh: {secs}\r\n").as_bytes());
        }
        out.extend_from_slice(b"Connection: close\r\n\r\n");
        out.extend_from_slice(&self.body);
        out
    }
}

/// The header block that opens a `multipart/x-mixed-replace` streaming
/// response; the boundary-delimited parts follow via [`super::multipart`].
pub fn multipart_open(boundary: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 200 OK\r\nContent-Type: multipart/x-mixed-replace; boundary={boundary}\r\nConnection: close\r\n\r\n"
    )
    .into_bytes()
}

pub fn error_response(code: u16, message: &str) -> Vec<u8> {
    SimpleResponse { code, content_type: "text/plain".to_string(), refresh_seconds: None, body: message.as_bytes().to_vec() }.to_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_response_includes_content_length_and_type() {
        let resp = SimpleResponse { code: 200, content_type: "image/jpeg".to_string(), refresh_seconds: None, body: vec![1, 2, 3] };
        let bytes = resp.to_bytes();
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Type: image/jpeg\r\n"));
        assert!(text.contains("Content-Length: 3\r\n"));
    }

    #[test]
    fn refresh_header_present_when_configured() {
        let resp = SimpleResponse { code: 200, content_type: "image/jpeg".to_string(), refresh_seconds: Some(2), body: vec![] };
        let text = String::from_utf8_lossy(&resp.to_bytes()).into_owned();
        assert!(text.contains("Refresh: 2\r\n"));
    }

    #[test]
    fn error_response_uses_matching_status_line() {
        let bytes = error_response(503, "no frame yet");
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.starts_with("HTTP/1.1 503 Service Unavailable\r\n"));
        assert!(text.contains("no frame yet"));
    }
}
