//! `multipart/x-mixed-replace` part framing for streaming connections.

/// One `\r\n--<boundary>\r\nContent-Type: <type>\r\n\r\n<payload>` part.
pub fn frame(boundary: &str, content_type: &str, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + boundary.len() + content_type.len() + 32);
    out.extend_from_slice(b"\r\n--");
    out.extend_from_slice(boundary.as_bytes());
    out.extend_from_slice(b"\r\nContent-Type: ");
    out.extend_from_slice(content_type.as_bytes());
    out.extend_from_slice(b"\r\n\r\n");
    out.extend_from_slice(payload);
    out
}

/// Maps a PubChannel frame type string to the MIME type a part declares.
pub fn content_type_for(type_str: &str) -> &'static str {
    match type_str {
        "jpeg" => "image/jpeg",
        "png" => "image/png",
        "pnm" => "image/x-portable-anymap",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_has_boundary_prefix_and_payload() {
        let bytes = frame("vtb", "image/jpeg", b"data");
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.starts_with("\r\n--vtb\r\nContent-Type: image/jpeg\r\n\r\n"));
        assert!(bytes.ends_with(b"data"));
    }

    #[test]
    fn content_type_maps_known_and_unknown_types() {
        assert_eq!(content_type_for("jpeg"), "image/jpeg");
        assert_eq!(content_type_for("weird"), "application/octet-stream");
    }
}
