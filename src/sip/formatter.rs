// SIP message formatter
// Converts SipMessage structs into wire bytes

use super::message::SipMessage;

/// Length of the body on the wire: lines joined by CRLF plus a trailing CRLF.
pub fn body_len(body: &[String]) -> usize {
    if body.is_empty() {
        return 0;
    }
    body.iter().map(|l| l.len() + 2).sum()
}

/// Set `Content-Length` from the current body.
pub fn finalize_content_length(msg: &mut SipMessage) {
    let mut itoa_buf = itoa::Buffer::new();
    let len = itoa_buf.format(body_len(&msg.body)).to_string();
    msg.headers.set("Content-Length", len);
}

/// Estimate the output size of a formatted SIP message to pre-allocate buffer.
pub fn estimate_message_size(msg: &SipMessage) -> usize {
    let mut size = msg.start_line.len() + 2;
    for (name, value) in msg.headers.lines() {
        // "Name: Value\r\n"
        size += name.len() + 2 + value.len() + 2;
    }
    size + 2 + body_len(&msg.body)
}

/// Format a SIP message into an existing buffer (for buffer reuse).
/// The buffer is not cleared; clear it before reuse.
pub fn format_into(buf: &mut Vec<u8>, msg: &SipMessage) {
    buf.extend_from_slice(msg.start_line.as_bytes());
    buf.extend_from_slice(b"\r\n");

    for (name, value) in msg.headers.lines() {
        buf.extend_from_slice(name.as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    buf.extend_from_slice(b"\r\n");

    for line in &msg.body {
        buf.extend_from_slice(line.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
}

/// Format a SipMessage into wire bytes.
///
///   Start-Line\r\n
///   Header-Name: Header-Value\r\n
///   ...\r\n
///   \r\n
///   [body lines, each followed by CRLF]
///
/// `Content-Length` is written as stored; see [`finalize_content_length`].
pub fn format_message(msg: &SipMessage) -> Vec<u8> {
    let mut buf = Vec::with_capacity(estimate_message_size(msg));
    format_into(&mut buf, msg);
    buf
}
