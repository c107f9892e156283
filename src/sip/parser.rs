// SIP message parser using nom combinators

use nom::{
    bytes::complete::{tag, take_until, take_while1},
    character::complete::{digit1, space0, space1},
    IResult,
};
use std::fmt;

use super::checksum::Adler32;
use super::message::{Direction, Headers, Method, SipMessage, SipType};

/// Parse error with descriptive messages
#[derive(Debug, Clone, PartialEq)]
pub struct ParseError {
    pub message: String,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SIP parse error: {}", self.message)
    }
}

impl std::error::Error for ParseError {}

impl ParseError {
    pub fn new(message: impl Into<String>) -> Self {
        ParseError {
            message: message.into(),
        }
    }
}

impl From<ParseError> for crate::error::GossipError {
    fn from(e: ParseError) -> Self {
        crate::error::GossipError::ParseError(e.message)
    }
}

/// A parsed inbound message plus the checksum of its scanned lines.
#[derive(Debug, Clone)]
pub struct Scanned {
    pub message: SipMessage,
    pub checksum: u32,
}

/// Parse a SIP message from raw bytes.
///
/// Determines whether the input is a request or response by checking
/// if the first line starts with "SIP/" (response) or not (request).
pub fn parse_sip_message(input: &[u8]) -> Result<Scanned, ParseError> {
    if input.is_empty() {
        return Err(ParseError::new("empty input"));
    }

    let mut adler = Adler32::new();
    let (remaining, mut message) = if input.starts_with(b"SIP/") {
        parse_response_head(input, &mut adler)?
    } else {
        parse_request_head(input, &mut adler)?
    };

    let (remaining, raw_headers) =
        parse_headers(remaining).map_err(|e| ParseError::new(format!("invalid headers: {}", e)))?;
    message.headers = collect_headers(&raw_headers, &mut adler)?;

    message.body = parse_body(remaining, &message.headers)?;
    for line in &message.body {
        adler.update(line.as_bytes());
    }

    Ok(Scanned {
        message,
        checksum: adler.finish(),
    })
}

/// nom parser: consume a CRLF sequence
fn crlf(input: &[u8]) -> IResult<&[u8], &[u8]> {
    tag(b"\r\n")(input)
}

/// Parse the request line: METHOD SP Request-URI SP SIP-Version CRLF
fn parse_request_line(input: &[u8]) -> IResult<&[u8], (&[u8], &[u8], &[u8])> {
    let (input, method) = take_while1(|b: u8| b.is_ascii_alphabetic())(input)?;
    let (input, _) = space1(input)?;
    let (input, uri) = take_while1(|b: u8| b != b' ' && b != b'\r' && b != b'\n')(input)?;
    let (input, _) = space1(input)?;
    let (input, version) = take_until("\r\n")(input)?;
    let (input, _) = crlf(input)?;
    Ok((input, (method, uri, version)))
}

/// Parse the status line: SIP-Version SP Status-Code SP Reason-Phrase CRLF
fn parse_status_line(input: &[u8]) -> IResult<&[u8], (&[u8], &[u8], &[u8])> {
    let (input, version) = take_while1(|b: u8| b != b' ' && b != b'\r' && b != b'\n')(input)?;
    let (input, _) = space1(input)?;
    let (input, status_code) = digit1(input)?;
    let (input, _) = space0(input)?;
    let (input, reason) = take_until("\r\n")(input)?;
    let (input, _) = crlf(input)?;
    Ok((input, (version, status_code, reason)))
}

/// One raw header line, without its CRLF
fn parse_header_line(input: &[u8]) -> IResult<&[u8], &[u8]> {
    let (input, line) = take_until("\r\n")(input)?;
    let (input, _) = crlf(input)?;
    Ok((input, line))
}

/// Split `Name: value`
fn split_header(line: &[u8]) -> IResult<&[u8], (&[u8], &[u8])> {
    let (rest, name) = take_while1(|b: u8| b != b':')(line)?;
    let (rest, _) = tag(b":")(rest)?;
    let (value, _) = space0(rest)?;
    Ok((&value[value.len()..], (name, value)))
}

/// Parse all header lines until an empty line (CRLF CRLF)
fn parse_headers(mut input: &[u8]) -> IResult<&[u8], Vec<&[u8]>> {
    let mut lines = Vec::new();
    loop {
        if input.starts_with(b"\r\n") {
            let (remaining, _) = crlf(input)?;
            return Ok((remaining, lines));
        }
        if input.is_empty() {
            return Ok((input, lines));
        }
        let (remaining, line) = parse_header_line(input)?;
        lines.push(line);
        input = remaining;
    }
}

fn utf8<'a>(bytes: &'a [u8], what: &str) -> Result<&'a str, ParseError> {
    std::str::from_utf8(bytes).map_err(|_| ParseError::new(format!("invalid UTF-8 in {}", what)))
}

fn parse_request_head<'a>(
    input: &'a [u8],
    adler: &mut Adler32,
) -> Result<(&'a [u8], SipMessage), ParseError> {
    let (remaining, (method_bytes, uri_bytes, version_bytes)) = parse_request_line(input)
        .map_err(|e| ParseError::new(format!("invalid request line: {}", e)))?;

    let method = Method::from_token(utf8(method_bytes, "method")?);
    utf8(uri_bytes, "request URI")?;
    let version = utf8(version_bytes, "SIP version")?;
    if !version.starts_with("SIP/") {
        return Err(ParseError::new(format!("invalid SIP version: {}", version)));
    }

    let start_line = utf8(&input[..input.len() - remaining.len() - 2], "request line")?;
    adler.update(start_line.as_bytes());

    let mut message = SipMessage::new(SipType::Request(method), Direction::Inbound);
    message.start_line = start_line.to_string();
    Ok((remaining, message))
}

fn parse_response_head<'a>(
    input: &'a [u8],
    adler: &mut Adler32,
) -> Result<(&'a [u8], SipMessage), ParseError> {
    let (remaining, (version_bytes, status_bytes, _reason)) = parse_status_line(input)
        .map_err(|e| ParseError::new(format!("invalid status line: {}", e)))?;

    let version = utf8(version_bytes, "SIP version")?;
    if !version.starts_with("SIP/") {
        return Err(ParseError::new(format!("invalid SIP version: {}", version)));
    }
    let status_str = utf8(status_bytes, "status code")?;
    let status_code: u16 = status_str
        .parse()
        .ok()
        .filter(|c| (100..700).contains(c))
        .ok_or_else(|| ParseError::new(format!("invalid status code: {}", status_str)))?;

    let start_line = utf8(&input[..input.len() - remaining.len() - 2], "status line")?;
    adler.update(start_line.as_bytes());

    let mut message = SipMessage::new(SipType::Response(status_code), Direction::Inbound);
    message.start_line = start_line.to_string();
    Ok((remaining, message))
}

fn collect_headers(lines: &[&[u8]], adler: &mut Adler32) -> Result<Headers, ParseError> {
    let mut headers = Headers::new();
    let mut last: Option<(String, String)> = None;
    for line in lines {
        adler.update(line);
        // folded continuation of the previous header
        if line.first().map_or(false, |b| *b == b' ' || *b == b'\t') {
            let cont = utf8(line, "header value")?.trim();
            match last.as_mut() {
                Some((_, value)) => {
                    value.push(' ');
                    value.push_str(cont);
                }
                None => return Err(ParseError::new("continuation line without header")),
            }
            continue;
        }
        let (_, (name_bytes, value_bytes)) = split_header(line).map_err(|_| {
            ParseError::new(format!("invalid header line: {}", String::from_utf8_lossy(line)))
        })?;
        let name = utf8(name_bytes, "header name")?.trim();
        if name.is_empty() {
            return Err(ParseError::new("empty header name"));
        }
        let value = utf8(value_bytes, "header value")?.trim();
        if let Some((n, v)) = last.replace((name.to_string(), value.to_string())) {
            headers.add(&n, v);
        }
    }
    if let Some((n, v)) = last {
        headers.add(&n, v);
    }
    Ok(headers)
}

/// Parse the message body based on Content-Length header
fn parse_body(remaining: &[u8], headers: &Headers) -> Result<Vec<String>, ParseError> {
    let content_length = headers
        .get("Content-Length")
        .map(|v| {
            v.trim()
                .parse::<usize>()
                .map_err(|_| ParseError::new(format!("invalid Content-Length: {}", v)))
        })
        .transpose()?;

    let body = match content_length {
        Some(len) => {
            if remaining.len() < len {
                return Err(ParseError::new(format!(
                    "body too short: expected {} bytes, got {}",
                    len,
                    remaining.len()
                )));
            }
            &remaining[..len]
        }
        // datagram without Content-Length: everything left is body
        None => remaining,
    };
    Ok(split_body(utf8(body, "body")?))
}

/// Split a body into lines; the trailing CRLF of the last line is not a line of its own.
pub fn split_body(body: &str) -> Vec<String> {
    if body.is_empty() {
        return Vec::new();
    }
    let body = body.strip_suffix("\r\n").unwrap_or(body);
    body.split("\r\n").map(|s| s.to_string()).collect()
}

/// Parse the header block produced by a template.
///
/// Lines may end in LF or CRLF and are trimmed. The first empty line after
/// a header ends the header block; the remaining lines form the body.
pub fn parse_header_block(text: &str) -> Result<(Headers, Vec<String>), ParseError> {
    let mut headers = Headers::new();
    let normalized = text.replace("\r\n", "\n");
    let lines: Vec<&str> = normalized.split('\n').collect();
    let mut body = Vec::new();
    for (i, raw) in lines.iter().enumerate() {
        let line = raw.trim();
        if line.is_empty() {
            if headers.is_empty() {
                continue;
            }
            body = lines[i + 1..].iter().map(|s| s.trim_end().to_string()).collect();
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| ParseError::new(format!("not a header line: {}", line)))?;
        let name = name.trim();
        if name.is_empty() {
            return Err(ParseError::new(format!("not a header line: {}", line)));
        }
        headers.add(name, value.trim());
    }
    while body.last().map_or(false, |l: &String| l.is_empty()) {
        body.pop();
    }
    Ok((headers, body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const KNOWN_METHODS: &[&[u8]] = &[
        b"INVITE", b"ACK", b"BYE", b"CANCEL", b"PRACK", b"OPTIONS", b"UPDATE", b"INFO",
    ];

    fn starts_with_sip_method(data: &[u8]) -> bool {
        KNOWN_METHODS.iter().any(|m| data.starts_with(m))
    }

    proptest! {
        /// Random bytes that don't start with a SIP method or "SIP/" should return error
        #[test]
        fn prop_random_bytes_return_error(
            data in proptest::collection::vec(any::<u8>(), 0..100)
        ) {
            prop_assume!(!data.starts_with(b"SIP/"));
            prop_assume!(!starts_with_sip_method(&data));
            prop_assume!(!data.first().map_or(false, |b| b.is_ascii_alphabetic()));

            let result = parse_sip_message(&data);
            prop_assert!(result.is_err(), "random bytes should produce parse error, got: {:?}", result);
        }

        /// Truncated requests (cut mid-header) should return error
        #[test]
        fn prop_truncated_request_returns_error(
            method in prop_oneof![Just("INVITE"), Just("ACK"), Just("BYE"), Just("PRACK")],
            user in "[0-9]{1,10}",
        ) {
            let mut truncated = format!("{} sip:{}@10.0.0.1:5060 SIP/2.0\r\n", method, user).into_bytes();
            truncated.extend_from_slice(b"Via: SIP/2.0/UDP 10.0.0.1:5060");

            let result = parse_sip_message(&truncated);
            prop_assert!(result.is_err(), "truncated request should produce parse error, got: {:?}", result);
        }

        /// Truncated responses should return error
        #[test]
        fn prop_truncated_response_returns_error(
            status_code in 100u16..700,
            reason in "[A-Za-z]{1,20}",
        ) {
            let mut truncated = format!("SIP/2.0 {} {}\r\n", status_code, reason).into_bytes();
            truncated.extend_from_slice(b"Via: SIP/2.0/UDP 10.0.0.1:5060");

            let result = parse_sip_message(&truncated);
            prop_assert!(result.is_err(), "truncated response should produce parse error, got: {:?}", result);
        }

        /// Non-numeric status codes are rejected
        #[test]
        fn prop_invalid_status_code_returns_error(bad_code in "[a-zA-Z]{1,5}") {
            let input = format!("SIP/2.0 {} Bad\r\n\r\n", bad_code);
            prop_assert!(parse_sip_message(input.as_bytes()).is_err());
        }
    }

    #[test]
    fn test_parse_invite_request() {
        let raw = b"INVITE sip:2000@10.0.0.1:5060;noa=2 SIP/2.0\r\n\
Via: SIP/2.0/UDP 10.0.0.2:5065;branch=z9hG4bKabc\r\n\
Call-ID: xyz\r\n\
CSeq: 1 INVITE\r\n\
Content-Length: 0\r\n\
\r\n";
        let scanned = parse_sip_message(raw).unwrap();
        let msg = scanned.message;
        assert_eq!(msg.sip_type, SipType::Request(Method::Invite));
        assert_eq!(msg.start_line, "INVITE sip:2000@10.0.0.1:5060;noa=2 SIP/2.0");
        assert_eq!(msg.direction, Direction::Inbound);
        assert_eq!(msg.call_id(), Some("xyz"));
        assert_eq!(msg.branch(), Some("z9hG4bKabc"));
        assert!(msg.body.is_empty());
    }

    #[test]
    fn test_parse_response_with_body() {
        let raw = b"SIP/2.0 200 OK\r\nCall-ID: a\r\nContent-Length: 12\r\n\r\nv=0\r\no=x y\r\n";
        let scanned = parse_sip_message(raw).unwrap();
        assert_eq!(scanned.message.sip_type, SipType::Response(200));
        assert_eq!(scanned.message.body, vec!["v=0".to_string(), "o=x y".to_string()]);
    }

    #[test]
    fn test_parse_multiple_headers_same_name() {
        let raw = b"SIP/2.0 180 Ringing\r\nVia: a\r\nVia: b\r\nContent-Length: 0\r\n\r\n";
        let msg = parse_sip_message(raw).unwrap().message;
        assert_eq!(msg.headers.get_all("Via"), &["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_parse_compact_and_folded_headers() {
        let raw = b"BYE sip:1@h SIP/2.0\r\ni: cid\r\nSubject: long\r\n  value\r\nl: 0\r\n\r\n";
        let msg = parse_sip_message(raw).unwrap().message;
        assert_eq!(msg.headers.get("Call-ID"), Some("cid"));
        assert_eq!(msg.headers.get("Subject"), Some("long value"));
        assert_eq!(msg.headers.get("Content-Length"), Some("0"));
    }

    #[test]
    fn test_parse_datagram_without_content_length() {
        let raw = b"SIP/2.0 200 OK\r\nCall-ID: a\r\n\r\nline1\r\n";
        let msg = parse_sip_message(raw).unwrap().message;
        assert_eq!(msg.body, vec!["line1".to_string()]);
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_sip_message(b"").is_err());
        assert!(parse_sip_message(b"INVITE\r\n").is_err());
        assert!(parse_sip_message(b"SIP/2.0 999 Nope\r\n\r\n").is_err());
        assert!(parse_sip_message(b"SIP/2.0 200 OK\r\nContent-Length: 10\r\n\r\nabc").is_err());
        assert!(parse_sip_message(b"SIP/2.0 200 OK\r\nContent-Length: x\r\n\r\n").is_err());
        assert!(parse_sip_message(b"SIP/2.0 200 OK\r\nNoColon\r\n\r\n").is_err());
        assert!(parse_sip_message(b"INVITE sip:1@h HTTP/1.1\r\n\r\n").is_err());
    }

    #[test]
    fn test_checksum_changes_with_content() {
        let a = parse_sip_message(b"SIP/2.0 200 OK\r\nCSeq: 1 INVITE\r\n\r\n").unwrap();
        let b = parse_sip_message(b"SIP/2.0 200 OK\r\nCSeq: 2 INVITE\r\n\r\n").unwrap();
        let c = parse_sip_message(b"SIP/2.0 200 OK\r\nCSeq: 1 INVITE\r\n\r\n").unwrap();
        assert_ne!(a.checksum, b.checksum);
        assert_eq!(a.checksum, c.checksum);
    }

    #[test]
    fn test_split_body() {
        assert!(split_body("").is_empty());
        assert_eq!(split_body("\r\n"), vec!["".to_string()]);
        assert_eq!(split_body("a\r\nb\r\n"), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_parse_header_block() {
        let (h, body) = parse_header_block("\n  X-Test: 1 \nX-Test:2\r\nFrom: <sip:1@h>\n\nv=0\no=-\n").unwrap();
        assert_eq!(h.get_all("X-Test"), &["1".to_string(), "2".to_string()]);
        assert_eq!(h.get("From"), Some("<sip:1@h>"));
        assert_eq!(body, vec!["v=0".to_string(), "o=-".to_string()]);
    }

    #[test]
    fn test_parse_header_block_rejects_garbage() {
        let err = parse_header_block("X-Test: 1\nnot a header\n").unwrap_err();
        assert!(err.message.contains("not a header"));
        assert!(parse_header_block(": value").is_err());
    }

    #[test]
    fn test_parse_error_display() {
        let err = ParseError::new("bad");
        assert_eq!(err.to_string(), "SIP parse error: bad");
    }
}
