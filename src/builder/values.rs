// Header value builders used by the message builder
//
// write!/push_str instead of format! keeps allocations to one per value.

use std::fmt::Write;

use crate::sip::extract_tag;

/// Via header value: "SIP/2.0/{TRANSPORT} {addr};branch={branch}"
pub(crate) fn build_via_value(transport: &str, addr: &str, branch: &str) -> String {
    let mut buf = String::with_capacity(8 + transport.len() + 1 + addr.len() + 8 + branch.len());
    buf.push_str("SIP/2.0/");
    buf.push_str(transport);
    buf.push(' ');
    buf.push_str(addr);
    buf.push_str(";branch=");
    buf.push_str(branch);
    buf
}

/// SIP URI: "sip:{user}@{addr}"
pub(crate) fn build_sip_uri(user: &str, addr: &str) -> String {
    let mut buf = String::with_capacity(4 + user.len() + 1 + addr.len());
    buf.push_str("sip:");
    buf.push_str(user);
    buf.push('@');
    buf.push_str(addr);
    buf
}

/// Name-addr with optional tag: "<{uri}>" or "<{uri}>;tag={tag}"
pub(crate) fn build_name_addr(uri: &str, tag: Option<&str>) -> String {
    let tag = tag.filter(|t| !t.is_empty());
    let mut buf = String::with_capacity(2 + uri.len() + tag.map_or(0, |t| 5 + t.len()));
    buf.push('<');
    buf.push_str(uri);
    buf.push('>');
    if let Some(tag) = tag {
        buf.push_str(";tag=");
        buf.push_str(tag);
    }
    buf
}

/// CSeq header value: "{num} {method}"
pub(crate) fn build_cseq_value(cseq: u32, method: &str) -> String {
    let mut buf = String::with_capacity(10 + 1 + method.len());
    let _ = write!(buf, "{}", cseq);
    buf.push(' ');
    buf.push_str(method);
    buf
}

/// Request line: "{METHOD} sip:{to}@{addr};noa={noa} SIP/2.0"
pub(crate) fn build_request_line(method: &str, to: &str, addr: &str, noa: &str) -> String {
    let mut buf = String::with_capacity(method.len() + 5 + to.len() + 1 + addr.len() + 5 + noa.len() + 8);
    buf.push_str(method);
    buf.push_str(" sip:");
    buf.push_str(to);
    buf.push('@');
    buf.push_str(addr);
    buf.push_str(";noa=");
    buf.push_str(noa);
    buf.push_str(" SIP/2.0");
    buf
}

/// Status line: "SIP/2.0 {code} {reason}"
pub(crate) fn build_status_line(code: u16, reason: &str) -> String {
    let mut buf = String::with_capacity(8 + 3 + 1 + reason.len());
    buf.push_str("SIP/2.0 ");
    let _ = write!(buf, "{}", code);
    buf.push(' ');
    buf.push_str(reason);
    buf
}

/// Append `;tag=` to a From/To value that carries none
pub(crate) fn with_tag(value: &str, tag: &str) -> String {
    if extract_tag(value).is_some() || tag.is_empty() {
        return value.to_string();
    }
    let mut buf = String::with_capacity(value.len() + 5 + tag.len());
    buf.push_str(value);
    buf.push_str(";tag=");
    buf.push_str(tag);
    buf
}

/// URI inside a From/To value: `"Bob" <sip:b@h>;tag=x` gives `sip:b@h`
pub(crate) fn uri_of(value: &str) -> &str {
    match (value.find('<'), value.find('>')) {
        (Some(start), Some(end)) if start < end => &value[start + 1..end],
        _ => value.split(';').next().unwrap_or(value).trim(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_via_value() {
        assert_eq!(
            build_via_value("UDP", "10.0.0.1:5065", "z9hG4bKabc"),
            "SIP/2.0/UDP 10.0.0.1:5065;branch=z9hG4bKabc"
        );
    }

    #[test]
    fn test_build_name_addr() {
        assert_eq!(build_name_addr("sip:1@h", None), "<sip:1@h>");
        assert_eq!(build_name_addr("sip:1@h", Some("")), "<sip:1@h>");
        assert_eq!(build_name_addr("sip:1@h", Some("t1")), "<sip:1@h>;tag=t1");
    }

    #[test]
    fn test_build_lines() {
        assert_eq!(
            build_request_line("INVITE", "2000", "10.0.0.1:5060", "2"),
            "INVITE sip:2000@10.0.0.1:5060;noa=2 SIP/2.0"
        );
        assert_eq!(build_status_line(180, "Ringing"), "SIP/2.0 180 Ringing");
        assert_eq!(build_cseq_value(3, "BYE"), "3 BYE");
    }

    #[test]
    fn test_with_tag() {
        assert_eq!(with_tag("<sip:2@h>", "abc"), "<sip:2@h>;tag=abc");
        assert_eq!(with_tag("<sip:2@h>;tag=x", "abc"), "<sip:2@h>;tag=x");
    }

    #[test]
    fn test_uri_of() {
        assert_eq!(uri_of("\"Bob\" <sip:b@h>;tag=x"), "sip:b@h");
        assert_eq!(uri_of("sip:b@h;tag=x"), "sip:b@h");
    }
}
