// SIP message data model

use once_cell::sync::OnceCell;
use smallvec::SmallVec;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// SIP method types
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    Invite,
    Ack,
    Bye,
    Cancel,
    Prack,
    Options,
    Update,
    Info,
    Other(String),
}

impl Method {
    /// メソッド名を大文字小文字を区別せずにパースする
    pub fn from_token(token: &str) -> Method {
        match token.to_ascii_uppercase().as_str() {
            "INVITE" => Method::Invite,
            "ACK" => Method::Ack,
            "BYE" => Method::Bye,
            "CANCEL" => Method::Cancel,
            "PRACK" => Method::Prack,
            "OPTIONS" => Method::Options,
            "UPDATE" => Method::Update,
            "INFO" => Method::Info,
            other => Method::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Method::Invite => "INVITE",
            Method::Ack => "ACK",
            Method::Bye => "BYE",
            Method::Cancel => "CANCEL",
            Method::Prack => "PRACK",
            Method::Options => "OPTIONS",
            Method::Update => "UPDATE",
            Method::Info => "INFO",
            Method::Other(s) => s.as_str(),
        }
    }

    /// INVITE and PRACK open a new CSeq number.
    pub fn increments_seq(&self) -> bool {
        matches!(self, Method::Invite | Method::Prack)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request method or response status code.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SipType {
    Request(Method),
    Response(u16),
}

impl SipType {
    /// `"INVITE"` や `"180"` をパースする。3桁の数字はレスポンスとして扱う。
    pub fn parse(s: &str) -> Option<SipType> {
        let s = s.trim();
        if s.is_empty() {
            return None;
        }
        if s.len() == 3 && s.bytes().all(|b| b.is_ascii_digit()) {
            let code: u16 = s.parse().ok()?;
            return if (100..700).contains(&code) {
                Some(SipType::Response(code))
            } else {
                None
            };
        }
        if s.bytes().all(|b| b.is_ascii_alphabetic()) {
            return Some(SipType::Request(Method::from_token(s)));
        }
        None
    }

    pub fn is_request(&self) -> bool {
        matches!(self, SipType::Request(_))
    }

    pub fn method(&self) -> Option<&Method> {
        match self {
            SipType::Request(m) => Some(m),
            SipType::Response(_) => None,
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            SipType::Response(code) => Some(*code),
            SipType::Request(_) => None,
        }
    }
}

impl fmt::Display for SipType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SipType::Request(m) => write!(f, "{}", m),
            SipType::Response(code) => write!(f, "{}", code),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Compact header forms (RFC 3261 7.3.3) mapped to their long names.
pub fn canonical_header_name(name: &str) -> &str {
    if name.len() != 1 {
        return name;
    }
    match name.as_bytes()[0].to_ascii_lowercase() {
        b'i' => "Call-ID",
        b'v' => "Via",
        b'f' => "From",
        b't' => "To",
        b'm' => "Contact",
        b'l' => "Content-Length",
        b'c' => "Content-Type",
        b'k' => "Supported",
        b's' => "Subject",
        b'e' => "Content-Encoding",
        _ => name,
    }
}

/// Ordered header multimap.
///
/// Names keep the order of their first appearance and each name keeps its
/// values in insertion order. Lookups ignore ASCII case.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, SmallVec<[String; 1]>)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|(n, _)| n.eq_ignore_ascii_case(name))
    }

    /// Get the first value of a header (case-insensitive)
    pub fn get(&self, name: &str) -> Option<&str> {
        self.position(name)
            .and_then(|i| self.entries[i].1.first())
            .map(|v| v.as_str())
    }

    /// Get all values of a header in insertion order
    pub fn get_all(&self, name: &str) -> &[String] {
        match self.position(name) {
            Some(i) => &self.entries[i].1,
            None => &[],
        }
    }

    pub fn count(&self, name: &str) -> usize {
        self.get_all(name).len()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.count(name) > 0
    }

    /// Append a value, keeping existing values of the same name
    pub fn add(&mut self, name: &str, value: impl Into<String>) {
        let name = canonical_header_name(name);
        match self.position(name) {
            Some(i) => self.entries[i].1.push(value.into()),
            None => {
                let mut values = SmallVec::new();
                values.push(value.into());
                self.entries.push((name.to_string(), values));
            }
        }
    }

    /// Replace every value of a header with a single one, keeping its position
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let name = canonical_header_name(name);
        match self.position(name) {
            Some(i) => {
                let values = &mut self.entries[i].1;
                values.clear();
                values.push(value.into());
            }
            None => self.add(name, value),
        }
    }

    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    /// Names with their values, in order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_slice()))
    }

    /// One `(name, value)` pair per header line, in wire order
    pub fn lines(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .flat_map(|(n, vs)| vs.iter().map(move |v| (n.as_str(), v.as_str())))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Merge another header set: values of `other` are appended per name
    pub fn extend(&mut self, other: Headers) {
        for (name, values) in other.entries {
            for v in values {
                self.add(&name, v);
            }
        }
    }

    /// Case-normalised snapshot, convenient for comparisons in tests
    pub fn to_multimap(&self) -> BTreeMap<String, Vec<String>> {
        self.entries
            .iter()
            .map(|(n, v)| (n.to_ascii_lowercase(), v.to_vec()))
            .collect()
    }
}

/// A call shared by every transaction of a dialog.
#[derive(Debug)]
pub struct SipCall {
    call_id: String,
    seq: AtomicU32,
}

impl SipCall {
    pub fn new(call_id: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            seq: AtomicU32::new(0),
        }
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn seq(&self) -> u32 {
        self.seq.load(Ordering::SeqCst)
    }

    /// Advance the sequence number and return the new value
    pub fn next_seq(&self) -> u32 {
        self.seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Fold an externally chosen sequence number in; the counter never goes down
    pub fn observe_seq(&self, seq: u32) {
        self.seq.fetch_max(seq, Ordering::SeqCst);
    }
}

/// One side's view of a dialog: call plus tags and addresses of record.
#[derive(Debug)]
pub struct SipTransaction {
    pub call: Arc<SipCall>,
    pub local_tag: String,
    pub local_aor: String,
    pub remote_aor: String,
    /// Dialled number of the far side, reused when a step names no target
    pub remote_number: String,
    remote_tag: OnceCell<String>,
}

impl SipTransaction {
    pub fn new(
        call: Arc<SipCall>,
        local_tag: impl Into<String>,
        local_aor: impl Into<String>,
        remote_aor: impl Into<String>,
        remote_number: impl Into<String>,
    ) -> Self {
        Self {
            call,
            local_tag: local_tag.into(),
            local_aor: local_aor.into(),
            remote_aor: remote_aor.into(),
            remote_number: remote_number.into(),
            remote_tag: OnceCell::new(),
        }
    }

    pub fn remote_tag(&self) -> Option<&str> {
        self.remote_tag.get().map(|s| s.as_str())
    }

    /// The remote tag is learned once; later values are ignored.
    pub fn learn_remote_tag(&self, tag: &str) -> bool {
        self.remote_tag.set(tag.to_string()).is_ok()
    }
}

/// A SIP message as handled by a party.
#[derive(Debug, Clone)]
pub struct SipMessage {
    pub transaction: Option<Arc<SipTransaction>>,
    /// Previous message in the party's chain
    pub prev: Option<Arc<SipMessage>>,
    /// For responses: the request being answered
    pub request: Option<Arc<SipMessage>>,
    pub sip_type: SipType,
    pub start_line: String,
    pub headers: Headers,
    pub body: Vec<String>,
    pub direction: Direction,
}

impl SipMessage {
    pub fn new(sip_type: SipType, direction: Direction) -> Self {
        Self {
            transaction: None,
            prev: None,
            request: None,
            sip_type,
            start_line: String::new(),
            headers: Headers::new(),
            body: Vec::new(),
            direction,
        }
    }

    pub fn is_request(&self) -> bool {
        self.sip_type.is_request()
    }

    pub fn call_id(&self) -> Option<&str> {
        self.headers.get("Call-ID")
    }

    /// Branch parameter of the topmost Via
    pub fn branch(&self) -> Option<&str> {
        self.headers.get("Via").and_then(super::extract_branch)
    }

    /// CSeq number and method
    pub fn cseq(&self) -> Option<(u32, &str)> {
        let value = self.headers.get("CSeq")?;
        let mut parts = value.split_whitespace();
        let seq = parts.next()?.parse().ok()?;
        Some((seq, parts.next().unwrap_or("")))
    }

    /// Request-URI of a request start line
    pub fn request_uri(&self) -> Option<&str> {
        if !self.is_request() {
            return None;
        }
        self.start_line.split_whitespace().nth(1)
    }
}

#[cfg(test)]
pub mod generators {
    use super::*;
    use proptest::prelude::*;

    /// Header names that never collide with a compact form
    pub fn arb_header_name() -> impl Strategy<Value = String> {
        "[A-Z][a-z]{1,8}(-[A-Z][a-z]{1,6})?"
    }

    pub fn arb_header_value() -> impl Strategy<Value = String> {
        "[!-~]([ -~]{0,30}[!-~])?"
    }

    pub fn arb_headers() -> impl Strategy<Value = Headers> {
        proptest::collection::vec((arb_header_name(), arb_header_value()), 0..10).prop_map(
            |pairs| {
                let mut headers = Headers::new();
                for (name, value) in pairs {
                    headers.add(&name, value);
                }
                headers
            },
        )
    }

    pub fn arb_body() -> impl Strategy<Value = Vec<String>> {
        proptest::collection::vec("[ -~]{0,40}", 0..6)
    }
}
