pub mod checksum;
pub mod formatter;
pub mod item;
pub mod message;
pub mod parser;

use once_cell::sync::Lazy;
use regex::Regex;
use std::hash::{Hash, Hasher};
#[allow(deprecated)]
use std::hash::SipHasher;

pub use item::{Item, RetransStage};
pub use message::{Direction, Headers, Method, SipCall, SipMessage, SipTransaction, SipType};

static BRANCH_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"branch=([^; ]*)").expect("valid regex"));
static USER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r":([^@; ]*)").expect("valid regex"));
static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r";\s*tag=([^;> ]+)").expect("valid regex"));

/// RFC 3261 Section 16.11に準拠したbranch値生成関数。
/// Call-ID、CSeq番号、メソッドのハッシュから`z9hG4bK`プレフィックス付きのbranch値を生成する。
/// 同一パラメータに対しては常に同一のbranch値を返す（冪等性）。
pub fn generate_branch(call_id: &str, cseq: u32, method: &str) -> String {
    use std::fmt::Write;
    #[allow(deprecated)]
    let mut hasher = SipHasher::new();
    call_id.hash(&mut hasher);
    cseq.hash(&mut hasher);
    method.hash(&mut hasher);
    let hash_value = hasher.finish();
    // "z9hG4bK" (7) + 16 hex chars = 23 chars
    let mut buf = String::with_capacity(23);
    buf.push_str("z9hG4bK");
    let _ = write!(buf, "{:016x}", hash_value);
    buf
}

/// Via ヘッダ値から branch パラメータを取り出す
pub fn extract_branch(via: &str) -> Option<&str> {
    BRANCH_RE
        .captures(via)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .filter(|s| !s.is_empty())
}

/// User part of a SIP URI (`sip:2000@host` -> `2000`)
pub fn extract_user(uri: &str) -> Option<&str> {
    USER_RE
        .captures(uri)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .filter(|s| !s.is_empty())
}

/// `tag` parameter of a From/To header value
pub fn extract_tag(value: &str) -> Option<&str> {
    TAG_RE.captures(value).and_then(|c| c.get(1)).map(|m| m.as_str())
}

/// Reason phrase for a status code
pub fn reason_phrase(code: u16) -> &'static str {
    match code {
        100 => "Trying",
        180 => "Ringing",
        181 => "Call Is Being Forwarded",
        182 => "Queued",
        183 => "Session Progress",
        200 => "OK",
        202 => "Accepted",
        300 => "Multiple Choices",
        301 => "Moved Permanently",
        302 => "Moved Temporarily",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        407 => "Proxy Authentication Required",
        408 => "Request Timeout",
        480 => "Temporarily Unavailable",
        481 => "Call/Transaction Does Not Exist",
        486 => "Busy Here",
        487 => "Request Terminated",
        488 => "Not Acceptable Here",
        500 => "Server Internal Error",
        503 => "Service Unavailable",
        600 => "Busy Everywhere",
        603 => "Decline",
        c if c < 200 => "Provisional",
        c if c < 300 => "Success",
        c if c < 400 => "Redirection",
        c if c < 500 => "Client Error",
        c if c < 600 => "Server Error",
        _ => "Global Failure",
    }
}
