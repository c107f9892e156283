// Message builder: turns a scenario step into a complete SIP message
//
// The step's header template is rendered first. Whatever mandatory header it
// leaves out is synthesized from the transaction, optionally through a
// per-step template override of the same name.

mod values;

use once_cell::sync::Lazy;
use std::sync::Arc;

use crate::config::Endpoint;
use crate::error::GossipError;
use crate::scenario::{CallStep, DEFAULT_NOA};
use crate::sip::formatter::finalize_content_length;
use crate::sip::parser::parse_header_block;
use crate::sip::{
    generate_branch, reason_phrase, Direction, Method, SipCall, SipMessage, SipTransaction,
    SipType,
};
use crate::template::{rand_string, Template, TemplateContext};
use values::{
    build_cseq_value, build_name_addr, build_request_line, build_sip_uri, build_status_line,
    build_via_value, uri_of, with_tag,
};

/// Length of a minted Call-ID
pub const CALL_ID_LEN: usize = 10;
/// Length of a minted local tag
pub const TAG_LEN: usize = 10;

/// Canned audio offer used when a step asks for SDP.
pub const DUMMY_SDP: &str = "v=0
o=gossip {{.Seq}} {{.Seq}} IN IP4 {{.LocalHost}}
s=gossip
c=IN IP4 {{.LocalHost}}
t=0 0
m=audio 49170 RTP/AVP 0 8
a=rtpmap:0 PCMU/8000
a=rtpmap:8 PCMA/8000";

static DUMMY_SDP_TEMPLATE: Lazy<Template> =
    Lazy::new(|| Template::parse(DUMMY_SDP).expect("valid sdp template"));

/// Builds messages for one party: its own number and the endpoints it talks over.
#[derive(Debug, Clone)]
pub struct MessageBuilder {
    local: Endpoint,
    remote: Endpoint,
    number: String,
    noa: String,
}

impl MessageBuilder {
    pub fn new(local: Endpoint, remote: Endpoint, number: impl Into<String>, noa: impl Into<String>) -> Self {
        Self {
            local,
            remote,
            number: number.into(),
            noa: noa.into(),
        }
    }

    pub fn local(&self) -> &Endpoint {
        &self.local
    }

    pub fn remote(&self) -> &Endpoint {
        &self.remote
    }

    /// Transaction for a call this party did not start: tags and addresses
    /// are taken from the inbound request that opened it.
    pub fn accept_transaction(&self, request: &SipMessage) -> Arc<SipTransaction> {
        let call_id = request.call_id().unwrap_or_default();
        let from = request.headers.get("From").unwrap_or_default();
        let to = request.headers.get("To").unwrap_or_default();
        let remote_number = uri_of(from)
            .strip_prefix("sip:")
            .and_then(|u| u.split('@').next())
            .unwrap_or_default()
            .to_string();
        let tr = SipTransaction::new(
            Arc::new(SipCall::new(call_id)),
            rand_string(TAG_LEN),
            uri_of(to),
            uri_of(from),
            remote_number,
        );
        if let Some(tag) = crate::sip::extract_tag(from) {
            tr.learn_remote_tag(tag);
        }
        if let Some((seq, _)) = request.cseq() {
            tr.call.observe_seq(seq);
        }
        Arc::new(tr)
    }

    /// Build the message a step sends.
    ///
    /// `prev` is the message this one continues; `None` opens a new call.
    /// For responses it must lead to the request being answered.
    pub fn build(
        &self,
        prev: Option<&Arc<SipMessage>>,
        step: &CallStep,
        sip_type: &SipType,
    ) -> Result<SipMessage, GossipError> {
        let mut msg = match sip_type {
            SipType::Request(method) => self.build_request(prev, step, method)?,
            SipType::Response(code) => self.build_response(prev, step, *code)?,
        };
        msg.prev = prev.cloned();
        finalize_content_length(&mut msg);
        Ok(msg)
    }

    fn new_transaction(&self, call: SipCall, to: &str) -> SipTransaction {
        SipTransaction::new(
            Arc::new(call),
            rand_string(TAG_LEN),
            build_sip_uri(&self.number, &self.local.addr()),
            build_sip_uri(to, &self.remote.addr()),
            to,
        )
    }

    fn build_request(
        &self,
        prev: Option<&Arc<SipMessage>>,
        step: &CallStep,
        method: &Method,
    ) -> Result<SipMessage, GossipError> {
        let (mut transaction, new_call) = match prev.and_then(|p| p.transaction.clone()) {
            Some(tr) => (tr, false),
            None => {
                let to = step.to.as_deref().ok_or_else(|| {
                    GossipError::ConfigError(format!("{} opens a call but names no target number", method))
                })?;
                let call = SipCall::new(rand_string(CALL_ID_LEN));
                (Arc::new(self.new_transaction(call, to)), true)
            }
        };
        let to_number = step.to.clone().unwrap_or_else(|| transaction.remote_number.clone());
        let to_noa = step.noa.as_deref().unwrap_or(DEFAULT_NOA);

        let call = Arc::clone(&transaction.call);
        let seq = if method.increments_seq() {
            call.next_seq()
        } else {
            call.observe_seq(1);
            call.seq()
        };
        let branch = generate_branch(call.call_id(), seq, method.as_str());
        let ctx = self.context(&transaction, seq, method.as_str(), &to_number, to_noa, &branch, step);

        let mut msg = SipMessage::new(SipType::Request(method.clone()), Direction::Outbound);
        apply_headers_template(&mut msg, step, &ctx)?;

        // Via は複数あってよい
        if !msg.headers.contains("Via") {
            let via = match step.template("Via") {
                Some(t) => t.render(&ctx)?,
                None => build_via_value(self.local.kind.via_token(), &self.local.addr(), &branch),
            };
            msg.headers.add("Via", via);
        }
        ensure(&mut msg, "Max-Forwards", step, &ctx, || "70".to_string())?;
        ensure(&mut msg, "From", step, &ctx, || {
            build_name_addr(&transaction.local_aor, Some(&transaction.local_tag))
        })?;
        ensure(&mut msg, "To", step, &ctx, || {
            build_name_addr(&transaction.remote_aor, transaction.remote_tag())
        })?;
        ensure(&mut msg, "Call-ID", step, &ctx, || call.call_id().to_string())?;
        ensure(&mut msg, "CSeq", step, &ctx, || build_cseq_value(seq, method.as_str()))?;

        // テンプレートで指定された CSeq 番号はカウンタに反映する
        if let Some(value) = msg.headers.get("CSeq") {
            let n: u32 = value
                .split_whitespace()
                .next()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| GossipError::ConfigError(format!("CSeq without sequence number: {}", value)))?;
            call.observe_seq(n);
        }

        if new_call {
            let call_id = msg.call_id().unwrap_or_default().to_string();
            if call_id != call.call_id() {
                let renamed = SipCall::new(call_id);
                renamed.observe_seq(call.seq());
                transaction = Arc::new(SipTransaction::new(
                    Arc::new(renamed),
                    transaction.local_tag.clone(),
                    transaction.local_aor.clone(),
                    transaction.remote_aor.clone(),
                    transaction.remote_number.clone(),
                ));
            }
        }

        add_tag_headers(&mut msg, step);
        apply_sdp(&mut msg, step, &ctx)?;

        msg.start_line = build_request_line(method.as_str(), &to_number, &self.remote.addr(), to_noa);
        msg.transaction = Some(transaction);
        Ok(msg)
    }

    fn build_response(
        &self,
        prev: Option<&Arc<SipMessage>>,
        step: &CallStep,
        code: u16,
    ) -> Result<SipMessage, GossipError> {
        let request = prev
            .and_then(nearest_request)
            .ok_or_else(|| GossipError::ConfigError(format!("{} response without a request to answer", code)))?;
        let transaction = request
            .transaction
            .clone()
            .ok_or_else(|| GossipError::ConfigError(format!("{} response to a request outside any call", code)))?;

        let (seq, method) = request
            .cseq()
            .map(|(n, m)| (n, m.to_string()))
            .unwrap_or_else(|| (transaction.call.seq(), request.sip_type.to_string()));
        let branch = request.branch().unwrap_or_default().to_string();
        let to_noa = step.noa.as_deref().unwrap_or(DEFAULT_NOA);
        let ctx = self.context(
            &transaction,
            seq,
            &method,
            &transaction.remote_number,
            to_noa,
            &branch,
            step,
        );

        let mut msg = SipMessage::new(SipType::Response(code), Direction::Outbound);
        apply_headers_template(&mut msg, step, &ctx)?;

        if !msg.headers.contains("Via") {
            match step.template("Via") {
                Some(t) => msg.headers.add("Via", t.render(&ctx)?),
                None => {
                    for via in request.headers.get_all("Via") {
                        msg.headers.add("Via", via.clone());
                    }
                }
            }
        }
        ensure(&mut msg, "From", step, &ctx, || {
            request
                .headers
                .get("From")
                .map(str::to_string)
                .unwrap_or_else(|| build_name_addr(&transaction.remote_aor, transaction.remote_tag()))
        })?;
        ensure(&mut msg, "To", step, &ctx, || match request.headers.get("To") {
            Some(to) => with_tag(to, &transaction.local_tag),
            None => build_name_addr(&transaction.local_aor, Some(&transaction.local_tag)),
        })?;
        ensure(&mut msg, "Call-ID", step, &ctx, || {
            request
                .call_id()
                .unwrap_or(transaction.call.call_id())
                .to_string()
        })?;
        ensure(&mut msg, "CSeq", step, &ctx, || {
            request
                .headers
                .get("CSeq")
                .map(str::to_string)
                .unwrap_or_else(|| build_cseq_value(seq, &method))
        })?;
        if msg.headers.count("Max-Forwards") > 1 {
            return Err(GossipError::DuplicateHeader("Max-Forwards".to_string()));
        }

        add_tag_headers(&mut msg, step);
        apply_sdp(&mut msg, step, &ctx)?;

        msg.start_line = build_status_line(code, reason_phrase(code));
        msg.transaction = Some(transaction);
        msg.request = Some(request);
        Ok(msg)
    }

    #[allow(clippy::too_many_arguments)]
    fn context(
        &self,
        tr: &SipTransaction,
        seq: u32,
        method: &str,
        to_number: &str,
        to_noa: &str,
        branch: &str,
        step: &CallStep,
    ) -> TemplateContext {
        TemplateContext {
            call_id: tr.call.call_id().to_string(),
            seq,
            method: method.to_string(),
            local_tag: tr.local_tag.clone(),
            remote_tag: tr.remote_tag().unwrap_or_default().to_string(),
            transport: self.local.kind.via_token().to_string(),
            local_addr: self.local.addr(),
            local_host: self.local.host.clone(),
            remote_addr: self.remote.addr(),
            remote_host: self.remote.host.clone(),
            from_number: self.number.clone(),
            from_noa: self.noa.clone(),
            to_number: to_number.to_string(),
            to_noa: to_noa.to_string(),
            branch: branch.to_string(),
            tags: step.tags.iter().map(String::as_str).collect::<Vec<_>>().join(" "),
        }
    }
}

/// Closest request at or before `msg` in its chain
fn nearest_request(msg: &Arc<SipMessage>) -> Option<Arc<SipMessage>> {
    let mut cur = Some(msg);
    while let Some(m) = cur {
        if m.is_request() {
            return Some(Arc::clone(m));
        }
        cur = m.prev.as_ref();
    }
    None
}

fn apply_headers_template(
    msg: &mut SipMessage,
    step: &CallStep,
    ctx: &TemplateContext,
) -> Result<(), GossipError> {
    if let Some(template) = &step.headers {
        let text = template.render(ctx)?;
        let (headers, body) = parse_header_block(&text)
            .map_err(|e| GossipError::ConfigError(format!("expanded headers: {}", e.message)))?;
        msg.headers = headers;
        msg.body = body;
    }
    Ok(())
}

/// Add a mandatory header when missing; more than one value is a scenario defect.
fn ensure(
    msg: &mut SipMessage,
    name: &str,
    step: &CallStep,
    ctx: &TemplateContext,
    default: impl FnOnce() -> String,
) -> Result<(), GossipError> {
    match msg.headers.count(name) {
        0 => {
            let value = match step.template(name) {
                Some(t) => t.render(ctx)?,
                None => default(),
            };
            msg.headers.add(name, value);
            Ok(())
        }
        1 => Ok(()),
        _ => Err(GossipError::DuplicateHeader(name.to_string())),
    }
}

fn add_tag_headers(msg: &mut SipMessage, step: &CallStep) {
    for (name, tags) in [
        ("Allow", &step.allow),
        ("Supported", &step.supported),
        ("Require", &step.required),
    ] {
        if !tags.is_empty() && !msg.headers.contains(name) {
            let value = tags.iter().map(String::as_str).collect::<Vec<_>>().join(", ");
            msg.headers.add(name, value);
        }
    }
}

fn apply_sdp(msg: &mut SipMessage, step: &CallStep, ctx: &TemplateContext) -> Result<(), GossipError> {
    if step.sdp.is_empty() {
        return Ok(());
    }
    let text = match step.template("sdp") {
        Some(t) => t.render(ctx)?,
        None => DUMMY_SDP_TEMPLATE.render(ctx)?,
    };
    let mut body: Vec<String> = text.lines().map(|l| l.trim_end().to_string()).collect();
    while body.last().map_or(false, |l| l.is_empty()) {
        body.pop();
    }
    msg.body = body;
    msg.headers.set("Content-Type", "application/sdp");
    Ok(())
}
