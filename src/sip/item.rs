// Transport envelope around a SIP message

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use super::checksum::checksum_lines;
use super::formatter::format_message;
use super::message::{Method, SipMessage, SipType};
use crate::config::Endpoint;

/// Retransmission progress of an outbound item.
///
/// `NoRetrans` doubles as the cancelled state: once an item is back at
/// `NoRetrans` no further copy is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum RetransStage {
    NoRetrans = 0,
    Initial,
    First,
    Second,
    Third,
    Fourth,
    Fifth,
    Sixth,
    Seventh,
    End,
}

impl RetransStage {
    fn from_u8(v: u8) -> RetransStage {
        match v {
            1 => RetransStage::Initial,
            2 => RetransStage::First,
            3 => RetransStage::Second,
            4 => RetransStage::Third,
            5 => RetransStage::Fourth,
            6 => RetransStage::Fifth,
            7 => RetransStage::Sixth,
            8 => RetransStage::Seventh,
            9 => RetransStage::End,
            _ => RetransStage::NoRetrans,
        }
    }

    /// Stage reached after one more transmission
    pub fn next(self) -> RetransStage {
        match self {
            RetransStage::NoRetrans => RetransStage::NoRetrans,
            RetransStage::End => RetransStage::End,
            other => RetransStage::from_u8(other as u8 + 1),
        }
    }

    /// Number of the retransmission this stage stands for (First = 1)
    pub fn ordinal(self) -> u32 {
        match self {
            RetransStage::NoRetrans | RetransStage::Initial | RetransStage::End => 0,
            other => other as u32 - 1,
        }
    }
}

/// A message in flight, with the endpoints it travels between.
#[derive(Debug)]
pub struct Item {
    pub msg: Arc<SipMessage>,
    pub local: Endpoint,
    pub remote: Endpoint,
    /// Queue of the provider that sends this item; retransmissions go back here
    pub reply: Option<mpsc::Sender<Arc<Item>>>,
    pub wire: Vec<u8>,
    pub checksum: u32,
    retrans: AtomicU8,
}

impl Item {
    /// Wrap a built message for sending. Requests other than ACK start
    /// their retransmission schedule at `Initial`.
    pub fn outbound(msg: Arc<SipMessage>, local: Endpoint, remote: Endpoint) -> Self {
        let wire = format_message(&msg);
        let checksum = message_checksum(&msg);
        let stage = match &msg.sip_type {
            SipType::Request(Method::Ack) | SipType::Response(_) => RetransStage::NoRetrans,
            SipType::Request(_) => RetransStage::Initial,
        };
        Self {
            msg,
            local,
            remote,
            reply: None,
            wire,
            checksum,
            retrans: AtomicU8::new(stage as u8),
        }
    }

    /// Wrap a message that arrived from the network.
    pub fn inbound(
        msg: SipMessage,
        wire: Vec<u8>,
        checksum: u32,
        local: Endpoint,
        remote: Endpoint,
        reply: Option<mpsc::Sender<Arc<Item>>>,
    ) -> Self {
        Self {
            msg: Arc::new(msg),
            local,
            remote,
            reply,
            wire,
            checksum,
            retrans: AtomicU8::new(RetransStage::NoRetrans as u8),
        }
    }

    pub fn with_reply(mut self, reply: mpsc::Sender<Arc<Item>>) -> Self {
        self.reply = Some(reply);
        self
    }

    pub fn branch(&self) -> Option<&str> {
        self.msg.branch()
    }

    pub fn retrans_stage(&self) -> RetransStage {
        RetransStage::from_u8(self.retrans.load(Ordering::SeqCst))
    }

    /// Move to the next stage and return it. Cancelled and exhausted items stay put.
    pub fn advance_retrans(&self) -> RetransStage {
        let mut current = self.retrans.load(Ordering::SeqCst);
        loop {
            let next = RetransStage::from_u8(current).next() as u8;
            if next == current {
                return RetransStage::from_u8(current);
            }
            match self
                .retrans
                .compare_exchange(current, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return RetransStage::from_u8(next),
                Err(actual) => current = actual,
            }
        }
    }

    pub fn cancel_retrans(&self) {
        self.retrans
            .store(RetransStage::NoRetrans as u8, Ordering::SeqCst);
    }

    pub fn is_retrans_cancelled(&self) -> bool {
        self.retrans_stage() == RetransStage::NoRetrans
    }
}

/// Adler-32 over start line, header lines and body lines.
pub fn message_checksum(msg: &SipMessage) -> u32 {
    let header_lines: Vec<String> = msg
        .headers
        .lines()
        .map(|(n, v)| format!("{}: {}", n, v))
        .collect();
    checksum_lines(
        std::iter::once(msg.start_line.as_str())
            .chain(header_lines.iter().map(|s| s.as_str()))
            .chain(msg.body.iter().map(|s| s.as_str())),
    )
}
