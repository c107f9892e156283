use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::director::{Director, Routing};
use crate::error::GossipError;
use crate::sip::item::message_checksum;
use crate::sip::parser::parse_sip_message;
use crate::sip::{Item, SipMessage};
use crate::transport::Transport;

/// テスト用の共通モックトランスポート
/// - 送信 Item の記録
/// - 送信カウント
/// - オプションの失敗注入
/// - オプションのループバック（送信したメッセージを受信として Director に渡す）
pub struct MockTransport {
    pub sent: Mutex<Vec<Item>>,
    pub send_count: AtomicUsize,
    pub should_fail: AtomicBool,
    loopback: Option<Arc<Director>>,
    reply: mpsc::Sender<Arc<Item>>,
    // ループバック時の返信キュー。誰も読まないが閉じないよう保持する
    _reply_rx: Mutex<mpsc::Receiver<Arc<Item>>>,
}

impl MockTransport {
    pub fn new() -> Self {
        let (reply, rx) = mpsc::channel(8);
        Self {
            sent: Mutex::new(Vec::new()),
            send_count: AtomicUsize::new(0),
            should_fail: AtomicBool::new(false),
            loopback: None,
            reply,
            _reply_rx: Mutex::new(rx),
        }
    }

    /// 送信したメッセージをワイヤ形式経由で `director` に戻すモック
    pub fn with_loopback(director: Arc<Director>) -> Self {
        Self {
            loopback: Some(director),
            ..Self::new()
        }
    }

    /// should_fail フラグを設定する
    pub fn set_should_fail(&self, fail: bool) {
        self.should_fail.store(fail, Ordering::Relaxed);
    }

    /// 送信成功した Item 数を返す（sent ベクタの長さ）
    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    /// 送信されたメッセージを送信順に返す
    pub fn sent_messages(&self) -> Vec<Arc<SipMessage>> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|item| Arc::clone(&item.msg))
            .collect()
    }

    /// 送信されたワイヤデータを再パースして返す
    pub fn sent_wire_messages(&self) -> Vec<SipMessage> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter_map(|item| parse_sip_message(&item.wire).ok().map(|s| s.message))
            .collect()
    }

    fn loop_back(&self, director: &Director, item: &Item) -> Routing {
        match parse_sip_message(&item.wire) {
            Ok(scanned) => {
                let inbound = Item::inbound(
                    scanned.message,
                    item.wire.clone(),
                    scanned.checksum,
                    item.remote.clone(),
                    item.local.clone(),
                    Some(self.reply.clone()),
                );
                director.direct(Arc::new(inbound))
            }
            Err(_) => Routing::Unrouted,
        }
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MockTransport {
    fn send<'a>(
        &'a self,
        item: Item,
    ) -> Pin<Box<dyn Future<Output = Result<(), GossipError>> + Send + 'a>> {
        Box::pin(async move {
            self.send_count.fetch_add(1, Ordering::Relaxed);
            if self.should_fail.load(Ordering::Relaxed) {
                return Err(GossipError::NetworkError(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "mock failure",
                )));
            }
            if let Some(director) = &self.loopback {
                director.stats().record_sent();
                self.loop_back(director, &item);
            }
            self.sent.lock().unwrap().push(item);
            Ok(())
        })
    }
}

/// チェックサム付きの受信 Item を組み立てる
pub fn inbound_item(msg: SipMessage, local: crate::config::Endpoint, remote: crate::config::Endpoint) -> Item {
    let wire = crate::sip::formatter::format_message(&msg);
    let checksum = message_checksum(&msg);
    Item::inbound(msg, wire, checksum, local, remote, None)
}
