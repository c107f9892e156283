// Inbound message routing
//
// Routes live in three independent keyspaces. Each keyspace has its own
// RwLock: lookups take the read side, registration and removal the write
// side. Locks are never held across an await.

pub mod retransmit;

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use crate::sip::{extract_tag, extract_user, Item, SipMessage};
use crate::stats::StatsCollector;

pub use retransmit::{RetransmitPolicy, Retransmitter};

/// Window within which an identical message on the same branch is a retransmission
pub const DUPLICATE_WINDOW: Duration = Duration::from_secs(32);

/// Stale route sweep period
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeySpace {
    /// Party number (user part of the Request-URI)
    Number,
    /// Call-ID qualified with the receiving side's tag, see [`dialog_key`]
    CallId,
    /// Via branch of a request sent by the route owner
    Via,
}

impl KeySpace {
    pub const ALL: [KeySpace; 3] = [KeySpace::Number, KeySpace::CallId, KeySpace::Via];

    fn index(self) -> usize {
        match self {
            KeySpace::Number => 0,
            KeySpace::CallId => 1,
            KeySpace::Via => 2,
        }
    }
}

/// What travels on a route queue.
#[derive(Debug, Clone)]
pub enum Delivery {
    Item(Arc<Item>),
    /// Liveness probe from the sweeper; consumers skip it
    Probe,
}

/// Consumer side of a route.
#[derive(Debug)]
pub struct Inbox {
    tx: mpsc::Sender<Delivery>,
    rx: mpsc::Receiver<Delivery>,
}

impl Inbox {
    fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self { tx, rx }
    }

    /// Next delivered item, skipping probes.
    pub async fn recv(&mut self) -> Option<Arc<Item>> {
        loop {
            match self.rx.recv().await? {
                Delivery::Item(item) => return Some(item),
                Delivery::Probe => continue,
            }
        }
    }

    /// Next item if one is queued, skipping probes.
    pub fn try_recv(&mut self) -> Option<Arc<Item>> {
        loop {
            match self.rx.try_recv().ok()? {
                Delivery::Item(item) => return Some(item),
                Delivery::Probe => continue,
            }
        }
    }

    fn same_queue(&self, tx: &mpsc::Sender<Delivery>) -> bool {
        self.tx.same_channel(tx)
    }
}

/// Result of routing one inbound item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routing {
    Delivered(KeySpace),
    Duplicate,
    Unrouted,
}

/// Key under which a party receives in-dialog traffic: the Call-ID plus the
/// tag the party uses for itself.
pub fn dialog_key(call_id: &str, local_tag: &str) -> String {
    format!("{};{}", call_id, local_tag)
}

type RouteTable = RwLock<HashMap<String, mpsc::Sender<Delivery>>>;

pub struct Director {
    routes: [RouteTable; 3],
    capacity: usize,
    retransmitter: Arc<Retransmitter>,
    seen: Mutex<HashMap<(String, u32), Instant>>,
    /// Held from the room check to the enqueue, so concurrent receivers
    /// and the sweep never fill the probe slot between them
    delivery: Mutex<()>,
    stats: Arc<StatsCollector>,
}

impl Director {
    /// `capacity` is the size of every route queue; one slot is kept for the probe.
    pub fn new(capacity: usize, retransmitter: Arc<Retransmitter>, stats: Arc<StatsCollector>) -> Self {
        Self {
            routes: [
                RwLock::new(HashMap::new()),
                RwLock::new(HashMap::new()),
                RwLock::new(HashMap::new()),
            ],
            capacity: capacity.max(2),
            retransmitter,
            seen: Mutex::new(HashMap::new()),
            delivery: Mutex::new(()),
            stats,
        }
    }

    fn table(&self, space: KeySpace) -> &RouteTable {
        &self.routes[space.index()]
    }

    pub fn retransmitter(&self) -> &Arc<Retransmitter> {
        &self.retransmitter
    }

    pub fn stats(&self) -> &Arc<StatsCollector> {
        &self.stats
    }

    /// A queue not yet registered under any key.
    pub fn inbox(&self) -> Inbox {
        Inbox::new(self.capacity)
    }

    /// Create a new queue and register it under `key`. An existing route for
    /// the key is replaced.
    pub fn register(&self, space: KeySpace, key: &str) -> Inbox {
        let inbox = self.inbox();
        self.attach(space, key, &inbox);
        inbox
    }

    /// Register an existing queue under one more key.
    pub fn attach(&self, space: KeySpace, key: &str, inbox: &Inbox) {
        self.table(space).write().insert(key.to_string(), inbox.tx.clone());
    }

    /// Remove the route for `key` if it still points at `inbox`.
    pub fn unregister(&self, space: KeySpace, key: &str, inbox: &Inbox) -> bool {
        let mut table = self.table(space).write();
        match table.get(key) {
            Some(tx) if inbox.same_queue(tx) => {
                table.remove(key);
                true
            }
            _ => false,
        }
    }

    pub fn is_registered(&self, space: KeySpace, key: &str) -> bool {
        self.table(space).read().contains_key(key)
    }

    pub fn route_count(&self, space: KeySpace) -> usize {
        self.table(space).read().len()
    }

    /// Non-blocking delivery. `false` when there is no route or the queue
    /// has no room left besides the probe slot.
    pub fn send_item(&self, space: KeySpace, key: &str, item: Arc<Item>) -> bool {
        let tx = match self.table(space).read().get(key) {
            Some(tx) => tx.clone(),
            None => return false,
        };
        let _gate = self.delivery.lock();
        if tx.capacity() <= 1 {
            return false;
        }
        tx.try_send(Delivery::Item(item)).is_ok()
    }

    /// Probe every route once and drop those whose queue is full or closed.
    /// Also forgets duplicate-detection entries older than [`DUPLICATE_WINDOW`].
    pub fn sweep(&self) -> usize {
        let mut removed = 0;
        for space in KeySpace::ALL {
            let stale: Vec<(String, mpsc::Sender<Delivery>)> = self
                .table(space)
                .read()
                .iter()
                .filter(|(_, tx)| {
                    let _gate = self.delivery.lock();
                    tx.try_send(Delivery::Probe).is_err()
                })
                .map(|(k, tx)| (k.clone(), tx.clone()))
                .collect();
            if stale.is_empty() {
                continue;
            }
            let mut table = self.table(space).write();
            for (key, tx) in stale {
                // 再登録されたルートは残す
                if table.get(&key).map_or(false, |cur| cur.same_channel(&tx)) {
                    table.remove(&key);
                    removed += 1;
                    debug!(?space, key = %key, "reclaimed stale route");
                }
            }
        }
        let now = Instant::now();
        self.seen
            .lock()
            .retain(|_, at| now.duration_since(*at) < DUPLICATE_WINDOW);
        self.retransmitter.purge_answered(DUPLICATE_WINDOW);
        if removed > 0 {
            self.stats.record_stale_routes(removed);
        }
        removed
    }

    /// Run [`Director::sweep`] every `period` until the director is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(director) = weak.upgrade() else {
                    break;
                };
                director.sweep();
            }
            info!("route sweeper stopped");
        })
    }

    /// Entry point for inbound traffic.
    ///
    /// Cancels the retransmission pending under the item's Via branch, drops
    /// retransmitted copies, then tries the route keys in order.
    pub fn direct(&self, item: Arc<Item>) -> Routing {
        if let Some(branch) = item.branch() {
            self.retransmitter.cancel(branch);
        }

        let dedup = item
            .branch()
            .or_else(|| item.msg.call_id())
            .map(|k| (k.to_string(), item.checksum));
        if let Some(key) = &dedup {
            if let Some(at) = self.seen.lock().get(key) {
                if at.elapsed() < DUPLICATE_WINDOW {
                    self.stats.record_duplicate();
                    debug!(branch = %key.0, "duplicate message dropped");
                    return Routing::Duplicate;
                }
            }
        }

        for (space, key) in route_keys(&item.msg) {
            if self.send_item(space, &key, Arc::clone(&item)) {
                if let Some(key) = dedup {
                    self.seen.lock().insert(key, Instant::now());
                }
                self.stats.record_received(item.msg.sip_type.status_code());
                return Routing::Delivered(space);
            }
        }

        self.stats.record_unrouted();
        debug!(
            start_line = %item.msg.start_line,
            call_id = item.msg.call_id().unwrap_or(""),
            "no route for inbound message"
        );
        Routing::Unrouted
    }
}

/// Route keys for an inbound message, most specific first.
///
/// Responses find the request's sender by Via branch, then by Call-ID and
/// From tag. Requests find an existing dialog by Call-ID and To tag, then a
/// party by the number in the Request-URI.
fn route_keys(msg: &SipMessage) -> Vec<(KeySpace, String)> {
    let mut keys = Vec::with_capacity(2);
    let call_id = msg.call_id();
    if msg.is_request() {
        if let (Some(cid), Some(tag)) = (call_id, msg.headers.get("To").and_then(extract_tag)) {
            keys.push((KeySpace::CallId, dialog_key(cid, tag)));
        }
        if let Some(user) = msg.request_uri().and_then(extract_user) {
            keys.push((KeySpace::Number, user.to_string()));
        }
    } else {
        if let Some(branch) = msg.branch() {
            keys.push((KeySpace::Via, branch.to_string()));
        }
        if let (Some(cid), Some(tag)) = (call_id, msg.headers.get("From").and_then(extract_tag)) {
            keys.push((KeySpace::CallId, dialog_key(cid, tag)));
        }
    }
    keys
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Endpoint, TransportKind};
    use crate::sip::{Direction, Method, SipType};
    use tokio::time::timeout;

    fn director() -> Director {
        Director::new(
            4,
            Arc::new(Retransmitter::new(RetransmitPolicy::default())),
            Arc::new(StatsCollector::new()),
        )
    }

    fn ep() -> Endpoint {
        Endpoint::new(TransportKind::Udp, "127.0.0.1", 5060)
    }

    fn inbound(msg: SipMessage) -> Arc<Item> {
        let scanned = crate::sip::formatter::format_message(&msg);
        let checksum = crate::sip::item::message_checksum(&msg);
        Arc::new(Item::inbound(msg, scanned, checksum, ep(), ep(), None))
    }

    fn request(method: Method, user: &str, branch: &str, to: &str) -> SipMessage {
        let mut msg = SipMessage::new(SipType::Request(method.clone()), Direction::Inbound);
        msg.start_line = format!("{} sip:{}@127.0.0.1:5065;noa=2 SIP/2.0", method, user);
        msg.headers.add("Via", format!("SIP/2.0/UDP 127.0.0.1:5060;branch={}", branch));
        msg.headers.add("From", "<sip:1000@127.0.0.1>;tag=ft");
        msg.headers.add("To", to.to_string());
        msg.headers.add("Call-ID", "cid-1");
        msg.headers.add("CSeq", format!("1 {}", method));
        msg
    }

    fn response(code: u16, branch: &str) -> SipMessage {
        let mut msg = SipMessage::new(SipType::Response(code), Direction::Inbound);
        msg.start_line = format!("SIP/2.0 {} {}", code, crate::sip::reason_phrase(code));
        msg.headers.add("Via", format!("SIP/2.0/UDP 127.0.0.1:5065;branch={}", branch));
        msg.headers.add("From", "<sip:1000@127.0.0.1>;tag=ft");
        msg.headers.add("To", "<sip:2000@127.0.0.1>;tag=tt");
        msg.headers.add("Call-ID", "cid-1");
        msg.headers.add("CSeq", "1 INVITE");
        msg
    }

    #[tokio::test]
    async fn test_registered_route_is_reachable() {
        let d = director();
        let mut inbox = d.register(KeySpace::Number, "2000");
        let item = inbound(request(Method::Invite, "2000", "z9hG4bK1", "<sip:2000@h>"));
        assert!(d.send_item(KeySpace::Number, "2000", Arc::clone(&item)));
        let got = inbox.try_recv().unwrap();
        assert!(Arc::ptr_eq(&got, &item));
        assert!(!d.send_item(KeySpace::CallId, "2000", item));
    }

    #[tokio::test]
    async fn test_unregister_makes_route_unreachable() {
        let d = director();
        let inbox = d.register(KeySpace::Via, "z9hG4bK1");
        assert!(d.unregister(KeySpace::Via, "z9hG4bK1", &inbox));
        let item = inbound(response(200, "z9hG4bK1"));
        assert!(!d.send_item(KeySpace::Via, "z9hG4bK1", item));
    }

    #[tokio::test]
    async fn test_unregister_keeps_newer_owner() {
        let d = director();
        let old = d.register(KeySpace::Number, "2000");
        let _new = d.register(KeySpace::Number, "2000");
        assert!(!d.unregister(KeySpace::Number, "2000", &old));
        assert!(d.is_registered(KeySpace::Number, "2000"));
    }

    #[tokio::test]
    async fn test_send_keeps_probe_slot_free() {
        let d = director();
        let _inbox = d.register(KeySpace::Number, "2000");
        let item = inbound(request(Method::Invite, "2000", "z9hG4bK1", "<sip:2000@h>"));
        for _ in 0..3 {
            assert!(d.send_item(KeySpace::Number, "2000", Arc::clone(&item)));
        }
        assert!(!d.send_item(KeySpace::Number, "2000", item));
        // 1 件空きがあるのでプローブは入り、ルートは残る
        assert_eq!(d.sweep(), 0);
        assert_eq!(d.sweep(), 1);
        assert!(!d.is_registered(KeySpace::Number, "2000"));
    }

    #[test]
    fn test_concurrent_senders_leave_probe_slot() {
        let d = director();
        let _inbox = d.register(KeySpace::Number, "2000");
        let item = inbound(request(Method::Invite, "2000", "z9hG4bK1", "<sip:2000@h>"));
        let delivered = std::sync::atomic::AtomicUsize::new(0);
        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for _ in 0..50 {
                        if d.send_item(KeySpace::Number, "2000", Arc::clone(&item)) {
                            delivered.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                        }
                    }
                });
            }
        });
        // 容量 4 のうち 3 件まで、プローブ用の 1 件は残る
        assert_eq!(delivered.load(std::sync::atomic::Ordering::SeqCst), 3);
        assert_eq!(d.sweep(), 0);
        assert!(d.is_registered(KeySpace::Number, "2000"));
    }

    #[tokio::test]
    async fn test_sweep_keeps_drained_routes() {
        let d = director();
        let mut inbox = d.register(KeySpace::CallId, "c;t");
        for _ in 0..10 {
            assert_eq!(d.sweep(), 0);
            assert!(inbox.try_recv().is_none());
        }
        assert!(d.is_registered(KeySpace::CallId, "c;t"));
    }

    #[tokio::test]
    async fn test_sweep_reclaims_dropped_inbox() {
        let d = director();
        let inbox = d.register(KeySpace::Number, "3000");
        drop(inbox);
        assert_eq!(d.sweep(), 1);
        assert_eq!(d.route_count(KeySpace::Number), 0);
        assert_eq!(d.stats().snapshot().stale_routes, 1);
    }

    #[tokio::test]
    async fn test_direct_routes_request_by_number() {
        let d = director();
        let mut inbox = d.register(KeySpace::Number, "2000");
        let item = inbound(request(Method::Invite, "2000", "z9hG4bK9", "<sip:2000@h>"));
        assert_eq!(d.direct(item), Routing::Delivered(KeySpace::Number));
        assert!(inbox.try_recv().is_some());
    }

    #[tokio::test]
    async fn test_direct_prefers_dialog_route() {
        let d = director();
        let mut by_number = d.register(KeySpace::Number, "2000");
        let mut by_dialog = d.register(KeySpace::CallId, &dialog_key("cid-1", "tt"));
        let item = inbound(request(Method::Bye, "2000", "z9hG4bK8", "<sip:2000@h>;tag=tt"));
        assert_eq!(d.direct(item), Routing::Delivered(KeySpace::CallId));
        assert!(by_dialog.try_recv().is_some());
        assert!(by_number.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_direct_routes_response_by_via() {
        let d = director();
        let mut inbox = d.register(KeySpace::Number, "1000");
        d.attach(KeySpace::Via, "z9hG4bK7", &inbox);
        let item = inbound(response(180, "z9hG4bK7"));
        assert_eq!(d.direct(item), Routing::Delivered(KeySpace::Via));
        let got = timeout(Duration::from_millis(100), inbox.recv()).await.unwrap().unwrap();
        assert_eq!(got.msg.sip_type, SipType::Response(180));
        assert_eq!(d.stats().snapshot().status_codes.get(&180), Some(&1));
    }

    #[tokio::test]
    async fn test_direct_drops_duplicates() {
        let d = director();
        let mut inbox = d.register(KeySpace::Via, "z9hG4bK6");
        let msg = response(200, "z9hG4bK6");
        assert_eq!(d.direct(inbound(msg.clone())), Routing::Delivered(KeySpace::Via));
        assert_eq!(d.direct(inbound(msg)), Routing::Duplicate);
        // 別のレスポンスは重複ではない
        assert_eq!(d.direct(inbound(response(180, "z9hG4bK6"))), Routing::Delivered(KeySpace::Via));
        assert!(inbox.try_recv().is_some());
        assert!(inbox.try_recv().is_some());
        assert!(inbox.try_recv().is_none());
        assert_eq!(d.stats().snapshot().duplicates, 1);
    }

    #[tokio::test]
    async fn test_direct_unrouted() {
        let d = director();
        let item = inbound(request(Method::Options, "9999", "z9hG4bK5", "<sip:9999@h>"));
        assert_eq!(d.direct(item), Routing::Unrouted);
        assert_eq!(d.stats().snapshot().unrouted, 1);
    }

    #[tokio::test]
    async fn test_direct_cancels_retransmission() {
        let d = director();
        let (tx, _rx) = mpsc::channel(4);
        let mut out = request(Method::Invite, "2000", "z9hG4bK4", "<sip:2000@h>");
        out.direction = Direction::Outbound;
        let sent = Arc::new(Item::outbound(Arc::new(out), ep(), ep()).with_reply(tx));
        d.retransmitter().after_send(&sent);
        assert_eq!(d.retransmitter().pending_count(), 1);

        d.direct(inbound(response(100, "z9hG4bK4")));
        assert_eq!(d.retransmitter().pending_count(), 0);
        assert!(sent.is_retrans_cancelled());
    }

    #[tokio::test]
    async fn test_sweeper_stops_with_director() {
        let d = Arc::new(director());
        let handle = d.spawn_sweeper(Duration::from_millis(5));
        drop(d);
        timeout(Duration::from_millis(500), handle)
            .await
            .expect("sweeper should exit")
            .unwrap();
    }
}
