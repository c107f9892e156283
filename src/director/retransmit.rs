// Retransmission timers for outbound requests

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::sip::{Item, RetransStage};

/// Timer values for the retransmission schedule (RFC 3261 T1/T2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetransmitPolicy {
    pub t1: Duration,
    pub t2: Duration,
}

impl Default for RetransmitPolicy {
    fn default() -> Self {
        Self {
            t1: Duration::from_millis(500),
            t2: Duration::from_secs(4),
        }
    }
}

impl RetransmitPolicy {
    /// Wait before the retransmission `stage`: `T1 * 2^(n-1)`, capped at `T2`.
    pub fn delay(&self, stage: RetransStage) -> Duration {
        let n = stage.ordinal().max(1);
        let factor = 1u32.checked_shl(n - 1).unwrap_or(u32::MAX);
        self.t1.saturating_mul(factor).min(self.t2)
    }
}

#[derive(Default)]
struct Table {
    /// Armed timers by Via branch
    pending: HashMap<String, Arc<Item>>,
    /// Branches answered before their timer was armed
    answered: HashMap<String, Instant>,
}

/// Pending retransmissions keyed by Via branch.
///
/// A response can be routed between the write of a request and the call to
/// [`Retransmitter::after_send`]. `cancel` then leaves a mark that
/// `after_send` consumes under the same lock, so the timer is never armed.
pub struct Retransmitter {
    policy: RetransmitPolicy,
    table: Mutex<Table>,
}

impl Retransmitter {
    pub fn new(policy: RetransmitPolicy) -> Self {
        Self {
            policy,
            table: Mutex::new(Table::default()),
        }
    }

    pub fn policy(&self) -> RetransmitPolicy {
        self.policy
    }

    /// Called once an item has been written to the network.
    ///
    /// Advances the item's stage and, while stages remain, arms a timer
    /// that puts the same item back on its reply queue. Returns the stage
    /// the timer was armed for, or `None` when the item is done.
    pub fn after_send(&self, item: &Arc<Item>) -> Option<RetransStage> {
        let branch = item.branch()?.to_string();
        let stage = item.advance_retrans();
        let reply = {
            let mut table = self.table.lock();
            match stage {
                RetransStage::NoRetrans | RetransStage::Initial | RetransStage::End => {
                    table.pending.remove(&branch);
                    table.answered.remove(&branch);
                    return None;
                }
                _ => {}
            }
            if table.answered.remove(&branch).is_some() {
                item.cancel_retrans();
                debug!(branch = %branch, "answered before the timer was armed");
                return None;
            }
            let reply = item.reply.clone()?;
            table.pending.insert(branch.clone(), Arc::clone(item));
            reply
        };

        let delay = self.policy.delay(stage);
        let item = Arc::clone(item);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if item.is_retrans_cancelled() {
                return;
            }
            // 送信キューが詰まっている場合はトランザクション放棄とみなす
            if reply.try_send(Arc::clone(&item)).is_err() {
                debug!(branch = %branch, ?stage, "retransmission dropped, queue full or closed");
            }
        });
        Some(stage)
    }

    /// Stop retransmitting the request sent under `branch`.
    ///
    /// Returns `false` when no timer is armed; the branch is then remembered
    /// so a later `after_send` for it arms nothing.
    pub fn cancel(&self, branch: &str) -> bool {
        let mut table = self.table.lock();
        match table.pending.remove(branch) {
            Some(item) => {
                item.cancel_retrans();
                true
            }
            None => {
                table.answered.insert(branch.to_string(), Instant::now());
                false
            }
        }
    }

    /// Cancel everything still pending.
    pub fn cancel_all(&self) {
        let drained: Vec<Arc<Item>> = {
            let mut table = self.table.lock();
            table.answered.clear();
            table.pending.drain().map(|(_, v)| v).collect()
        };
        for item in drained {
            item.cancel_retrans();
        }
    }

    /// Forget answered marks older than `window`.
    pub fn purge_answered(&self, window: Duration) {
        let now = Instant::now();
        self.table
            .lock()
            .answered
            .retain(|_, at| now.duration_since(*at) < window);
    }

    pub fn pending_count(&self) -> usize {
        self.table.lock().pending.len()
    }

    pub fn answered_count(&self) -> usize {
        self.table.lock().answered.len()
    }
}
