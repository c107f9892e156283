// Admission limiter: caps concurrent scenario runs and paces their start

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{interval, Interval, MissedTickBehavior};

/// 同時実行数とレートの設定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimiterConfig {
    /// `None` means unbounded
    pub concurrent_max: Option<usize>,
    /// Claims per second; 0 falls back to one per second
    pub rate: u32,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            concurrent_max: None,
            rate: 1,
        }
    }
}

impl LimiterConfig {
    pub fn period(&self) -> Duration {
        if self.rate == 0 {
            Duration::from_secs(1)
        } else {
            Duration::from_secs(1) / self.rate
        }
    }
}

pub struct Limiter {
    max: usize,
    period: Duration,
    active: Mutex<usize>,
    released: Notify,
    drained: Notify,
    // created on first claim so a Limiter can be built outside a runtime
    ticker: tokio::sync::Mutex<Option<Interval>>,
}

impl Limiter {
    pub fn new(config: LimiterConfig) -> Self {
        Self {
            max: config.concurrent_max.unwrap_or(usize::MAX),
            period: config.period(),
            active: Mutex::new(0),
            released: Notify::new(),
            drained: Notify::new(),
            ticker: tokio::sync::Mutex::new(None),
        }
    }

    /// Wait for a free slot, take it, then wait for the next pacing tick.
    ///
    /// The slot is counted from the moment it is taken, so the cap holds
    /// while the claimant waits for its tick. Dropping the future during
    /// that wait gives the slot back.
    pub async fn claim(&self) {
        loop {
            let notified = self.released.notified();
            {
                let mut active = self.active.lock();
                if *active < self.max {
                    *active += 1;
                    break;
                }
            }
            notified.await;
        }
        let pending = PendingClaim { limiter: Some(self) };
        self.tick().await;
        pending.keep();
    }

    async fn tick(&self) {
        let mut ticker = self.ticker.lock().await;
        let ticker = ticker.get_or_insert_with(|| {
            let mut t = interval(self.period);
            t.set_missed_tick_behavior(MissedTickBehavior::Delay);
            t
        });
        ticker.tick().await;
    }

    /// Give a slot back and wake one waiting claimant.
    pub fn release(&self) {
        let now_idle = {
            let mut active = self.active.lock();
            debug_assert!(*active > 0, "release without claim");
            *active = active.saturating_sub(1);
            *active == 0
        };
        self.released.notify_one();
        if now_idle {
            self.drained.notify_waiters();
        }
    }

    /// Claim a slot that is released when the returned guard drops.
    pub async fn claim_slot(self: &Arc<Self>) -> LimiterSlot {
        self.claim().await;
        LimiterSlot {
            limiter: Arc::clone(self),
        }
    }

    /// Block until every claimed slot has been released.
    pub async fn wait(&self) {
        loop {
            let notified = self.drained.notified();
            if *self.active.lock() == 0 {
                return;
            }
            notified.await;
        }
    }

    pub fn active(&self) -> usize {
        *self.active.lock()
    }
}

/// Slot taken by a claim that has not seen its tick yet
struct PendingClaim<'a> {
    limiter: Option<&'a Limiter>,
}

impl PendingClaim<'_> {
    fn keep(mut self) {
        self.limiter = None;
    }
}

impl Drop for PendingClaim<'_> {
    fn drop(&mut self) {
        if let Some(limiter) = self.limiter.take() {
            limiter.release();
        }
    }
}

/// RAII handle for one claimed slot.
pub struct LimiterSlot {
    limiter: Arc<Limiter>,
}

impl Drop for LimiterSlot {
    fn drop(&mut self) {
        self.limiter.release();
    }
}

impl std::fmt::Debug for LimiterSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LimiterSlot")
            .field("active", &self.limiter.active())
            .finish()
    }
}
