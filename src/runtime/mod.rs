// Process-wide runtime state shared by every scenario run
//
// Owns the director, the transport, the admission limiter and the
// single-flight lock table. Tests build isolated runtimes around a mock
// transport.

use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::config::{Config, Endpoint};
use crate::director::{Director, Retransmitter};
use crate::error::GossipError;
use crate::limiter::Limiter;
use crate::scenario::ScenarioId;
use crate::stats::StatsCollector;
use crate::transport::Transport;

/// How often waiting parties look at the stop flags
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

pub struct Runtime {
    director: Arc<Director>,
    transport: Arc<dyn Transport>,
    limiter: Arc<Limiter>,
    scenario_locks: DashMap<ScenarioId, Arc<tokio::sync::Mutex<()>>>,
    locals: Vec<Endpoint>,
    remotes: Vec<Endpoint>,
    remote_cursor: AtomicUsize,
    shutdown: Arc<AtomicBool>,
    grace: Duration,
    poll_interval: Duration,
}

impl Runtime {
    /// `locals` are the endpoints as bound by the transport.
    pub fn new(
        config: &Config,
        director: Arc<Director>,
        transport: Arc<dyn Transport>,
        locals: Vec<Endpoint>,
    ) -> Result<Arc<Self>, GossipError> {
        let remotes = config.remote_endpoints()?;
        if remotes.is_empty() {
            return Err(GossipError::ConfigError("no remote endpoint configured".to_string()));
        }
        info!(
            locals = locals.len(),
            remotes = remotes.len(),
            concurrent = ?config.concurrent,
            rate = config.rate,
            "runtime ready"
        );
        Ok(Arc::new(Self {
            director,
            transport,
            limiter: Arc::new(Limiter::new(config.limiter_config())),
            scenario_locks: DashMap::new(),
            locals,
            remotes,
            remote_cursor: AtomicUsize::new(0),
            shutdown: Arc::new(AtomicBool::new(false)),
            grace: config.grace(),
            poll_interval: POLL_INTERVAL,
        }))
    }

    /// Runtime with its own director, for a transport that needs none.
    pub fn with_transport(config: &Config, transport: Arc<dyn Transport>) -> Result<Arc<Self>, GossipError> {
        let director = Arc::new(Director::new(
            config.route_queue_capacity,
            Arc::new(Retransmitter::new(config.retransmit_policy())),
            Arc::new(StatsCollector::new()),
        ));
        Self::new(config, director, transport, config.local_endpoints()?)
    }

    pub fn director(&self) -> &Arc<Director> {
        &self.director
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn limiter(&self) -> &Arc<Limiter> {
        &self.limiter
    }

    pub fn stats(&self) -> &Arc<StatsCollector> {
        self.director.stats()
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Next remote endpoint in round-robin order, paired with a local
    /// endpoint of the same transport kind.
    pub fn resolve_endpoints(&self) -> Result<(Endpoint, Endpoint), GossipError> {
        let i = self.remote_cursor.fetch_add(1, Ordering::Relaxed) % self.remotes.len();
        let remote = self.remotes[i].clone();
        let local = self
            .locals
            .iter()
            .find(|l| l.kind == remote.kind)
            .cloned()
            .ok_or_else(|| GossipError::NoTransport(format!("no local {} endpoint for {}", remote.kind, remote)))?;
        Ok((local, remote))
    }

    /// Lock serializing runs of one scenario.
    pub fn scenario_lock(&self, id: ScenarioId) -> Arc<tokio::sync::Mutex<()>> {
        self.scenario_locks
            .entry(id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Ask every running scenario to stop and the scheduler to start no more.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// The flag itself, for signal handlers.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }
}

/// Asynchronously waits until the given flag becomes `true`.
pub async fn wait_for_shutdown(flag: &AtomicBool) {
    loop {
        if flag.load(Ordering::Relaxed) {
            return;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}
