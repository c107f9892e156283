// Scenario orchestrator: one run of one scenario
//
// Create takes the single-flight lock of the scenario, then a limiter slot,
// then resolves the endpoint pair. Run spawns one party task per call leg
// and returns once every task has terminated. Lock and slot are guards held
// by the tester, so both are released on every exit path.

mod party;

pub use party::PartyState;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Barrier, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::config::Endpoint;
use crate::error::GossipError;
use crate::limiter::LimiterSlot;
use crate::runtime::Runtime;
use crate::scenario::{Catalog, ScenarioId};
use party::PartyTest;

/// State shared by the party tasks of one run.
pub(crate) struct RunShared {
    pub(crate) stop: AtomicBool,
    pub(crate) setup: Barrier,
    pub(crate) run: Barrier,
}

impl RunShared {
    fn new(parties: usize) -> Self {
        Self {
            stop: AtomicBool::new(false),
            setup: Barrier::new(parties),
            run: Barrier::new(parties),
        }
    }
}

/// Outcome of a successful run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub scenario: String,
    pub parties: usize,
    pub elapsed: Duration,
}

pub struct Tester {
    runtime: Arc<Runtime>,
    catalog: Arc<Catalog>,
    id: ScenarioId,
    local: Endpoint,
    remote: Endpoint,
    _slot: LimiterSlot,
    _lock: OwnedMutexGuard<()>,
}

impl Tester {
    /// Prepare a run of scenario `id`. Blocks while another run of the same
    /// scenario is in progress and while the limiter has no free slot.
    pub async fn create(
        runtime: Arc<Runtime>,
        catalog: Arc<Catalog>,
        id: ScenarioId,
    ) -> Result<Tester, GossipError> {
        if catalog.scenario(id).is_none() {
            return Err(GossipError::ConfigError(format!(
                "no scenario {}.{} in catalog",
                id.suite, id.test
            )));
        }
        let lock = runtime.scenario_lock(id).lock_owned().await;
        let slot = runtime.limiter().claim_slot().await;
        let (local, remote) = runtime.resolve_endpoints()?;
        debug!(
            scenario = %catalog.describe_scenario(id),
            local = %local,
            remote = %remote,
            "scenario admitted"
        );
        Ok(Tester {
            runtime,
            catalog,
            id,
            local,
            remote,
            _slot: slot,
            _lock: lock,
        })
    }

    pub fn local(&self) -> &Endpoint {
        &self.local
    }

    pub fn remote(&self) -> &Endpoint {
        &self.remote
    }

    /// Run every party to termination. The first party error is returned.
    pub async fn run(self) -> Result<RunReport, GossipError> {
        let name = self.catalog.describe_scenario(self.id);
        let parties = self.catalog.scenario(self.id).map_or(0, |t| t.parties.len());
        let stats = Arc::clone(self.runtime.stats());
        stats.record_scenario_started();
        let started = Instant::now();
        info!(scenario = %name, parties, "scenario started");

        let shared = Arc::new(RunShared::new(parties));
        let mut handles = Vec::with_capacity(parties);
        for index in 0..parties {
            let party = PartyTest::new(
                Arc::clone(&self.runtime),
                Arc::clone(&self.catalog),
                self.id,
                index,
                self.local.clone(),
                self.remote.clone(),
                Arc::clone(&shared),
            );
            handles.push(tokio::spawn(party.run()));
        }

        let mut first_error = None;
        for handle in handles {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => Err(GossipError::TaskFailed(e.to_string())),
            };
            if let Err(e) = result {
                warn!(scenario = %name, error = %e, "party failed");
                first_error.get_or_insert(e);
            }
        }

        let elapsed = started.elapsed();
        stats.record_scenario_finished(first_error.is_none(), elapsed);
        match first_error {
            Some(e) => Err(e),
            None => {
                info!(scenario = %name, elapsed_ms = elapsed.as_millis() as u64, "scenario completed");
                Ok(RunReport {
                    scenario: name,
                    parties,
                    elapsed,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::testutil::MockTransport;
    use tokio::time::timeout;

    const SUITE: &str = r#"
suite: basic
tests:
  - name: invite
    calls:
      - number: "1000"
        steps:
          - out: INVITE
            to: "2000"
      - number: "2000"
"#;

    fn setup(concurrent: Option<usize>) -> (Arc<Runtime>, Arc<MockTransport>, Arc<Catalog>) {
        let config = Config {
            local: vec!["udp/127.0.0.1:5065".to_string()],
            remote: vec!["udp/127.0.0.1:5060".to_string()],
            rate: 1000,
            concurrent,
            grace_ms: 20,
            ..Config::default()
        };
        let transport = Arc::new(MockTransport::new());
        let runtime = Runtime::with_transport(&config, transport.clone()).unwrap();
        let mut catalog = Catalog::new();
        catalog.add_suite_str("basic.yaml", SUITE).unwrap();
        (runtime, transport, Arc::new(catalog))
    }

    #[tokio::test]
    async fn test_run_spawns_one_task_per_party() {
        let (runtime, transport, catalog) = setup(None);
        let id = ScenarioId { suite: 0, test: 0 };
        let tester = Tester::create(runtime.clone(), catalog, id).await.unwrap();
        let report = timeout(Duration::from_secs(2), tester.run()).await.unwrap().unwrap();
        assert_eq!(report.parties, 2);
        assert_eq!(report.scenario, "basic.yaml: basic/invite");
        assert_eq!(transport.sent_count(), 1);

        let snap = runtime.stats().snapshot();
        assert_eq!(snap.scenarios_started, 1);
        assert_eq!(snap.scenarios_completed, 1);
        assert_eq!(runtime.limiter().active(), 0);
    }

    #[tokio::test]
    async fn test_create_rejects_unknown_scenario() {
        let (runtime, _, catalog) = setup(None);
        let err = Tester::create(runtime, catalog, ScenarioId { suite: 3, test: 0 })
            .await
            .err()
            .expect("unknown scenario must fail");
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_slot_and_lock_released_on_failure() {
        let (runtime, transport, catalog) = setup(Some(1));
        transport.set_should_fail(true);
        let id = ScenarioId { suite: 0, test: 0 };

        let tester = Tester::create(runtime.clone(), catalog.clone(), id).await.unwrap();
        let err = timeout(Duration::from_secs(2), tester.run()).await.unwrap().unwrap_err();
        assert!(err.to_string().contains("basic/invite:1000 step 1"), "{}", err);
        assert!(!err.is_fatal());
        assert_eq!(runtime.limiter().active(), 0);
        assert_eq!(runtime.stats().snapshot().scenarios_failed, 1);

        // 次の実行はブロックされない
        transport.set_should_fail(false);
        let tester = timeout(Duration::from_millis(500), Tester::create(runtime, catalog, id))
            .await
            .expect("lock and slot must be free again")
            .unwrap();
        tester.run().await.unwrap();
    }

    #[tokio::test]
    async fn test_same_scenario_is_single_flight() {
        let (runtime, _, catalog) = setup(None);
        let id = ScenarioId { suite: 0, test: 0 };
        let first = Tester::create(runtime.clone(), catalog.clone(), id).await.unwrap();

        let second = timeout(
            Duration::from_millis(50),
            Tester::create(runtime.clone(), catalog.clone(), id),
        )
        .await;
        assert!(second.is_err(), "second create must wait for the first run");

        first.run().await.unwrap();
        let second = timeout(Duration::from_millis(500), Tester::create(runtime, catalog, id))
            .await
            .expect("second create proceeds after the first run")
            .unwrap();
        second.run().await.unwrap();
    }
}
