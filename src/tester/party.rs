// Party state machine: one task per call leg
//
// Init -> SetupBarrier -> Running(i)... -> Stopping -> RunBarrier -> Cleanup -> Terminated
//
// Every state transition happens in `run`. A failing step records its error
// and jumps to Stopping, so the party still passes both barriers and its
// siblings are never left waiting.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, sleep, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::RunShared;
use crate::builder::MessageBuilder;
use crate::config::Endpoint;
use crate::director::{dialog_key, Inbox, KeySpace};
use crate::error::GossipError;
use crate::runtime::Runtime;
use crate::scenario::{CallParty, CallStep, Catalog, ScenarioId, StepRef};
use crate::sip::{extract_tag, Direction, Item, SipMessage, SipTransaction, SipType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartyState {
    Init,
    SetupBarrier,
    Running(usize),
    Stopping,
    RunBarrier,
    Cleanup,
    Terminated,
}

pub(crate) struct PartyTest {
    runtime: Arc<Runtime>,
    catalog: Arc<Catalog>,
    scenario: ScenarioId,
    index: usize,
    local: Endpoint,
    remote: Endpoint,
    builder: MessageBuilder,
    shared: Arc<RunShared>,
    inbox: Inbox,
    state: PartyState,
    /// Keys this party's inbox is registered under
    routes: Vec<(KeySpace, String)>,
    /// Every message sent or received, in order
    messages: Vec<Arc<SipMessage>>,
    /// Last message at the end of each aliased step
    aliases: HashMap<String, Arc<SipMessage>>,
    /// Transactions by Call-ID
    calls: HashMap<String, Arc<SipTransaction>>,
    error: Option<GossipError>,
}

impl PartyTest {
    pub(crate) fn new(
        runtime: Arc<Runtime>,
        catalog: Arc<Catalog>,
        scenario: ScenarioId,
        index: usize,
        local: Endpoint,
        remote: Endpoint,
        shared: Arc<RunShared>,
    ) -> Self {
        let (number, noa) = catalog
            .scenario(scenario)
            .and_then(|t| t.parties.get(index))
            .map(|p| (p.number.clone(), p.noa.clone()))
            .unwrap_or_default();
        let builder = MessageBuilder::new(local.clone(), remote.clone(), number, noa);
        let inbox = runtime.director().inbox();
        Self {
            runtime,
            catalog,
            scenario,
            index,
            local,
            remote,
            builder,
            shared,
            inbox,
            state: PartyState::Init,
            routes: Vec::new(),
            messages: Vec::new(),
            aliases: HashMap::new(),
            calls: HashMap::new(),
            error: None,
        }
    }

    fn party<'c>(catalog: &'c Catalog, scenario: ScenarioId, index: usize) -> Option<&'c CallParty> {
        catalog.scenario(scenario).and_then(|t| t.parties.get(index))
    }

    fn step_ref(&self, step: usize) -> StepRef {
        StepRef {
            scenario: self.scenario,
            party: self.index,
            step,
        }
    }

    pub(crate) async fn run(mut self) -> Result<(), GossipError> {
        loop {
            debug!(party = self.index, state = ?self.state, "party state");
            self.state = match self.state {
                PartyState::Init => {
                    self.init();
                    PartyState::SetupBarrier
                }
                PartyState::SetupBarrier => {
                    self.shared.setup.wait().await;
                    PartyState::Running(0)
                }
                PartyState::Running(i) => self.step(i).await,
                PartyState::Stopping => {
                    self.stop().await;
                    PartyState::RunBarrier
                }
                PartyState::RunBarrier => {
                    self.shared.run.wait().await;
                    PartyState::Cleanup
                }
                PartyState::Cleanup => {
                    self.cleanup();
                    PartyState::Terminated
                }
                PartyState::Terminated => break,
            };
        }
        match self.error.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn init(&mut self) {
        let catalog = Arc::clone(&self.catalog);
        if let Some(party) = Self::party(&catalog, self.scenario, self.index) {
            self.attach(KeySpace::Number, party.number.clone());
            debug!(
                number = %party.number,
                steps = party.steps.len(),
                aliases = party.aliases().len(),
                "party ready"
            );
        }
    }

    fn stop_requested(&self) -> bool {
        self.shared.stop.load(Ordering::SeqCst) || self.runtime.is_shutdown_requested()
    }

    /// Execute step `i` and pick the next state.
    async fn step(&mut self, i: usize) -> PartyState {
        let catalog = Arc::clone(&self.catalog);
        let Some(party) = Self::party(&catalog, self.scenario, self.index) else {
            return PartyState::Stopping;
        };
        let Some(step) = party.steps.get(i) else {
            return PartyState::Stopping;
        };

        self.drain();
        if let Some(delay) = step.delay {
            self.pause(delay).await;
        }
        if let Some(sip_type) = &step.out {
            if let Err(e) = self.send(step, sip_type).await {
                self.fail(i, e);
                return PartyState::Stopping;
            }
        }
        if let (Some(alias), Some(last)) = (&step.alias, self.messages.last()) {
            self.aliases.insert(alias.clone(), Arc::clone(last));
        }

        // 停止フラグはステップの合間に確認する
        if self.stop_requested() {
            return PartyState::Stopping;
        }
        match &step.next {
            Some(alias) => match party.step_index(alias) {
                Some(j) => PartyState::Running(j),
                None => {
                    self.fail(i, GossipError::UnknownAlias(alias.clone()));
                    PartyState::Stopping
                }
            },
            None => PartyState::Running(i + 1),
        }
    }

    fn fail(&mut self, step: usize, e: GossipError) {
        let context = self.catalog.describe(self.step_ref(step));
        warn!(step = %context, error = %e, "step failed");
        self.error.get_or_insert(GossipError::in_scenario(context, e));
    }

    /// Wait for `delay`, taking in inbound traffic, until the delay is over
    /// or a stop is requested.
    async fn pause(&mut self, delay: Duration) {
        let deadline = Instant::now() + delay;
        let mut tick = interval(self.runtime.poll_interval());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            if self.stop_requested() {
                break;
            }
            let received = tokio::select! {
                _ = sleep_until(deadline) => break,
                item = self.inbox.recv() => item,
                _ = tick.tick() => None,
            };
            if let Some(item) = received {
                self.accept(item);
            }
        }
    }

    /// Take in everything already queued.
    fn drain(&mut self) {
        while let Some(item) = self.inbox.try_recv() {
            self.accept(item);
        }
    }

    /// Link an inbound message into this party's message list.
    fn accept(&mut self, item: Arc<Item>) {
        let mut msg = (*item.msg).clone();
        let call_id = msg.call_id().unwrap_or_default().to_string();
        let transaction = match self.calls.get(&call_id) {
            Some(tr) => {
                if msg.is_request() {
                    if let Some((seq, _)) = msg.cseq() {
                        tr.call.observe_seq(seq);
                    }
                } else if let Some(tag) = msg.headers.get("To").and_then(extract_tag) {
                    tr.learn_remote_tag(tag);
                }
                Some(Arc::clone(tr))
            }
            None if msg.is_request() => {
                let tr = self.builder.accept_transaction(&msg);
                self.attach(KeySpace::CallId, dialog_key(&call_id, &tr.local_tag));
                self.calls.insert(call_id.clone(), Arc::clone(&tr));
                Some(tr)
            }
            None => {
                debug!(call_id = %call_id, "response outside any known call");
                None
            }
        };
        if !msg.is_request() {
            let branch = msg.branch().map(str::to_string);
            msg.request = self
                .messages
                .iter()
                .rev()
                .find(|m| m.direction == Direction::Outbound && m.is_request() && m.branch() == branch.as_deref())
                .cloned();
        }
        msg.transaction = transaction;
        msg.prev = self.messages.last().cloned();
        debug!(
            party = self.index,
            start_line = %msg.start_line,
            call_id = %call_id,
            "received"
        );
        self.messages.push(Arc::new(msg));
    }

    /// The message a step continues.
    ///
    /// `previous` names it explicitly. Otherwise a response answers the
    /// latest inbound request and a request follows the latest message.
    fn previous_for(&self, step: &CallStep, sip_type: &SipType) -> Result<Option<Arc<SipMessage>>, GossipError> {
        if let Some(alias) = &step.previous {
            return self
                .aliases
                .get(alias)
                .cloned()
                .map(Some)
                .ok_or_else(|| GossipError::UnknownAlias(alias.clone()));
        }
        let prev = match sip_type {
            SipType::Response(_) => self
                .messages
                .iter()
                .rev()
                .find(|m| m.direction == Direction::Inbound && m.is_request())
                .cloned(),
            SipType::Request(_) => self.messages.last().cloned(),
        };
        Ok(prev)
    }

    async fn send(&mut self, step: &CallStep, sip_type: &SipType) -> Result<(), GossipError> {
        let prev = self.previous_for(step, sip_type)?;
        let msg = Arc::new(self.builder.build(prev.as_ref(), step, sip_type)?);

        if let Some(tr) = &msg.transaction {
            let call_id = tr.call.call_id().to_string();
            if !self.calls.contains_key(&call_id) {
                self.attach(KeySpace::CallId, dialog_key(&call_id, &tr.local_tag));
                self.calls.insert(call_id, Arc::clone(tr));
            }
        }
        if msg.is_request() {
            if let Some(branch) = msg.branch() {
                self.attach(KeySpace::Via, branch.to_string());
            }
        }

        debug!(
            party = self.index,
            start_line = %msg.start_line,
            call_id = msg.call_id().unwrap_or(""),
            remote = %self.remote,
            "sending"
        );
        self.messages.push(Arc::clone(&msg));
        let item = Item::outbound(msg, self.local.clone(), self.remote.clone());
        self.runtime.transport().send(item).await
    }

    fn attach(&mut self, space: KeySpace, key: String) {
        self.runtime.director().attach(space, &key, &self.inbox);
        self.routes.push((space, key));
    }

    /// The first party here raises the stop flag, then gives its siblings
    /// the grace period to notice.
    async fn stop(&mut self) {
        let won = self
            .shared
            .stop
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if won {
            debug!(party = self.index, "stop flag raised");
            sleep(self.runtime.grace()).await;
        }
    }

    fn cleanup(&mut self) {
        let director = self.runtime.director();
        for (space, key) in self.routes.drain(..) {
            director.unregister(space, &key, &self.inbox);
        }
        self.drain();
        info!(
            scenario = %self.catalog.describe_scenario(self.scenario),
            party = self.index,
            messages = self.messages.len(),
            failed = self.error.is_some(),
            "party terminated"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::testutil::MockTransport;
    use crate::sip::Method;
    use tokio::time::timeout;

    fn runtime(transport: Arc<MockTransport>) -> Arc<Runtime> {
        let config = Config {
            local: vec!["udp/127.0.0.1:5065".to_string()],
            remote: vec!["udp/127.0.0.1:5060".to_string()],
            grace_ms: 10,
            ..Config::default()
        };
        Runtime::with_transport(&config, transport).unwrap()
    }

    fn single_party(yaml: &str) -> (Arc<Runtime>, Arc<MockTransport>, PartyTest) {
        let transport = Arc::new(MockTransport::new());
        let rt = runtime(transport.clone());
        let mut catalog = Catalog::new();
        catalog.add_suite_str("p.yaml", yaml).unwrap();
        let (local, remote) = rt.resolve_endpoints().unwrap();
        let party = PartyTest::new(
            rt.clone(),
            Arc::new(catalog),
            ScenarioId { suite: 0, test: 0 },
            0,
            local,
            remote,
            Arc::new(RunShared::new(1)),
        );
        (rt, transport, party)
    }

    #[tokio::test]
    async fn test_party_walks_steps_in_order() {
        let yaml = r#"
suite: s
tests:
  - name: t
    calls:
      - number: "1000"
        steps:
          - out: INVITE
            to: "2000"
          - out: ACK
          - out: BYE
"#;
        let (rt, transport, party) = single_party(yaml);
        timeout(Duration::from_secs(1), party.run()).await.unwrap().unwrap();

        let sent = transport.sent_messages();
        let types: Vec<&SipType> = sent.iter().map(|m| &m.sip_type).collect();
        assert_eq!(
            types,
            vec![
                &SipType::Request(Method::Invite),
                &SipType::Request(Method::Ack),
                &SipType::Request(Method::Bye),
            ]
        );
        // 同じ呼の中で Call-ID は変わらない
        assert!(sent.iter().all(|m| m.call_id() == sent[0].call_id()));
        assert_eq!(sent[2].cseq(), Some((1, "BYE")));
        // 終了時にルートは全て外れる
        for space in KeySpace::ALL {
            assert_eq!(rt.director().route_count(space), 0);
        }
    }

    #[tokio::test]
    async fn test_next_jumps_to_alias() {
        let yaml = r#"
suite: s
tests:
  - name: t
    calls:
      - number: "1000"
        steps:
          - out: INVITE
            to: "2000"
            next: bye
          - out: INFO
          - alias: bye
            out: BYE
"#;
        let (_, transport, party) = single_party(yaml);
        timeout(Duration::from_secs(1), party.run()).await.unwrap().unwrap();
        let methods: Vec<String> = transport
            .sent_messages()
            .iter()
            .map(|m| m.sip_type.to_string())
            .collect();
        assert_eq!(methods, vec!["INVITE", "BYE"]);
    }

    #[tokio::test]
    async fn test_delay_is_cut_short_by_stop_flag() {
        let yaml = r#"
suite: s
tests:
  - name: t
    calls:
      - number: "1000"
        steps:
          - delay: 10s
          - out: OPTIONS
            to: "2000"
"#;
        let (rt, transport, party) = single_party(yaml);
        let flag = rt.shutdown_flag();
        let task = tokio::spawn(party.run());
        tokio::time::sleep(Duration::from_millis(30)).await;
        flag.store(true, Ordering::SeqCst);
        timeout(Duration::from_millis(500), task)
            .await
            .expect("delay must end once stop is requested")
            .unwrap()
            .unwrap();
        // 中断されたステップの後は次のステップに進まない
        assert_eq!(transport.sent_count(), 0);
    }

    #[tokio::test]
    async fn test_builder_error_is_reported_with_context() {
        let yaml = r#"
suite: s
tests:
  - name: t
    calls:
      - number: "1000"
        steps:
          - out: INVITE
            to: "2000"
            headers: |
              CSeq: 1 INVITE
              CSeq: 2 INVITE
"#;
        let (_, transport, party) = single_party(yaml);
        let err = timeout(Duration::from_secs(1), party.run()).await.unwrap().unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(
            err.to_string(),
            "p.yaml: s/t:1000 step 1: Too many CSeq headers"
        );
        assert_eq!(transport.sent_count(), 0);
    }

    #[tokio::test]
    async fn test_response_without_request_fails() {
        let yaml = r#"
suite: s
tests:
  - name: t
    calls:
      - number: "2000"
        steps:
          - out: "200"
"#;
        let (_, _, party) = single_party(yaml);
        let err = timeout(Duration::from_secs(1), party.run()).await.unwrap().unwrap_err();
        assert!(err.is_fatal());
    }
}
