//! Fleet reconciler
//!
//! Keeps one spoke relay running for every radar mayara-server reports.
//!
//! A single driver task polls the backend. What it does on each tick, and the
//! period between the starts of two ticks, follow from the current [`Phase`]:
//!
//! | Phase                       | Tick                          | Period                |
//! |-----------------------------|-------------------------------|-----------------------|
//! | `Disconnected`/`Connecting` | connection attempt            | reconnect interval    |
//! | `Connected`                 | discovery poll + reconcile    | discovery interval    |
//!
//! Because there is only one driver, the discovery and reconnect cadences are
//! never active at the same time.
//!
//! The known device set, the relay table and the phase share one mutex. A
//! reconciliation pass holds it from the first relay created to the last relay
//! stopped, so nobody can observe a device in one structure and not the other.
//!
//! When the backend becomes unreachable the existing relays are left alone;
//! they keep retrying their own streams until a successful discovery says the
//! radar is gone.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use strum::Display;
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, Interval, MissedTickBehavior};
use tokio_graceful_shutdown::SubsystemHandle;

use crate::client::DeviceSource;
use crate::config::BridgeConfig;
use crate::error::BridgeError;
use crate::host::StatusReporter;
use crate::relay::{Relay, RelayFactory, RelayStats};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Phase {
    Disconnected,
    Connecting,
    Connected,
}

/// Read-only view for health checks
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetStatus {
    pub connected: bool,
    pub phase: Phase,
    pub devices: Vec<String>,
    pub relays: BTreeMap<String, RelayStats>,
}

/// Devices added and removed by one reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileDelta {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl ReconcileDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

struct FleetState {
    phase: Phase,
    known: BTreeSet<String>,
    relays: HashMap<String, Box<dyn Relay>>,
    driver: Option<JoinHandle<()>>,
    stopped: bool,
    /// Set once an outage has been reported, cleared on reconnect
    outage_reported: bool,
}

impl FleetState {
    fn is_consistent(&self) -> bool {
        self.known.len() == self.relays.len() && self.known.iter().all(|id| self.relays.contains_key(id))
    }
}

struct FleetInner {
    config: BridgeConfig,
    source: Arc<dyn DeviceSource>,
    factory: Arc<dyn RelayFactory>,
    reporter: Arc<dyn StatusReporter>,
    state: Mutex<FleetState>,
}

#[derive(Clone)]
pub struct Fleet {
    inner: Arc<FleetInner>,
}

impl Fleet {
    pub fn new(
        config: BridgeConfig,
        source: Arc<dyn DeviceSource>,
        factory: Arc<dyn RelayFactory>,
        reporter: Arc<dyn StatusReporter>,
    ) -> Self {
        Fleet {
            inner: Arc::new(FleetInner {
                config,
                source,
                factory,
                reporter,
                state: Mutex::new(FleetState {
                    phase: Phase::Disconnected,
                    known: BTreeSet::new(),
                    relays: HashMap::new(),
                    driver: None,
                    stopped: false,
                    outage_reported: false,
                }),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FleetState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn phase(&self) -> Phase {
        self.lock().phase
    }

    pub fn status(&self) -> FleetStatus {
        let state = self.lock();
        FleetStatus {
            connected: state.phase == Phase::Connected,
            phase: state.phase,
            devices: state.known.iter().cloned().collect(),
            relays: state
                .relays
                .iter()
                .map(|(id, relay)| (id.clone(), relay.stats()))
                .collect(),
        }
    }

    /// Spawn the driver task. Outside a tokio runtime this only logs.
    pub fn start(&self) {
        let mut state = self.lock();
        if state.stopped || state.driver.is_some() {
            log::debug!("Fleet already started or stopped");
            return;
        }
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(e) => {
                log::error!("Cannot start radar discovery outside a runtime: {}", e);
                return;
            }
        };
        log::info!(
            "Starting radar discovery on mayara-server at {}",
            self.inner.config.authority()
        );
        let fleet = self.clone();
        state.driver = Some(runtime.spawn(async move { fleet.run().await }));
    }

    /// Run as a subsystem: start, wait for shutdown, stop.
    pub async fn run_until_shutdown(self, subsys: SubsystemHandle) -> Result<(), BridgeError> {
        self.start();
        subsys.on_shutdown_requested().await;
        log::info!("Fleet: shutdown requested");
        self.stop();
        Ok(())
    }

    /// Ticks are spaced from the start of one attempt to the start of the
    /// next, so a slow backend does not stretch the cadence. The timer is
    /// rebuilt only when the fleet moves in or out of `Connected`.
    async fn run(self) {
        let mut connected = self.phase() == Phase::Connected;
        let mut timer = interval(self.period(self.phase()));
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let started = timer.tick().await;
            let phase = self.tick().await;
            if (phase == Phase::Connected) != connected {
                connected = phase == Phase::Connected;
                timer = self.timer_from(started, phase);
            }
        }
    }

    fn timer_from(&self, started: tokio::time::Instant, phase: Phase) -> Interval {
        let period = self.period(phase);
        let mut timer = interval_at(started + period, period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        timer
    }

    fn period(&self, phase: Phase) -> Duration {
        match phase {
            Phase::Connected => self.inner.config.discovery_poll_interval(),
            Phase::Disconnected | Phase::Connecting => self.inner.config.reconnect_interval(),
        }
    }

    async fn tick(&self) -> Phase {
        match self.phase() {
            Phase::Connected => self.discovery_poll().await,
            Phase::Disconnected | Phase::Connecting => self.try_connect().await,
        }
    }

    /// Run one tick for the current phase and return the period that applies
    /// to the phase it ends in.
    pub async fn poll_once(&self) -> Duration {
        let phase = self.tick().await;
        self.period(phase)
    }

    /// A single connection attempt. Used for the first attempt at startup as
    /// well as for every attempt while disconnected.
    async fn try_connect(&self) -> Phase {
        {
            let mut state = self.lock();
            if state.stopped {
                return state.phase;
            }
            state.phase = Phase::Connecting;
        }

        let result = self.inner.source.list_devices().await;

        let mut state = self.lock();
        if state.stopped {
            return state.phase;
        }
        match result {
            Ok(devices) => {
                state.phase = Phase::Connected;
                state.outage_reported = false;
                let current: BTreeSet<String> = devices.into_keys().collect();
                self.reconcile_locked(&mut state, &current);
                log::info!(
                    "Connected to mayara-server at {}",
                    self.inner.config.authority()
                );
                self.report_connected(state.known.len());
            }
            Err(e) => {
                state.phase = Phase::Disconnected;
                log::debug!("Connection attempt failed: {}", e);
                self.report_unreachable(&mut state, &e);
            }
        }
        state.phase
    }

    async fn discovery_poll(&self) -> Phase {
        let result = self.inner.source.list_devices().await;

        let mut state = self.lock();
        if state.stopped {
            return state.phase;
        }
        match result {
            Ok(devices) => {
                let current: BTreeSet<String> = devices.into_keys().collect();
                let delta = self.reconcile_locked(&mut state, &current);
                if !delta.is_empty() {
                    log::debug!("Discovery delta: {:?}", delta);
                }
                self.report_connected(state.known.len());
            }
            Err(e) => {
                log::warn!("Lost mayara-server at {}: {}", self.inner.config.authority(), e);
                state.phase = Phase::Disconnected;
                self.report_unreachable(&mut state, &e);
            }
        }
        state.phase
    }

    /// Bring the relay table in line with `current`.
    ///
    /// Does nothing once the fleet has been stopped.
    pub fn reconcile(&self, current: &BTreeSet<String>) -> ReconcileDelta {
        let mut state = self.lock();
        if state.stopped {
            return ReconcileDelta::default();
        }
        self.reconcile_locked(&mut state, current)
    }

    fn reconcile_locked(&self, state: &mut FleetState, current: &BTreeSet<String>) -> ReconcileDelta {
        let delta = ReconcileDelta {
            added: current.difference(&state.known).cloned().collect(),
            removed: state.known.difference(current).cloned().collect(),
        };

        for id in &delta.added {
            let url = self.inner.source.build_stream_url(id);
            log::info!("Radar '{}' appeared, relaying {}", id, url);
            let mut relay = self.inner.factory.create(id, url);
            relay.start();
            state.known.insert(id.clone());
            state.relays.insert(id.clone(), relay);
        }

        for id in &delta.removed {
            log::info!("Radar '{}' disappeared", id);
            state.known.remove(id);
            if let Some(mut relay) = state.relays.remove(id) {
                relay.stop();
            }
        }

        debug_assert!(state.is_consistent());
        delta
    }

    /// Tear everything down: the driver, every relay, and the bookkeeping.
    ///
    /// Safe to call more than once, and before [`Fleet::start`].
    pub fn stop(&self) {
        {
            let mut state = self.lock();
            if state.stopped {
                return;
            }
            state.stopped = true;
            if let Some(driver) = state.driver.take() {
                driver.abort();
            }
            for (id, mut relay) in state.relays.drain() {
                log::debug!("Stopping relay for '{}'", id);
                relay.stop();
            }
            state.known.clear();
            state.phase = Phase::Disconnected;
        }
        log::info!("Fleet stopped");
        self.inner.reporter.set_status("Stopped");
    }

    fn report_connected(&self, count: usize) {
        self.inner.reporter.set_status(&format!(
            "Connected to mayara-server at {} ({} radar{})",
            self.inner.config.authority(),
            count,
            if count == 1 { "" } else { "s" }
        ));
    }

    /// Report an outage once; retries while still unreachable stay quiet.
    fn report_unreachable(&self, state: &mut FleetState, e: &BridgeError) {
        if state.outage_reported {
            return;
        }
        state.outage_reported = true;
        self.inner.reporter.set_error(&format!(
            "Cannot reach mayara-server at {}: {}, retrying every {}s",
            self.inner.config.authority(),
            e,
            self.inner.config.reconnect_interval_seconds
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{stream_url, DeviceSummary};
    use crate::host::testing::RecordingHost;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use tokio::time::{sleep, Instant};

    type Reply = Result<Vec<&'static str>, BridgeError>;

    /// Replays scripted replies; the last one repeats forever. Each reply
    /// arrives `delay` after the call.
    struct ScriptedSource {
        script: Mutex<VecDeque<Reply>>,
        calls: Mutex<Vec<Instant>>,
        delay: Duration,
    }

    impl ScriptedSource {
        fn new(script: Vec<Reply>) -> Arc<Self> {
            Self::slow(script, Duration::ZERO)
        }

        fn slow(script: Vec<Reply>, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: Mutex::new(Vec::new()),
                delay,
            })
        }

        fn call_times(&self) -> Vec<Instant> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl DeviceSource for ScriptedSource {
        async fn list_devices(&self) -> Result<BTreeMap<String, DeviceSummary>, BridgeError> {
            self.calls.lock().unwrap().push(Instant::now());
            let reply = {
                let mut script = self.script.lock().unwrap();
                if script.len() > 1 {
                    script.pop_front().unwrap()
                } else {
                    script.front().cloned().unwrap()
                }
            };
            if !self.delay.is_zero() {
                sleep(self.delay).await;
            }
            reply.map(|ids| {
                ids.into_iter()
                    .map(|id| (id.to_string(), DeviceSummary::default()))
                    .collect()
            })
        }

        fn build_stream_url(&self, device_id: &str) -> String {
            stream_url("backend", 6502, false, device_id)
        }
    }

    #[derive(Debug, Default, Clone, Copy, PartialEq)]
    struct Calls {
        created: usize,
        starts: usize,
        stops: usize,
    }

    type Ledger = Arc<Mutex<HashMap<String, Calls>>>;

    struct CountingRelay {
        id: String,
        ledger: Ledger,
        running: bool,
    }

    impl Relay for CountingRelay {
        fn start(&mut self) {
            self.ledger.lock().unwrap().entry(self.id.clone()).or_default().starts += 1;
            self.running = true;
        }

        fn stop(&mut self) {
            self.ledger.lock().unwrap().entry(self.id.clone()).or_default().stops += 1;
            self.running = false;
        }

        fn is_connected(&self) -> bool {
            self.running
        }
    }

    #[derive(Default)]
    struct CountingFactory {
        ledger: Ledger,
        urls: Mutex<Vec<String>>,
    }

    impl CountingFactory {
        fn calls(&self, id: &str) -> Calls {
            self.ledger.lock().unwrap().get(id).copied().unwrap_or_default()
        }
    }

    impl RelayFactory for CountingFactory {
        fn create(&self, device_id: &str, stream_url: String) -> Box<dyn Relay> {
            self.ledger.lock().unwrap().entry(device_id.to_string()).or_default().created += 1;
            self.urls.lock().unwrap().push(stream_url);
            Box::new(CountingRelay {
                id: device_id.to_string(),
                ledger: self.ledger.clone(),
                running: false,
            })
        }
    }

    struct Harness {
        fleet: Fleet,
        source: Arc<ScriptedSource>,
        factory: Arc<CountingFactory>,
        host: Arc<RecordingHost>,
    }

    fn harness(script: Vec<Reply>) -> Harness {
        harness_with(ScriptedSource::new(script))
    }

    fn harness_with(source: Arc<ScriptedSource>) -> Harness {
        let factory = Arc::new(CountingFactory::default());
        let host = Arc::new(RecordingHost::default());
        let fleet = Fleet::new(
            BridgeConfig::default(),
            source.clone(),
            factory.clone(),
            host.clone(),
        );
        Harness {
            fleet,
            source,
            factory,
            host,
        }
    }

    fn ids(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    fn assert_consistent(fleet: &Fleet) {
        let status = fleet.status();
        let keys: Vec<String> = status.relays.keys().cloned().collect();
        assert_eq!(status.devices, keys);
    }

    fn unreachable() -> BridgeError {
        BridgeError::Unreachable("connection refused".to_string())
    }

    #[test]
    fn test_reconcile_replaces_vanished_devices() {
        let h = harness(vec![Ok(vec![])]);

        let delta = h.fleet.reconcile(&ids(&["A", "B"]));
        assert_eq!(delta.added, vec!["A", "B"]);
        assert_consistent(&h.fleet);

        let delta = h.fleet.reconcile(&ids(&["B", "C"]));
        assert_eq!(delta.added, vec!["C"]);
        assert_eq!(delta.removed, vec!["A"]);
        assert_consistent(&h.fleet);

        assert_eq!(h.fleet.status().devices, vec!["B", "C"]);
        assert_eq!(h.factory.calls("A"), Calls { created: 1, starts: 1, stops: 1 });
        assert_eq!(h.factory.calls("B"), Calls { created: 1, starts: 1, stops: 0 });
        assert_eq!(h.factory.calls("C"), Calls { created: 1, starts: 1, stops: 0 });
        assert!(h
            .factory
            .urls
            .lock()
            .unwrap()
            .contains(&"ws://backend:6502/v2/api/radars/C/spokes".to_string()));
    }

    #[test]
    fn test_reconcile_keeps_invariant() {
        let h = harness(vec![Ok(vec![])]);
        let sequence: [&[&str]; 6] = [
            &["A"],
            &["A", "B", "C"],
            &[],
            &["C", "D"],
            &["C", "D"],
            &["A", "D", "E"],
        ];
        for set in sequence {
            h.fleet.reconcile(&ids(set));
            assert_consistent(&h.fleet);
            assert_eq!(h.fleet.status().devices, ids(set).into_iter().collect::<Vec<_>>());
        }
        // A was added twice, so it has two relays over time, each stopped once at most
        assert_eq!(h.factory.calls("A"), Calls { created: 2, starts: 2, stops: 1 });
        assert_eq!(h.factory.calls("D"), Calls { created: 1, starts: 1, stops: 0 });

        let delta = h.fleet.reconcile(&ids(&["A", "D", "E"]));
        assert!(delta.is_empty());
    }

    #[tokio::test]
    async fn test_first_attempt_connects_and_reconciles() {
        let h = harness(vec![Ok(vec!["radar-0", "radar-1"])]);

        let next = h.fleet.poll_once().await;
        assert_eq!(next, Duration::from_secs(10));
        assert_eq!(h.fleet.phase(), Phase::Connected);

        let status = h.fleet.status();
        assert!(status.connected);
        assert_eq!(status.devices, vec!["radar-0", "radar-1"]);
        assert!(status.relays.values().all(|r| r.connected));
        assert_eq!(
            h.host.statuses(),
            vec!["Connected to mayara-server at localhost:6502 (2 radars)"]
        );
    }

    #[tokio::test]
    async fn test_backend_loss_keeps_relays() {
        let h = harness(vec![Ok(vec!["A", "B"]), Err(unreachable())]);

        h.fleet.poll_once().await;
        assert_eq!(h.fleet.phase(), Phase::Connected);

        let next = h.fleet.poll_once().await;
        assert_eq!(next, Duration::from_secs(5));
        assert_eq!(h.fleet.phase(), Phase::Disconnected);
        assert_eq!(h.fleet.status().devices, vec!["A", "B"]);
        assert_eq!(h.factory.calls("A").stops, 0);
        assert_eq!(h.factory.calls("B").stops, 0);
        assert_eq!(h.host.errors().len(), 1);
        assert!(h.host.errors()[0].contains("retrying every 5s"));

        // Still unreachable: retry without another error report
        h.fleet.poll_once().await;
        assert_eq!(h.fleet.phase(), Phase::Disconnected);
        assert_consistent(&h.fleet);
    }

    #[tokio::test]
    async fn test_reconnect_reconciles_changes_made_while_away() {
        let h = harness(vec![Ok(vec!["A", "B"]), Err(unreachable()), Ok(vec!["B", "C"])]);

        h.fleet.poll_once().await;
        h.fleet.poll_once().await;
        assert_eq!(h.fleet.phase(), Phase::Disconnected);

        let next = h.fleet.poll_once().await;
        assert_eq!(next, Duration::from_secs(10));
        assert_eq!(h.fleet.phase(), Phase::Connected);
        assert_eq!(h.fleet.status().devices, vec!["B", "C"]);
        assert_eq!(h.factory.calls("A").stops, 1);
        assert_eq!(h.factory.calls("B"), Calls { created: 1, starts: 1, stops: 0 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_interval_is_fixed() {
        let h = harness(vec![Err(unreachable())]);
        let t0 = Instant::now();
        h.fleet.start();

        sleep(Duration::from_secs(61)).await;

        let calls = h.source.call_times();
        assert_eq!(calls.len(), 13);
        assert_eq!(calls[0], t0);
        for pair in calls.windows(2) {
            assert_eq!(pair[1] - pair[0], Duration::from_secs(5));
        }
        assert_eq!(h.fleet.phase(), Phase::Disconnected);
        assert_eq!(h.host.errors().len(), 1);
        h.fleet.stop();
    }

    fn offsets(source: &ScriptedSource, t0: Instant) -> Vec<u64> {
        source
            .call_times()
            .iter()
            .map(|t| (*t - t0).as_secs())
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_failures_keep_reconnect_spacing() {
        let timeout = BridgeError::Timeout(3000);
        let h = harness_with(ScriptedSource::slow(vec![Err(timeout)], Duration::from_secs(3)));
        let t0 = Instant::now();
        h.fleet.start();

        sleep(Duration::from_secs(31)).await;

        assert_eq!(offsets(&h.source, t0), vec![0, 5, 10, 15, 20, 25, 30]);
        assert_eq!(h.fleet.phase(), Phase::Connecting);
        assert_eq!(h.host.errors().len(), 1);
        h.fleet.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_discovery_keeps_discovery_spacing() {
        let h = harness_with(ScriptedSource::slow(
            vec![Ok(vec!["A"]), Ok(vec!["A"]), Err(unreachable()), Ok(vec!["A"])],
            Duration::from_secs(3),
        ));
        let t0 = Instant::now();
        h.fleet.start();

        sleep(Duration::from_secs(36)).await;

        // connect, discovery, discovery fails, reconnect, discovery
        assert_eq!(offsets(&h.source, t0), vec![0, 10, 20, 25, 35]);
        assert_eq!(h.factory.calls("A"), Calls { created: 1, starts: 1, stops: 0 });
        h.fleet.stop();
    }

    #[test]
    fn test_start_outside_runtime_is_ignored() {
        let h = harness(vec![Ok(vec!["A"])]);
        h.fleet.start();
        assert_eq!(h.fleet.phase(), Phase::Disconnected);
        assert!(h.source.call_times().is_empty());
        h.fleet.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cadence_switches_with_phase() {
        let h = harness(vec![
            Err(unreachable()),
            Err(unreachable()),
            Ok(vec!["A"]),
            Ok(vec!["A"]),
            Err(unreachable()),
            Ok(vec!["A"]),
        ]);
        let t0 = Instant::now();
        h.fleet.start();

        sleep(Duration::from_secs(46)).await;

        // reconnect, reconnect, connected, discovery, discovery fails, reconnect, discovery
        assert_eq!(offsets(&h.source, t0), vec![0, 5, 10, 20, 30, 35, 45]);
        assert_eq!(h.fleet.phase(), Phase::Connected);
        assert_eq!(h.factory.calls("A"), Calls { created: 1, starts: 1, stops: 0 });
        h.fleet.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_tears_everything_down() {
        let h = harness(vec![Ok(vec!["A", "B"])]);
        h.fleet.start();
        sleep(Duration::from_secs(1)).await;
        assert_eq!(h.fleet.status().devices.len(), 2);

        h.fleet.stop();
        let status = h.fleet.status();
        assert!(!status.connected);
        assert!(status.devices.is_empty());
        assert!(status.relays.is_empty());
        assert_eq!(h.factory.calls("A").stops, 1);
        assert_eq!(h.factory.calls("B").stops, 1);

        // No more polling, no resurrection
        let polled = h.source.call_times().len();
        sleep(Duration::from_secs(60)).await;
        assert_eq!(h.source.call_times().len(), polled);
        assert!(h.fleet.reconcile(&ids(&["C"])).is_empty());
        h.fleet.poll_once().await;
        assert!(h.fleet.status().devices.is_empty());

        h.fleet.stop();
        assert_eq!(h.factory.calls("A").stops, 1);
        assert_eq!(h.host.statuses().last().map(String::as_str), Some("Stopped"));
        assert_eq!(h.host.statuses().iter().filter(|s| *s == "Stopped").count(), 1);
    }

    #[test]
    fn test_stop_without_start() {
        let h = harness(vec![Err(unreachable())]);
        h.fleet.stop();
        assert_eq!(h.fleet.phase(), Phase::Disconnected);
        assert!(h.source.call_times().is_empty());
    }
}
