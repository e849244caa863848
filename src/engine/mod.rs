//! The test engine.
//!
//! [`IperfTest`] owns every socket, stream and timer of a session and walks
//! it through [`TestState`]. One engine runs one session at a time; a
//! continuous server resets it between sessions instead of building a new
//! one.
//!
//! Cancellation is a token tree: the engine's root token (fired by
//! [`EngineHandle::stop`]) parents one token per session, which parents the
//! token of the run phase. The duration timer, a failing stream worker or the
//! peer's end-of-run message cancel the run token only.

mod client;
mod control;
mod server;
mod server_loop;

use crate::config::{Config, ProtocolKind, Settings};
use crate::error::{Error, Result};
use crate::measurements::{Meter, Sampler, TestResult};
use crate::reporter::{EventCallback, TestEvent};
use crate::state::{Lifecycle, TestState};
use crate::stream::{run_worker, CounterSnapshot, Direction, Stream};
use crate::timer::{DurationTimer, Ticker};
use crate::token_bucket::TokenBucket;
use crate::transport::{DatagramListener, Protocol};
use chrono::{DateTime, Utc};
use control::ControlChannel;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;

/// Wait for each control message before the run starts.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
/// Wait for each control message after the run ends.
pub const RESULT_TIMEOUT: Duration = Duration::from_secs(5);
/// Result exchange budget once the session has been stopped.
pub const CANCEL_GRACE: Duration = Duration::from_secs(1);
/// How much longer than the agreed duration a server runs without hearing
/// from the client.
pub const SERVER_RUN_MARGIN: Duration = Duration::from_secs(5);

struct EngineShared {
    lifecycle: Mutex<Lifecycle>,
    test_count: AtomicUsize,
    sessions: AtomicUsize,
    done: AtomicBool,
    root: Mutex<CancellationToken>,
}

impl EngineShared {
    fn root(&self) -> CancellationToken {
        self.root.lock().clone()
    }

    fn stopped(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }
}

/// Cloneable remote control for an engine, usable while a run borrows it.
///
/// # Examples
///
/// ```no_run
/// use riperf::{Config, IperfTest, TestEvent};
///
/// # #[tokio::main]
/// # async fn main() -> riperf::Result<()> {
/// let mut engine = IperfTest::from_config(&Config::server(5201))?;
/// let handle = engine.handle();
/// tokio::spawn(async move {
///     tokio::signal::ctrl_c().await.ok();
///     handle.stop();
/// });
/// engine.run_server_loop(|_event: TestEvent| {}).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct EngineHandle {
    shared: Arc<EngineShared>,
}

impl EngineHandle {
    /// Cancels whatever the engine is doing. Blocked accepts, connects and
    /// transfers return promptly; a running session still tries a short
    /// result exchange.
    pub fn stop(&self) {
        self.shared.done.store(true, Ordering::SeqCst);
        self.shared.root.lock().cancel();
        info!("stop requested");
    }

    /// Sessions completed successfully.
    pub fn test_count(&self) -> usize {
        self.shared.test_count.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> TestState {
        self.shared.lifecycle.lock().state()
    }

    pub fn is_done(&self) -> bool {
        self.shared.stopped()
    }
}

/// Observable engine state, for comparing an engine against a fresh one.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineStatus {
    pub state: TestState,
    pub protocol: Option<ProtocolKind>,
    pub settings: Settings,
    pub streams: usize,
    pub totals: CounterSnapshot,
    pub control_open: bool,
    pub listening: bool,
    pub timers_running: bool,
}

struct RunHandles {
    sampler: Arc<Sampler>,
    started_at: DateTime<Utc>,
    workers: Vec<(usize, JoinHandle<(Stream, Result<()>)>)>,
}

struct RunOutcome {
    sampler: Arc<Sampler>,
    started_at: DateTime<Utc>,
    elapsed: Duration,
}

/// One iperf-style test engine.
///
/// # Examples
///
/// ```no_run
/// use riperf::{Config, IperfTest, ProtocolKind, TestEvent};
/// use std::time::Duration;
///
/// # #[tokio::main]
/// # async fn main() -> riperf::Result<()> {
/// let config = Config::client("192.168.1.10".to_string(), 5201)
///     .with_protocol(ProtocolKind::Udp)
///     .with_duration(Duration::from_secs(5));
/// let mut engine = IperfTest::from_config(&config)?;
/// let result = engine.run_test(|_event: TestEvent| {}).await?;
/// println!("{:.1} Mbit/s", result.mbps());
/// # Ok(())
/// # }
/// ```
pub struct IperfTest {
    config: Config,
    settings: Settings,
    variants: Vec<ProtocolKind>,
    protocol: Option<Protocol>,
    control: Option<ControlChannel>,
    listener: Option<TcpListener>,
    datagram: Option<DatagramListener>,
    streams: Vec<Stream>,
    totals: CounterSnapshot,
    timer: DurationTimer,
    stats_ticker: Ticker,
    report_ticker: Ticker,
    shared: Arc<EngineShared>,
}

impl Default for IperfTest {
    fn default() -> Self {
        Self::new()
    }
}

impl IperfTest {
    /// A bare engine in `Created`; call [`init`](Self::init) next.
    pub fn new() -> Self {
        let config = Config::default();
        Self {
            settings: Settings::from_config(&config),
            config,
            variants: Vec::new(),
            protocol: None,
            control: None,
            listener: None,
            datagram: None,
            streams: Vec::new(),
            totals: CounterSnapshot::default(),
            timer: DurationTimer::new(),
            stats_ticker: Ticker::new(),
            report_ticker: Ticker::new(),
            shared: Arc::new(EngineShared {
                lifecycle: Mutex::new(Lifecycle::default()),
                test_count: AtomicUsize::new(0),
                sessions: AtomicUsize::new(0),
                done: AtomicBool::new(false),
                root: Mutex::new(CancellationToken::new()),
            }),
        }
    }

    /// Registers the protocol variants and attaches default settings.
    pub fn init(&mut self) -> Result<()> {
        self.advance(TestState::Initialized)?;
        self.variants = ProtocolKind::ALL.to_vec();
        self.settings = Settings::from_config(&self.config);
        self.protocol = Some(self.resolve_protocol()?);
        Ok(())
    }

    /// `new`, `init` and `apply_config` in one step.
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut engine = Self::new();
        engine.init()?;
        engine.apply_config(config)?;
        Ok(engine)
    }

    /// Validates `config` and makes it the engine's configuration.
    pub fn apply_config(&mut self, config: &Config) -> Result<()> {
        self.require_idle("apply a configuration")?;
        config.validate()?;
        self.config = config.clone();
        self.settings = Settings::from_config(config);
        self.protocol = Some(self.resolve_protocol()?);
        debug!("configured for {} as {:?}", config.protocol, config.role);
        Ok(())
    }

    /// Selects the protocol by name (`tcp`, `udp`, `rudp` or `kcp`).
    pub fn set_protocol(&mut self, name: &str) -> Result<()> {
        self.require_idle("change protocol")?;
        let kind: ProtocolKind = name.parse()?;
        let mut config = self.config.clone();
        config.protocol = kind;
        self.apply_config(&config)
    }

    fn require_idle(&self, what: &str) -> Result<()> {
        match self.state() {
            TestState::Initialized => Ok(()),
            state => Err(Error::InvalidState(format!("cannot {} in state {}", what, state))),
        }
    }

    fn resolve_protocol(&self) -> Result<Protocol> {
        let kind = self.config.protocol;
        if !self.variants.contains(&kind) {
            return Err(Error::Config(format!("protocol {} is not registered", kind)));
        }
        let mut protocol = Protocol::new(kind, self.settings);
        protocol.init(self.settings)?;
        Ok(protocol)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn protocol(&self) -> Option<&Protocol> {
        self.protocol.as_ref()
    }

    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn state(&self) -> TestState {
        self.shared.lifecycle.lock().state()
    }

    /// States visited since the engine was created or last reset.
    pub fn transitions(&self) -> Vec<TestState> {
        self.shared.lifecycle.lock().visited().to_vec()
    }

    pub fn test_count(&self) -> usize {
        self.shared.test_count.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            state: self.state(),
            protocol: self.protocol.as_ref().map(Protocol::kind),
            settings: self.settings,
            streams: self.streams.len(),
            totals: self.totals,
            control_open: self.control.is_some(),
            listening: self.listener.is_some() || self.datagram.is_some(),
            timers_running: self.timer.is_running()
                || self.stats_ticker.is_running()
                || self.report_ticker.is_running(),
        }
    }

    fn advance(&self, next: TestState) -> Result<()> {
        self.shared.lifecycle.lock().advance(next)
    }

    fn control_mut(&mut self) -> Result<&mut ControlChannel> {
        self.control
            .as_mut()
            .ok_or_else(|| Error::InvalidState("no control connection".into()))
    }

    fn active_protocol(&self) -> Result<Protocol> {
        self.protocol
            .clone()
            .ok_or_else(|| Error::InvalidState("no protocol selected".into()))
    }

    /// Runs one session in the configured role and returns its result.
    ///
    /// The engine must be `Initialized`; after a session, call
    /// [`reset_for_next_test`](Self::reset_for_next_test) before running
    /// again.
    pub async fn run_test<C: EventCallback + 'static>(&mut self, callback: C) -> Result<TestResult> {
        self.run_session(Arc::new(callback)).await
    }

    async fn run_session(&mut self, callback: Arc<dyn EventCallback>) -> Result<TestResult> {
        self.require_idle("start a session")?;
        if self.protocol.is_none() {
            self.protocol = Some(self.resolve_protocol()?);
        }
        let session = self.shared.root().child_token();

        let outcome = match self.config.role {
            crate::config::Role::Client => self.client_session(&session, &callback).await,
            crate::config::Role::Server => self.server_session(&session, &callback).await,
        };

        if let Err(e) = &outcome {
            if !matches!(e, Error::Cancelled) {
                if let Some(control) = self.control.as_mut() {
                    debug!("telling {} the session failed", control.peer());
                    control.send_error(e.to_string()).await;
                }
            }
        }
        self.release_session().await;

        match outcome {
            Ok(result) => {
                let count = self.shared.test_count.fetch_add(1, Ordering::SeqCst) + 1;
                info!(
                    "session {} complete: {} bytes in {:.2}s, {:.2} Mbit/s",
                    count,
                    result.total_bytes,
                    result.duration.as_secs_f64(),
                    result.mbps()
                );
                callback.on_event(TestEvent::Completed(result.clone()));
                Ok(result)
            }
            Err(e) => {
                self.shared.lifecycle.lock().fail();
                if !matches!(e, Error::Cancelled) {
                    callback.on_event(TestEvent::Error {
                        kind: e.kind(),
                        message: e.to_string(),
                    });
                }
                Err(e)
            }
        }
    }

    fn announce(&self, callback: &Arc<dyn EventCallback>) {
        let test_num = self.shared.sessions.fetch_add(1, Ordering::SeqCst) + 1;
        callback.on_event(TestEvent::Connected { test_num });
    }

    /// Starts the timer, the tickers and one worker per stream.
    fn start_run(
        &mut self,
        run: &CancellationToken,
        run_for: Duration,
        (sample_every, report_every): (Duration, Duration),
        callback: &Arc<dyn EventCallback>,
    ) -> Result<RunHandles> {
        let protocol = self.active_protocol()?;
        let pacing = protocol.settings().pacing_bytes_per_sec();
        let meters = self
            .streams
            .iter()
            .map(|s| Meter {
                id: s.id(),
                counters: s.counters(),
                probe: s.probe(),
            })
            .collect();
        let sampler = Arc::new(Sampler::new(protocol, meters));

        self.timer.start(run_for, run.clone())?;
        if !self.streams.is_empty() {
            let (s, cb) = (Arc::clone(&sampler), Arc::clone(callback));
            self.stats_ticker
                .start(sample_every, move || cb.on_event(TestEvent::Sample(s.sample())))?;
            let (s, cb) = (Arc::clone(&sampler), Arc::clone(callback));
            self.report_ticker
                .start(report_every, move || cb.on_event(TestEvent::Interval(s.report())))?;
        }

        let workers = std::mem::take(&mut self.streams)
            .into_iter()
            .map(|stream| {
                let pacer = pacing
                    .filter(|_| stream.direction() == Direction::Send)
                    .map(TokenBucket::new);
                (stream.id(), tokio::spawn(run_worker(stream, run.clone(), pacer)))
            })
            .collect();
        debug!("run started for {:?}", run_for);

        Ok(RunHandles {
            sampler,
            started_at: Utc::now(),
            workers,
        })
    }

    /// Stops the tickers and the timer and takes the streams back from their
    /// workers. The streams stay open. The second value is the first worker
    /// failure, if any.
    async fn finish_run(
        &mut self,
        handles: RunHandles,
        callback: &Arc<dyn EventCallback>,
    ) -> (RunOutcome, Result<()>) {
        let elapsed = handles.sampler.elapsed();
        self.stats_ticker.stop().await;
        self.report_ticker.stop().await;
        self.timer.stop().await;

        let mut result = Ok(());
        for (id, worker) in handles.workers {
            let outcome = match worker.await {
                Ok((stream, outcome)) => {
                    self.streams.push(stream);
                    outcome
                }
                Err(e) => Err(worker_failure(id, e)),
            };
            if let Err(e) = outcome {
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        self.streams.sort_by_key(Stream::id);

        if let Some(report) = handles.sampler.close() {
            callback.on_event(TestEvent::Interval(report));
        }
        let outcome = RunOutcome {
            sampler: handles.sampler,
            started_at: handles.started_at,
            elapsed,
        };
        (outcome, result)
    }

    fn build_result(&mut self, run: &RunOutcome, agreed: Duration) -> TestResult {
        let duration = if agreed.is_zero() { Duration::ZERO } else { run.elapsed };
        let summaries = run.sampler.summaries(duration);
        let name = self.protocol.as_ref().map(Protocol::name).unwrap_or("unknown");
        let result = TestResult::new(name, run.started_at, duration, summaries, run.sampler.history());
        self.totals = CounterSnapshot {
            bytes_sent: result.bytes_sent,
            bytes_received: result.bytes_received,
            blocks_sent: result.blocks_sent,
            blocks_received: result.blocks_received,
        };
        result
    }

    /// Closes everything the session opened. Safe to call repeatedly.
    async fn release_session(&mut self) {
        self.stats_ticker.stop().await;
        self.report_ticker.stop().await;
        self.timer.stop().await;
        for stream in std::mem::take(&mut self.streams) {
            stream.close().await;
        }
        if let Some(control) = self.control.take() {
            control.close().await;
        }
        self.listener = None;
        self.datagram = None;
        if let Some(protocol) = &self.protocol {
            protocol.teardown().await;
        }
    }

    /// Returns the engine to `Initialized` with nothing open, zeroed totals
    /// and the protocol re-resolved from the configuration.
    pub async fn reset_for_next_test(&mut self) -> Result<()> {
        if self.state() == TestState::Created {
            return Err(Error::InvalidState("engine was never initialized".into()));
        }
        self.release_session().await;
        self.totals = CounterSnapshot::default();
        self.shared.lifecycle.lock().reset();
        self.settings = Settings::from_config(&self.config);
        self.protocol = Some(self.resolve_protocol()?);
        debug!("engine reset");
        Ok(())
    }

    /// Full teardown: a reset that also drops the protocol instance and arms
    /// a fresh stop token. Idempotent.
    pub async fn free_test(&mut self) -> Result<()> {
        if self.state() == TestState::Created {
            return Ok(());
        }
        self.reset_for_next_test().await?;
        self.protocol = None;
        *self.shared.root.lock() = CancellationToken::new();
        self.shared.done.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// Sampling and reporting periods of a session.
fn intervals(config: &Config) -> (Duration, Duration) {
    (config.effective_stats_interval(), config.interval)
}

/// Runs `fut` unless `token` fires first.
async fn cancellable<T>(token: &CancellationToken, fut: impl Future<Output = Result<T>>) -> Result<T> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(Error::Cancelled),
        r = fut => r,
    }
}

/// A worker that panicked or was aborted lost its stream, which ends the
/// session like any other data-path fault.
fn worker_failure(stream_id: usize, err: JoinError) -> Error {
    warn!("stream {} worker did not finish: {}", stream_id, err);
    Error::data_path(stream_id, err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Role, ServerLoopPolicy};
    use crate::error::ErrorKind;

    fn fresh(kind: ProtocolKind) -> IperfTest {
        IperfTest::from_config(&Config::server(0).with_protocol(kind)).unwrap()
    }

    #[tokio::test]
    async fn test_panicked_worker_is_a_data_path_fault() {
        let worker: JoinHandle<()> = tokio::spawn(async { panic!("stream worker blew up") });
        let err = worker_failure(7, worker.await.unwrap_err());
        assert_eq!(err.kind(), ErrorKind::DataPath);
        assert!(ServerLoopPolicy::default().backoff_for(err.kind()).is_some());
        assert!(matches!(err, Error::DataPath { stream_id: 7, .. }));
    }

    #[test]
    fn test_new_engine_is_created() {
        let engine = IperfTest::new();
        assert_eq!(engine.state(), TestState::Created);
        assert!(engine.protocol().is_none());
        assert_eq!(engine.transitions(), vec![TestState::Created]);
    }

    #[test]
    fn test_init_selects_default_protocol() {
        let mut engine = IperfTest::new();
        engine.init().unwrap();
        assert_eq!(engine.state(), TestState::Initialized);
        assert_eq!(engine.protocol().map(Protocol::kind), Some(ProtocolKind::Tcp));
        assert!(matches!(engine.init(), Err(Error::InvalidState(_))));
    }

    #[test]
    fn test_set_protocol_by_name() {
        let mut engine = fresh(ProtocolKind::Tcp);
        engine.set_protocol("KCP").unwrap();
        assert_eq!(engine.protocol().map(Protocol::kind), Some(ProtocolKind::Kcp));
        assert_eq!(engine.settings().reliable.snd_wnd, 128);
        assert!(engine.set_protocol("quic").is_err());
        assert_eq!(engine.protocol().map(Protocol::kind), Some(ProtocolKind::Kcp));
    }

    #[test]
    fn test_apply_config_rejects_invalid() {
        let mut engine = fresh(ProtocolKind::Tcp);
        let bad = Config::client("h".into(), 5201).with_parallel(0);
        assert!(matches!(engine.apply_config(&bad), Err(Error::Config(_))));
        assert_eq!(engine.config().role, Role::Server);
    }

    #[tokio::test]
    async fn test_reset_matches_fresh_engine_for_every_protocol() {
        for kind in ProtocolKind::ALL {
            let baseline = fresh(kind).status();
            let mut engine = fresh(kind);
            engine.reset_for_next_test().await.unwrap();
            assert_eq!(engine.status(), baseline, "{}", kind);
        }
    }

    #[tokio::test]
    async fn test_free_test_is_idempotent() {
        let mut engine = fresh(ProtocolKind::Udp);
        engine.handle().stop();
        engine.free_test().await.unwrap();
        let first = engine.status();
        assert!(!engine.handle().is_done());
        engine.free_test().await.unwrap();
        assert_eq!(engine.status(), first);
        assert_eq!(first.state, TestState::Initialized);
        assert_eq!(first.protocol, None);

        let mut bare = IperfTest::new();
        bare.free_test().await.unwrap();
        assert_eq!(bare.state(), TestState::Created);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let mut engine = IperfTest::from_config(&Config::server(0)).unwrap();
        engine.handle().stop();
        let err = engine.run_test(|_event: TestEvent| {}).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert_eq!(engine.state(), TestState::Error);
        assert!(!engine.status().listening);
    }

    #[tokio::test]
    async fn test_stop_preempts_name_lookup() {
        let config = Config::client("riperf-host.invalid".to_string(), 5201);
        let mut engine = IperfTest::from_config(&config).unwrap();
        engine.handle().stop();
        let err = engine.run_test(|_event: TestEvent| {}).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled), "lookup ran after stop: {}", err);
    }
}
