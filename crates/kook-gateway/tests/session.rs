//! Gateway session tests
//!
//! Drive `GatewaySession` with scripted in-memory streams and record every
//! `gateway/index` request it makes.

use std::collections::VecDeque;
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use flate2::{Compression, write::ZlibEncoder};
use kook_api::gateway::GetGateway;
use kook_common::DispatchPolicy;
use kook_gateway::session::{HeartbeatConfig, ReconnectPolicy};
use kook_gateway::transport::{Connection, Frame, FrameSink, FrameStream};
use kook_gateway::{
    CancelMode, Connector, EventFrame, EventPipeline, GatewayError, GatewayLocator,
    GatewaySession, SessionConfig, SessionHandle, SessionState, processor_fn,
};
use tokio::sync::{Notify, mpsc};

// ============================================================================
// Test Fixtures
// ============================================================================

#[derive(Default)]
struct RecordingLocator {
    requests: Mutex<Vec<GetGateway>>,
}

#[async_trait]
impl GatewayLocator for RecordingLocator {
    async fn locate(&self, request: &GetGateway) -> kook_gateway::Result<String> {
        let mut requests = self.requests.lock().unwrap();
        requests.push(request.clone());
        Ok(format!("mock://gateway/{}", requests.len()))
    }
}

impl RecordingLocator {
    fn requests(&self) -> Vec<GetGateway> {
        self.requests.lock().unwrap().clone()
    }
}

/// One scripted connection: frames delivered in order, then either the
/// stream ends (`end = true`) or stays open.
struct Script {
    frames: Vec<Frame>,
    end: bool,
    auto_pong: bool,
}

impl Script {
    fn open(frames: Vec<Frame>) -> Self {
        Self { frames, end: false, auto_pong: true }
    }

    fn ending(frames: Vec<Frame>) -> Self {
        Self { frames, end: true, auto_pong: true }
    }

    fn silent(mut self) -> Self {
        self.auto_pong = false;
        self
    }
}

#[derive(Default)]
struct ScriptedConnector {
    scripts: Mutex<VecDeque<Script>>,
    sent: Arc<Mutex<Vec<Vec<String>>>>,
    /// Signalled whenever a stream has handed out every scripted frame and
    /// is asked for another one.
    drained: Arc<Notify>,
}

impl ScriptedConnector {
    fn new(scripts: Vec<Script>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            ..Default::default()
        })
    }

    fn sent(&self, connection: usize) -> Vec<String> {
        self.sent.lock().unwrap().get(connection).cloned().unwrap_or_default()
    }

    fn connections(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self, _url: &str) -> kook_gateway::Result<Connection> {
        let Some(script) = self.scripts.lock().unwrap().pop_front() else {
            return Err(GatewayError::ConnectionLost);
        };
        let index = {
            let mut sent = self.sent.lock().unwrap();
            sent.push(Vec::new());
            sent.len() - 1
        };

        let (tx, rx) = mpsc::unbounded_channel();
        for frame in script.frames {
            tx.send(Some(frame)).unwrap();
        }
        if script.end {
            tx.send(None).unwrap();
        }

        Ok(Connection {
            sink: Box::new(MockSink {
                index,
                sent: Arc::clone(&self.sent),
                pong: script.auto_pong.then(|| tx.clone()),
            }),
            stream: Box::new(MockStream {
                rx,
                drained: Arc::clone(&self.drained),
                _keep_open: tx,
            }),
        })
    }
}

struct MockSink {
    index: usize,
    sent: Arc<Mutex<Vec<Vec<String>>>>,
    pong: Option<mpsc::UnboundedSender<Option<Frame>>>,
}

#[async_trait]
impl FrameSink for MockSink {
    async fn send_text(&mut self, text: String) -> kook_gateway::Result<()> {
        let is_ping = text.starts_with(r#"{"s":2"#);
        self.sent.lock().unwrap()[self.index].push(text);
        if let (true, Some(pong)) = (is_ping, &self.pong) {
            let _ = pong.send(Some(Frame::Text(r#"{"s":3}"#.into())));
        }
        Ok(())
    }

    async fn close(&mut self) -> kook_gateway::Result<()> {
        Ok(())
    }
}

struct MockStream {
    rx: mpsc::UnboundedReceiver<Option<Frame>>,
    drained: Arc<Notify>,
    _keep_open: mpsc::UnboundedSender<Option<Frame>>,
}

#[async_trait]
impl FrameStream for MockStream {
    async fn next_frame(&mut self) -> Option<kook_gateway::Result<Frame>> {
        if self.rx.is_empty() {
            self.drained.notify_one();
        }
        self.rx.recv().await.flatten().map(Ok)
    }
}

fn hello(session_id: &str) -> Frame {
    Frame::Text(format!(r#"{{"s":1,"d":{{"code":0,"session_id":"{session_id}"}}}}"#))
}

fn event(sn: u64) -> Frame {
    Frame::Text(format!(
        r#"{{"s":0,"sn":{sn},"d":{{"channel_type":"GROUP","type":9,"target_id":"c","author_id":"u",
            "content":"event {sn}","msg_id":"m{sn}","msg_timestamp":{sn},"nonce":"",
            "extra":{{"type":9,"author":{{"id":"u","username":"u"}},"kmarkdown":{{"raw_content":"x"}}}}}}}}"#
    ))
}

fn reconnect() -> Frame {
    Frame::Text(r#"{"s":5,"d":{"code":41008,"err":"Missing params"}}"#.into())
}

fn deflate(frame: Frame) -> Frame {
    let Frame::Text(text) = frame else { unreachable!() };
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(text.as_bytes()).unwrap();
    Frame::Binary(encoder.finish().unwrap())
}

fn config() -> SessionConfig {
    SessionConfig {
        compress: true,
        hello_timeout: Duration::from_secs(6),
        heartbeat: HeartbeatConfig {
            interval: Duration::from_secs(30),
            jitter: Duration::ZERO,
            ack_timeout: Duration::from_secs(6),
            ack_retries: 2,
        },
        reconnect: ReconnectPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(100),
        },
        dispatch: DispatchPolicy::Sequential,
    }
}

struct Harness {
    handle: SessionHandle,
    task: tokio::task::JoinHandle<kook_gateway::Result<()>>,
    locator: Arc<RecordingLocator>,
    connector: Arc<ScriptedConnector>,
    dispatched: Arc<Mutex<Vec<u64>>>,
}

fn start(config: SessionConfig, scripts: Vec<Script>) -> Harness {
    start_with(config, scripts, Duration::ZERO)
}

/// `work` is how long the (single) processor takes per frame.
fn start_with(config: SessionConfig, scripts: Vec<Script>, work: Duration) -> Harness {
    let locator = Arc::new(RecordingLocator::default());
    let connector = ScriptedConnector::new(scripts);
    let dispatched: Arc<Mutex<Vec<u64>>> = Arc::default();

    let log = Arc::clone(&dispatched);
    let pipeline = EventPipeline::builder()
        .policy(config.dispatch)
        .processor(processor_fn(move |frame: Arc<EventFrame>| {
            let log = Arc::clone(&log);
            async move {
                if !work.is_zero() {
                    tokio::time::sleep(work).await;
                }
                log.lock().unwrap().push(frame.sn);
                Ok(())
            }
        }))
        .build();

    let (session, handle) = GatewaySession::new(
        "client",
        config,
        Arc::clone(&locator) as Arc<dyn GatewayLocator>,
        Arc::clone(&connector) as Arc<dyn Connector>,
        Arc::new(pipeline),
    );
    let task = session.spawn();

    Harness { handle, task, locator, connector, dispatched }
}

impl Harness {
    async fn drained(&self) {
        tokio::time::timeout(Duration::from_secs(60), self.connector.drained.notified())
            .await
            .expect("stream was never drained");
    }

    fn dispatched(&self) -> Vec<u64> {
        self.dispatched.lock().unwrap().clone()
    }

    async fn stop(self, mode: CancelMode) -> kook_gateway::Result<()> {
        self.handle.cancel(mode);
        let result = self.task.await.unwrap();
        assert_eq!(self.handle.state(), SessionState::Closed);
        result
    }
}

fn resume_params(request: &GetGateway) -> Option<(u64, String)> {
    request.resume_info().map(|r| (r.sn, r.session_id.clone()))
}

// ============================================================================
// Sequence Tracking
// ============================================================================

#[tokio::test]
async fn test_duplicate_event_is_dispatched_once() {
    let h = start(config(), vec![Script::open(vec![hello("S1"), event(1), event(1)])]);
    h.drained().await;

    assert_eq!(h.dispatched(), [1]);
    let status = h.handle.status();
    assert_eq!(status.state, SessionState::Connected);
    assert_eq!(status.sn, 1);
    assert_eq!(status.session_id.as_deref(), Some("S1"));

    h.stop(CancelMode::Soft).await.unwrap();
}

#[tokio::test]
async fn test_stale_events_never_reach_pipeline() {
    let h = start(
        config(),
        vec![Script::open(vec![hello("S1"), event(1), event(3), event(2), event(3), event(4)])],
    );
    h.drained().await;

    assert_eq!(h.dispatched(), [1, 3, 4]);
    assert_eq!(h.handle.status().sn, 4);
    h.stop(CancelMode::Soft).await.unwrap();
}

#[tokio::test]
async fn test_malformed_and_unknown_frames_are_skipped() {
    let h = start(
        config(),
        vec![Script::open(vec![
            hello("S1"),
            Frame::Text("not json".into()),
            Frame::Text(r#"{"s":42,"d":{}}"#.into()),
            Frame::Binary(b"not zlib".to_vec()),
            event(1),
        ])],
    );
    h.drained().await;

    assert_eq!(h.dispatched(), [1]);
    assert_eq!(h.handle.state(), SessionState::Connected);
    h.stop(CancelMode::Soft).await.unwrap();
}

#[tokio::test]
async fn test_compressed_frames_are_inflated() {
    let h = start(
        config(),
        vec![Script::open(vec![deflate(hello("S1")), deflate(event(1)), deflate(event(2))])],
    );
    h.drained().await;

    assert_eq!(h.dispatched(), [1, 2]);
    assert!(h.locator.requests()[0].compress());
    h.stop(CancelMode::Soft).await.unwrap();
}

// ============================================================================
// Resume and Reconnect
// ============================================================================

#[tokio::test]
async fn test_drop_resumes_then_reconnect_starts_fresh() {
    let h = start(
        config(),
        vec![
            Script::ending(vec![hello("S1"), event(1), event(2), event(3), event(4), event(5)]),
            // Server refuses the resume.
            Script::open(vec![reconnect()]),
            Script::open(vec![hello("S2"), event(1)]),
        ],
    );
    h.drained().await;
    assert_eq!(h.handle.status().session_id.as_deref(), Some("S2"));

    let requests = h.locator.requests();
    assert_eq!(requests.len(), 3);
    assert_eq!(resume_params(&requests[0]), None);
    assert_eq!(resume_params(&requests[1]), Some((5, "S1".into())));
    assert_eq!(resume_params(&requests[2]), None);
    assert_eq!(h.dispatched(), [1, 2, 3, 4, 5, 1]);

    h.stop(CancelMode::Soft).await.unwrap();
}

#[tokio::test]
async fn test_reconnect_signal_while_connected_discards_session() {
    let h = start(
        config(),
        vec![
            Script::open(vec![hello("S1"), event(1), event(2), reconnect()]),
            Script::open(vec![hello("S2")]),
        ],
    );
    h.handle.wait_for(|s| s.session_id.as_deref() == Some("S2")).await;

    let requests = h.locator.requests();
    assert_eq!(resume_params(&requests[1]), None);
    assert_eq!(h.handle.status().sn, 0);
    h.stop(CancelMode::Soft).await.unwrap();
}

#[tokio::test]
async fn test_resume_keeps_sequence_and_drops_replays() {
    let h = start(
        config(),
        vec![
            Script::ending(vec![hello("S1"), event(1), event(2)]),
            Script::open(vec![hello("S1"), event(2), event(3)]),
        ],
    );
    h.handle.wait_for(|s| s.sn == 3).await;
    h.drained().await;

    assert_eq!(resume_params(&h.locator.requests()[1]), Some((2, "S1".into())));
    assert_eq!(h.dispatched(), [1, 2, 3]);
    h.stop(CancelMode::Soft).await.unwrap();
}

#[tokio::test]
async fn test_intentional_resume_reconnects_with_position() {
    let h = start(
        config(),
        vec![
            Script::open(vec![hello("S1"), event(1)]),
            Script::open(vec![hello("S1")]),
        ],
    );
    h.drained().await;
    assert!(h.handle.resume());

    h.drained().await;
    assert_eq!(h.connector.connections(), 2);
    assert_eq!(resume_params(&h.locator.requests()[1]), Some((1, "S1".into())));
    assert_eq!(h.handle.state(), SessionState::Connected);
    h.stop(CancelMode::Soft).await.unwrap();
}

// ============================================================================
// Handshake Failures
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_missing_hello_times_out() {
    let mut cfg = config();
    cfg.reconnect.max_attempts = 1;
    let h = start(cfg, vec![Script::open(vec![])]);

    let err = h.task.await.unwrap().unwrap_err();
    match err {
        GatewayError::AttemptsExhausted { attempts, last } => {
            assert_eq!(attempts, 1);
            assert!(matches!(*last, GatewayError::HelloTimeout(_)));
        }
        other => panic!("expected exhaustion, got {other:?}"),
    }
    assert_eq!(h.handle.state(), SessionState::Closed);
}

#[tokio::test]
async fn test_event_before_hello_is_rejected() {
    let mut cfg = config();
    cfg.reconnect.max_attempts = 1;
    let h = start(cfg, vec![Script::open(vec![event(1)])]);
    let dispatched = Arc::clone(&h.dispatched);

    let err = h.task.await.unwrap().unwrap_err();
    match err {
        GatewayError::AttemptsExhausted { last, .. } => {
            assert!(matches!(*last, GatewayError::UnexpectedFirstFrame(0)));
        }
        other => panic!("expected exhaustion, got {other:?}"),
    }
    assert!(dispatched.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_invalid_token_is_terminal_immediately() {
    let h = start(
        config(),
        vec![
            Script::open(vec![Frame::Text(r#"{"s":1,"d":{"code":40101}}"#.into())]),
            Script::open(vec![hello("never")]),
        ],
    );

    let err = h.task.await.unwrap().unwrap_err();
    assert!(matches!(err, GatewayError::HelloRejected { code: 40101 }));
    assert_eq!(h.connector.connections(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_attempt_budget_is_bounded() {
    // No scripts: every connect fails.
    let h = start(config(), vec![]);

    let err = h.task.await.unwrap().unwrap_err();
    match err {
        GatewayError::AttemptsExhausted { attempts, last } => {
            assert_eq!(attempts, 3);
            assert!(matches!(*last, GatewayError::ConnectionLost));
        }
        other => panic!("expected exhaustion, got {other:?}"),
    }
    assert_eq!(h.locator.requests().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_budget_resets_after_successful_handshake() {
    let h = start(
        config(),
        vec![
            Script::ending(vec![hello("S1"), event(1)]),
            Script::open(vec![]).silent(),
            Script::open(vec![]).silent(),
            Script::open(vec![hello("S1"), event(2)]),
        ],
    );
    h.handle.wait_for(|s| s.sn == 2).await;

    // Two hello timeouts after a working connection do not exhaust a budget
    // of three.
    assert_eq!(h.locator.requests().len(), 4);
    h.stop(CancelMode::Soft).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_rejected_resumes_use_the_attempt_budget() {
    let scripts = (0..40)
        .map(|_| Script::open(vec![hello("S1"), reconnect()]))
        .collect();
    let started = tokio::time::Instant::now();
    let h = start(config(), scripts);

    let err = h.task.await.unwrap().unwrap_err();
    match err {
        GatewayError::AttemptsExhausted { attempts, last } => {
            assert_eq!(attempts, 3);
            assert!(matches!(*last, GatewayError::ResumeRejected { code: 41008, .. }));
        }
        other => panic!("expected exhaustion, got {other:?}"),
    }
    assert_eq!(h.connector.connections(), 3);
    // Backoff of 10ms then 20ms between the three attempts.
    assert!(started.elapsed() >= Duration::from_millis(30));
}

#[tokio::test(start_paused = true)]
async fn test_connections_dropped_after_hello_use_the_attempt_budget() {
    let scripts = (0..40).map(|_| Script::ending(vec![hello("S1")])).collect();
    let h = start(config(), scripts);

    let err = h.task.await.unwrap().unwrap_err();
    match err {
        GatewayError::AttemptsExhausted { attempts, last } => {
            assert_eq!(attempts, 3);
            assert!(matches!(*last, GatewayError::ConnectionLost));
        }
        other => panic!("expected exhaustion, got {other:?}"),
    }
    assert_eq!(h.connector.connections(), 3);
    // The identity survives, so every retry asks to resume.
    let requests = h.locator.requests();
    assert_eq!(resume_params(&requests[1]), Some((0, "S1".into())));
    assert_eq!(resume_params(&requests[2]), Some((0, "S1".into())));
}

/// Opening the stream never completes.
struct StalledConnector;

#[async_trait]
impl Connector for StalledConnector {
    async fn connect(&self, _url: &str) -> kook_gateway::Result<Connection> {
        std::future::pending().await
    }
}

#[tokio::test(start_paused = true)]
async fn test_stalled_connect_counts_as_hello_timeout() {
    let mut cfg = config();
    cfg.reconnect.max_attempts = 2;
    let locator = Arc::new(RecordingLocator::default());
    let (session, handle) = GatewaySession::new(
        "client",
        cfg,
        Arc::clone(&locator) as Arc<dyn GatewayLocator>,
        Arc::new(StalledConnector),
        Arc::new(EventPipeline::builder().build()),
    );
    let started = tokio::time::Instant::now();

    let err = tokio::time::timeout(Duration::from_secs(3600), session.run())
        .await
        .expect("a stalled connect must not hang the session")
        .unwrap_err();
    match err {
        GatewayError::AttemptsExhausted { attempts, last } => {
            assert_eq!(attempts, 2);
            assert!(matches!(*last, GatewayError::HelloTimeout(_)));
        }
        other => panic!("expected exhaustion, got {other:?}"),
    }
    assert_eq!(locator.requests().len(), 2);
    assert!(started.elapsed() >= Duration::from_secs(12));
    assert_eq!(handle.state(), SessionState::Closed);
}

// ============================================================================
// Heartbeat
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_slow_sequential_processor_does_not_starve_heartbeat() {
    let h = start_with(
        config(),
        vec![Script::open(vec![hello("S1"), event(1), event(2)])],
        Duration::from_secs(60),
    );

    tokio::time::sleep(Duration::from_secs(130)).await;

    // PINGs at 30s, 60s, 90s and 120s were all answered while the
    // processor was busy.
    assert_eq!(h.connector.connections(), 1);
    assert!(h.connector.sent(0).len() >= 4);
    assert_eq!(h.dispatched(), [1, 2]);
    assert_eq!(h.handle.state(), SessionState::Connected);
    h.stop(CancelMode::Soft).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_acknowledged_heartbeat_keeps_connection() {
    let h = start(config(), vec![Script::open(vec![hello("S1"), event(1), event(2)])]);
    h.handle.wait_for(|s| s.sn == 2).await;

    tokio::time::sleep(Duration::from_secs(95)).await;

    let pings = h.connector.sent(0);
    assert_eq!(pings.len(), 3);
    assert!(pings.iter().all(|p| p == r#"{"s":2,"sn":2}"#));
    assert_eq!(h.handle.state(), SessionState::Connected);
    assert_eq!(h.connector.connections(), 1);
    h.stop(CancelMode::Soft).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_missed_heartbeat_triggers_resume() {
    let h = start(
        config(),
        vec![
            Script::open(vec![hello("S1"), event(1)]).silent(),
            Script::open(vec![hello("S1")]),
        ],
    );
    h.handle.wait_for(|s| s.sn == 1).await;

    h.handle
        .wait_for(|s| s.state == SessionState::Connected && h.locator.requests().len() == 2)
        .await;

    // One ping plus two retries before the connection is declared lost.
    assert_eq!(h.connector.sent(0).len(), 3);
    assert_eq!(resume_params(&h.locator.requests()[1]), Some((1, "S1".into())));
    h.stop(CancelMode::Soft).await.unwrap();
}

// ============================================================================
// Cancellation
// ============================================================================

#[tokio::test]
async fn test_soft_cancel_lets_dispatch_finish() {
    let h = start_with(
        config(),
        vec![Script::open(vec![hello("S1"), event(1)])],
        Duration::from_millis(100),
    );
    h.handle.wait_for(|s| s.sn == 1).await;

    let dispatched = Arc::clone(&h.dispatched);
    h.stop(CancelMode::Soft).await.unwrap();
    assert_eq!(*dispatched.lock().unwrap(), [1]);
}

#[tokio::test]
async fn test_hard_cancel_stops_in_flight_dispatch() {
    let mut cfg = config();
    cfg.dispatch = DispatchPolicy::Concurrent;
    let h = start_with(
        cfg,
        vec![Script::open(vec![hello("S1"), event(1)])],
        Duration::from_secs(3600),
    );
    h.handle.wait_for(|s| s.sn == 1).await;

    let dispatched = Arc::clone(&h.dispatched);
    tokio::time::timeout(Duration::from_secs(5), h.stop(CancelMode::Hard))
        .await
        .expect("hard cancel must not wait for processors")
        .unwrap();
    assert!(dispatched.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_resume_is_ignored_unless_connected() {
    let h = start(config(), vec![]);
    let _ = h.handle.wait_for(|s| s.state == SessionState::Closed).await;
    assert!(!h.handle.resume());
}
