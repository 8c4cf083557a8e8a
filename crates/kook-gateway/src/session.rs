//! One logical gateway connection.
//!
//! `Idle → Handshaking → Connected → Resuming → …` until cancellation or a
//! terminal failure moves it to `Closed`. A [`GatewaySession`] is consumed by
//! [`GatewaySession::run`]; once closed it cannot be restarted, a new one
//! must be built.

use std::collections::VecDeque;
use std::future::ready;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use kook_api::gateway::GetGateway;
use kook_common::DispatchPolicy;
use kook_common::config::GatewayConfig;
use rand::Rng;
use tokio::sync::{Mutex, Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::compress::inflate;
use crate::error::{GatewayError, Result};
use crate::event::{Event, EventFrame};
use crate::pipeline::{CancelMode, EventPipeline};
use crate::signal::{self, Hello, Reconnect, ResumeAck, Signal, SignalKind, hello_code};
use crate::transport::{Connection, Connector, Frame, FrameSink, FrameStream, GatewayLocator};

// ── Configuration ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    pub interval: Duration,
    /// Each interval is moved by a random amount in `[-jitter, +jitter]`.
    pub jitter: Duration,
    pub ack_timeout: Duration,
    /// Extra PINGs sent after a missed ack before giving up.
    pub ack_retries: u32,
}

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Consecutive failed attempts allowed before the session closes.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl ReconnectPolicy {
    /// Delay after the `failures`-th consecutive failure.
    pub fn backoff(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << exp)
            .min(self.max_backoff)
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub compress: bool,
    pub hello_timeout: Duration,
    pub heartbeat: HeartbeatConfig,
    pub reconnect: ReconnectPolicy,
    pub dispatch: DispatchPolicy,
}

impl From<&GatewayConfig> for SessionConfig {
    fn from(config: &GatewayConfig) -> Self {
        Self {
            compress: config.compress,
            hello_timeout: Duration::from_millis(config.hello_timeout_ms),
            heartbeat: HeartbeatConfig {
                interval: Duration::from_millis(config.heartbeat_interval_ms),
                jitter: Duration::from_millis(config.heartbeat_jitter_ms),
                ack_timeout: Duration::from_millis(config.heartbeat_ack_timeout_ms),
                ack_retries: config.heartbeat_ack_retries,
            },
            reconnect: ReconnectPolicy {
                max_attempts: config.max_attempts,
                initial_backoff: Duration::from_millis(config.backoff_initial_ms),
                max_backoff: Duration::from_millis(config.backoff_max_ms),
            },
            dispatch: config.dispatch,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            compress: true,
            hello_timeout: Duration::from_secs(6),
            heartbeat: HeartbeatConfig {
                interval: Duration::from_secs(30),
                jitter: Duration::from_secs(5),
                ack_timeout: Duration::from_secs(6),
                ack_retries: 2,
            },
            reconnect: ReconnectPolicy {
                max_attempts: 3,
                initial_backoff: Duration::from_secs(1),
                max_backoff: Duration::from_secs(30),
            },
            dispatch: DispatchPolicy::Sequential,
        }
    }
}

// ── Status ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Handshaking,
    Connected,
    Resuming,
    Closed,
}

/// Snapshot published on every transition and every accepted event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStatus {
    pub state: SessionState,
    pub sn: u64,
    pub session_id: Option<String>,
}

struct Control {
    cancel: CancellationToken,
    restart: Notify,
}

/// Cheap, cloneable view of a running session.
#[derive(Clone)]
pub struct SessionHandle {
    status: watch::Receiver<SessionStatus>,
    control: Arc<Control>,
    pipeline: Arc<EventPipeline>,
}

impl SessionHandle {
    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    pub fn state(&self) -> SessionState {
        self.status.borrow().state
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    /// Stop the session. `Hard` also stops frames already handed to the
    /// pipeline; `Soft` lets them drain.
    pub fn cancel(&self, mode: CancelMode) {
        if mode == CancelMode::Hard {
            self.pipeline.abort_in_flight();
        }
        self.control.cancel.cancel();
    }

    /// Drop the current stream and reconnect, resuming from the last `sn`.
    /// Only honoured while connected; returns whether it was requested.
    pub fn resume(&self) -> bool {
        if self.state() != SessionState::Connected {
            return false;
        }
        self.control.restart.notify_one();
        true
    }

    /// Wait until `predicate` holds. Returns the final status if the session
    /// ends first.
    pub async fn wait_for(&self, predicate: impl FnMut(&SessionStatus) -> bool) -> SessionStatus {
        let mut rx = self.status.clone();
        let reached = rx.wait_for(predicate).await.map(|s| s.clone());
        match reached {
            Ok(status) => status,
            Err(_) => rx.borrow().clone(),
        }
    }
}

// ── Session ───────────────────────────────────────────────────────────────────

/// Server-assigned identity of one logical session. Replaced, never patched,
/// when a fresh handshake succeeds.
#[derive(Debug, Clone)]
struct Identity {
    session_id: String,
    sn: u64,
}

/// Why the steady-state loop stopped.
enum Exit {
    Cancelled,
    Restart,
    Reconnect(Reconnect),
    Lost(GatewayError),
}

type SharedSink = Arc<Mutex<Box<dyn FrameSink>>>;

/// One decoded inbound frame, or why reading failed.
type Incoming = Result<(String, Signal)>;

pub struct GatewaySession {
    client_id: String,
    config: SessionConfig,
    locator: Arc<dyn GatewayLocator>,
    connector: Arc<dyn Connector>,
    pipeline: Arc<EventPipeline>,
    status: watch::Sender<SessionStatus>,
    control: Arc<Control>,
    identity: Option<Identity>,
    state: SessionState,
}

impl GatewaySession {
    pub fn new(
        client_id: impl Into<String>,
        config: SessionConfig,
        locator: Arc<dyn GatewayLocator>,
        connector: Arc<dyn Connector>,
        pipeline: Arc<EventPipeline>,
    ) -> (Self, SessionHandle) {
        let (status, status_rx) = watch::channel(SessionStatus::default());
        let control = Arc::new(Control {
            cancel: CancellationToken::new(),
            restart: Notify::new(),
        });
        let handle = SessionHandle {
            status: status_rx,
            control: Arc::clone(&control),
            pipeline: Arc::clone(&pipeline),
        };
        let session = Self {
            client_id: client_id.into(),
            config,
            locator,
            connector,
            pipeline,
            status,
            control,
            identity: None,
            state: SessionState::Idle,
        };
        (session, handle)
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    /// Drive the session until it is cancelled (`Ok`) or gives up (`Err`).
    pub async fn run(mut self) -> Result<()> {
        let cancel = self.control.cancel.clone();
        let mut failures: u32 = 0;
        let mut intentional = false;

        let outcome = loop {
            if cancel.is_cancelled() {
                break Ok(());
            }

            let request = match &self.identity {
                Some(id) => GetGateway::resume(self.config.compress, id.sn, id.session_id.clone()),
                None => GetGateway::new(self.config.compress),
            };
            let next_state = if self.identity.is_some() && !intentional {
                SessionState::Resuming
            } else {
                SessionState::Handshaking
            };
            self.transition(next_state);
            intentional = false;

            let attempt = tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                attempt = self.connect(&request) => attempt,
            };

            // A HELLO alone does not clear the budget: the connection must
            // also deliver an event or answer a PING.
            let error = match attempt {
                Ok(connection) => {
                    let (exit, proven) = self.serve(connection).await;
                    if proven {
                        failures = 0;
                    }
                    match exit {
                        Exit::Cancelled => break Ok(()),
                        Exit::Restart => {
                            info!(client_id = %self.client_id, "reconnect requested");
                            intentional = true;
                            continue;
                        }
                        Exit::Reconnect(reason) => {
                            warn!(
                                client_id = %self.client_id,
                                code = reason.code,
                                err = %reason.err,
                                proven,
                                "server asked for a fresh session"
                            );
                            self.identity = None;
                            if proven {
                                continue;
                            }
                            GatewayError::ResumeRejected {
                                code: reason.code,
                                err: reason.err,
                            }
                        }
                        Exit::Lost(e) => {
                            warn!(client_id = %self.client_id, error = %e, proven, "connection lost");
                            if proven {
                                continue;
                            }
                            e
                        }
                    }
                }
                Err(e) => e,
            };

            if let GatewayError::ResumeRejected { .. } = error {
                self.identity = None;
            }
            failures += 1;

            if !error.is_recoverable() {
                error!(client_id = %self.client_id, error = %error, "connect attempt failed fatally");
                break Err(error);
            }
            if failures >= self.config.reconnect.max_attempts {
                error!(client_id = %self.client_id, failures, error = %error, "giving up");
                break Err(GatewayError::AttemptsExhausted {
                    attempts: failures,
                    last: Box::new(error),
                });
            }

            let delay = self.config.reconnect.backoff(failures);
            warn!(
                client_id = %self.client_id,
                attempt = failures,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "connect attempt failed, backing off"
            );
            tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                _ = sleep(delay) => {}
            }
        };

        self.pipeline.drain().await;
        self.transition(SessionState::Closed);
        info!(client_id = %self.client_id, ok = outcome.is_ok(), "session closed");
        outcome
    }

    /// Locate, connect, and wait for HELLO. Opening the stream and the
    /// first frame share one `hello_timeout` deadline.
    async fn connect(&mut self, request: &GetGateway) -> Result<Connection> {
        let url = self.locator.locate(request).await?;
        debug!(client_id = %self.client_id, url = %url, resume = request.resume_info().is_some(), "opening gateway stream");

        let hello_timeout = self.config.hello_timeout;
        let connector = Arc::clone(&self.connector);
        let handshake = async move {
            let mut connection = connector.connect(&url).await?;
            let (_, first) = next_signal(connection.stream.as_mut()).await?;
            Ok::<_, GatewayError>((connection, first))
        };
        let (connection, first) = timeout(hello_timeout, handshake)
            .await
            .map_err(|_| GatewayError::HelloTimeout(hello_timeout))??;

        match first.kind() {
            SignalKind::Hello => {
                let hello: Hello = first.data()?;
                let session_id = match hello.session_id {
                    Some(id) if hello.code == hello_code::SUCCESS => id,
                    _ => return Err(GatewayError::HelloRejected { code: hello.code }),
                };
                self.accept_hello(session_id);
                Ok(connection)
            }
            SignalKind::Reconnect => {
                let reason: Reconnect = first.data().unwrap_or_default();
                Err(GatewayError::ResumeRejected {
                    code: reason.code,
                    err: reason.err,
                })
            }
            _ => Err(GatewayError::UnexpectedFirstFrame(first.s)),
        }
    }

    fn accept_hello(&mut self, session_id: String) {
        match &mut self.identity {
            Some(id) if id.session_id == session_id => {
                info!(client_id = %self.client_id, session_id = %session_id, sn = id.sn, "session resumed");
            }
            _ => {
                info!(client_id = %self.client_id, session_id = %session_id, "session established");
                self.identity = Some(Identity { session_id, sn: 0 });
            }
        }
    }

    /// Steady state: heartbeat in the background, frames in order here.
    /// Also reports whether the connection proved itself with an event or
    /// a PONG.
    async fn serve(&mut self, connection: Connection) -> (Exit, bool) {
        let Connection { sink, mut stream } = connection;
        let sink: SharedSink = Arc::new(Mutex::new(sink));
        let current_sn = Arc::new(AtomicU64::new(self.sn()));
        let (ack_tx, ack_rx) = watch::channel(Instant::now());
        let mut backlog: VecDeque<Incoming> = VecDeque::new();
        let mut proven = false;

        let mut heartbeat = tokio::spawn(heartbeat_loop(
            Arc::clone(&sink),
            Arc::clone(&current_sn),
            ack_rx,
            self.config.heartbeat.clone(),
        ));
        self.transition(SessionState::Connected);

        let exit = loop {
            let next = tokio::select! {
                biased;
                _ = self.control.cancel.cancelled() => break Exit::Cancelled,
                _ = self.control.restart.notified() => break Exit::Restart,
                beat = &mut heartbeat => {
                    break Exit::Lost(beat.unwrap_or(GatewayError::ConnectionLost));
                }
                Some(buffered) = ready(backlog.pop_front()) => buffered,
                next = next_signal(stream.as_mut()) => next,
            };
            let (text, signal) = match next {
                Ok(decoded) => decoded,
                Err(e @ (GatewayError::Decode(_) | GatewayError::Inflate(_))) => {
                    warn!(client_id = %self.client_id, error = %e, "skipping malformed frame");
                    continue;
                }
                Err(e) => break Exit::Lost(e),
            };
            match signal.kind() {
                SignalKind::Event => {
                    proven = true;
                    if let Some(frame) = self.accept_event(text, signal, &current_sn) {
                        self.dispatch(frame, stream.as_mut(), &mut backlog, &ack_tx).await;
                    }
                }
                SignalKind::Pong => {
                    trace!(client_id = %self.client_id, "pong");
                    proven = true;
                    ack_tx.send_replace(Instant::now());
                }
                SignalKind::Reconnect => {
                    break Exit::Reconnect(signal.data().unwrap_or_default());
                }
                SignalKind::ResumeAck => match signal.data::<ResumeAck>() {
                    Ok(ack) => debug!(client_id = %self.client_id, session_id = %ack.session_id, "resume acknowledged"),
                    Err(e) => debug!(client_id = %self.client_id, error = %e, "resume ack without session id"),
                },
                kind => trace!(client_id = %self.client_id, ?kind, "ignoring signal"),
            }
        };

        heartbeat.abort();
        if let Err(e) = sink.lock().await.close().await {
            trace!(client_id = %self.client_id, error = %e, "close after exit failed");
        }
        (exit, proven)
    }

    /// Apply the `sn` rule and decode the event. `None` when the frame is a
    /// duplicate, stale, or undecodable.
    fn accept_event(&mut self, text: String, signal: Signal, current_sn: &AtomicU64) -> Option<Arc<EventFrame>> {
        let Some(sn) = signal.sn else {
            warn!(client_id = %self.client_id, "EVENT without sn dropped");
            return None;
        };
        let identity = self.identity.as_mut()?;
        if sn <= identity.sn {
            debug!(client_id = %self.client_id, sn, current = identity.sn, "duplicate or stale event dropped");
            return None;
        }
        identity.sn = sn;
        current_sn.store(sn, Ordering::Release);
        self.publish();

        let event: Event = match signal.data() {
            Ok(event) => event,
            Err(e) => {
                warn!(client_id = %self.client_id, sn, error = %e, "undecodable event skipped");
                return None;
            }
        };
        trace!(client_id = %self.client_id, sn, event_type = event.type_value, "dispatching");
        Some(Arc::new(EventFrame {
            sn,
            event,
            raw: text,
        }))
    }

    /// Run one frame through the pipeline. The stream keeps being read
    /// meanwhile: PONGs are acknowledged at once, everything else waits in
    /// `backlog` so the next frame is only handled after this dispatch.
    async fn dispatch(
        &self,
        frame: Arc<EventFrame>,
        stream: &mut dyn FrameStream,
        backlog: &mut VecDeque<Incoming>,
        acks: &watch::Sender<Instant>,
    ) {
        let dispatch = self.pipeline.dispatch(frame);
        tokio::pin!(dispatch);
        let mut reading = !backlog.iter().any(ends_stream);

        loop {
            tokio::select! {
                biased;
                _ = &mut dispatch => return,
                next = next_signal(&mut *stream), if reading => {
                    if let Ok((_, signal)) = &next {
                        if matches!(signal.kind(), SignalKind::Pong) {
                            trace!(client_id = %self.client_id, "pong during dispatch");
                            acks.send_replace(Instant::now());
                            continue;
                        }
                    }
                    reading = !ends_stream(&next);
                    backlog.push_back(next);
                }
            }
        }
    }

    fn sn(&self) -> u64 {
        self.identity.as_ref().map_or(0, |id| id.sn)
    }

    fn transition(&mut self, state: SessionState) {
        if self.state != state {
            debug!(client_id = %self.client_id, from = ?self.state, to = ?state, "session state");
        }
        self.state = state;
        self.publish();
    }

    fn publish(&self) {
        let status = SessionStatus {
            state: self.state,
            sn: self.sn(),
            session_id: self.identity.as_ref().map(|id| id.session_id.clone()),
        };
        self.status.send_replace(status);
    }
}

/// Read errors after which the stream yields nothing useful.
fn ends_stream(next: &Incoming) -> bool {
    matches!(next, Err(e) if !matches!(e, GatewayError::Decode(_) | GatewayError::Inflate(_)))
}

/// Next frame as text plus its parsed envelope. Close frames and end of
/// stream are `ConnectionLost`.
async fn next_signal(stream: &mut dyn FrameStream) -> Result<(String, Signal)> {
    let text = match stream.next_frame().await {
        None => return Err(GatewayError::ConnectionLost),
        Some(Err(e)) => return Err(e),
        Some(Ok(Frame::Close(reason))) => {
            debug!(reason = reason.as_deref().unwrap_or(""), "gateway closed the stream");
            return Err(GatewayError::ConnectionLost);
        }
        Some(Ok(Frame::Text(text))) => text,
        Some(Ok(Frame::Binary(bytes))) => inflate(&bytes)?,
    };
    trace!(frame = %text, "<== gateway");
    let signal = Signal::parse(&text)?;
    Ok((text, signal))
}

/// Sends PING every (jittered) interval and waits for the PONG. Only
/// returns when the connection should be treated as lost.
async fn heartbeat_loop(
    sink: SharedSink,
    sn: Arc<AtomicU64>,
    mut acks: watch::Receiver<Instant>,
    config: HeartbeatConfig,
) -> GatewayError {
    loop {
        sleep(jittered(config.interval, config.jitter)).await;

        let mut missed = 0;
        loop {
            let ping = signal::ping(sn.load(Ordering::Acquire));
            if let Err(e) = sink.lock().await.send_text(ping).await {
                return e;
            }
            match timeout(config.ack_timeout, acks.changed()).await {
                Ok(Ok(())) => break,
                Ok(Err(_)) => return GatewayError::ConnectionLost,
                Err(_) if missed < config.ack_retries => {
                    missed += 1;
                    warn!(missed, "heartbeat ack missed, pinging again");
                }
                Err(_) => return GatewayError::HeartbeatTimeout,
            }
        }
    }
}

fn jittered(interval: Duration, jitter: Duration) -> Duration {
    let jitter_ms = jitter.as_millis() as u64;
    if jitter_ms == 0 {
        return interval;
    }
    let offset = rand::rng().random_range(0..=jitter_ms * 2);
    (interval + Duration::from_millis(offset)).saturating_sub(jitter)
}
