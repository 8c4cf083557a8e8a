//! A bot: ticket + REST executor + gateway session + pipeline.

use std::sync::Arc;

use async_trait::async_trait;
use kook_api::RestClient;
use kook_api::user::{GetMe, Me, Offline};
use kook_common::config::DEFAULT_BASE_URL;
use kook_common::{DispatchPolicy, Ticket};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{GatewayError, Result};
use crate::event::{EventFrame, SystemEvent};
use crate::pipeline::{CancelMode, EventPipeline, EventPipelineBuilder, EventProcessor};
use crate::session::{GatewaySession, SessionConfig, SessionHandle, SessionState, SessionStatus};
use crate::transport::{Connector, GatewayLocator, RestLocator, WsConnector};

pub struct KookBotBuilder {
    ticket: Ticket,
    rest: Option<RestClient>,
    config: SessionConfig,
    dispatch: Option<DispatchPolicy>,
    connector: Option<Arc<dyn Connector>>,
    locator: Option<Arc<dyn GatewayLocator>>,
    pipeline: EventPipelineBuilder,
    me: Arc<RwLock<Option<Me>>>,
}

impl KookBotBuilder {
    pub fn rest(mut self, rest: RestClient) -> Self {
        self.rest = Some(rest);
        self
    }

    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Overrides `config.dispatch`.
    pub fn dispatch(mut self, policy: DispatchPolicy) -> Self {
        self.dispatch = Some(policy);
        self
    }

    pub fn connector(mut self, connector: impl Connector + 'static) -> Self {
        self.connector = Some(Arc::new(connector));
        self
    }

    /// Replace the REST `gateway/index` lookup.
    pub fn locator(mut self, locator: impl GatewayLocator + 'static) -> Self {
        self.locator = Some(Arc::new(locator));
        self
    }

    /// Runs after the built-in self-identity bookkeeping.
    pub fn pre_processor(mut self, processor: impl EventProcessor + 'static) -> Self {
        self.pipeline = self.pipeline.pre_processor(processor);
        self
    }

    pub fn processor(mut self, processor: impl EventProcessor + 'static) -> Self {
        self.pipeline = self.pipeline.processor(processor);
        self
    }

    pub fn build(self) -> Result<KookBot> {
        let rest = match self.rest {
            Some(rest) => rest,
            None => RestClient::new(DEFAULT_BASE_URL)?,
        };
        let client_id = self.ticket.client_id().to_owned();
        let ticket = Arc::new(RwLock::new(self.ticket));
        let pipeline = self
            .pipeline
            .policy(self.dispatch.unwrap_or(self.config.dispatch))
            .build();

        let locator: Arc<dyn GatewayLocator> = match self.locator {
            Some(locator) => locator,
            None => Arc::new(RestLocator::new(rest.clone(), Arc::clone(&ticket))),
        };

        Ok(KookBot {
            client_id,
            ticket,
            rest,
            config: self.config,
            connector: self
                .connector
                .unwrap_or_else(|| Arc::new(WsConnector) as Arc<dyn Connector>),
            locator,
            pipeline: Arc::new(pipeline),
            me: self.me,
            runtime: Mutex::new(Runtime::default()),
        })
    }
}

#[derive(Default)]
struct Runtime {
    started: bool,
    handle: Option<SessionHandle>,
    task: Option<JoinHandle<Result<()>>>,
    /// Terminal session error not yet handed to anyone.
    failure: Option<GatewayError>,
    /// The session ended with an error, delivered or not.
    failed: bool,
}

pub struct KookBot {
    client_id: String,
    ticket: Arc<RwLock<Ticket>>,
    rest: RestClient,
    config: SessionConfig,
    connector: Arc<dyn Connector>,
    locator: Arc<dyn GatewayLocator>,
    pipeline: Arc<EventPipeline>,
    me: Arc<RwLock<Option<Me>>>,
    runtime: Mutex<Runtime>,
}

impl std::fmt::Debug for KookBot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KookBot")
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

impl KookBot {
    pub fn builder(ticket: Ticket) -> KookBotBuilder {
        let me: Arc<RwLock<Option<Me>>> = Arc::default();
        KookBotBuilder {
            ticket,
            rest: None,
            config: SessionConfig::default(),
            dispatch: None,
            connector: None,
            locator: None,
            pipeline: EventPipeline::builder().pre_processor(SelfIdentity {
                me: Arc::clone(&me),
            }),
            me,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn rest(&self) -> &RestClient {
        &self.rest
    }

    pub async fn ticket(&self) -> Ticket {
        self.ticket.read().await.clone()
    }

    pub async fn authorization(&self) -> String {
        self.ticket.read().await.authorization()
    }

    /// Connect and wait for the first `Connected` (or a terminal failure),
    /// then fetch the bot's own identity. A bot starts at most once; calling
    /// this again while it runs is a no-op.
    pub async fn start(&self) -> Result<()> {
        let handle = {
            let mut runtime = self.runtime.lock().await;
            if runtime.started {
                return match &runtime.handle {
                    Some(handle) if handle.state() != SessionState::Closed => Ok(()),
                    _ => Err(GatewayError::Closed),
                };
            }
            let (session, handle) = GatewaySession::new(
                self.client_id.clone(),
                self.config.clone(),
                Arc::clone(&self.locator),
                Arc::clone(&self.connector),
                Arc::clone(&self.pipeline),
            );
            runtime.started = true;
            runtime.handle = Some(handle.clone());
            runtime.task = Some(session.spawn());
            handle
        };
        info!(client_id = %self.client_id, "starting bot");

        let status = handle
            .wait_for(|s| matches!(s.state, SessionState::Connected | SessionState::Closed))
            .await;
        if status.state == SessionState::Closed {
            return Err(self.take_outcome().await.err().unwrap_or(GatewayError::Closed));
        }

        if let Err(e) = self.refresh_me().await {
            error!(client_id = %self.client_id, error = %e, "could not fetch bot identity, stopping");
            handle.cancel(CancelMode::Hard);
            let outcome = self.take_outcome().await;
            let mut runtime = self.runtime.lock().await;
            runtime.failed = true;
            if let Err(outcome) = outcome {
                warn!(client_id = %self.client_id, error = %outcome, "session ended with an error while stopping");
                runtime.failure = Some(outcome);
            }
            return Err(e);
        }
        Ok(())
    }

    /// Await the session task. An error outcome marks the runtime as failed
    /// so later [`join`](Self::join) calls do not report success.
    async fn take_outcome(&self) -> Result<()> {
        let task = self.runtime.lock().await.task.take();
        match task {
            Some(task) => self.take_outcome_of(task).await,
            None => Err(GatewayError::Closed),
        }
    }

    /// Cached identity, filled by [`start`](Self::start) and kept current by
    /// `user_updated` events.
    pub async fn me(&self) -> Option<Me> {
        self.me.read().await.clone()
    }

    pub async fn refresh_me(&self) -> Result<Me> {
        let me = self.rest.request_data(&GetMe, &self.authorization().await).await?;
        debug!(client_id = %self.client_id, user_id = %me.id, username = %me.username, "identity fetched");
        *self.me.write().await = Some(me.clone());
        Ok(me)
    }

    /// Mark the bot offline on the platform. The session is left alone.
    pub async fn offline(&self) -> Result<()> {
        self.rest
            .request_data(&Offline, &self.authorization().await)
            .await?;
        info!(client_id = %self.client_id, "bot offline");
        Ok(())
    }

    /// Swap the secret. Later REST calls and reconnects use the new token.
    pub async fn rotate_token(&self, token: impl Into<String>) {
        self.ticket.write().await.rotate_token(token);
        info!(client_id = %self.client_id, "token rotated");
    }

    pub async fn status(&self) -> SessionStatus {
        match &self.runtime.lock().await.handle {
            Some(handle) => handle.status(),
            None => SessionStatus::default(),
        }
    }

    pub async fn session(&self) -> Option<SessionHandle> {
        self.runtime.lock().await.handle.clone()
    }

    /// Stop the session and wait for it to wind down.
    pub async fn close(&self, mode: CancelMode) -> Result<()> {
        let (handle, task) = {
            let mut runtime = self.runtime.lock().await;
            (runtime.handle.clone(), runtime.task.take())
        };
        let Some(handle) = handle else {
            return Err(GatewayError::NotStarted);
        };
        handle.cancel(mode);
        match task {
            Some(task) => join_session(task).await,
            None => {
                handle.wait_for(|s| s.state == SessionState::Closed).await;
                Ok(())
            }
        }
    }

    /// Wait for the session to end on its own (terminal failure) or through
    /// [`close`](Self::close) from elsewhere.
    ///
    /// A terminal error is returned once. After a failed
    /// [`start`](Self::start), later calls get [`GatewayError::Closed`].
    pub async fn join(&self) -> Result<()> {
        let (handle, task) = {
            let mut runtime = self.runtime.lock().await;
            if let Some(failure) = runtime.failure.take() {
                return Err(failure);
            }
            if runtime.failed {
                return Err(GatewayError::Closed);
            }
            (runtime.handle.clone(), runtime.task.take())
        };
        match (task, handle) {
            (Some(task), _) => self.take_outcome_of(task).await,
            (None, Some(handle)) => {
                handle.wait_for(|s| s.state == SessionState::Closed).await;
                let runtime = self.runtime.lock().await;
                if runtime.failed {
                    return Err(GatewayError::Closed);
                }
                Ok(())
            }
            (None, None) => Err(GatewayError::NotStarted),
        }
    }

    async fn take_outcome_of(&self, task: JoinHandle<Result<()>>) -> Result<()> {
        let outcome = join_session(task).await;
        if outcome.is_err() {
            self.runtime.lock().await.failed = true;
        }
        outcome
    }
}

async fn join_session(task: JoinHandle<Result<()>>) -> Result<()> {
    match task.await {
        Ok(result) => result,
        Err(e) => {
            error!(error = %e, "session task failed");
            Err(GatewayError::Closed)
        }
    }
}

/// Keeps the cached [`Me`] current. Only system frames have their extra
/// decoded.
struct SelfIdentity {
    me: Arc<RwLock<Option<Me>>>,
}

#[async_trait]
impl EventProcessor for SelfIdentity {
    async fn process(&self, frame: Arc<EventFrame>) -> anyhow::Result<()> {
        if !frame.event.is_system() {
            return Ok(());
        }
        let Some(SystemEvent::UserUpdated(update)) = frame.event.extra().as_system() else {
            return Ok(());
        };
        let mut me = self.me.write().await;
        if let Some(me) = me.as_mut().filter(|me| me.id == update.user_id) {
            me.username = update.username.clone();
            me.avatar = update.avatar.clone();
            debug!(user_id = %me.id, username = %me.username, "self identity updated");
        }
        Ok(())
    }
}
