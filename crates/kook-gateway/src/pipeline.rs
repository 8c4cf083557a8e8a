//! Ordered dispatch of accepted frames.
//!
//! Pre-processors run inline, in registration order, and finish before the
//! session reads the next frame. Processors run afterwards according to the
//! [`DispatchPolicy`]: awaited inline (`Sequential`) or spawned per frame on
//! a [`TaskTracker`] (`Concurrent`). Errors and panics from either stage are
//! logged and never reach the session.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::FutureExt;
use kook_common::DispatchPolicy;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, warn};

use crate::event::EventFrame;

#[async_trait]
pub trait EventProcessor: Send + Sync {
    async fn process(&self, frame: Arc<EventFrame>) -> anyhow::Result<()>;
}

/// Adapts an async closure into an [`EventProcessor`].
pub fn processor_fn<F, Fut>(f: F) -> FnProcessor<F>
where
    F: Fn(Arc<EventFrame>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    FnProcessor(f)
}

pub struct FnProcessor<F>(F);

#[async_trait]
impl<F, Fut> EventProcessor for FnProcessor<F>
where
    F: Fn(Arc<EventFrame>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn process(&self, frame: Arc<EventFrame>) -> anyhow::Result<()> {
        (self.0)(frame).await
    }
}

/// How a session shutdown treats frames already handed to the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CancelMode {
    /// In-flight dispatch runs to completion.
    #[default]
    Soft,
    /// No further processor is invoked; running ones are dropped at their
    /// next await point.
    Hard,
}

type Chain = Arc<[Arc<dyn EventProcessor>]>;

#[derive(Default)]
pub struct EventPipelineBuilder {
    pre_processors: Vec<Arc<dyn EventProcessor>>,
    processors: Vec<Arc<dyn EventProcessor>>,
    policy: DispatchPolicy,
}

impl EventPipelineBuilder {
    pub fn pre_processor(mut self, processor: impl EventProcessor + 'static) -> Self {
        self.pre_processors.push(Arc::new(processor));
        self
    }

    pub fn processor(mut self, processor: impl EventProcessor + 'static) -> Self {
        self.processors.push(Arc::new(processor));
        self
    }

    pub fn policy(mut self, policy: DispatchPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn build(self) -> EventPipeline {
        EventPipeline {
            pre_processors: self.pre_processors.into(),
            processors: self.processors.into(),
            policy: self.policy,
            tracker: TaskTracker::new(),
            hard: CancellationToken::new(),
        }
    }
}

pub struct EventPipeline {
    pre_processors: Chain,
    processors: Chain,
    policy: DispatchPolicy,
    tracker: TaskTracker,
    hard: CancellationToken,
}

impl EventPipeline {
    pub fn builder() -> EventPipelineBuilder {
        EventPipelineBuilder::default()
    }

    pub fn policy(&self) -> DispatchPolicy {
        self.policy
    }

    /// Run one frame through both stages. Returns once the pre-processors are
    /// done and, under `Sequential`, once the processors are done too.
    pub async fn dispatch(&self, frame: Arc<EventFrame>) {
        if self.hard.is_cancelled() {
            return;
        }

        for (index, pre) in self.pre_processors.iter().enumerate() {
            if self.hard.is_cancelled() {
                return;
            }
            match AssertUnwindSafe(pre.process(Arc::clone(&frame)))
                .catch_unwind()
                .await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(sn = frame.sn, index, error = %e, "pre-processor failed, skipping the rest");
                    break;
                }
                Err(_) => {
                    error!(sn = frame.sn, index, "pre-processor panicked, skipping the rest");
                    break;
                }
            }
        }

        if self.processors.is_empty() {
            return;
        }
        match self.policy {
            DispatchPolicy::Sequential => {
                run_chain(&self.processors, frame, &self.hard).await;
            }
            DispatchPolicy::Concurrent => {
                let processors = Arc::clone(&self.processors);
                let hard = self.hard.clone();
                self.tracker.spawn(async move {
                    run_chain(&processors, frame, &hard).await;
                });
            }
        }
    }

    /// Stop invoking processors for frames already handed over.
    pub fn abort_in_flight(&self) {
        self.hard.cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.hard.is_cancelled()
    }

    /// Wait for every spawned chain to finish (or be dropped, after
    /// [`abort_in_flight`](Self::abort_in_flight)).
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }

    pub async fn shutdown(&self, mode: CancelMode) {
        if mode == CancelMode::Hard {
            self.abort_in_flight();
        }
        self.drain().await;
    }
}

async fn run_chain(processors: &[Arc<dyn EventProcessor>], frame: Arc<EventFrame>, hard: &CancellationToken) {
    for (index, processor) in processors.iter().enumerate() {
        let outcome = tokio::select! {
            _ = hard.cancelled() => return,
            outcome = AssertUnwindSafe(processor.process(Arc::clone(&frame))).catch_unwind() => outcome,
        };
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(sn = frame.sn, index, error = %e, "processor failed"),
            Err(_) => error!(sn = frame.sn, index, "processor panicked"),
        }
    }
}
