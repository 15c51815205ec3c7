//! Background work that request handlers and the execution loop hand off instead of awaiting.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{mpsc, Notify};
use tracing::Level;

use mctl_observability::{emit_event, ObservabilityEvent, ProcessKind};

use crate::{EventBus, Notification};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SideEffect {
    Orchestrate { task_id: String },
    /// A task completed; check whether its parent can be synthesized.
    FanIn { task_id: String },
    FanInParent { parent_id: String },
    Replan { insight_id: String },
    Notify { notification: Notification },
    /// Archive and broadcast a finished master report.
    Deliver { task_id: String },
}

impl SideEffect {
    pub fn kind(&self) -> &'static str {
        match self {
            SideEffect::Orchestrate { .. } => "orchestrate",
            SideEffect::FanIn { .. } => "fan_in",
            SideEffect::FanInParent { .. } => "fan_in_parent",
            SideEffect::Replan { .. } => "replan",
            SideEffect::Notify { .. } => "notify",
            SideEffect::Deliver { .. } => "deliver",
        }
    }

    fn subject(&self) -> &str {
        match self {
            SideEffect::Orchestrate { task_id }
            | SideEffect::FanIn { task_id }
            | SideEffect::Deliver { task_id } => task_id,
            SideEffect::FanInParent { parent_id } => parent_id,
            SideEffect::Replan { insight_id } => insight_id,
            SideEffect::Notify { notification } => notification.task_id.as_deref().unwrap_or(""),
        }
    }
}

#[async_trait]
pub trait SideEffectHandler: Send + Sync {
    async fn handle(&self, effect: &SideEffect) -> anyhow::Result<()>;
}

/// Counts background jobs that have not finished yet, including queued side effects and
/// spawned engine runs.
#[derive(Clone, Default)]
pub struct InFlight {
    inner: Arc<InFlightInner>,
}

#[derive(Default)]
struct InFlightInner {
    count: AtomicUsize,
    idle: Notify,
}

pub struct InFlightGuard {
    inner: Arc<InFlightInner>,
}

impl InFlight {
    pub fn enter(&self) -> InFlightGuard {
        self.inner.count.fetch_add(1, Ordering::SeqCst);
        InFlightGuard {
            inner: self.inner.clone(),
        }
    }

    pub fn count(&self) -> usize {
        self.inner.count.load(Ordering::SeqCst)
    }

    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.count() == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.inner.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}

struct Queued {
    effect: SideEffect,
    guard: InFlightGuard,
}

#[derive(Clone)]
pub struct SideEffectQueue {
    tx: mpsc::UnboundedSender<Queued>,
    in_flight: InFlight,
}

pub struct SideEffectReceiver {
    rx: mpsc::UnboundedReceiver<Queued>,
}

impl SideEffectQueue {
    pub fn channel() -> (Self, SideEffectReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                in_flight: InFlight::default(),
            },
            SideEffectReceiver { rx },
        )
    }

    pub fn in_flight(&self) -> &InFlight {
        &self.in_flight
    }

    pub fn enqueue(&self, effect: SideEffect) {
        tracing::debug!(kind = effect.kind(), subject = effect.subject(), "side effect queued");
        let queued = Queued {
            effect,
            guard: self.in_flight.enter(),
        };
        if let Err(err) = self.tx.send(queued) {
            tracing::error!(
                kind = err.0.effect.kind(),
                "side-effect worker is gone; dropping effect"
            );
        }
    }
}

/// Drains the queue, running every effect on its own task with bounded retries.
pub fn spawn_side_effect_worker(
    receiver: SideEffectReceiver,
    handler: Arc<dyn SideEffectHandler>,
    bus: EventBus,
    max_attempts: u32,
) -> tokio::task::JoinHandle<()> {
    let SideEffectReceiver { mut rx } = receiver;
    tokio::spawn(async move {
        while let Some(Queued { effect, guard }) = rx.recv().await {
            let handler = handler.clone();
            let bus = bus.clone();
            tokio::spawn(async move {
                run_with_retries(&effect, handler.as_ref(), &bus, max_attempts.max(1)).await;
                drop(guard);
            });
        }
    })
}

async fn run_with_retries(
    effect: &SideEffect,
    handler: &dyn SideEffectHandler,
    bus: &EventBus,
    max_attempts: u32,
) {
    let mut attempt = 1;
    loop {
        match handler.handle(effect).await {
            Ok(()) => return,
            Err(err) if attempt < max_attempts => {
                tracing::warn!(
                    kind = effect.kind(),
                    attempt,
                    "side effect failed, retrying: {err:#}"
                );
                tokio::time::sleep(backoff(attempt)).await;
                attempt += 1;
            }
            Err(err) => {
                let detail = format!("{err:#}");
                emit_event(
                    Level::ERROR,
                    ProcessKind::Engine,
                    ObservabilityEvent::new("side_effects", "side_effect.failed")
                        .task(effect.subject())
                        .status(effect.kind())
                        .error_code("SIDE_EFFECT_FAILED")
                        .detail(&detail),
                );
                bus.emit(
                    "side_effect.failed",
                    json!({
                        "kind": effect.kind(),
                        "subject": effect.subject(),
                        "attempts": attempt,
                        "error": detail,
                    }),
                );
                return;
            }
        }
    }
}

fn backoff(attempt: u32) -> Duration {
    Duration::from_millis(50u64.saturating_mul(1 << attempt.min(6)))
}
