use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use mctl_core::MissionControl;

mod http;
mod webhook;

pub use http::{app_router, serve};
pub use webhook::{parse_telegram_update, InboundMessage};

/// Shared state handed to every route.
#[derive(Clone)]
pub struct AppState {
    mission: MissionControl,
    ready: Arc<AtomicBool>,
    started_at_ms: u64,
}

impl AppState {
    pub fn new(mission: MissionControl) -> Self {
        Self {
            mission,
            ready: Arc::new(AtomicBool::new(true)),
            started_at_ms: now_ms(),
        }
    }

    pub fn mission(&self) -> &MissionControl {
        &self.mission
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Relaxed);
    }

    pub fn uptime_ms(&self) -> u64 {
        now_ms().saturating_sub(self.started_at_ms)
    }
}

impl Deref for AppState {
    type Target = MissionControl;

    fn deref(&self) -> &Self::Target {
        &self.mission
    }
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
