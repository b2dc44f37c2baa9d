//! Shared application state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use crate::classify::Router;
use crate::config::Settings;
use crate::events::EventBus;
use crate::gpu::GpuLock;
use crate::orchestrator::Orchestrator;

/// Process-wide mutable scalars. Writes are rare (debug endpoints); reads are
/// unsynchronized against them by design.
#[derive(Default)]
pub struct Flags {
    /// Debug override: when set, every chat request routes here.
    pub test_model: RwLock<Option<String>>,
    /// Gates `log` events on the status channel.
    pub log_requests: AtomicBool,
    /// When true, client-sent system-role messages are stripped.
    pub ignore_role_system: AtomicBool,
}

impl Flags {
    pub fn test_model(&self) -> Option<String> {
        self.test_model.read().expect("flags lock poisoned").clone()
    }

    pub fn set_test_model(&self, value: Option<String>) {
        *self.test_model.write().expect("flags lock poisoned") = value;
    }

    pub fn logging_enabled(&self) -> bool {
        self.log_requests.load(Ordering::Relaxed)
    }

    pub fn set_logging(&self, on: bool) {
        self.log_requests.store(on, Ordering::Relaxed);
    }

    pub fn ignore_role_system(&self) -> bool {
        self.ignore_role_system.load(Ordering::Relaxed)
    }
}

/// Shared application state passed to all handlers.
pub struct AppState {
    pub settings: Arc<Settings>,
    pub http: reqwest::Client,
    pub gpu: GpuLock,
    pub orchestrator: Arc<Orchestrator>,
    pub router: Arc<Router>,
    pub events: EventBus,
    pub flags: Arc<Flags>,
    /// Unix timestamp reported as `created` on `/v1/models`.
    pub started_at: i64,
    /// Keeps the spawned classifier child alive (and reaped on exit).
    pub classifier_proc: tokio::sync::Mutex<Option<tokio::process::Child>>,
}

impl AppState {
    pub fn new(settings: Arc<Settings>) -> Arc<Self> {
        let events = EventBus::new();
        let flags = Arc::new(Flags::default());
        flags
            .ignore_role_system
            .store(settings.ignore_role_system, Ordering::Relaxed);

        let orchestrator = Arc::new(Orchestrator::new(settings.clone(), events.clone()));
        let router = Arc::new(Router::new(settings.clone(), flags.clone()));

        Arc::new(Self {
            settings,
            http: reqwest::Client::new(),
            gpu: GpuLock::new(),
            orchestrator,
            router,
            events,
            flags,
            started_at: chrono::Utc::now().timestamp(),
            classifier_proc: tokio::sync::Mutex::new(None),
        })
    }

    /// Trace line on the status channel, honored only while the toggle is on.
    pub fn trace(&self, message: impl Into<String>) {
        if self.flags.logging_enabled() {
            self.events.publish(lols_common::StatusEvent::Log {
                message: message.into(),
            });
        }
    }
}
