//! Single-GPU model orchestrator.
//!
//! Owns the one resident local backend. `ensure_loaded` is only ever called
//! inside [`crate::gpu::GpuLock::with_gpu`], so resident transitions are
//! serial; the RwLocks here exist for the read-side accessors used by status
//! and telemetry paths.

use std::collections::HashMap;

use lols_common::{ModelKind, ModelSnapshot};
use tokio::process::Child;
use tokio::sync::RwLock;

use crate::backend;
use crate::config::{ModelDescriptor, Settings};
use crate::error::Result;
use crate::events::EventBus;

/// The backend (or remote marker) currently selected for the GPU.
pub struct ResidentModel {
    pub model_id: String,
    pub kind: ModelKind,
    pub port: Option<u16>,
    /// True when this process spawned the backend. Adopted backends are never
    /// stopped by us.
    pub owned: bool,
    handle: Option<Child>,
    pub descriptor: ModelDescriptor,
}

/// Read-only view of the resident, safe to hand out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResidentView {
    pub model_id: String,
    pub kind: ModelKind,
    pub port: Option<u16>,
    pub owned: bool,
}

#[derive(Default)]
struct ResidentState {
    resident: Option<ResidentModel>,
    /// A local backend shadowed by a remote selection. Remote requests share
    /// the GPU with it, so it keeps running until a local switch evicts it.
    parked: Option<ResidentModel>,
}

/// Labeling of GPU-resident processes for telemetry consumers. Entries are
/// inserted on load and never removed on eviction; stale pids are tolerated.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryEntry {
    pub model_id: String,
    pub port: u16,
    pub category: Option<String>,
}

pub struct Orchestrator {
    settings: std::sync::Arc<Settings>,
    state: RwLock<ResidentState>,
    registry: RwLock<HashMap<u32, RegistryEntry>>,
    events: EventBus,
    http: reqwest::Client,
}

impl Orchestrator {
    pub fn new(settings: std::sync::Arc<Settings>, events: EventBus) -> Self {
        Self {
            settings,
            state: RwLock::new(ResidentState::default()),
            registry: RwLock::new(HashMap::new()),
            events,
            http: reqwest::Client::new(),
        }
    }

    /// Make `desc` the resident model. Caller must hold the GPU lock.
    ///
    /// Remote descriptors only update the logical marker; nothing is evicted
    /// and no process is touched. Local descriptors evict an owned resident,
    /// adopt an already-listening process on the configured port, or cold
    /// load a fresh one.
    pub async fn ensure_loaded(&self, desc: &ModelDescriptor) -> Result<()> {
        if desc.kind == ModelKind::RemoteHttp {
            let mut state = self.state.write().await;
            if let Some(old) = state.resident.take() {
                if old.kind.is_local() {
                    state.parked = Some(old);
                }
            }
            state.resident = Some(ResidentModel {
                model_id: desc.id.clone(),
                kind: desc.kind,
                port: None,
                owned: false,
                handle: None,
                descriptor: desc.clone(),
            });
            drop(state);
            self.emit_model_status().await;
            return Ok(());
        }

        let port = desc.port.expect("local descriptor validated at load");
        let ready_path = ready_path(desc.kind);

        // Already resident: no-op.
        {
            let state = self.state.read().await;
            if let Some(current) = state.resident.as_ref() {
                if current.kind.is_local() && current.model_id == desc.id {
                    return Ok(());
                }
            }
        }

        // A backend parked behind a remote marker comes straight back.
        {
            let mut state = self.state.write().await;
            if state
                .parked
                .as_ref()
                .map(|p| p.model_id == desc.id)
                .unwrap_or(false)
            {
                state.resident = state.parked.take();
                drop(state);
                self.emit_model_status().await;
                return Ok(());
            }
        }

        // Evict. Only owned processes are stopped; adopted ones are left to
        // their external owner and merely forgotten.
        {
            let mut state = self.state.write().await;
            let evicted: Vec<ResidentModel> = state
                .resident
                .take()
                .into_iter()
                .chain(state.parked.take())
                .collect();
            drop(state);
            for mut old in evicted {
                if old.owned {
                    if let Some(mut child) = old.handle.take() {
                        tracing::info!("Evicting {} to load {}", old.model_id, desc.id);
                        backend::stop(&mut child).await;
                    }
                }
            }
        }

        // Adopt a compatible process already holding the port.
        if backend::is_up(&self.http, port, ready_path).await {
            tracing::info!("Adopting running backend for {} on port {}", desc.id, port);
            let mut state = self.state.write().await;
            state.resident = Some(ResidentModel {
                model_id: desc.id.clone(),
                kind: desc.kind,
                port: Some(port),
                owned: false,
                handle: None,
                descriptor: desc.clone(),
            });
            drop(state);
            self.emit_model_status().await;
            return Ok(());
        }

        // Cold load.
        let mut child = match desc.kind {
            ModelKind::LocalText => backend::llama::spawn(desc, &self.settings)?,
            ModelKind::LocalSpeech => backend::whisper::spawn(desc, &self.settings)?,
            ModelKind::RemoteHttp => unreachable!("handled above"),
        };
        let pid = child.id();

        if let Err(e) =
            backend::wait_ready(&self.http, port, ready_path, backend::COLD_LOAD_DEADLINE).await
        {
            tracing::error!("Cold load of {} failed: {}", desc.id, e);
            backend::stop(&mut child).await;
            // Resident stays cleared; the next request retries from eviction.
            return Err(e);
        }

        if let Some(pid) = pid {
            let category = match desc.kind {
                ModelKind::LocalSpeech => Some("transcription".to_string()),
                _ => None,
            };
            self.register_process(pid, desc.id.clone(), port, category)
                .await;
        }

        let mut state = self.state.write().await;
        state.resident = Some(ResidentModel {
            model_id: desc.id.clone(),
            kind: desc.kind,
            port: Some(port),
            owned: true,
            handle: Some(child),
            descriptor: desc.clone(),
        });
        drop(state);
        self.emit_model_status().await;
        Ok(())
    }

    /// Port of the resident local backend, if any.
    pub async fn current_port(&self) -> Option<u16> {
        self.state
            .read()
            .await
            .resident
            .as_ref()
            .and_then(|r| r.port)
    }

    pub async fn current_model(&self) -> Option<ResidentView> {
        self.state.read().await.resident.as_ref().map(|r| ResidentView {
            model_id: r.model_id.clone(),
            kind: r.kind,
            port: r.port,
            owned: r.owned,
        })
    }

    /// Drop (and stop, when owned) any local backend we track. Used by the
    /// cleanup endpoint; caller must hold the GPU lock.
    pub async fn clear_local_resident(&self) {
        let mut state = self.state.write().await;
        let mut evicted = Vec::new();
        if state
            .resident
            .as_ref()
            .map(|r| r.kind.is_local())
            .unwrap_or(false)
        {
            evicted.extend(state.resident.take());
        }
        evicted.extend(state.parked.take());
        drop(state);

        let any = !evicted.is_empty();
        for mut old in evicted {
            if old.owned {
                if let Some(mut child) = old.handle.take() {
                    backend::stop(&mut child).await;
                }
            }
        }
        if any {
            self.emit_model_status().await;
        }
    }

    /// Record a spawned backend pid for telemetry labeling.
    pub async fn register_process(
        &self,
        pid: u32,
        model_id: String,
        port: u16,
        category: Option<String>,
    ) {
        self.registry.write().await.insert(
            pid,
            RegistryEntry {
                model_id,
                port,
                category,
            },
        );
    }

    /// Best-effort category tag on registry entries matching a model id.
    pub async fn tag_category(&self, model_id: &str, category: &str) {
        let mut registry = self.registry.write().await;
        for entry in registry.values_mut() {
            if entry.model_id == model_id || entry.model_id.contains(model_id) {
                entry.category = Some(category.to_string());
            }
        }
    }

    pub async fn registry_snapshot(&self) -> HashMap<u32, RegistryEntry> {
        self.registry.read().await.clone()
    }

    /// Current resident as a `modelStatus` event, also sent to fresh
    /// WebSocket subscribers.
    pub async fn model_status_event(&self) -> lols_common::StatusEvent {
        let state = self.state.read().await;
        match state.resident.as_ref() {
            Some(r) => lols_common::StatusEvent::ModelStatus {
                model_id: Some(r.model_id.clone()),
                kind: Some(r.kind),
                port: r.port,
                snapshot: ModelSnapshot {
                    context: r.descriptor.context,
                    system_prompt: r.descriptor.resolved_system_prompt(),
                    max_tokens: r.descriptor.max_tokens,
                    timeout: r.descriptor.timeout,
                    temperature: r.descriptor.temperature,
                    top_p: r.descriptor.top_p,
                },
            },
            None => lols_common::StatusEvent::ModelStatus {
                model_id: None,
                kind: None,
                port: None,
                snapshot: ModelSnapshot::default(),
            },
        }
    }

    async fn emit_model_status(&self) {
        let event = self.model_status_event().await;
        self.events.publish(event);
    }
}

fn ready_path(kind: ModelKind) -> &'static str {
    match kind {
        ModelKind::LocalSpeech => backend::SPEECH_READY_PATH,
        _ => backend::TEXT_READY_PATH,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lols_common::StatusEvent;
    use std::sync::Arc;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn settings_with(models: serde_json::Value) -> Arc<Settings> {
        Arc::new(
            serde_json::from_value::<Settings>(serde_json::json!({ "models": models }))
                .unwrap()
                .finish()
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_remote_sets_marker_without_eviction() {
        let settings = settings_with(serde_json::json!({
            "cloud": {
                "kind": "remote_http",
                "endpoint": "https://api.example.com/v1/chat/completions",
                "model": "big"
            }
        }));
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let orch = Orchestrator::new(settings.clone(), events);

        let desc = settings.descriptor("cloud").unwrap().clone();
        orch.ensure_loaded(&desc).await.unwrap();

        let view = orch.current_model().await.unwrap();
        assert_eq!(view.model_id, "cloud");
        assert_eq!(view.kind, ModelKind::RemoteHttp);
        assert_eq!(view.port, None);
        assert!(!view.owned);

        // No registry entry is attributable to a remote selection.
        assert!(orch.registry_snapshot().await.is_empty());

        match rx.recv().await.unwrap() {
            StatusEvent::ModelStatus { model_id, .. } => {
                assert_eq!(model_id.as_deref(), Some("cloud"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_adoption_of_listening_port() {
        // A "backend" is already answering /v1/models on the configured port.
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        let port = server.address().port();

        let settings = settings_with(serde_json::json!({
            "adopted": {
                "kind": "local_text",
                "port": port,
                "file": "/nonexistent/never-spawned.gguf"
            }
        }));
        let orch = Orchestrator::new(settings.clone(), EventBus::new());

        let desc = settings.descriptor("adopted").unwrap().clone();
        // The model file does not exist, so a spawn attempt would fail; the
        // adoption path must succeed without ever spawning.
        orch.ensure_loaded(&desc).await.unwrap();

        let view = orch.current_model().await.unwrap();
        assert_eq!(view.model_id, "adopted");
        assert!(!view.owned);
        assert_eq!(view.port, Some(port));
    }

    #[tokio::test]
    async fn test_same_model_is_noop() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1) // a second ensure_loaded must not probe again
            .mount(&server)
            .await;
        let port = server.address().port();

        let settings = settings_with(serde_json::json!({
            "adopted": {
                "kind": "local_text",
                "port": port,
                "file": "/nonexistent/never-spawned.gguf"
            }
        }));
        let orch = Orchestrator::new(settings.clone(), EventBus::new());
        let desc = settings.descriptor("adopted").unwrap().clone();

        orch.ensure_loaded(&desc).await.unwrap();
        orch.ensure_loaded(&desc).await.unwrap();
    }

    #[tokio::test]
    async fn test_local_survives_remote_selection() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1) // only the first local selection probes; the second restores the parked backend
            .mount(&server)
            .await;
        let port = server.address().port();

        let settings = settings_with(serde_json::json!({
            "local": {
                "kind": "local_text",
                "port": port,
                "file": "/nonexistent.gguf"
            },
            "cloud": {
                "kind": "remote_http",
                "endpoint": "https://api.example.com/v1",
                "model": "big"
            }
        }));
        let orch = Orchestrator::new(settings.clone(), EventBus::new());

        let local = settings.descriptor("local").unwrap().clone();
        let cloud = settings.descriptor("cloud").unwrap().clone();

        orch.ensure_loaded(&local).await.unwrap();
        orch.ensure_loaded(&cloud).await.unwrap();
        assert_eq!(orch.current_model().await.unwrap().model_id, "cloud");

        // Back to the local model without re-probing or reloading.
        orch.ensure_loaded(&local).await.unwrap();
        assert_eq!(orch.current_model().await.unwrap().model_id, "local");
    }

    #[tokio::test]
    async fn test_failed_cold_load_clears_resident() {
        let settings = settings_with(serde_json::json!({
            "broken": {
                "kind": "local_text",
                "port": 9,
                "file": "/nonexistent/model.gguf"
            }
        }));
        let orch = Orchestrator::new(settings.clone(), EventBus::new());
        let desc = settings.descriptor("broken").unwrap().clone();

        assert!(orch.ensure_loaded(&desc).await.is_err());
        assert!(orch.current_model().await.is_none());
    }

    #[tokio::test]
    async fn test_tag_category_updates_matching_entries() {
        let settings = settings_with(serde_json::json!({}));
        let orch = Orchestrator::new(settings, EventBus::new());

        orch.register_process(100, "coder-v2".to_string(), 9000, None)
            .await;
        orch.register_process(101, "other".to_string(), 9001, None)
            .await;

        orch.tag_category("coder-v2", "code").await;

        let registry = orch.registry_snapshot().await;
        assert_eq!(registry[&100].category.as_deref(), Some("code"));
        assert_eq!(registry[&101].category, None);
    }
}
