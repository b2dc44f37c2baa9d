//! LOLS Gateway - multiplexes one GPU across local and remote inference
//! backends behind an OpenAI-compatible API.

use std::env;
use std::sync::Arc;
use std::time::Duration;

use lols_gateway::backend::{self, sweep};
use lols_gateway::routes::audio;
use lols_gateway::{app, AppState, Settings};
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// How long the classifier gets to come up before routing degrades.
const CLASSIFIER_BOOT_DEADLINE: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();
    if args.iter().any(|a| a == "--version" || a == "-V") {
        println!("lols-gateway {}", VERSION);
        return Ok(());
    }

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config_path = args
        .get(1)
        .cloned()
        .or_else(|| env::var("LOLS_CONFIG").ok())
        .unwrap_or_else(|| "lols.json".to_string());
    let settings = Arc::new(Settings::load(&config_path).map_err(|e| {
        format!(
            "Failed to load configuration from {}: {}. \
             Pass a config path as the first argument or set LOLS_CONFIG.",
            config_path, e
        )
    })?);

    tracing::info!(
        "Starting lols-gateway with {} models, {} categories",
        settings.models.len(),
        settings.categories.len()
    );

    // A crashed predecessor may still hold configured ports; clear them,
    // sparing the classifier so it can be re-adopted below.
    let swept = sweep::terminate_stale_backends(&settings);
    let cleared = swept.iter().filter(|r| r.terminated).count();
    if cleared > 0 {
        tracing::info!("Cleared {} stale backend process(es)", cleared);
    }

    let state = AppState::new(settings.clone());

    boot_classifier(&state).await;

    // Orphaned audio uploads are swept for as long as we run.
    tokio::spawn(async {
        let mut ticker = tokio::time::interval(audio::SWEEP_INTERVAL);
        loop {
            ticker.tick().await;
            let removed = audio::sweep_stale_uploads();
            if removed > 0 {
                tracing::info!("Swept {} stale audio uploads", removed);
            }
        }
    });

    let addr = format!("{}:{}", settings.host, settings.port);
    tracing::info!("Listening on {}", addr);

    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, app(state)).await?;

    Ok(())
}

/// Bring up the permanently resident classifier backend. Adoption of a
/// survivor from a previous run is preferred over spawning. Failure is not
/// fatal: the router then always answers `default`.
async fn boot_classifier(state: &Arc<AppState>) {
    let Some(router_cfg) = state.settings.router.clone() else {
        tracing::info!("No classifier configured; alias requests route to 'default'");
        return;
    };

    // Validated at load: the router model exists and is local_text.
    let mut desc = state
        .settings
        .descriptor(&router_cfg.model_id)
        .expect("router model validated at load")
        .clone();
    desc.port = Some(router_cfg.port);
    if router_cfg.context.is_some() {
        desc.context = router_cfg.context;
    }

    if backend::is_up(&state.http, router_cfg.port, backend::TEXT_READY_PATH).await {
        tracing::info!(
            "Adopting running classifier on port {} ({})",
            router_cfg.port,
            router_cfg.model_id
        );
        state.router.set_classifier_up(true);
        return;
    }

    let child = match backend::llama::spawn(&desc, &state.settings) {
        Ok(child) => child,
        Err(e) => {
            tracing::warn!("Classifier spawn failed, degrading to 'default': {}", e);
            return;
        }
    };
    let pid = child.id();
    *state.classifier_proc.lock().await = Some(child);

    match backend::wait_ready(
        &state.http,
        router_cfg.port,
        backend::TEXT_READY_PATH,
        CLASSIFIER_BOOT_DEADLINE,
    )
    .await
    {
        Ok(()) => {
            if let Some(pid) = pid {
                state
                    .orchestrator
                    .register_process(
                        pid,
                        router_cfg.model_id.clone(),
                        router_cfg.port,
                        Some("router".to_string()),
                    )
                    .await;
            }
            state.router.set_classifier_up(true);
            tracing::info!(
                "Classifier {} ready on port {}",
                router_cfg.model_id,
                router_cfg.port
            );
        }
        Err(e) => {
            tracing::warn!("Classifier not ready, degrading to 'default': {}", e);
        }
    }
}
