//! Backend process drivers.
//!
//! Each local model is served by an external inference server process bound
//! to `127.0.0.1:<port>`. The text variant spawns llama-server, the speech
//! variant whisper-server; both share the stop/readiness contract here.

pub mod llama;
pub mod sweep;
pub mod whisper;

use std::time::{Duration, Instant};

use tokio::process::Child;

use crate::error::{Error, Result};

/// Readiness poll cadence.
pub const READY_POLL_INTERVAL: Duration = Duration::from_millis(150);
/// Grace period between SIGTERM and SIGKILL.
pub const STOP_GRACE: Duration = Duration::from_secs(30);
/// Cold-load deadline; generous because a first use may download the model.
pub const COLD_LOAD_DEADLINE: Duration = Duration::from_secs(300);
/// Single-shot liveness probe timeout.
const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Readiness endpoint of the text backend.
pub const TEXT_READY_PATH: &str = "/v1/models";
/// Readiness endpoint of the speech backend.
pub const SPEECH_READY_PATH: &str = "/health";

/// Poll `http://127.0.0.1:{port}{path}` until it answers with a success
/// status or the deadline expires.
pub async fn wait_ready(
    client: &reqwest::Client,
    port: u16,
    path: &str,
    deadline: Duration,
) -> Result<()> {
    let url = format!("http://127.0.0.1:{}{}", port, path);
    let start = Instant::now();

    loop {
        if start.elapsed() > deadline {
            return Err(Error::ColdStartTimeout {
                port,
                waited_secs: start.elapsed().as_secs(),
            });
        }

        if let Ok(resp) = client
            .get(&url)
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
        {
            if resp.status().is_success() {
                tracing::debug!("Backend on port {} ready after {:?}", port, start.elapsed());
                return Ok(());
            }
        }

        tokio::time::sleep(READY_POLL_INTERVAL).await;
    }
}

/// Single-shot liveness predicate.
pub async fn is_up(client: &reqwest::Client, port: u16, path: &str) -> bool {
    let url = format!("http://127.0.0.1:{}{}", port, path);
    match client.get(&url).timeout(PROBE_TIMEOUT).send().await {
        Ok(resp) => resp.status().is_success(),
        Err(_) => false,
    }
}

/// Terminate a backend process: SIGTERM, then SIGKILL after [`STOP_GRACE`].
/// Idempotent; an already-exited child is reaped quietly.
pub async fn stop(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = child.id() {
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }
    }
    #[cfg(not(unix))]
    {
        let _ = child.start_kill();
    }

    match tokio::time::timeout(STOP_GRACE, child.wait()).await {
        Ok(Ok(status)) => {
            tracing::debug!("Backend exited with {}", status);
        }
        Ok(Err(e)) => {
            tracing::warn!("Error waiting for backend exit: {}", e);
        }
        Err(_) => {
            tracing::warn!("Backend ignored SIGTERM for {:?}, killing", STOP_GRACE);
            let _ = child.kill().await;
        }
    }
}
