//! Speech backend driver: spawns whisper-server for a `local_speech`
//! descriptor.

use std::path::Path;
use std::process::Stdio;

use tokio::process::{Child, Command};

use crate::config::{expand_home, ModelDescriptor, Settings};
use crate::error::{Error, Result};

/// Launch whisper-server bound to `127.0.0.1:{desc.port}`.
pub fn spawn(desc: &ModelDescriptor, settings: &Settings) -> Result<Child> {
    let port = desc
        .port
        .ok_or_else(|| Error::ConfigInvalid(format!("model '{}' has no port", desc.id)))?;

    let binary = &settings.whisper_server_bin;
    let binary_path = Path::new(binary);
    if binary_path.is_absolute() && !binary_path.exists() {
        return Err(Error::ConfigInvalid(format!(
            "backend binary not found: {}",
            binary
        )));
    }

    let file = desc
        .file
        .as_ref()
        .ok_or_else(|| Error::ConfigInvalid(format!("speech model '{}' has no file", desc.id)))?;
    let model_path = expand_home(file);
    if !model_path.exists() {
        return Err(Error::ConfigInvalid(format!(
            "model file not found: {}",
            model_path.display()
        )));
    }

    let mut cmd = Command::new(binary);
    cmd.arg("--host")
        .arg("127.0.0.1")
        .arg("--port")
        .arg(port.to_string())
        .arg("-m")
        .arg(model_path)
        .arg("-l")
        .arg(desc.language.as_deref().unwrap_or("auto"));

    if let Some(threads) = desc.threads {
        cmd.arg("-t").arg(threads.to_string());
    }

    if !settings.gpu {
        cmd.arg("-ng");
    }

    cmd.stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);

    let child = cmd.spawn().map_err(|e| {
        Error::ConfigInvalid(format!(
            "failed to spawn {} for '{}': {}",
            binary, desc.id, e
        ))
    })?;

    tracing::info!(
        "Spawned whisper-server for {} on port {} (pid: {:?})",
        desc.id,
        port,
        child.id()
    );

    Ok(child)
}
