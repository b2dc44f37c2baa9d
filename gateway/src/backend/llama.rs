//! Text backend driver: spawns llama-server for a `local_text` descriptor.

use std::path::Path;
use std::process::Stdio;

use tokio::process::{Child, Command};

use crate::config::{expand_home, ModelDescriptor, Settings};
use crate::error::{Error, Result};

/// Launch llama-server bound to `127.0.0.1:{desc.port}`.
///
/// Fails fast when the server binary or a referenced model file is missing;
/// repo-referenced models are left to the backend's own download path.
pub fn spawn(desc: &ModelDescriptor, settings: &Settings) -> Result<Child> {
    let port = desc
        .port
        .ok_or_else(|| Error::ConfigInvalid(format!("model '{}' has no port", desc.id)))?;

    let binary = &settings.llama_server_bin;
    check_binary(binary)?;

    let mut cmd = Command::new(binary);
    cmd.arg("--host")
        .arg("127.0.0.1")
        .arg("--port")
        .arg(port.to_string());

    match (&desc.repo, &desc.file) {
        (Some(repo), Some(file)) => {
            cmd.arg("--hf-repo").arg(repo).arg("--hf-file").arg(file);
        }
        (Some(repo), None) => {
            cmd.arg("--hf-repo").arg(repo);
        }
        (None, Some(file)) => {
            let path = expand_home(file);
            if !path.exists() {
                return Err(Error::ConfigInvalid(format!(
                    "model file not found: {}",
                    path.display()
                )));
            }
            cmd.arg("-m").arg(path);
        }
        (None, None) => {
            return Err(Error::ConfigInvalid(format!(
                "model '{}' has neither repo nor file",
                desc.id
            )));
        }
    }

    if let Some(mmproj) = &desc.mmproj {
        cmd.arg("--mmproj").arg(expand_home(mmproj));
    }

    if let Some(context) = desc.context {
        cmd.arg("-c").arg(context.to_string());
        // Pin the advertised context length to what we actually allocate.
        cmd.arg("--override-kv")
            .arg(format!("llama.context_length=int:{}", context));
    }

    if settings.gpu {
        cmd.arg("-ngl").arg("999");
        if let Some(device) = &settings.gpu_device {
            cmd.arg("--device").arg(device);
        }
    } else {
        cmd.arg("-ngl").arg("0");
    }

    if let Some(t) = desc.temperature {
        cmd.arg("--temp").arg(t.to_string());
    }
    if let Some(p) = desc.top_p {
        cmd.arg("--top-p").arg(p.to_string());
    }
    if let Some(k) = desc.top_k {
        cmd.arg("--top-k").arg(k.to_string());
    }
    if let Some(p) = desc.min_p {
        cmd.arg("--min-p").arg(p.to_string());
    }
    if let Some(p) = desc.repeat_penalty {
        cmd.arg("--repeat-penalty").arg(p.to_string());
    }

    if let Some(perf) = &desc.performance {
        if perf.flash_attention == Some(true) {
            cmd.arg("-fa");
        }
        if let Some(b) = perf.batch_size {
            cmd.arg("-b").arg(b.to_string());
        }
        if let Some(ub) = perf.ubatch_size {
            cmd.arg("-ub").arg(ub.to_string());
        }
        if let Some(t) = perf.threads {
            cmd.arg("-t").arg(t.to_string());
        }
        if let Some(np) = perf.parallel {
            cmd.arg("-np").arg(np.to_string());
        }
        if perf.cont_batching == Some(true) {
            cmd.arg("--cont-batching");
        }
        if let Some(k) = &perf.cache_type_k {
            cmd.arg("--cache-type-k").arg(k);
        }
        if let Some(v) = &perf.cache_type_v {
            cmd.arg("--cache-type-v").arg(v);
        }
    }

    // Backend logs go to our console; the child dies with us.
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
        "Spawned llama-server for {} on port {} (pid: {:?})",
        desc.id,
        port,
        child.id()
    );

    Ok(child)
}

/// A relative binary name is resolved through PATH by the OS; only absolute
/// paths are checked here.
fn check_binary(binary: &str) -> Result<()> {
    let path = Path::new(binary);
    if path.is_absolute() && !path.exists() {
        return Err(Error::ConfigInvalid(format!(
            "backend binary not found: {}",
            binary
        )));
    }
    Ok(())
}
