//! Residual backend cleanup.
//!
//! A previous gateway run (or a crashed one) can leave inference servers
//! holding the GPU. The boot sweep kills every process running a known
//! backend binary, sparing only the classifier port; the `/v1/cleanup`
//! endpoint terminates the backends on the configured ports.

use serde::Serialize;
use sysinfo::System;

use crate::config::Settings;

/// Result of one termination attempt, as reported by `/v1/cleanup`.
#[derive(Debug, Clone, Serialize)]
pub struct SweepResult {
    pub port: Option<u16>,
    pub terminated: bool,
}

fn binary_names(settings: &Settings) -> Vec<String> {
    let stem = |s: &str| {
        std::path::Path::new(s)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| s.to_string())
    };
    vec![
        stem(&settings.llama_server_bin),
        stem(&settings.whisper_server_bin),
    ]
}

fn cmdline(process: &sysinfo::Process) -> String {
    process
        .cmd()
        .iter()
        .map(|s| s.to_string_lossy())
        .collect::<Vec<_>>()
        .join(" ")
}

/// The `--port N` value a backend was started with, if present.
fn port_of(cmd: &str) -> Option<u16> {
    let mut args = cmd.split_whitespace();
    while let Some(arg) = args.next() {
        if arg == "--port" {
            return args.next().and_then(|v| v.parse().ok());
        }
    }
    None
}

/// Kill every process running a known backend binary, except the one holding
/// the classifier port. Run at boot so a crashed predecessor cannot squat the
/// GPU.
pub fn terminate_stale_backends(settings: &Settings) -> Vec<SweepResult> {
    let names = binary_names(settings);
    let keep_port = settings.router.as_ref().map(|r| r.port);

    let mut sys = System::new();
    sys.refresh_processes(sysinfo::ProcessesToUpdate::All);

    let mut results = Vec::new();
    for process in sys.processes().values() {
        let name = process.name().to_string_lossy();
        if !names.iter().any(|n| name.contains(n.as_str())) {
            continue;
        }
        let port = port_of(&cmdline(process));
        if port.is_some() && port == keep_port {
            tracing::debug!("Sparing classifier backend (pid {})", process.pid());
            continue;
        }
        let terminated = process.kill();
        if terminated {
            tracing::info!(
                "Terminated stale backend {} (pid {}, port {:?})",
                name,
                process.pid(),
                port
            );
        }
        results.push(SweepResult { port, terminated });
    }
    results
}

/// Terminate the backends bound to the given ports (by `--port N` match on
/// their command line). One result per requested port.
pub fn terminate_on_ports(settings: &Settings, ports: &[u16]) -> Vec<SweepResult> {
    let names = binary_names(settings);
    let mut sys = System::new();
    sys.refresh_processes(sysinfo::ProcessesToUpdate::All);

    let mut results: Vec<SweepResult> = ports
        .iter()
        .map(|&port| SweepResult {
            port: Some(port),
            terminated: false,
        })
        .collect();

    for process in sys.processes().values() {
        let name = process.name().to_string_lossy();
        if !names.iter().any(|n| name.contains(n.as_str())) {
            continue;
        }
        let port = match port_of(&cmdline(process)) {
            Some(port) => port,
            None => continue,
        };
        if let Some(result) = results.iter_mut().find(|r| r.port == Some(port)) {
            if process.kill() {
                tracing::info!(
                    "Terminated backend {} (pid {}) on port {}",
                    name,
                    process.pid(),
                    port
                );
                result.terminated = true;
            }
        }
    }

    results
}

/// The configured local ports the cleanup endpoint operates on: everything
/// except the classifier's.
pub fn cleanup_ports(settings: &Settings) -> Vec<u16> {
    let keep_port = settings.router.as_ref().map(|r| r.port);
    settings
        .local_ports()
        .into_iter()
        .filter(|p| Some(*p) != keep_port)
        .collect()
}

/// Liveness of each configured local port, for `/v1/cleanup/status`.
pub async fn port_status(client: &reqwest::Client, settings: &Settings) -> Vec<(u16, bool)> {
    let mut out = Vec::new();
    for port in settings.local_ports() {
        // Either backend variant answers its readiness path; probe both.
        let up = super::is_up(client, port, super::TEXT_READY_PATH).await
            || super::is_up(client, port, super::SPEECH_READY_PATH).await;
        out.push((port, up));
    }
    out
}
