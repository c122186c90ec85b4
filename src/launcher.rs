use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::net::TcpListener;
use std::path::PathBuf;
use std::process::{Child, Stdio};
use std::sync::mpsc::RecvTimeoutError;
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::error::{ProcessErrorDetails, SmolError};
use crate::layout::Layout;
use crate::readiness::{probe_health, ReadinessMatcher, ReadinessWatch, WatchEvent, Watcher};
use crate::shell::{quote_arg, render_template, shell_command, venv_env};
use crate::state::{
    clear_record, current_record, load_record, terminate_process, write_record, OpLock, Phase,
    ProcessRecord,
};

const WAIT_TICK: Duration = Duration::from_millis(200);
const HEALTH_PROBE_EVERY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Default)]
pub struct LaunchOptions {
    pub foreground: bool,
    /// Overrides `server.ready_timeout_sec` when set.
    pub timeout: Option<Duration>,
}

enum LaunchFailure {
    Exited(Option<i32>),
    TimedOut(Duration),
}

pub fn allocate_port(configured: u16) -> Result<u16, SmolError> {
    if configured != 0 {
        return Ok(configured);
    }
    let listener = TcpListener::bind(("127.0.0.1", 0))?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

pub fn server_command_line(cfg: &Config, port: u16) -> String {
    render_template(
        &cfg.server.command,
        &[
            ("script", &quote_arg(&cfg.app.script)),
            ("port", &port.to_string()),
            ("host", cfg.server.bind_host.as_str()),
        ],
    )
}

pub fn server_env(cfg: &Config, layout: &Layout, port: u16) -> BTreeMap<String, String> {
    let mut envs = venv_env(layout);
    envs.insert(cfg.server.port_env.clone(), port.to_string());
    envs.insert(cfg.server.host_env.clone(), cfg.server.bind_host.clone());
    // The log is a file, so Python would otherwise block-buffer the readiness line.
    envs.insert("PYTHONUNBUFFERED".to_string(), "1".to_string());
    if !cfg.server.gpu_devices.trim().is_empty() && !cfg.server.gpu_env.trim().is_empty() {
        envs.insert(cfg.server.gpu_env.clone(), cfg.server.gpu_devices.trim().to_string());
    }
    envs
}

fn ready_timeout(cfg: &Config, opts: &LaunchOptions) -> Option<Duration> {
    match opts.timeout {
        Some(timeout) if timeout.is_zero() => None,
        Some(timeout) => Some(timeout),
        None if cfg.server.ready_timeout_sec == 0 => None,
        None => Some(Duration::from_secs(cfg.server.ready_timeout_sec)),
    }
}

/// Starts the chat server and blocks until it is ready, has died, or timed out.
/// `echo` receives raw server output in foreground mode.
pub fn start(
    cfg: &Config,
    layout: &Layout,
    opts: &LaunchOptions,
    echo: &mut dyn FnMut(&str),
) -> Result<ProcessRecord, SmolError> {
    if !layout.installed() {
        return Err(SmolError::NotInstalled(
            layout.env_dir.to_string_lossy().to_string(),
        ));
    }
    let _lock = OpLock::acquire(layout, "start")?;
    if let Some((record, alive)) = current_record(layout)? {
        if alive {
            return Err(SmolError::AlreadyRunning {
                pid: record.pid,
                url: record.url.clone(),
            });
        }
    }

    let health = health_client(cfg)?;
    let port = allocate_port(cfg.server.port)?;
    let matcher = ReadinessMatcher::compile(&cfg.server.readiness, port)?;
    let fallback_url = format!("http://{}:{}", cfg.server.url_host, port);
    let command_line = server_command_line(cfg, port);

    fs::create_dir_all(&layout.run_dir)?;
    let log = File::create(&layout.log_path)?;
    let mut cmd = shell_command(&command_line);
    cmd.current_dir(&layout.app_dir)
        .envs(server_env(cfg, layout, port))
        .stdin(Stdio::null())
        .stdout(Stdio::from(log.try_clone()?))
        .stderr(Stdio::from(log));
    #[cfg(unix)]
    if !opts.foreground {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }
    let mut child = cmd.spawn().map_err(|err| SmolError::ProcessDetailed {
        message: format!("failed to launch `{command_line}`: {err}"),
        details: ProcessErrorDetails {
            error_code: "server_spawn_failed".to_string(),
            step: Some("start".to_string()),
            hint: None,
            command: Some(command_line.clone()),
            raw_stderr: None,
        },
    })?;

    let mut record = ProcessRecord::launched(child.id(), port, &layout.log_path);
    write_record(&layout.state_path, &record)?;
    tracing::info!(pid = record.pid, port, command = %command_line, "server launched");

    let watch = ReadinessWatch::new(matcher, fallback_url.clone(), cfg.server.url_host.clone());
    let watcher = Watcher::spawn(File::open(&layout.log_path)?, watch, opts.foreground);

    let outcome = wait_for_ready(
        cfg,
        &mut child,
        &watcher,
        health.as_ref(),
        port,
        &fallback_url,
        ready_timeout(cfg, opts),
        echo,
    );
    match outcome {
        Ok(url) => {
            record.mark_ready(&url)?;
            write_record(&layout.state_path, &record)?;
            tracing::info!(pid = record.pid, %url, "server ready");
        }
        Err(failure) => {
            return Err(fail_launch(cfg, layout, record, &mut child, watcher, failure));
        }
    }

    if !opts.foreground {
        watcher.finish();
        return Ok(record);
    }

    echo(&format!("{} is running at {}", cfg.model.title, record.url.as_deref().unwrap_or(&fallback_url)));
    let status = loop {
        match watcher.events.recv_timeout(WAIT_TICK) {
            Ok(WatchEvent::Line(line)) => echo(&line),
            Ok(_) | Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => std::thread::sleep(WAIT_TICK),
        }
        if let Some(status) = child.try_wait()? {
            break status;
        }
    };
    watcher.drain(|event| {
        if let WatchEvent::Line(line) = event {
            echo(&line);
        }
    });
    tracing::info!(pid = record.pid, code = ?status.code(), "server exited");
    record.advance(Phase::Stopped)?;
    clear_record(&layout.state_path)?;
    Ok(record)
}

fn health_client(cfg: &Config) -> Result<Option<reqwest::blocking::Client>, SmolError> {
    if cfg.server.health_path.is_empty() {
        return Ok(None);
    }
    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(2))
        .no_proxy()
        .build()?;
    Ok(Some(client))
}

#[allow(clippy::too_many_arguments)]
fn wait_for_ready(
    cfg: &Config,
    child: &mut Child,
    watcher: &Watcher,
    health: Option<&reqwest::blocking::Client>,
    port: u16,
    fallback_url: &str,
    timeout: Option<Duration>,
    echo: &mut dyn FnMut(&str),
) -> Result<String, LaunchFailure> {
    let started = Instant::now();
    let mut last_probe: Option<Instant> = None;
    let mut watcher_gone = false;

    loop {
        if watcher_gone {
            std::thread::sleep(WAIT_TICK);
        } else {
            match watcher.events.recv_timeout(WAIT_TICK) {
                Ok(WatchEvent::Ready(url)) => return Ok(url),
                Ok(WatchEvent::Progress(line)) => tracing::info!(%line, "server progress"),
                Ok(WatchEvent::Line(line)) => echo(&line),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => watcher_gone = true,
            }
        }

        match child.try_wait() {
            Ok(Some(status)) => return Err(LaunchFailure::Exited(status.code())),
            Ok(None) => {}
            Err(err) => tracing::warn!(error = %err, "could not poll server process"),
        }

        if let Some(client) = health {
            if last_probe.map_or(true, |at| at.elapsed() >= HEALTH_PROBE_EVERY) {
                last_probe = Some(Instant::now());
                if probe_health(client, port, &cfg.server.health_path) {
                    return Ok(fallback_url.to_string());
                }
            }
        }

        if let Some(limit) = timeout {
            if started.elapsed() >= limit {
                return Err(LaunchFailure::TimedOut(limit));
            }
        }
    }
}

fn fail_launch(
    cfg: &Config,
    layout: &Layout,
    mut record: ProcessRecord,
    child: &mut Child,
    watcher: Watcher,
    failure: LaunchFailure,
) -> SmolError {
    let (error_code, message) = match failure {
        LaunchFailure::Exited(code) => (
            "server_exited",
            format!(
                "server exited before becoming ready (status {})",
                code.map(|c| c.to_string()).unwrap_or_else(|| "signal".to_string())
            ),
        ),
        LaunchFailure::TimedOut(limit) => {
            terminate_process(record.pid, Duration::from_secs(cfg.server.stop_grace_sec));
            let _ = child.kill();
            let _ = child.wait();
            (
                "server_ready_timeout",
                format!("server did not become ready within {}s", limit.as_secs()),
            )
        }
    };
    watcher.finish();

    // A concurrent `stop` removes the record; that is a stop, not a failure.
    if matches!(load_record(&layout.state_path), Ok(None)) {
        let _ = record.advance(Phase::Stopped);
        return SmolError::Process("server was stopped before it became ready".to_string());
    }
    if let Err(err) = record.mark_failed(message.clone()) {
        return err;
    }
    if let Err(err) = write_record(&layout.state_path, &record) {
        return err;
    }
    tracing::warn!(pid = record.pid, %message, "server launch failed");
    SmolError::ProcessDetailed {
        message: format!("{message}; see {}", layout.log_path.display()),
        details: ProcessErrorDetails {
            error_code: error_code.to_string(),
            step: Some("start".to_string()),
            hint: Some("Check `smolctl logs` for the server output.".to_string()),
            command: Some(server_command_line(cfg, record.port)),
            raw_stderr: None,
        },
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StopReport {
    pub stopped: bool,
    pub pid: Option<u32>,
    pub previous_phase: Option<Phase>,
}

pub fn stop(cfg: &Config, layout: &Layout) -> Result<StopReport, SmolError> {
    let Some(mut record) = load_record(&layout.state_path)? else {
        return Ok(StopReport {
            stopped: false,
            pid: None,
            previous_phase: None,
        });
    };
    let previous = record.phase;
    let stopped = record.phase.is_active()
        && terminate_process(record.pid, Duration::from_secs(cfg.server.stop_grace_sec));
    if record.phase.is_active() {
        record.advance(Phase::Stopped)?;
    }
    clear_record(&layout.state_path)?;
    tracing::info!(pid = record.pid, stopped, "server stop requested");
    Ok(StopReport {
        stopped,
        pid: Some(record.pid),
        previous_phase: Some(previous),
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub installed: bool,
    pub phase: Phase,
    pub alive: bool,
    pub pid: Option<u32>,
    pub port: Option<u16>,
    pub url: Option<String>,
    pub started_at: Option<String>,
    pub ready_at: Option<String>,
    pub detail: Option<String>,
    pub log_path: PathBuf,
}

pub fn status(layout: &Layout) -> Result<StatusReport, SmolError> {
    let installed = layout.installed();
    let Some((record, alive)) = current_record(layout)? else {
        return Ok(StatusReport {
            installed,
            phase: Phase::Idle,
            alive: false,
            pid: None,
            port: None,
            url: None,
            started_at: None,
            ready_at: None,
            detail: None,
            log_path: layout.log_path.clone(),
        });
    };
    Ok(StatusReport {
        installed,
        phase: record.phase,
        alive,
        pid: Some(record.pid),
        port: Some(record.port),
        url: record.live_url(alive).map(str::to_string),
        started_at: Some(record.started_at.clone()),
        ready_at: record.ready_at.clone(),
        detail: record.detail.clone(),
        log_path: record.log_path.clone(),
    })
}
