use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use crate::config::ensure_parent;
use crate::error::SmolError;
use crate::layout::Layout;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Starting,
    Ready,
    Stopped,
    Failed,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Starting => "starting",
            Phase::Ready => "ready",
            Phase::Stopped => "stopped",
            Phase::Failed => "failed",
        }
    }

    pub fn can_advance_to(self, next: Phase) -> bool {
        matches!(
            (self, next),
            (Phase::Idle, Phase::Starting)
                | (Phase::Starting, Phase::Ready)
                | (Phase::Starting, Phase::Stopped)
                | (Phase::Starting, Phase::Failed)
                | (Phase::Ready, Phase::Stopped)
                | (Phase::Ready, Phase::Failed)
                | (Phase::Stopped, Phase::Starting)
                | (Phase::Failed, Phase::Starting)
        )
    }

    /// A process is expected to be alive in these phases.
    pub fn is_active(self) -> bool {
        matches!(self, Phase::Starting | Phase::Ready)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The launched chat server, persisted in `run/state.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProcessRecord {
    pub pid: u32,
    pub port: u16,
    pub phase: Phase,
    #[serde(default)]
    pub url: Option<String>,
    pub started_at: String,
    #[serde(default)]
    pub ready_at: Option<String>,
    pub log_path: PathBuf,
    #[serde(default)]
    pub detail: Option<String>,
}

impl ProcessRecord {
    pub fn launched(pid: u32, port: u16, log_path: &Path) -> Self {
        Self {
            pid,
            port,
            phase: Phase::Starting,
            url: None,
            started_at: Utc::now().to_rfc3339(),
            ready_at: None,
            log_path: log_path.to_path_buf(),
            detail: None,
        }
    }

    pub fn advance(&mut self, next: Phase) -> Result<(), SmolError> {
        if !self.phase.can_advance_to(next) {
            return Err(SmolError::IllegalTransition {
                from: self.phase,
                to: next,
            });
        }
        self.phase = next;
        if next != Phase::Ready {
            self.url = None;
        }
        Ok(())
    }

    pub fn mark_ready(&mut self, url: &str) -> Result<(), SmolError> {
        self.advance(Phase::Ready)?;
        self.url = Some(url.to_string());
        self.ready_at = Some(Utc::now().to_rfc3339());
        Ok(())
    }

    pub fn mark_failed(&mut self, detail: impl Into<String>) -> Result<(), SmolError> {
        self.advance(Phase::Failed)?;
        self.detail = Some(detail.into());
        Ok(())
    }

    /// The URL is only meaningful while the recorded process is alive and ready.
    pub fn live_url(&self, alive: bool) -> Option<&str> {
        if alive && self.phase == Phase::Ready {
            self.url.as_deref()
        } else {
            None
        }
    }
}

/// Folds process liveness into the record: an active phase with a dead pid is a failure.
pub fn reconcile(mut record: ProcessRecord, alive: bool) -> ProcessRecord {
    if record.phase.is_active() && !alive {
        let detail = match record.phase {
            Phase::Starting => "server exited before becoming ready",
            _ => "server exited unexpectedly",
        };
        record.phase = Phase::Failed;
        record.url = None;
        record.detail = Some(detail.to_string());
    }
    record
}

pub fn load_record(path: &Path) -> Result<Option<ProcessRecord>, SmolError> {
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path)?;
    let parsed: ProcessRecord = serde_json::from_str(&content)?;
    Ok(Some(parsed))
}

pub fn write_record(path: &Path, record: &ProcessRecord) -> Result<(), SmolError> {
    ensure_parent(path)?;
    let tmp_path = path.with_extension("json.tmp");
    let body = serde_json::to_string_pretty(record)?;
    fs::write(&tmp_path, format!("{body}\n"))?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}

pub fn clear_record(path: &Path) -> Result<(), SmolError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(SmolError::Io(err)),
    }
}

/// Loads the record and reconciles it against the process table.
pub fn current_record(layout: &Layout) -> Result<Option<(ProcessRecord, bool)>, SmolError> {
    let Some(record) = load_record(&layout.state_path)? else {
        return Ok(None);
    };
    let alive = record.phase.is_active() && process_is_alive(record.pid);
    Ok(Some((reconcile(record, alive), alive)))
}

#[cfg(unix)]
pub fn process_is_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    Command::new("kill")
        .arg("-0")
        .arg(pid.to_string())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

#[cfg(windows)]
pub fn process_is_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    Command::new("tasklist")
        .args(["/FI", &format!("PID eq {pid}"), "/NH"])
        .stderr(Stdio::null())
        .output()
        .map(|out| String::from_utf8_lossy(&out.stdout).contains(&pid.to_string()))
        .unwrap_or(false)
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: &str) -> bool {
    let quiet = |args: &[String]| {
        Command::new("kill")
            .args(args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    };
    let group = vec![
        "-s".to_string(),
        signal.to_string(),
        "--".to_string(),
        format!("-{pid}"),
    ];
    quiet(&group) || quiet(&["-s".to_string(), signal.to_string(), pid.to_string()])
}

/// Terminates the server and its process group. Returns false when nothing was running.
#[cfg(unix)]
pub fn terminate_process(pid: u32, grace: Duration) -> bool {
    if !process_is_alive(pid) {
        return false;
    }
    send_signal(pid, "TERM");
    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if !process_is_alive(pid) {
            return true;
        }
        thread::sleep(Duration::from_millis(100));
    }
    tracing::warn!(pid, "server ignored SIGTERM, sending SIGKILL");
    send_signal(pid, "KILL");
    true
}

#[cfg(windows)]
pub fn terminate_process(pid: u32, grace: Duration) -> bool {
    if !process_is_alive(pid) {
        return false;
    }
    let _ = grace;
    let _ = Command::new("taskkill")
        .args(["/F", "/T", "/PID", &pid.to_string()])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline && process_is_alive(pid) {
        thread::sleep(Duration::from_millis(100));
    }
    true
}

/// Marks an operation as in progress. The file holds the owner pid and goes
/// away on drop; a lock left by a dead pid is taken over.
#[derive(Debug)]
pub struct OpLock {
    path: PathBuf,
}

/// How long a lock file may stay without a readable pid before it counts as abandoned.
const LOCK_CLAIM_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, PartialEq, Eq)]
enum LockHolder {
    Alive(u32),
    /// Created but the owner pid is not written yet.
    Claiming,
    Stale,
}

fn lock_holder(path: &Path) -> Option<LockHolder> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return None,
        Err(_) => String::new(),
    };
    match text.trim().parse::<u32>() {
        Ok(pid) if process_is_alive(pid) => Some(LockHolder::Alive(pid)),
        Ok(_) => Some(LockHolder::Stale),
        Err(_) => {
            let young = fs::metadata(path)
                .and_then(|meta| meta.modified())
                .ok()
                .and_then(|modified| modified.elapsed().ok())
                .map_or(true, |age| age < LOCK_CLAIM_GRACE);
            Some(if young {
                LockHolder::Claiming
            } else {
                LockHolder::Stale
            })
        }
    }
}

impl OpLock {
    pub fn acquire(layout: &Layout, op: &str) -> Result<Self, SmolError> {
        let path = layout.lock_path(op);
        ensure_parent(&path)?;
        let me = std::process::id();
        for _ in 0..3 {
            match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    let lock = Self { path };
                    writeln!(file, "{me}")?;
                    file.sync_all()?;
                    return Ok(lock);
                }
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    match lock_holder(&path) {
                        Some(LockHolder::Alive(owner)) if owner != me => {
                            return Err(SmolError::Busy {
                                op: op.to_string(),
                                pid: Some(owner),
                            });
                        }
                        Some(LockHolder::Claiming) => {
                            return Err(SmolError::Busy {
                                op: op.to_string(),
                                pid: None,
                            });
                        }
                        None => continue,
                        Some(_) => {
                            tracing::debug!(path = %path.display(), "removing stale lock");
                            let _ = fs::remove_file(&path);
                        }
                    }
                }
                Err(err) => return Err(SmolError::Io(err)),
            }
        }
        Err(SmolError::Process(format!(
            "could not acquire lock {}",
            path.display()
        )))
    }
}

impl Drop for OpLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

pub fn op_running(layout: &Layout, op: &str) -> bool {
    matches!(
        lock_holder(&layout.lock_path(op)),
        Some(LockHolder::Alive(_) | LockHolder::Claiming)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use tempfile::tempdir;

    fn record() -> ProcessRecord {
        ProcessRecord::launched(4242, 7860, Path::new("/tmp/server.log"))
    }

    #[test]
    fn lifecycle_transitions() {
        assert!(Phase::Idle.can_advance_to(Phase::Starting));
        assert!(Phase::Starting.can_advance_to(Phase::Ready));
        assert!(Phase::Starting.can_advance_to(Phase::Stopped));
        assert!(Phase::Ready.can_advance_to(Phase::Stopped));
        assert!(Phase::Stopped.can_advance_to(Phase::Starting));
        assert!(!Phase::Idle.can_advance_to(Phase::Ready));
        assert!(!Phase::Stopped.can_advance_to(Phase::Ready));
        assert!(!Phase::Ready.can_advance_to(Phase::Starting));
    }

    #[test]
    fn mark_ready_publishes_url() {
        let mut rec = record();
        assert_eq!(rec.phase, Phase::Starting);
        rec.mark_ready("http://localhost:7860").unwrap();
        assert_eq!(rec.phase, Phase::Ready);
        assert_eq!(rec.live_url(true), Some("http://localhost:7860"));
        assert_eq!(rec.live_url(false), None);
        assert!(rec.ready_at.is_some());
    }

    #[test]
    fn illegal_transition_is_rejected() {
        let mut rec = record();
        rec.advance(Phase::Stopped).unwrap();
        let err = rec.mark_ready("http://x:1").expect_err("stopped -> ready");
        assert!(err.to_string().contains("stopped -> ready"));
        assert_eq!(rec.url, None);
    }

    #[test]
    fn reconcile_dead_process_fails_and_drops_url() {
        let mut rec = record();
        rec.mark_ready("http://localhost:7860").unwrap();
        let rec = reconcile(rec, false);
        assert_eq!(rec.phase, Phase::Failed);
        assert_eq!(rec.url, None);
        assert_eq!(rec.detail.as_deref(), Some("server exited unexpectedly"));
    }

    #[test]
    fn reconcile_alive_process_is_unchanged() {
        let mut rec = record();
        rec.mark_ready("http://localhost:7860").unwrap();
        assert_eq!(reconcile(rec.clone(), true), rec);
    }

    #[test]
    fn record_round_trips_through_state_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run").join("state.json");
        assert!(load_record(&path).unwrap().is_none());
        let rec = record();
        write_record(&path, &rec).unwrap();
        assert_eq!(load_record(&path).unwrap(), Some(rec));
        clear_record(&path).unwrap();
        clear_record(&path).unwrap();
        assert!(load_record(&path).unwrap().is_none());
    }

    #[cfg(unix)]
    #[test]
    fn op_lock_blocks_second_holder_and_releases_on_drop() {
        let dir = tempdir().unwrap();
        let layout = Layout::new(dir.path(), &Config::default());
        let mut holder = Command::new("sleep").arg("30").spawn().unwrap();
        {
            let _lock = OpLock::acquire(&layout, "install").unwrap();
            assert!(op_running(&layout, "install"));
            fs::write(layout.lock_path("update"), format!("{}\n", holder.id())).unwrap();
            let err = OpLock::acquire(&layout, "update").expect_err("sleeper holds update");
            assert!(matches!(err, SmolError::Busy { ref op, pid } if op == "update" && pid == Some(holder.id())));
        }
        holder.kill().unwrap();
        holder.wait().unwrap();
        assert!(!op_running(&layout, "install"));
        assert!(!layout.lock_path("install").exists());
    }

    #[test]
    fn stale_lock_is_taken_over() {
        let dir = tempdir().unwrap();
        let layout = Layout::new(dir.path(), &Config::default());
        fs::create_dir_all(&layout.run_dir).unwrap();
        fs::write(layout.lock_path("reset"), "0\n").unwrap();
        assert!(!op_running(&layout, "reset"));
        let _lock = OpLock::acquire(&layout, "reset").unwrap();
        assert!(op_running(&layout, "reset"));
        assert_eq!(
            fs::read_to_string(layout.lock_path("reset")).unwrap(),
            format!("{}\n", std::process::id())
        );
    }

    #[test]
    fn freshly_created_empty_lock_counts_as_busy() {
        let dir = tempdir().unwrap();
        let layout = Layout::new(dir.path(), &Config::default());
        fs::create_dir_all(&layout.run_dir).unwrap();
        fs::write(layout.lock_path("start"), "").unwrap();

        let err = OpLock::acquire(&layout, "start").expect_err("claim in progress");
        assert!(matches!(err, SmolError::Busy { ref op, pid: None } if op == "start"));
        assert!(op_running(&layout, "start"));
        assert!(layout.lock_path("start").exists());
    }

    #[test]
    fn abandoned_empty_lock_is_taken_over() {
        let dir = tempdir().unwrap();
        let layout = Layout::new(dir.path(), &Config::default());
        fs::create_dir_all(&layout.run_dir).unwrap();
        let path = layout.lock_path("start");
        let file = fs::File::create(&path).unwrap();
        file.set_modified(std::time::SystemTime::now() - Duration::from_secs(60))
            .unwrap();
        drop(file);

        assert!(!op_running(&layout, "start"));
        let _lock = OpLock::acquire(&layout, "start").unwrap();
        assert!(op_running(&layout, "start"));
    }
}
