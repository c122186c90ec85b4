use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::{ensure_parent, Config, TorchBackend};
use crate::error::{ProcessErrorDetails, SmolError};
use crate::layout::Layout;
use crate::shell::{venv_env, ShellRunner};
use crate::state::{clear_record, load_record, terminate_process};

const CHAT_APP_TEMPLATE: &str = include_str!("../templates/chat_app.py");
const STDERR_TAIL_LINES: usize = 20;

/// Concrete tool invocations, resolved once per run from config and PATH.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Toolchain {
    pub pip: String,
    pub venv_command: String,
    pub torch: TorchBackend,
}

impl Toolchain {
    pub fn resolve(cfg: &Config, available: impl Fn(&str) -> bool) -> Self {
        let has_uv = available("uv");
        let pip = if !cfg.python.pip.trim().is_empty() {
            cfg.python.pip.trim().to_string()
        } else if has_uv {
            "uv pip".to_string()
        } else {
            "python -m pip".to_string()
        };
        let venv_command = if !cfg.python.venv_command.trim().is_empty() {
            cfg.python.venv_command.trim().to_string()
        } else if has_uv {
            "uv venv env".to_string()
        } else if cfg!(windows) {
            "python -m venv env".to_string()
        } else {
            "python3 -m venv env".to_string()
        };
        let torch = match cfg.python.torch {
            TorchBackend::Auto => {
                if available("nvidia-smi") {
                    TorchBackend::Cuda
                } else if cfg!(target_os = "macos") {
                    TorchBackend::Default
                } else {
                    TorchBackend::Cpu
                }
            }
            other => other,
        };
        Self {
            pip,
            venv_command,
            torch,
        }
    }

    fn torch_command(&self, upgrade: bool) -> Option<String> {
        let index = match self.torch {
            TorchBackend::Skip => return None,
            TorchBackend::Cuda => Some("https://download.pytorch.org/whl/cu121"),
            TorchBackend::Rocm => Some("https://download.pytorch.org/whl/rocm6.0"),
            TorchBackend::Cpu => Some("https://download.pytorch.org/whl/cpu"),
            TorchBackend::Default | TorchBackend::Auto => None,
        };
        let mut command = format!("{} install", self.pip);
        if upgrade {
            command.push_str(" --upgrade");
        }
        command.push_str(" torch torchvision torchaudio");
        if let Some(index) = index {
            command.push_str(" --index-url ");
            command.push_str(index);
        }
        Some(command)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepAction {
    Shell {
        command: String,
        cwd: PathBuf,
        venv: bool,
    },
    CreateDir(PathBuf),
    WriteFile {
        path: PathBuf,
        content: String,
        overwrite: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub name: String,
    pub action: StepAction,
    pub skip: Option<String>,
}

impl Step {
    fn shell(name: &str, command: String, cwd: &Path, venv: bool) -> Self {
        Self {
            name: name.to_string(),
            action: StepAction::Shell {
                command,
                cwd: cwd.to_path_buf(),
                venv,
            },
            skip: None,
        }
    }

    fn write(name: &str, path: &Path, content: String, overwrite: bool) -> Self {
        Self {
            name: name.to_string(),
            action: StepAction::WriteFile {
                path: path.to_path_buf(),
                content,
                overwrite,
            },
            skip: None,
        }
    }

    fn skipped(mut self, reason: &str) -> Self {
        self.skip = Some(reason.to_string());
        self
    }

    pub fn describe(&self) -> String {
        match &self.action {
            StepAction::Shell { command, .. } => command.clone(),
            StepAction::CreateDir(path) => format!("mkdir {}", path.display()),
            StepAction::WriteFile { path, .. } => format!("write {}", path.display()),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StepReport {
    pub name: String,
    pub action: String,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

pub fn render_chat_app(cfg: &Config) -> String {
    CHAT_APP_TEMPLATE
        .replace("{{MODEL_ID}}", &cfg.model.id)
        .replace("{{TITLE}}", &cfg.model.title)
}

fn requirements_manifest(cfg: &Config) -> String {
    let mut content = String::new();
    for requirement in &cfg.app.requirements {
        content.push_str(requirement.trim());
        content.push('\n');
    }
    content
}

fn install_marker_text(cfg: &Config) -> String {
    format!(
        "{title} installation completed successfully.\n\n\
         Next steps:\n\
         1. Start the application with `smolctl start`\n\
         2. Open the web interface at the printed URL\n\
         3. Begin chatting with the {name} model\n\n\
         Model: {id}\n",
        title = cfg.model.title,
        name = cfg.model.name,
        id = cfg.model.id,
    )
}

fn update_marker_text(cfg: &Config, refreshed: bool) -> String {
    let mut text = format!(
        "{title} update completed successfully.\n\n\
         Updated components:\n\
         - PyTorch\n\
         - Transformers and supporting dependencies\n\
         - Gradio web interface\n",
        title = cfg.model.title,
    );
    if refreshed {
        text.push_str("- Chat application script\n");
    }
    text.push_str("\nStart the application with `smolctl start`.\n");
    text
}

fn dir_is_empty(path: &Path) -> bool {
    fs::read_dir(path)
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(true)
}

fn verify_steps(cfg: &Config, layout: &Layout) -> Vec<Step> {
    cfg.python
        .verify_imports
        .iter()
        .map(|module| {
            Step::shell(
                "verify",
                format!("python -c \"import {}\"", module.trim()),
                &layout.app_dir,
                true,
            )
        })
        .collect()
}

fn accelerator_steps(cfg: &Config, layout: &Layout, tools: &Toolchain) -> Vec<Step> {
    cfg.python
        .accelerators
        .iter()
        .map(|package| {
            let step = Step::shell(
                "accelerators",
                format!("{} install {}", tools.pip, quote_requirement(package)),
                &layout.app_dir,
                true,
            );
            if tools.torch == TorchBackend::Cuda {
                step
            } else {
                step.skipped("accelerators need the cuda torch backend")
            }
        })
        .collect()
}

pub fn install_plan(cfg: &Config, layout: &Layout, tools: &Toolchain) -> Vec<Step> {
    let mut steps = Vec::new();
    let repository = cfg.app.repository.trim();
    let clone = Step::shell(
        "clone",
        format!("git clone {repository} app"),
        &layout.root,
        false,
    );
    steps.push(if repository.is_empty() {
        clone.skipped("no repository configured")
    } else if layout.app_dir.join(".git").exists() {
        clone.skipped("repository already cloned")
    } else if layout.app_dir.exists() && !dir_is_empty(&layout.app_dir) {
        clone.skipped("app directory already populated")
    } else {
        clone
    });
    steps.push(Step {
        name: "app-dir".to_string(),
        action: StepAction::CreateDir(layout.app_dir.clone()),
        skip: None,
    });

    let venv = Step::shell("venv", tools.venv_command.clone(), &layout.app_dir, false);
    steps.push(if layout.env_dir.is_dir() {
        venv.skipped("environment already exists")
    } else {
        venv
    });

    steps.push(Step::write(
        "manifest",
        &layout.requirements_path,
        requirements_manifest(cfg),
        false,
    ));
    steps.push(Step::write(
        "script",
        &layout.script_path,
        render_chat_app(cfg),
        false,
    ));

    match tools.torch_command(false) {
        Some(command) => steps.push(Step::shell("torch", command, &layout.app_dir, true)),
        None => steps.push(
            Step::shell("torch", String::new(), &layout.app_dir, true)
                .skipped("torch install disabled"),
        ),
    }
    steps.extend(accelerator_steps(cfg, layout, tools));
    steps.push(Step::shell(
        "requirements",
        format!("{} install -r requirements.txt", tools.pip),
        &layout.app_dir,
        true,
    ));
    for package in &cfg.python.extra_packages {
        steps.push(Step::shell(
            "extras",
            format!("{} install {}", tools.pip, quote_requirement(package)),
            &layout.app_dir,
            true,
        ));
    }
    steps.extend(verify_steps(cfg, layout));
    steps.push(Step::write(
        "marker",
        &layout.install_marker,
        install_marker_text(cfg),
        true,
    ));
    steps
}

pub fn update_plan(cfg: &Config, layout: &Layout, tools: &Toolchain) -> Vec<Step> {
    let mut steps = Vec::new();
    match tools.torch_command(true) {
        Some(command) => steps.push(Step::shell("torch", command, &layout.app_dir, true)),
        None => steps.push(
            Step::shell("torch", String::new(), &layout.app_dir, true)
                .skipped("torch install disabled"),
        ),
    }
    for entry in &cfg.python.upgrade_packages {
        steps.push(Step::shell(
            "upgrade",
            format!("{} install --upgrade {}", tools.pip, entry.trim()),
            &layout.app_dir,
            true,
        ));
    }
    steps.push(Step::shell(
        "requirements",
        format!("{} install -r requirements.txt --upgrade", tools.pip),
        &layout.app_dir,
        true,
    ));
    let refresh = Step::write("refresh", &layout.script_path, render_chat_app(cfg), true);
    steps.push(if cfg.update.refresh_script {
        refresh
    } else {
        refresh.skipped("update.refresh_script is off")
    });
    let scan = Step::shell(
        "cache",
        "python -c \"import transformers; transformers.utils.hub.scan_cache_dir()\"".to_string(),
        &layout.app_dir,
        true,
    );
    steps.push(if cfg.update.scan_cache {
        scan
    } else {
        scan.skipped("update.scan_cache is off")
    });
    steps.extend(verify_steps(cfg, layout));
    steps.push(Step::write(
        "marker",
        &layout.update_marker,
        update_marker_text(cfg, cfg.update.refresh_script),
        true,
    ));
    steps
}

/// Requirement specifiers such as `gradio>=4.0.0` must not reach the shell unquoted.
fn quote_requirement(requirement: &str) -> String {
    let requirement = requirement.trim();
    if requirement.contains(['<', '>', '=', '!', '~', ';', ' ']) {
        format!("\"{requirement}\"")
    } else {
        requirement.to_string()
    }
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let lines: Vec<&str> = text.trim().lines().collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join("\n")
}

fn classify_step_failure(stderr: &str) -> (String, Option<String>) {
    let lower = stderr.to_lowercase();

    if lower.contains("command not found")
        || lower.contains("not recognized as an internal or external command")
        || lower.contains("no such file or directory")
    {
        return (
            "tool_not_found".to_string(),
            Some("A required tool is missing. Run `smolctl doctor` to see what is available.".to_string()),
        );
    }

    if lower.contains("could not resolve host")
        || lower.contains("temporary failure in name resolution")
        || lower.contains("failed to connect")
        || lower.contains("connection refused")
        || lower.contains("network is unreachable")
    {
        return (
            "network_unavailable".to_string(),
            Some("Network access failed. Check connectivity or proxy settings and retry.".to_string()),
        );
    }

    if lower.contains("no space left on device") {
        return (
            "disk_full".to_string(),
            Some("The disk is full. Free space under the installation root and retry.".to_string()),
        );
    }

    if lower.contains("no module named") || lower.contains("modulenotfounderror") {
        return (
            "python_import_failed".to_string(),
            Some("A Python package failed to import. Re-run `smolctl install` or `smolctl update`.".to_string()),
        );
    }

    if lower.contains("already exists and is not an empty directory") {
        return (
            "app_dir_not_empty".to_string(),
            Some("The app directory is in the way. Run `smolctl reset` and install again.".to_string()),
        );
    }

    ("step_failed".to_string(), None)
}

fn write_step_file(path: &Path, content: &str, overwrite: bool) -> Result<bool, SmolError> {
    if !overwrite && path.exists() {
        return Ok(false);
    }
    ensure_parent(path)?;
    fs::write(path, content)?;
    Ok(true)
}

/// Executes steps in order. The first failing step aborts the run; nothing is rolled back.
pub fn run_plan<R: ShellRunner>(
    steps: &[Step],
    layout: &Layout,
    runner: &R,
    capture_output: bool,
) -> Result<Vec<StepReport>, SmolError> {
    let envs = venv_env(layout);
    let plain = BTreeMap::new();
    let mut reports = Vec::with_capacity(steps.len());
    for step in steps {
        let action = step.describe();
        if let Some(reason) = &step.skip {
            tracing::info!(step = %step.name, %reason, "skipping step");
            reports.push(StepReport {
                name: step.name.clone(),
                action,
                status: "skipped",
                reason: Some(reason.clone()),
            });
            continue;
        }
        tracing::info!(step = %step.name, %action, "running step");
        let status = match &step.action {
            StepAction::Shell { command, cwd, venv } => {
                fs::create_dir_all(cwd)?;
                let env_overrides = if *venv { &envs } else { &plain };
                run_shell_step(&step.name, command, cwd, env_overrides, runner, capture_output)?;
                "done"
            }
            StepAction::CreateDir(path) => {
                fs::create_dir_all(path)?;
                "done"
            }
            StepAction::WriteFile {
                path,
                content,
                overwrite,
            } => {
                if write_step_file(path, content, *overwrite)? {
                    "done"
                } else {
                    "kept"
                }
            }
        };
        reports.push(StepReport {
            name: step.name.clone(),
            action,
            status,
            reason: None,
        });
    }
    Ok(reports)
}

fn run_shell_step<R: ShellRunner>(
    name: &str,
    command: &str,
    cwd: &Path,
    env_overrides: &BTreeMap<String, String>,
    runner: &R,
    capture_output: bool,
) -> Result<(), SmolError> {
    let output = runner
        .run(command, cwd, env_overrides, capture_output)
        .map_err(|err| {
            let error_code = if err.kind() == io::ErrorKind::NotFound {
                "shell_not_found"
            } else {
                "process_command_failed"
            };
            SmolError::ProcessDetailed {
                message: format!("step `{name}` could not run `{command}`: {err}"),
                details: ProcessErrorDetails {
                    error_code: error_code.to_string(),
                    step: Some(name.to_string()),
                    hint: None,
                    command: Some(command.to_string()),
                    raw_stderr: None,
                },
            }
        })?;
    if output.success() {
        return Ok(());
    }
    let stderr = stderr_tail(&output.stderr);
    let (error_code, hint) = classify_step_failure(&stderr);
    let mut message = format!(
        "step `{name}` failed with status {} while running `{command}`",
        output.status_code
    );
    if !stderr.is_empty() {
        message = format!("{message}: {stderr}");
    }
    if let Some(ref hint_message) = hint {
        message = format!("{message}\nHint: {hint_message}");
    }
    Err(SmolError::ProcessDetailed {
        message,
        details: ProcessErrorDetails {
            error_code,
            step: Some(name.to_string()),
            hint,
            command: Some(command.to_string()),
            raw_stderr: if stderr.is_empty() { None } else { Some(stderr) },
        },
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct ResetReport {
    pub server_stopped: bool,
    pub removed: Vec<String>,
    pub missing: Vec<String>,
}

fn remove_path(path: &Path) -> Result<bool, SmolError> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(SmolError::Io(err)),
    };
    if meta.file_type().is_dir() {
        fs::remove_dir_all(path)?;
    } else {
        fs::remove_file(path)?;
    }
    Ok(true)
}

/// Deletes the whole installation without asking. A recorded server is killed first.
pub fn reset(layout: &Layout, stop_grace: Duration) -> Result<ResetReport, SmolError> {
    let mut server_stopped = false;
    match load_record(&layout.state_path) {
        Ok(Some(record)) if record.phase.is_active() => {
            server_stopped = terminate_process(record.pid, stop_grace);
        }
        Ok(_) => {}
        Err(err) => tracing::warn!(error = %err, "ignoring unreadable process record"),
    }
    clear_record(&layout.state_path)?;

    let mut removed = Vec::new();
    let mut missing = Vec::new();
    for path in [&layout.app_dir, &layout.log_path] {
        let display = path.to_string_lossy().to_string();
        if remove_path(path)? {
            removed.push(display);
        } else {
            missing.push(display);
        }
    }
    Ok(ResetReport {
        server_stopped,
        removed,
        missing,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shell::CommandOutput;
    use std::cell::RefCell;
    use tempfile::tempdir;

    #[derive(Debug, Clone)]
    struct RecordedCall {
        command: String,
        cwd: PathBuf,
        env_overrides: BTreeMap<String, String>,
    }

    #[derive(Default)]
    struct MockShellRunner {
        calls: RefCell<Vec<RecordedCall>>,
        fail_on: Option<String>,
    }

    impl MockShellRunner {
        fn failing_on(fragment: &str) -> Self {
            Self {
                calls: RefCell::new(Vec::new()),
                fail_on: Some(fragment.to_string()),
            }
        }

        fn commands(&self) -> Vec<String> {
            self.calls.borrow().iter().map(|c| c.command.clone()).collect()
        }
    }

    impl ShellRunner for MockShellRunner {
        fn run(
            &self,
            command: &str,
            cwd: &Path,
            env_overrides: &BTreeMap<String, String>,
            _capture_output: bool,
        ) -> Result<CommandOutput, io::Error> {
            self.calls.borrow_mut().push(RecordedCall {
                command: command.to_string(),
                cwd: cwd.to_path_buf(),
                env_overrides: env_overrides.clone(),
            });
            if self.fail_on.as_deref().is_some_and(|f| command.contains(f)) {
                return Ok(CommandOutput {
                    status_code: 1,
                    stdout: Vec::new(),
                    stderr: b"ERROR: Could not resolve host: pypi.org".to_vec(),
                });
            }
            if command.contains("venv env") {
                fs::create_dir_all(cwd.join("env"))?;
            }
            Ok(CommandOutput {
                status_code: 0,
                stdout: Vec::new(),
                stderr: Vec::new(),
            })
        }
    }

    fn test_config() -> Config {
        let mut cfg = Config::default();
        cfg.app.repository = String::new();
        cfg.python.torch = TorchBackend::Cpu;
        cfg
    }

    fn tools(cfg: &Config) -> Toolchain {
        Toolchain::resolve(cfg, |tool| tool == "uv")
    }

    #[test]
    fn toolchain_prefers_uv_and_honours_overrides() {
        let mut cfg = Config::default();
        let with_uv = Toolchain::resolve(&cfg, |tool| tool == "uv");
        assert_eq!(with_uv.pip, "uv pip");
        assert_eq!(with_uv.venv_command, "uv venv env");

        let without = Toolchain::resolve(&cfg, |_| false);
        assert_eq!(without.pip, "python -m pip");

        cfg.python.pip = "pip3".to_string();
        cfg.python.venv_command = "virtualenv env".to_string();
        let custom = Toolchain::resolve(&cfg, |_| true);
        assert_eq!(custom.pip, "pip3");
        assert_eq!(custom.venv_command, "virtualenv env");
    }

    #[test]
    fn auto_torch_picks_cuda_when_nvidia_smi_present() {
        let cfg = Config::default();
        let tools = Toolchain::resolve(&cfg, |tool| tool == "nvidia-smi");
        assert_eq!(tools.torch, TorchBackend::Cuda);
        assert!(tools
            .torch_command(false)
            .unwrap()
            .ends_with("--index-url https://download.pytorch.org/whl/cu121"));
    }

    #[test]
    fn install_runs_steps_in_order_and_writes_marker() {
        let dir = tempdir().unwrap();
        let cfg = test_config();
        let layout = Layout::new(dir.path(), &cfg);
        let runner = MockShellRunner::default();

        let plan = install_plan(&cfg, &layout, &tools(&cfg));
        let reports = run_plan(&plan, &layout, &runner, true).unwrap();

        let commands = runner.commands();
        assert_eq!(commands[0], "uv venv env");
        assert!(commands[1].starts_with("uv pip install torch torchvision torchaudio"));
        assert_eq!(commands[2], "uv pip install -r requirements.txt");
        assert_eq!(commands[3], "uv pip install \"transformers>=4.40.0\"");
        assert!(commands.contains(&"python -c \"import gradio\"".to_string()));

        assert_eq!(reports[0].status, "skipped");
        assert!(layout.installed());
        assert!(layout.install_marker.exists());
        let requirements = fs::read_to_string(&layout.requirements_path).unwrap();
        assert!(requirements.contains("gradio>=4.0.0\n"));
        let script = fs::read_to_string(&layout.script_path).unwrap();
        assert!(script.contains("HuggingFaceTB/SmolLM3-3B"));
        assert!(!script.contains("{{MODEL_ID}}"));
    }

    #[test]
    fn venv_steps_run_with_activated_environment() {
        let dir = tempdir().unwrap();
        let cfg = test_config();
        let layout = Layout::new(dir.path(), &cfg);
        let runner = MockShellRunner::default();
        let plan = install_plan(&cfg, &layout, &tools(&cfg));
        run_plan(&plan, &layout, &runner, true).unwrap();

        let calls = runner.calls.borrow();
        assert!(!calls[0].env_overrides.contains_key("VIRTUAL_ENV"));
        assert_eq!(calls[0].cwd, layout.app_dir);
        assert!(calls[1].env_overrides.contains_key("VIRTUAL_ENV"));
    }

    #[test]
    fn failing_step_halts_install_without_marker() {
        let dir = tempdir().unwrap();
        let cfg = test_config();
        let layout = Layout::new(dir.path(), &cfg);
        let runner = MockShellRunner::failing_on("-r requirements.txt");

        let plan = install_plan(&cfg, &layout, &tools(&cfg));
        let err = run_plan(&plan, &layout, &runner, true).expect_err("requirements fail");

        let details = err.details().expect("details");
        assert_eq!(details.step.as_deref(), Some("requirements"));
        assert_eq!(details.error_code, "network_unavailable");
        assert!(details.hint.is_some());
        assert!(!layout.install_marker.exists());
        assert!(!runner.commands().iter().any(|c| c.contains("import")));
    }

    #[test]
    fn reinstall_keeps_existing_files_and_skips_clone() {
        let dir = tempdir().unwrap();
        let mut cfg = test_config();
        let layout = Layout::new(dir.path(), &cfg);
        fs::create_dir_all(layout.app_dir.join(".git")).unwrap();
        fs::create_dir_all(&layout.env_dir).unwrap();
        fs::write(&layout.script_path, "custom\n").unwrap();
        cfg.app.repository = "https://example.invalid/repo.git".to_string();

        let plan = install_plan(&cfg, &layout, &tools(&cfg));
        assert_eq!(plan[0].skip.as_deref(), Some("repository already cloned"));
        assert_eq!(plan[2].skip.as_deref(), Some("environment already exists"));

        let runner = MockShellRunner::default();
        let reports = run_plan(&plan, &layout, &runner, true).unwrap();
        assert!(!runner.commands().iter().any(|c| c.starts_with("git clone")));
        assert_eq!(fs::read_to_string(&layout.script_path).unwrap(), "custom\n");
        assert!(reports.iter().any(|r| r.status == "kept"));
    }

    #[test]
    fn fresh_install_clones_repository_from_root() {
        let dir = tempdir().unwrap();
        let mut cfg = test_config();
        cfg.app.repository = "https://example.invalid/repo.git".to_string();
        let layout = Layout::new(dir.path(), &cfg);
        let plan = install_plan(&cfg, &layout, &tools(&cfg));
        assert_eq!(plan[0].skip, None);
        assert_eq!(
            plan[0].action,
            StepAction::Shell {
                command: "git clone https://example.invalid/repo.git app".to_string(),
                cwd: layout.root.clone(),
                venv: false,
            }
        );
    }

    #[test]
    fn update_upgrades_and_refreshes_script() {
        let dir = tempdir().unwrap();
        let cfg = test_config();
        let layout = Layout::new(dir.path(), &cfg);
        fs::create_dir_all(&layout.env_dir).unwrap();
        fs::write(&layout.script_path, "old\n").unwrap();
        let runner = MockShellRunner::default();

        let plan = update_plan(&cfg, &layout, &tools(&cfg));
        run_plan(&plan, &layout, &runner, true).unwrap();

        let commands = runner.commands();
        assert!(commands[0].starts_with("uv pip install --upgrade torch"));
        assert_eq!(commands[1], "uv pip install --upgrade transformers --no-deps");
        assert!(commands.contains(&"uv pip install -r requirements.txt --upgrade".to_string()));
        assert!(fs::read_to_string(&layout.script_path)
            .unwrap()
            .contains("HuggingFaceTB/SmolLM3-3B"));
        assert!(layout.update_marker.exists());
    }

    #[test]
    fn update_without_refresh_keeps_script() {
        let dir = tempdir().unwrap();
        let mut cfg = test_config();
        cfg.update.refresh_script = false;
        cfg.python.torch = TorchBackend::Skip;
        let layout = Layout::new(dir.path(), &cfg);
        fs::create_dir_all(&layout.app_dir).unwrap();
        fs::write(&layout.script_path, "old\n").unwrap();

        let plan = update_plan(&cfg, &layout, &tools(&cfg));
        run_plan(&plan, &layout, &MockShellRunner::default(), true).unwrap();
        assert_eq!(fs::read_to_string(&layout.script_path).unwrap(), "old\n");
    }

    #[test]
    fn accelerators_install_only_on_cuda() {
        let dir = tempdir().unwrap();
        let mut cfg = test_config();
        let layout = Layout::new(dir.path(), &cfg);
        let runner = MockShellRunner::default();

        let plan = install_plan(&cfg, &layout, &tools(&cfg));
        let skipped: Vec<&Step> = plan.iter().filter(|s| s.name == "accelerators").collect();
        assert_eq!(skipped.len(), 3);
        assert!(skipped.iter().all(|s| s.skip.is_some()));

        cfg.python.torch = TorchBackend::Cuda;
        let plan = install_plan(&cfg, &layout, &tools(&cfg));
        run_plan(&plan, &layout, &runner, true).unwrap();
        let commands = runner.commands();
        let torch_at = commands.iter().position(|c| c.contains("torchvision")).unwrap();
        assert_eq!(commands[torch_at + 1], "uv pip install xformers");
        assert_eq!(commands[torch_at + 3], "uv pip install sageattention");
        assert_eq!(commands[torch_at + 4], "uv pip install -r requirements.txt");
    }

    #[test]
    fn update_scans_cache_unless_disabled() {
        let dir = tempdir().unwrap();
        let mut cfg = test_config();
        let layout = Layout::new(dir.path(), &cfg);
        let scan = "python -c \"import transformers; transformers.utils.hub.scan_cache_dir()\"";

        let plan = update_plan(&cfg, &layout, &tools(&cfg));
        let step = plan.iter().find(|s| s.name == "cache").unwrap();
        assert_eq!(step.describe(), scan);
        assert_eq!(step.skip, None);

        cfg.update.scan_cache = false;
        let plan = update_plan(&cfg, &layout, &tools(&cfg));
        let step = plan.iter().find(|s| s.name == "cache").unwrap();
        assert!(step.skip.is_some());
    }

    #[test]
    fn reset_is_idempotent() {
        let dir = tempdir().unwrap();
        let cfg = test_config();
        let layout = Layout::new(dir.path(), &cfg);
        fs::create_dir_all(&layout.env_dir).unwrap();
        fs::create_dir_all(&layout.run_dir).unwrap();
        fs::write(&layout.log_path, "log\n").unwrap();

        let first = reset(&layout, Duration::from_millis(10)).unwrap();
        assert_eq!(first.removed.len(), 2);
        assert!(!layout.installed());
        assert!(!layout.app_dir.exists());

        let second = reset(&layout, Duration::from_millis(10)).unwrap();
        assert!(second.removed.is_empty());
        assert_eq!(second.missing.len(), 2);
        assert!(!layout.installed());
    }

    #[test]
    fn quote_requirement_protects_specifiers() {
        assert_eq!(quote_requirement("accelerate"), "accelerate");
        assert_eq!(quote_requirement("gradio>=4.0.0"), "\"gradio>=4.0.0\"");
    }
}
