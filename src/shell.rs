use std::collections::BTreeMap;
use std::env;
use std::io;
use std::path::Path;
use std::process::Command;

use crate::layout::Layout;

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status_code == 0
    }
}

/// Runs one shell command line. Swapped for a recorder in tests.
pub trait ShellRunner {
    fn run(
        &self,
        command: &str,
        cwd: &Path,
        env_overrides: &BTreeMap<String, String>,
        capture_output: bool,
    ) -> Result<CommandOutput, io::Error>;
}

pub struct RealShellRunner;

impl ShellRunner for RealShellRunner {
    fn run(
        &self,
        command: &str,
        cwd: &Path,
        env_overrides: &BTreeMap<String, String>,
        capture_output: bool,
    ) -> Result<CommandOutput, io::Error> {
        let mut cmd = shell_command(command);
        cmd.current_dir(cwd);
        for (key, value) in env_overrides {
            cmd.env(key, value);
        }
        if capture_output {
            let output = cmd.output()?;
            let status_code =
                output
                    .status
                    .code()
                    .unwrap_or(if output.status.success() { 0 } else { 1 });
            Ok(CommandOutput {
                status_code,
                stdout: output.stdout,
                stderr: output.stderr,
            })
        } else {
            let status = cmd.status()?;
            let status_code = status
                .code()
                .unwrap_or(if status.success() { 0 } else { 1 });
            Ok(CommandOutput {
                status_code,
                stdout: Vec::new(),
                stderr: Vec::new(),
            })
        }
    }
}

/// Wraps a command line in the platform shell.
pub fn shell_command(command: &str) -> Command {
    if cfg!(windows) {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C").arg(command);
        cmd
    } else {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        cmd
    }
}

/// Environment that activates the installation's virtual environment.
pub fn venv_env(layout: &Layout) -> BTreeMap<String, String> {
    let mut envs = BTreeMap::new();
    envs.insert(
        "VIRTUAL_ENV".to_string(),
        layout.env_dir.to_string_lossy().to_string(),
    );
    let mut paths = vec![layout.env_bin_dir()];
    if let Some(existing) = env::var_os("PATH") {
        paths.extend(env::split_paths(&existing));
    }
    if let Ok(joined) = env::join_paths(paths) {
        envs.insert("PATH".to_string(), joined.to_string_lossy().to_string());
    }
    envs
}

/// Fills `{name}` placeholders; unknown placeholders are left alone.
pub fn render_template(template: &str, values: &[(&str, &str)]) -> String {
    let mut rendered = template.to_string();
    for (key, value) in values {
        rendered = rendered.replace(&format!("{{{key}}}"), value);
    }
    rendered
}

pub fn quote_arg(part: &str) -> String {
    if part.is_empty() {
        return "\"\"".to_string();
    }
    if part.chars().any(|c| c.is_whitespace() || c == '"') {
        return format!("\"{}\"", part.replace('"', "\\\""));
    }
    part.to_string()
}

pub fn tool_available(name: &str) -> bool {
    which::which(name).is_ok()
}
