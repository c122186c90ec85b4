use dirs::home_dir;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::SmolError;
use crate::readiness::ReadinessMatcher;

pub const DEFAULT_CONFIG_YAML: &str = include_str!("../config/default.yaml");
pub const CONFIG_VERSION: u32 = 1;

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub version: u32,
    pub paths: Paths,
    pub model: Model,
    pub app: App,
    pub python: Python,
    pub server: Server,
    pub update: Update,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct Paths {
    pub root: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct Model {
    pub id: String,
    pub name: String,
    pub title: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct App {
    /// Cloned into the app dir on first install; empty means no clone.
    pub repository: String,
    pub script: String,
    pub requirements: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct Python {
    /// Package installer invocation; empty picks `uv pip` or `python -m pip`.
    pub pip: String,
    /// Virtual environment creation command; empty picks `uv venv` or `python3 -m venv`.
    pub venv_command: String,
    pub torch: TorchBackend,
    /// Kernel packages installed after torch, only on the cuda backend.
    pub accelerators: Vec<String>,
    pub extra_packages: Vec<String>,
    pub upgrade_packages: Vec<String>,
    pub verify_imports: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TorchBackend {
    Auto,
    Cuda,
    Rocm,
    Cpu,
    Default,
    Skip,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct Server {
    /// Shell command with `{script}`, `{port}` and `{host}` placeholders.
    pub command: String,
    pub bind_host: String,
    pub url_host: String,
    /// 0 allocates a free port on every start.
    pub port: u16,
    pub port_env: String,
    pub host_env: String,
    pub gpu_env: String,
    pub gpu_devices: String,
    /// 0 waits forever.
    pub ready_timeout_sec: u64,
    pub stop_grace_sec: u64,
    pub health_path: String,
    pub readiness: Vec<ReadinessPattern>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ReadinessPattern {
    pub pattern: String,
    #[serde(default = "default_done")]
    pub done: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct Update {
    pub refresh_script: bool,
    /// Report the Hugging Face cache contents after upgrading.
    pub scan_cache: bool,
}

fn default_done() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            paths: Paths::default(),
            model: Model::default(),
            app: App::default(),
            python: Python::default(),
            server: Server::default(),
            update: Update::default(),
        }
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self {
            root: "~/.local/share/smolctl".to_string(),
        }
    }
}

impl Default for Model {
    fn default() -> Self {
        Self {
            id: "HuggingFaceTB/SmolLM3-3B".to_string(),
            name: "SmolLM3-3B".to_string(),
            title: "SmolLM3-3B Chatbot".to_string(),
        }
    }
}

impl Default for App {
    fn default() -> Self {
        Self {
            repository: "https://github.com/PierrunoYT/SmolLM3-3B-Pinokio.git".to_string(),
            script: "smollm3_gradio.py".to_string(),
            requirements: [
                "transformers>=4.40.0",
                "gradio>=4.0.0",
                "accelerate",
                "sentencepiece",
                "protobuf",
                "safetensors",
                "huggingface-hub",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

impl Default for Python {
    fn default() -> Self {
        Self {
            pip: String::new(),
            venv_command: String::new(),
            torch: TorchBackend::Auto,
            accelerators: ["xformers", "triton", "sageattention"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            extra_packages: ["transformers>=4.40.0", "gradio>=4.0.0", "accelerate", "bitsandbytes"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            upgrade_packages: [
                "transformers --no-deps",
                "gradio",
                "accelerate",
                "sentencepiece",
                "protobuf",
                "tokenizers",
                "safetensors",
                "huggingface-hub",
                "numpy",
                "packaging",
                "pyyaml",
                "regex",
                "requests",
                "tqdm",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            verify_imports: vec!["transformers".to_string(), "gradio".to_string()],
        }
    }
}

impl Default for TorchBackend {
    fn default() -> Self {
        TorchBackend::Auto
    }
}

impl Default for Server {
    fn default() -> Self {
        Self {
            command: "python {script} --port {port} --host {host}".to_string(),
            bind_host: "0.0.0.0".to_string(),
            url_host: "localhost".to_string(),
            port: 0,
            port_env: "GRADIO_SERVER_PORT".to_string(),
            host_env: "GRADIO_SERVER_NAME".to_string(),
            gpu_env: "CUDA_VISIBLE_DEVICES".to_string(),
            gpu_devices: String::new(),
            ready_timeout_sec: 900,
            stop_grace_sec: 5,
            health_path: String::new(),
            readiness: default_readiness_patterns(),
        }
    }
}

impl Default for Update {
    fn default() -> Self {
        Self {
            refresh_script: true,
            scan_cache: true,
        }
    }
}

pub fn default_readiness_patterns() -> Vec<ReadinessPattern> {
    let terminal = |pattern: &str| ReadinessPattern {
        pattern: pattern.to_string(),
        done: true,
    };
    vec![
        terminal(r"Running on local URL:\s*(?P<url>http://[0-9.:]+:[0-9]+)"),
        terminal(r"Running on public URL:.*https://[a-zA-Z0-9.-]+\.gradio\.live"),
        terminal(r"Gradio app running"),
        terminal(r"http://localhost:{port}"),
        terminal(r"Starting Gradio interface"),
        ReadinessPattern {
            pattern: r"Model loaded successfully".to_string(),
            done: false,
        },
    ]
}

pub fn read_config_from_str(content: &str) -> Result<Config, SmolError> {
    let cfg: Config = serde_yaml::from_str(content)?;
    validate_config(&cfg)?;
    Ok(cfg)
}

pub fn read_config(path: &Path) -> Result<Config, SmolError> {
    let content = fs::read_to_string(path)?;
    read_config_from_str(&content)
}

/// Reads the config file, falling back to defaults when it does not exist.
pub fn load_config(path: &Path) -> Result<Config, SmolError> {
    if path.exists() {
        read_config(path)
    } else {
        tracing::debug!(path = %path.display(), "config file missing, using defaults");
        Ok(Config::default())
    }
}

pub fn validate_config(cfg: &Config) -> Result<(), SmolError> {
    if cfg.version != CONFIG_VERSION {
        return Err(SmolError::Config(format!(
            "unsupported config version {}",
            cfg.version
        )));
    }
    if cfg.paths.root.trim().is_empty() {
        return Err(SmolError::Config("paths.root must not be empty".to_string()));
    }
    if cfg.app.script.trim().is_empty() {
        return Err(SmolError::Config("app.script must not be empty".to_string()));
    }
    if cfg.app.script.contains('/') || cfg.app.script.contains('\\') {
        return Err(SmolError::Config(
            "app.script must be a file name inside the app directory".to_string(),
        ));
    }
    if cfg.server.command.trim().is_empty() {
        return Err(SmolError::Config("server.command must not be empty".to_string()));
    }
    for (field, value) in [
        ("server.port_env", &cfg.server.port_env),
        ("server.host_env", &cfg.server.host_env),
    ] {
        if value.trim().is_empty() {
            return Err(SmolError::Config(format!("{field} must not be empty")));
        }
    }
    if !cfg.server.health_path.is_empty() && !cfg.server.health_path.starts_with('/') {
        return Err(SmolError::Config(
            "server.health_path must start with '/'".to_string(),
        ));
    }
    let matcher = ReadinessMatcher::compile(&cfg.server.readiness, cfg.server.port)
        .map_err(|err| SmolError::Config(format!("server.readiness: {err}")))?;
    if !matcher.has_terminal() && cfg.server.health_path.is_empty() {
        return Err(SmolError::Config(
            "server.readiness needs at least one pattern with done: true (or set server.health_path)"
                .to_string(),
        ));
    }
    Ok(())
}

pub fn resolve_config_path(override_path: Option<&PathBuf>) -> PathBuf {
    if let Some(path) = override_path {
        return path.clone();
    }
    if let Ok(path) = env::var("SMOLCTL_CONFIG") {
        return PathBuf::from(path);
    }
    default_config_dir().join("config.yaml")
}

pub fn default_config_dir() -> PathBuf {
    if let Ok(path) = env::var("SMOLCTL_CONFIG_DIR") {
        return PathBuf::from(path);
    }
    let mut base = home_dir().unwrap_or_else(|| PathBuf::from("."));
    base.push(".config");
    base.push("smolctl");
    base
}

pub fn resolve_root(override_path: Option<&PathBuf>, cfg: &Config) -> PathBuf {
    if let Some(path) = override_path {
        return path.clone();
    }
    if let Ok(path) = env::var("SMOLCTL_ROOT") {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }
    PathBuf::from(expand_path(&cfg.paths.root))
}

pub fn expand_path(input: &str) -> String {
    if let Some(stripped) = input.strip_prefix("~/") {
        if let Some(home) = home_dir() {
            return home.join(stripped).to_string_lossy().to_string();
        }
    }
    input.to_string()
}

pub fn ensure_parent(path: &Path) -> Result<(), SmolError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_unknown_field_errors() {
        let yaml = r#"
version: 1
unknown: true
paths:
  root: ~/smolctl
"#;
        let result: Result<Config, _> = serde_yaml::from_str(yaml);
        assert!(result.is_err());
    }

    #[test]
    fn config_defaults_apply() {
        let cfg = read_config_from_str("version: 1").expect("config");
        assert_eq!(cfg.version, 1);
        assert_eq!(cfg.paths.root, "~/.local/share/smolctl");
        assert_eq!(cfg.server.port_env, "GRADIO_SERVER_PORT");
        assert_eq!(cfg.server.host_env, "GRADIO_SERVER_NAME");
        assert_eq!(cfg.server.readiness.len(), 6);
        assert!(!cfg.server.readiness[5].done);
        assert_eq!(cfg.python.torch, TorchBackend::Auto);
    }

    #[test]
    fn embedded_default_yaml_matches_defaults() {
        let from_file = read_config_from_str(DEFAULT_CONFIG_YAML).expect("default yaml");
        let defaults = Config::default();
        assert_eq!(from_file.paths.root, defaults.paths.root);
        assert_eq!(from_file.model.id, defaults.model.id);
        assert_eq!(from_file.app.repository, defaults.app.repository);
        assert_eq!(from_file.app.requirements, defaults.app.requirements);
        assert_eq!(from_file.python.extra_packages, defaults.python.extra_packages);
        assert_eq!(from_file.python.upgrade_packages, defaults.python.upgrade_packages);
        assert_eq!(from_file.python.accelerators, defaults.python.accelerators);
        assert_eq!(from_file.update.scan_cache, defaults.update.scan_cache);
        assert_eq!(from_file.server.command, defaults.server.command);
        assert_eq!(from_file.server.readiness, defaults.server.readiness);
        assert_eq!(from_file.server.ready_timeout_sec, defaults.server.ready_timeout_sec);
    }

    #[test]
    fn unsupported_version_rejected() {
        let err = read_config_from_str("version: 7").expect_err("version 7");
        assert!(err.to_string().contains("unsupported config version 7"));
    }

    #[test]
    fn invalid_readiness_pattern_rejected() {
        let yaml = "version: 1\nserver:\n  readiness:\n    - pattern: \"([unclosed\"\n";
        let err = read_config_from_str(yaml).expect_err("bad regex");
        assert!(err.to_string().contains("server.readiness"));
    }

    #[test]
    fn readiness_without_terminal_pattern_needs_health_path() {
        let yaml = "version: 1\nserver:\n  readiness:\n    - pattern: loading\n      done: false\n";
        let err = read_config_from_str(yaml).expect_err("no terminal pattern");
        assert!(err.to_string().contains("done: true"));

        let yaml = "version: 1\nserver:\n  health_path: /\n  readiness:\n    - pattern: loading\n      done: false\n";
        assert!(read_config_from_str(yaml).is_ok());
    }

    #[test]
    fn pattern_done_defaults_to_true() {
        let yaml = "version: 1\nserver:\n  readiness:\n    - pattern: ready\n";
        let cfg = read_config_from_str(yaml).expect("config");
        assert!(cfg.server.readiness[0].done);
    }

    #[test]
    fn script_must_be_plain_file_name() {
        let yaml = "version: 1\napp:\n  script: ../escape.py\n";
        let err = read_config_from_str(yaml).expect_err("nested script");
        assert!(err.to_string().contains("app.script"));
    }

    #[test]
    fn expand_tilde_works() {
        let expanded = expand_path("~/smolctl");
        assert!(!expanded.starts_with("~/"));
    }

    #[test]
    fn root_override_wins() {
        let cfg = Config::default();
        let root = PathBuf::from("/tmp/smolctl-root");
        assert_eq!(resolve_root(Some(&root), &cfg), root);
    }
}
