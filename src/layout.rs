use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::config::Config;

pub const INSTALL_MARKER_FILE: &str = "INSTALLATION_COMPLETE.txt";
pub const UPDATE_MARKER_FILE: &str = "UPDATE_COMPLETE.txt";
pub const REQUIREMENTS_FILE: &str = "requirements.txt";

/// Every path the lifecycle touches, derived from the installation root.
#[derive(Debug, Clone, Serialize)]
pub struct Layout {
    pub root: PathBuf,
    pub app_dir: PathBuf,
    pub env_dir: PathBuf,
    pub script_path: PathBuf,
    pub requirements_path: PathBuf,
    pub install_marker: PathBuf,
    pub update_marker: PathBuf,
    pub run_dir: PathBuf,
    pub state_path: PathBuf,
    pub log_path: PathBuf,
}

impl Layout {
    pub fn new(root: &Path, cfg: &Config) -> Self {
        let app_dir = root.join("app");
        let run_dir = root.join("run");
        Self {
            root: root.to_path_buf(),
            env_dir: app_dir.join("env"),
            script_path: app_dir.join(&cfg.app.script),
            requirements_path: app_dir.join(REQUIREMENTS_FILE),
            install_marker: app_dir.join(INSTALL_MARKER_FILE),
            update_marker: app_dir.join(UPDATE_MARKER_FILE),
            state_path: run_dir.join("state.json"),
            log_path: run_dir.join("server.log"),
            app_dir,
            run_dir,
        }
    }

    /// The environment directory doubles as the "installed" flag.
    pub fn installed(&self) -> bool {
        self.env_dir.is_dir()
    }

    pub fn env_bin_dir(&self) -> PathBuf {
        if cfg!(windows) {
            self.env_dir.join("Scripts")
        } else {
            self.env_dir.join("bin")
        }
    }

    pub fn lock_path(&self, op: &str) -> PathBuf {
        self.run_dir.join(format!("{op}.lock"))
    }
}
