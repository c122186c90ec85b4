use serde::Serialize;
use std::io;
use thiserror::Error;

use crate::state::Phase;

#[derive(Debug, Error)]
pub enum SmolError {
    #[error("config error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("pattern error: {0}")]
    Regex(#[from] regex::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("process error: {0}")]
    Process(String),
    #[error("process error: {message}")]
    ProcessDetailed {
        message: String,
        details: ProcessErrorDetails,
    },
    #[error("not installed: {0} is missing; run `smolctl install` first")]
    NotInstalled(String),
    #[error("server already running (pid {pid}){}", url.as_ref().map(|u| format!(" at {u}")).unwrap_or_default())]
    AlreadyRunning { pid: u32, url: Option<String> },
    #[error("{op} is already in progress{}", pid.map(|p| format!(" (pid {p})")).unwrap_or_default())]
    Busy { op: String, pid: Option<u32> },
    #[error("illegal state transition: {from} -> {to}")]
    IllegalTransition { from: Phase, to: Phase },
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ProcessErrorDetails {
    pub error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_stderr: Option<String>,
}

impl SmolError {
    pub fn details(&self) -> Option<ProcessErrorDetails> {
        match self {
            SmolError::ProcessDetailed { details, .. } => Some(details.clone()),
            SmolError::NotInstalled(_) => Some(code_only("not_installed")),
            SmolError::AlreadyRunning { .. } => Some(code_only("already_running")),
            SmolError::Busy { .. } => Some(code_only("operation_busy")),
            _ => None,
        }
    }
}

fn code_only(code: &str) -> ProcessErrorDetails {
    ProcessErrorDetails {
        error_code: code.to_string(),
        step: None,
        hint: None,
        command: None,
        raw_stderr: None,
    }
}
