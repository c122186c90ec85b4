//! Menu state: which actions to offer for the current install/run state.

use serde::Serialize;
use std::collections::BTreeMap;

use crate::layout::Layout;
use crate::state::{current_record, op_running};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Running {
    pub install: bool,
    pub start: bool,
    pub update: bool,
    pub reset: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MenuInput {
    pub name: String,
    pub installed: bool,
    pub running: Running,
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MenuAction {
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub default: bool,
    pub icon: String,
    pub text: String,
    pub href: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<BTreeMap<String, String>>,
}

impl MenuAction {
    fn new(icon: &str, text: impl Into<String>, href: impl Into<String>) -> Self {
        Self {
            default: false,
            icon: icon.to_string(),
            text: text.into(),
            href: href.into(),
            params: None,
        }
    }

    fn default_action(mut self) -> Self {
        self.default = true;
        self
    }
}

/// No I/O; the same input always produces the same list.
pub fn menu(input: &MenuInput) -> Vec<MenuAction> {
    let name = &input.name;
    let running = &input.running;
    if running.install {
        return vec![
            MenuAction::new("fa-solid fa-plug", format!("Installing {name}..."), "install")
                .default_action(),
        ];
    }
    if running.update {
        return vec![
            MenuAction::new("fa-solid fa-sync", format!("Updating {name}..."), "update")
                .default_action(),
        ];
    }
    if running.reset {
        return vec![
            MenuAction::new("fa-solid fa-trash", format!("Resetting {name}..."), "reset")
                .default_action(),
        ];
    }
    if !input.installed {
        return vec![
            MenuAction::new("fa-solid fa-download", format!("Install {name}"), "install")
                .default_action(),
        ];
    }
    if running.start {
        return match &input.url {
            Some(url) => vec![
                MenuAction::new("fa-solid fa-robot", format!("Open {name} Chatbot"), url.clone())
                    .default_action(),
                MenuAction::new("fa-solid fa-terminal", "View Terminal", "logs"),
                MenuAction::new("fa-solid fa-stop", "Stop Application", "stop"),
            ],
            None => vec![
                MenuAction::new("fa-solid fa-spinner fa-spin", "Starting...", "start")
                    .default_action(),
            ],
        };
    }
    vec![
        MenuAction::new("fa-solid fa-play", format!("Start {name} Chatbot"), "start")
            .default_action(),
        MenuAction::new("fa-solid fa-sync", "Update", "update"),
        MenuAction::new("fa-solid fa-download", "Reinstall", "install"),
        MenuAction::new("fa-solid fa-trash", "Reset", "reset"),
    ]
}

/// Reads the observable state the menu depends on. Never writes.
pub fn observe(layout: &Layout, name: &str) -> MenuInput {
    let record = match current_record(layout) {
        Ok(record) => record,
        Err(err) => {
            tracing::warn!(error = %err, "ignoring unreadable process record");
            None
        }
    };
    let (server_alive, url) = match &record {
        Some((record, alive)) => (*alive, record.live_url(*alive).map(str::to_string)),
        None => (false, None),
    };
    MenuInput {
        name: name.to_string(),
        installed: layout.installed(),
        running: Running {
            install: op_running(layout, "install"),
            start: server_alive || op_running(layout, "start"),
            update: op_running(layout, "update"),
            reset: op_running(layout, "reset"),
        },
        url,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use tempfile::tempdir;

    fn input(installed: bool, running: Running, url: Option<&str>) -> MenuInput {
        MenuInput {
            name: "SmolLM3-3B".to_string(),
            installed,
            running,
            url: url.map(str::to_string),
        }
    }

    fn hrefs(actions: &[MenuAction]) -> Vec<&str> {
        actions.iter().map(|a| a.href.as_str()).collect()
    }

    #[test]
    fn not_installed_offers_install() {
        let actions = menu(&input(false, Running::default(), None));
        assert_eq!(hrefs(&actions), vec!["install"]);
        assert_eq!(actions[0].text, "Install SmolLM3-3B");
        assert!(actions[0].default);
    }

    #[test]
    fn install_in_progress_wins_over_everything() {
        let running = Running {
            install: true,
            start: true,
            ..Running::default()
        };
        let actions = menu(&input(true, running, Some("http://localhost:7860")));
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].text, "Installing SmolLM3-3B...");
    }

    #[test]
    fn installed_idle_offers_start_first() {
        let actions = menu(&input(true, Running::default(), None));
        assert_eq!(hrefs(&actions), vec!["start", "update", "install", "reset"]);
        assert!(actions[0].default);
        assert!(actions[1..].iter().all(|a| !a.default));
    }

    #[test]
    fn starting_without_url_shows_spinner() {
        let running = Running {
            start: true,
            ..Running::default()
        };
        let actions = menu(&input(true, running, None));
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].text, "Starting...");
    }

    #[test]
    fn ready_server_offers_open_terminal_stop() {
        let running = Running {
            start: true,
            ..Running::default()
        };
        let actions = menu(&input(true, running, Some("http://localhost:7860")));
        assert_eq!(
            hrefs(&actions),
            vec!["http://localhost:7860", "logs", "stop"]
        );
        assert_eq!(actions[0].text, "Open SmolLM3-3B Chatbot");
    }

    #[test]
    fn menu_is_referentially_transparent() {
        let cases = [
            input(false, Running::default(), None),
            input(true, Running::default(), None),
            input(
                true,
                Running {
                    start: true,
                    ..Running::default()
                },
                Some("http://localhost:1"),
            ),
        ];
        for case in &cases {
            assert_eq!(menu(case), menu(&case.clone()));
        }
    }

    #[test]
    fn default_flag_is_omitted_when_false() {
        let actions = menu(&input(true, Running::default(), None));
        let value = serde_json::to_value(&actions).unwrap();
        assert_eq!(value[0]["default"], serde_json::Value::Bool(true));
        assert!(value[1].get("default").is_none());
    }

    #[test]
    fn observe_fresh_root_is_not_installed() {
        let dir = tempdir().unwrap();
        let layout = Layout::new(dir.path(), &Config::default());
        let observed = observe(&layout, "SmolLM3-3B");
        assert!(!observed.installed);
        assert_eq!(observed.running, Running::default());
        assert_eq!(observed.url, None);
    }
}
