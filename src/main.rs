use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::json;
use std::env;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod config;
mod error;
mod launcher;
mod layout;
mod menu;
mod provision;
mod readiness;
mod shell;
mod state;

use config::{
    ensure_parent, load_config, read_config, resolve_config_path, resolve_root, Config,
    DEFAULT_CONFIG_YAML,
};
use error::{ProcessErrorDetails, SmolError};
use launcher::LaunchOptions;
use layout::Layout;
use provision::{install_plan, run_plan, update_plan, Step, StepReport, Toolchain};
use shell::{tool_available, RealShellRunner, ShellRunner};
use state::OpLock;

#[derive(Parser, Debug)]
#[command(name = "smolctl", version, about = "Install and run a local SmolLM3 chat UI")]
struct Cli {
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Installation root (defaults to paths.root from the config)
    #[arg(long, global = true)]
    root: Option<PathBuf>,
    #[arg(long, global = true)]
    json: bool,
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Clone the app, create the virtual environment and install dependencies
    Install {
        #[arg(long)]
        dry_run: bool,
    },
    /// Launch the chat server and wait until it is ready
    Start {
        /// Stay attached and stream server output until it exits
        #[arg(long)]
        foreground: bool,
        /// Readiness timeout in seconds (0 waits forever)
        #[arg(long)]
        timeout_sec: Option<u64>,
    },
    /// Terminate the running chat server
    Stop,
    Status,
    /// Upgrade dependencies and refresh the chat script
    Update {
        #[arg(long)]
        dry_run: bool,
    },
    /// Permanently delete the installation. There is no confirmation prompt.
    Reset,
    /// Print the actions available in the current state
    Menu,
    Paths,
    Doctor,
    /// Show the tail of the server log
    Logs {
        #[arg(long, default_value_t = 50)]
        lines: usize,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    Init,
    Edit,
    Validate,
    Show,
}

#[derive(Debug, Serialize)]
struct JsonResult<T: Serialize> {
    ok: bool,
    result: Option<T>,
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_details: Option<ProcessErrorDetails>,
}

#[derive(Debug, Clone)]
struct Context {
    config_path: PathBuf,
    root_override: Option<PathBuf>,
    json: bool,
}

impl Context {
    fn load(&self) -> Result<(Config, Layout), SmolError> {
        let cfg = load_config(&self.config_path)?;
        let root = resolve_root(self.root_override.as_ref(), &cfg);
        let layout = Layout::new(&root, &cfg);
        Ok((cfg, layout))
    }
}

fn main() -> Result<(), SmolError> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let ctx = build_context(&cli);
    let runner = RealShellRunner;

    let result = match cli.command {
        Commands::Config { command } => handle_config(&ctx, command),
        Commands::Install { dry_run } => handle_install(&ctx, dry_run, &runner),
        Commands::Start {
            foreground,
            timeout_sec,
        } => handle_start(&ctx, foreground, timeout_sec),
        Commands::Stop => handle_stop(&ctx),
        Commands::Status => handle_status(&ctx),
        Commands::Update { dry_run } => handle_update(&ctx, dry_run, &runner),
        Commands::Reset => handle_reset(&ctx),
        Commands::Menu => handle_menu(&ctx),
        Commands::Paths => handle_paths(&ctx),
        Commands::Doctor => handle_doctor(&ctx),
        Commands::Logs { lines } => handle_logs(&ctx, lines),
    };

    if let Err(err) = result {
        if ctx.json {
            let payload = JsonResult::<serde_json::Value> {
                ok: false,
                result: None,
                error: Some(err.to_string()),
                error_details: err.details(),
            };
            print_json(&payload)?;
        } else {
            eprintln!("{err}");
        }
        std::process::exit(1);
    }

    Ok(())
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn build_context(cli: &Cli) -> Context {
    Context {
        config_path: resolve_config_path(cli.config.as_ref()),
        root_override: cli.root.clone(),
        json: cli.json,
    }
}

fn handle_config(ctx: &Context, command: ConfigCommand) -> Result<(), SmolError> {
    match command {
        ConfigCommand::Init => {
            if ctx.config_path.exists() {
                return output(ctx, json!({"path": ctx.config_path, "created": false}));
            }
            ensure_parent(&ctx.config_path)?;
            fs::write(&ctx.config_path, DEFAULT_CONFIG_YAML)?;
            output(ctx, json!({"path": ctx.config_path, "created": true}))
        }
        ConfigCommand::Edit => {
            if !ctx.config_path.exists() {
                ensure_parent(&ctx.config_path)?;
                fs::write(&ctx.config_path, DEFAULT_CONFIG_YAML)?;
            }
            let editor = env::var("VISUAL").ok().or_else(|| env::var("EDITOR").ok());
            let Some(editor) = editor else {
                return Err(SmolError::Process(
                    "EDITOR is not set; please edit the config file manually".to_string(),
                ));
            };
            let status = Command::new(editor)
                .arg(&ctx.config_path)
                .status()
                .map_err(|err| SmolError::Process(format!("failed to launch editor: {err}")))?;
            if !status.success() {
                return Err(SmolError::Process("editor exited with error".to_string()));
            }
            read_config(&ctx.config_path)?;
            output(ctx, json!({"path": ctx.config_path, "valid": true}))
        }
        ConfigCommand::Validate => {
            if !ctx.config_path.exists() {
                return Err(SmolError::Config(format!(
                    "config file not found: {} (run `smolctl config init`)",
                    ctx.config_path.display()
                )));
            }
            read_config(&ctx.config_path)?;
            output(ctx, json!({"path": ctx.config_path, "valid": true}))
        }
        ConfigCommand::Show => {
            let cfg = load_config(&ctx.config_path)?;
            if ctx.json {
                return output(ctx, serde_json::to_value(&cfg)?);
            }
            print!("{}", serde_yaml::to_string(&cfg)?);
            Ok(())
        }
    }
}

fn step_payload(steps: &[Step]) -> Vec<serde_json::Value> {
    steps
        .iter()
        .map(|step| {
            json!({
                "name": step.name,
                "action": step.describe(),
                "skip": step.skip,
            })
        })
        .collect()
}

fn print_step_reports(ctx: &Context, reports: &[StepReport]) {
    if ctx.json {
        return;
    }
    for report in reports {
        match &report.reason {
            Some(reason) => println!("[{}] {} ({})", report.status, report.name, reason),
            None => println!("[{}] {}: {}", report.status, report.name, report.action),
        }
    }
}

fn handle_install<R: ShellRunner>(
    ctx: &Context,
    dry_run: bool,
    runner: &R,
) -> Result<(), SmolError> {
    let (cfg, layout) = ctx.load()?;
    let tools = Toolchain::resolve(&cfg, tool_available);
    let plan = install_plan(&cfg, &layout, &tools);
    if dry_run {
        return output(
            ctx,
            json!({"action": "install", "dry_run": true, "toolchain": tools, "steps": step_payload(&plan)}),
        );
    }
    let _lock = OpLock::acquire(&layout, "install")?;
    let reports = run_plan(&plan, &layout, runner, ctx.json)?;
    print_step_reports(ctx, &reports);
    output(
        ctx,
        json!({
            "action": "install",
            "root": layout.root,
            "marker": layout.install_marker,
            "steps": reports,
        }),
    )
}

fn handle_update<R: ShellRunner>(
    ctx: &Context,
    dry_run: bool,
    runner: &R,
) -> Result<(), SmolError> {
    let (cfg, layout) = ctx.load()?;
    if !layout.installed() {
        return Err(SmolError::NotInstalled(
            layout.env_dir.to_string_lossy().to_string(),
        ));
    }
    let tools = Toolchain::resolve(&cfg, tool_available);
    let plan = update_plan(&cfg, &layout, &tools);
    if dry_run {
        return output(
            ctx,
            json!({"action": "update", "dry_run": true, "toolchain": tools, "steps": step_payload(&plan)}),
        );
    }
    let _lock = OpLock::acquire(&layout, "update")?;
    let reports = run_plan(&plan, &layout, runner, ctx.json)?;
    print_step_reports(ctx, &reports);
    output(
        ctx,
        json!({
            "action": "update",
            "marker": layout.update_marker,
            "steps": reports,
        }),
    )
}

fn handle_reset(ctx: &Context) -> Result<(), SmolError> {
    let (cfg, layout) = ctx.load()?;
    let _lock = OpLock::acquire(&layout, "reset")?;
    let report = provision::reset(&layout, Duration::from_secs(cfg.server.stop_grace_sec))?;
    if !ctx.json {
        println!("{} has been removed. Reinstall with `smolctl install`.", cfg.model.name);
    }
    output(ctx, json!({"action": "reset", "result": report}))
}

fn handle_start(
    ctx: &Context,
    foreground: bool,
    timeout_sec: Option<u64>,
) -> Result<(), SmolError> {
    let (cfg, layout) = ctx.load()?;
    let opts = LaunchOptions {
        foreground,
        timeout: timeout_sec.map(Duration::from_secs),
    };
    let json_mode = ctx.json;
    let mut echo = |line: &str| {
        if json_mode {
            eprintln!("{line}");
        } else {
            println!("{line}");
            let _ = std::io::stdout().flush();
        }
    };
    let record = launcher::start(&cfg, &layout, &opts, &mut echo)?;
    if ctx.json {
        return output(ctx, serde_json::to_value(&record)?);
    }
    if !foreground {
        if let Some(url) = &record.url {
            println!("{} is running at {url}", cfg.model.title);
        }
    }
    Ok(())
}

fn handle_stop(ctx: &Context) -> Result<(), SmolError> {
    let (cfg, layout) = ctx.load()?;
    let report = launcher::stop(&cfg, &layout)?;
    if ctx.json {
        return output(ctx, serde_json::to_value(&report)?);
    }
    match report.pid {
        Some(pid) if report.stopped => println!("Stopped server (pid {pid})."),
        Some(_) => println!("Server was not running; cleared stale record."),
        None => println!("Server is not running."),
    }
    Ok(())
}

fn handle_status(ctx: &Context) -> Result<(), SmolError> {
    let (_cfg, layout) = ctx.load()?;
    let report = launcher::status(&layout)?;
    if ctx.json {
        return output(ctx, serde_json::to_value(&report)?);
    }
    println!("installed: {}", report.installed);
    println!("phase: {}", report.phase);
    if let Some(pid) = report.pid {
        println!("pid: {pid} ({})", if report.alive { "alive" } else { "exited" });
    }
    if let Some(url) = &report.url {
        println!("url: {url}");
    }
    if let Some(detail) = &report.detail {
        println!("detail: {detail}");
    }
    Ok(())
}

fn handle_menu(ctx: &Context) -> Result<(), SmolError> {
    let (cfg, layout) = ctx.load()?;
    let input = menu::observe(&layout, &cfg.model.name);
    let actions = menu::menu(&input);
    if ctx.json {
        return output(ctx, json!({"state": input, "actions": actions}));
    }
    for action in &actions {
        let marker = if action.default { "*" } else { " " };
        println!("{marker} {:<28} -> {}", action.text, action.href);
    }
    Ok(())
}

fn handle_paths(ctx: &Context) -> Result<(), SmolError> {
    let (_cfg, layout) = ctx.load()?;
    let mut payload = serde_json::to_value(&layout)?;
    if let Some(map) = payload.as_object_mut() {
        map.insert("config_path".to_string(), json!(ctx.config_path));
        map.insert("config_exists".to_string(), json!(ctx.config_path.exists()));
    }
    output(ctx, payload)
}

#[derive(Debug, Clone, Serialize)]
struct DoctorCheck {
    name: String,
    ok: bool,
    required: bool,
    detail: String,
}

fn tool_check(name: &str, required: bool) -> DoctorCheck {
    match which::which(name) {
        Ok(path) => DoctorCheck {
            name: name.to_string(),
            ok: true,
            required,
            detail: path.to_string_lossy().to_string(),
        },
        Err(_) => DoctorCheck {
            name: name.to_string(),
            ok: false,
            required,
            detail: "not found on PATH".to_string(),
        },
    }
}

fn root_writable(root: &std::path::Path) -> bool {
    fs::create_dir_all(root)
        .and_then(|_| {
            let test_path = root.join(".smolctl_write_test");
            fs::write(&test_path, b"ok")?;
            fs::remove_file(&test_path)?;
            Ok(())
        })
        .is_ok()
}

fn handle_doctor(ctx: &Context) -> Result<(), SmolError> {
    let (cfg, layout) = ctx.load()?;
    let mut checks = Vec::new();
    checks.push(tool_check("git", !cfg.app.repository.trim().is_empty()));
    let python = if cfg!(windows) { "python" } else { "python3" };
    checks.push(tool_check(
        python,
        cfg.python.venv_command.trim().is_empty() && !tool_available("uv"),
    ));
    checks.push(tool_check("uv", false));
    checks.push(tool_check("nvidia-smi", false));
    let writable = root_writable(&layout.root);
    checks.push(DoctorCheck {
        name: "root_writable".to_string(),
        ok: writable,
        required: true,
        detail: layout.root.to_string_lossy().to_string(),
    });

    let failed: Vec<&DoctorCheck> = checks.iter().filter(|c| c.required && !c.ok).collect();
    let ok = failed.is_empty();
    let error = failed
        .first()
        .map(|check| format!("{} check failed: {}", check.name, check.detail));

    if ctx.json {
        let payload = JsonResult {
            ok,
            result: Some(json!({ "checks": checks })),
            error: error.clone(),
            error_details: None,
        };
        print_json(&payload)?;
        if !ok {
            std::process::exit(1);
        }
        return Ok(());
    }

    for check in &checks {
        let status = match (check.ok, check.required) {
            (true, _) => "ok",
            (false, true) => "MISSING",
            (false, false) => "missing (optional)",
        };
        println!("{:<14} {:<20} {}", check.name, status, check.detail);
    }
    match error {
        Some(message) => Err(SmolError::Process(message)),
        None => Ok(()),
    }
}

fn handle_logs(ctx: &Context, lines: usize) -> Result<(), SmolError> {
    let (_cfg, layout) = ctx.load()?;
    let target = &layout.log_path;
    if !target.exists() {
        return Err(SmolError::Process(format!(
            "log not found: {}",
            target.display()
        )));
    }
    let bytes = fs::read(target)?;
    let content = String::from_utf8_lossy(&bytes);
    let lines_vec: Vec<&str> = content.lines().collect();
    let start = lines_vec.len().saturating_sub(lines);
    if ctx.json {
        return output(ctx, json!({"path": target, "lines": &lines_vec[start..]}));
    }
    for line in &lines_vec[start..] {
        println!("{}", line);
    }
    Ok(())
}

fn output(ctx: &Context, payload: serde_json::Value) -> Result<(), SmolError> {
    if ctx.json {
        let wrapper = JsonResult {
            ok: true,
            result: Some(payload),
            error: None,
            error_details: None,
        };
        print_json(&wrapper)?;
    } else {
        println!("{}", payload);
    }
    Ok(())
}

fn print_json<T: Serialize>(payload: &T) -> Result<(), SmolError> {
    let text = serde_json::to_string_pretty(payload)?;
    println!("{}", text);
    Ok(())
}
