//! tpfw - transparent-proxy firewall rules
//!
//! Command-line front end for installing and removing the iptables chains
//! that feed a local TPROXY proxy.
//!
//! # Usage
//!
//! ```bash
//! tpfw apply                       # Install all chains and hooks
//! tpfw clean                       # Remove everything tpfw installed
//! tpfw run                         # apply, wait for SIGINT/SIGTERM, clean
//! tpfw plan clean                  # Print the iptables commands without running them
//! tpfw status                      # Show which chains exist and recent audit events
//! tpfw check                       # Preflight: privileges, capabilities, iptables binary
//! tpfw init-config                 # Write the default config file
//! tpfw --tproxy-port 7894 apply    # Override a config value for one run
//! ```

use clap::{Args, Parser, Subcommand, ValueEnum};
use ipnetwork::Ipv4Network;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tpfw::audit::{self, AuditLog};
use tpfw::config::{self, AppConfig};
use tpfw::core::error::IptablesErrorPattern;
use tpfw::core::plan::Step;
use tpfw::{elevation, preflight};
use tpfw::{Error, IptablesCli, Orchestrator, Result};
use tokio::signal::unix::{Signal, SignalKind, signal};
use tracing::{Level, error, info, warn};

shadow_rs::shadow!(build);

type Tpfw = Orchestrator<IptablesCli>;

#[derive(Parser)]
#[command(name = "tpfw")]
#[command(about = "Transparent-proxy firewall rules for a local TPROXY proxy", long_about = None)]
#[command(version, long_version = build::CLAP_LONG_VERSION)]
struct Cli {
    /// Config file (default: ~/.config/tpfw/config.json)
    #[arg(short, long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: Level,

    /// Shorthand for --log-level debug
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Append logs to this file instead of stderr
    #[arg(long, global = true, value_name = "PATH")]
    log_file: Option<PathBuf>,

    #[command(flatten)]
    overrides: Overrides,

    #[command(subcommand)]
    command: Commands,
}

/// Per-run overrides of config file values
#[derive(Args)]
struct Overrides {
    /// Proxy TPROXY listener port
    #[arg(long, global = true)]
    tproxy_port: Option<u16>,

    /// Proxy DNS listener port
    #[arg(long, global = true)]
    dns_port: Option<u16>,

    /// Proxy fake-IP block (CIDR)
    #[arg(long, global = true)]
    fake_ip_range: Option<Ipv4Network>,

    /// fwmark set on intercepted packets, value[/mask]
    #[arg(long, global = true)]
    tproxy_mark: Option<String>,

    /// DNS destinations to hijack (comma separated, repeatable)
    #[arg(long, global = true, value_delimiter = ',')]
    hijack_dns: Vec<String>,

    /// User the proxy runs as
    #[arg(long, global = true)]
    clash_user: Option<String>,

    /// Group whose traffic bypasses the proxy
    #[arg(long, global = true)]
    direct_group: Option<String>,
}

impl Overrides {
    fn apply_to(&self, config: &mut AppConfig) {
        if let Some(port) = self.tproxy_port {
            config.proxy.tproxy_port = port;
        }
        if let Some(port) = self.dns_port {
            config.proxy.dns_port = port;
        }
        if let Some(range) = self.fake_ip_range {
            config.proxy.fake_ip_range = range;
        }
        if let Some(mark) = &self.tproxy_mark {
            config.host.tproxy_mark.clone_from(mark);
        }
        if !self.hijack_dns.is_empty() {
            config.host.hijack_dns.clone_from(&self.hijack_dns);
        }
        if let Some(user) = &self.clash_user {
            config.host.clash_user.clone_from(user);
        }
        if let Some(group) = &self.direct_group {
            config.host.direct_group.clone_from(group);
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Install all chains and hooks
    Apply,
    /// Remove all chains, hooks and satellite rules
    Clean,
    /// Apply, wait for SIGINT/SIGTERM, then clean
    Run,
    /// Print the iptables commands a lifecycle call would issue
    Plan {
        #[arg(value_enum, default_value_t = PlanKind::Apply)]
        kind: PlanKind,
    },
    /// Show which chains exist and recent audit events
    Status {
        /// Number of audit events to show
        #[arg(long, default_value_t = 5)]
        history: usize,
    },
    /// Check privileges, capabilities and the iptables binary
    Check,
    /// Write the effective configuration to the config file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

impl Commands {
    /// Commands that query or mutate the rule table
    fn needs_root(&self) -> bool {
        matches!(self, Self::Apply | Self::Clean | Self::Run | Self::Status { .. })
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum PlanKind {
    Apply,
    Clean,
}

fn main() -> ExitCode {
    let _ = tpfw::utils::ensure_dirs();
    let cli = Cli::parse();

    if let Err(e) = init_logging(&cli) {
        eprintln!("Error: failed to open log file: {e}");
        return ExitCode::FAILURE;
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to create Tokio runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(handle_cli(cli)) {
        Ok(code) => code,
        Err(e) => {
            report(&e);
            ExitCode::FAILURE
        }
    }
}

fn init_logging(cli: &Cli) -> std::io::Result<()> {
    let level = if cli.verbose { Level::DEBUG } else { cli.log_level };
    let builder = tracing_subscriber::fmt().with_max_level(level).with_target(false);

    if let Some(path) = &cli.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        builder
            .with_ansi(false)
            .with_writer(std::sync::Mutex::new(file))
            .init();
    } else {
        builder.with_writer(std::io::stderr).init();
    }
    Ok(())
}

/// Prints the error and, for rule-table failures, what iptables most likely meant.
fn report(e: &Error) {
    eprintln!("Error: {e}");

    if matches!(e, Error::Elevation(_)) {
        eprintln!("  Run tpfw as root, or set TPFW_ELEVATION_METHOD to sudo, run0 or pkexec");
        return;
    }

    let Some(diagnostic) = e.diagnostic() else {
        return;
    };
    let translation = IptablesErrorPattern::match_error(diagnostic);
    eprintln!("  {}", translation.user_message);
    for suggestion in &translation.suggestions {
        eprintln!("  - {suggestion}");
    }
    if let Some(url) = &translation.help_url {
        eprintln!("  See: {url}");
    }
}

fn config_path(explicit: Option<&Path>) -> Result<PathBuf> {
    explicit
        .map(Path::to_path_buf)
        .or_else(config::default_config_path)
        .ok_or_else(|| Error::Internal("could not determine config directory".to_string()))
}

async fn load(cli: &Cli) -> Result<AppConfig> {
    let path = config_path(cli.config.as_deref())?;
    let mut config = config::load_config(&path).await?;
    cli.overrides.apply_to(&mut config);
    config.validate()
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Internal(format!("rule worker panicked: {e}")))
}

async fn apply(orch: &Arc<Tpfw>) -> Result<()> {
    let worker = Arc::clone(orch);
    let (steps, result) = blocking(move || (worker.plan_apply().len(), worker.apply())).await?;
    audit::log_apply(steps, result.is_ok(), result.as_ref().err().map(ToString::to_string)).await;
    result
}

async fn clean(orch: &Arc<Tpfw>) -> Result<()> {
    let worker = Arc::clone(orch);
    let (steps, result) = blocking(move || (worker.plan_clean().len(), worker.clean())).await?;
    audit::log_clean(steps, result.is_ok(), result.as_ref().err().map(ToString::to_string)).await;
    result
}

/// SIGINT/SIGTERM listener. Registering it replaces the default disposition,
/// so a signal that arrives while rules are being applied is queued instead of
/// killing the process halfway.
struct Shutdown {
    interrupt: Signal,
    terminate: Signal,
}

impl Shutdown {
    fn register() -> Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    async fn wait(&mut self) {
        tokio::select! {
            _ = self.interrupt.recv() => {}
            _ = self.terminate.recv() => {}
        }
    }
}

/// This invocation's arguments, pinned to the caller's config file so the
/// elevated process does not read root's.
fn reexec_args(cli: &Cli) -> Result<Vec<OsString>> {
    let mut args: Vec<OsString> = std::env::args_os().skip(1).collect();
    if cli.config.is_none() {
        args.push("--config".into());
        args.push(config_path(None)?.into_os_string());
    }
    Ok(args)
}

/// Runs the elevated copy of this invocation and relays its exit status.
///
/// The terminal delivers SIGINT to the elevated child directly; SIGTERM sent
/// to this process is forwarded to the helper.
async fn run_elevated(cmd: std::process::Command) -> Result<ExitCode> {
    info!(
        "Not running as root, re-running through {}",
        cmd.get_program().to_string_lossy()
    );
    let mut shutdown = Shutdown::register()?;
    let mut child = tokio::process::Command::from(cmd).spawn()?;
    let pid = child.id();

    let status = loop {
        tokio::select! {
            status = child.wait() => break status?,
            _ = shutdown.interrupt.recv() => {}
            _ = shutdown.terminate.recv() => forward_terminate(pid),
        }
    };
    Ok(status
        .code()
        .and_then(|code| u8::try_from(code).ok())
        .map_or(ExitCode::FAILURE, ExitCode::from))
}

fn forward_terminate(pid: Option<u32>) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Some(pid) = pid.and_then(|id| i32::try_from(id).ok()) else {
        return;
    };
    if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
        warn!("Could not forward SIGTERM to the elevated process: {e}");
    }
}

async fn handle_cli(cli: Cli) -> Result<ExitCode> {
    if cli.command.needs_root()
        && let Some(cmd) = elevation::elevated_self_command(reexec_args(&cli)?)?
    {
        return run_elevated(cmd).await;
    }

    match &cli.command {
        Commands::Apply => {
            let config = load(&cli).await?;
            let orch = Arc::new(Tpfw::new(IptablesCli::from_env(), config.proxy, config.host));
            apply(&orch).await?;
            println!("✓ Rules applied.");
        }
        Commands::Clean => {
            let config = load(&cli).await?;
            let orch = Arc::new(Tpfw::new(IptablesCli::from_env(), config.proxy, config.host));
            clean(&orch).await?;
            println!("✓ Rules cleaned.");
        }
        Commands::Run => {
            let config = load(&cli).await?;
            let orch = Arc::new(Tpfw::new(IptablesCli::from_env(), config.proxy, config.host));
            let mut shutdown = Shutdown::register()?;

            if let Err(e) = apply(&orch).await {
                error!("apply failed, cleaning up: {e}");
                if let Err(clean_err) = clean(&orch).await {
                    warn!("cleanup after failed apply also failed: {clean_err}");
                }
                return Err(e);
            }

            info!("rules applied, waiting for SIGINT/SIGTERM");
            shutdown.wait().await;
            info!("shutting down");
            clean(&orch).await?;
        }
        Commands::Plan { kind } => {
            let config = load(&cli).await?;
            let orch = Tpfw::new(IptablesCli::from_env(), config.proxy, config.host);
            let steps = match *kind {
                PlanKind::Apply => orch.plan_apply(),
                PlanKind::Clean => orch.plan_clean(),
            };
            for command in steps.iter().flat_map(Step::commands) {
                println!("{command}");
            }
        }
        Commands::Status { history } => {
            let config = load(&cli).await?;
            let orch = Arc::new(Tpfw::new(IptablesCli::from_env(), config.proxy, config.host));
            let worker = Arc::clone(&orch);
            let status = blocking(move || worker.status()).await??;

            for chain in &status.chains {
                println!(
                    "  {:<24} hooked from {:<18} {}",
                    chain.chain.to_string(),
                    chain.hook.to_string(),
                    match (chain.exists, chain.hooked) {
                        (true, true) => "applied",
                        (true, false) => "present, not hooked",
                        (false, true) => "absent, dangling hook",
                        (false, false) => "absent",
                    }
                );
            }
            let summary = if status.is_applied() {
                "applied"
            } else if status.is_clean() {
                "clean"
            } else {
                "partially applied (run `tpfw clean`)"
            };
            println!("State: {summary}");

            if *history > 0
                && let Ok(log) = AuditLog::new()
            {
                let events = log.read_recent(*history).await?;
                if !events.is_empty() {
                    println!();
                    println!("Recent operations:");
                }
                for event in events {
                    println!(
                        "  {} {:<12} {}{}",
                        event.timestamp.format("%Y-%m-%d %H:%M:%S"),
                        event.event_type.to_string(),
                        if event.success { "ok" } else { "failed" },
                        event.error.map(|e| format!(": {e}")).unwrap_or_default()
                    );
                }
            }
        }
        Commands::Check => {
            let checks = preflight::run_checks(IptablesCli::from_env().program());
            let config_ok = match load(&cli).await {
                Ok(_) => true,
                Err(e) => {
                    println!("[FAIL] config: {e}");
                    false
                }
            };
            for check in &checks {
                println!("{check}");
            }

            let (_, warn_count, fail_count) = preflight::summarize(&checks);
            let fail_count = fail_count + usize::from(!config_ok);
            println!();
            println!("Preflight: WARN={warn_count} FAIL={fail_count}");
            if fail_count > 0 {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::InitConfig { force } => {
            let path = config_path(cli.config.as_deref())?;
            if path.exists() && !*force {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    format!("{} already exists (use --force to overwrite)", path.display()),
                )
                .into());
            }
            let mut config = AppConfig::default();
            cli.overrides.apply_to(&mut config);
            let config = config.validate()?;
            config::save_config(&config, &path).await?;
            println!("✓ Wrote {}", path.display());
        }
    }
    Ok(ExitCode::SUCCESS)
}
