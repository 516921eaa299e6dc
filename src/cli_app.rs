//! Top-level CLI definition and dispatch.

use std::fs;
use std::io::{self, BufRead, BufReader, IsTerminal, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::{ArgGroup, Args, CommandFactory, Parser, Subcommand};
use clap_complete::{Shell as CompletionShell, generate};
use colored::{Colorize, control};
use serde_json::{Value, json};
use thiserror::Error;
use tracing_subscriber::EnvFilter;

use fleet_rule_engine::api::{self, ApiState};
use fleet_rule_engine::audit::types::{AlertDetailRow, ProgressRow};
use fleet_rule_engine::audit::{AuditManifest, AuditSink, PageRequest, SortOrder, SqliteAuditStore};
use fleet_rule_engine::core::config::Config;
use fleet_rule_engine::core::errors::FreError;
use fleet_rule_engine::engine::{Engine, NativeRuleCompiler, ProcessReport, RuleCompiler};
use fleet_rule_engine::notify::NotificationEvent;
use fleet_rule_engine::store::{
    DEFAULT_RULE_PRIORITY, GeofenceStore, RuleDefinition, RuleSource, ShapeKind, SqliteStore,
};

/// Fleet rule engine: per-device rule execution and audit for GPS telemetry.
#[derive(Debug, Parser)]
#[command(
    name = "fre",
    author,
    version,
    about = "Fleet Rule Engine - GPS telemetry rules and audit",
    long_about = None,
    arg_required_else_help = true
)]
pub struct Cli {
    /// Override config file path.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Force JSON output mode.
    #[arg(long, global = true)]
    json: bool,
    /// Disable colored output.
    #[arg(long, global = true)]
    no_color: bool,
    /// Increase verbosity.
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,
    /// Quiet mode (errors only).
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Run workers, maintenance and the audit HTTP API.
    Serve(ServeArgs),
    /// Process payloads from a file or stdin, one JSON document per line.
    Ingest(IngestArgs),
    /// Query or clear captured audit rows.
    Audit(AuditArgs),
    /// Manage stored rules.
    Rules(RulesArgs),
    /// Manage geofence reference data.
    Geofence(GeofenceArgs),
    /// Inspect configuration.
    Config(ConfigArgs),
    /// Generate shell completions.
    Completions(CompletionsArgs),
}

#[derive(Debug, Clone, Args, Default)]
struct ServeArgs {
    /// Override `[api].bind`.
    #[arg(long, value_name = "ADDR")]
    bind: Option<String>,
    /// Do not start the HTTP API.
    #[arg(long)]
    no_api: bool,
    /// Feed payload lines from stdin into the worker pool.
    #[arg(long)]
    stdin: bool,
}

#[derive(Debug, Clone, Args, Default)]
struct IngestArgs {
    /// Payload file; `-` or omitted reads stdin.
    #[arg(value_name = "FILE")]
    input: Option<PathBuf>,
    /// Capture progress audit for this run regardless of config.
    #[arg(long)]
    progress: bool,
}

#[derive(Debug, Clone, Args)]
struct AuditArgs {
    #[command(subcommand)]
    command: AuditCommand,
}

#[derive(Debug, Clone, Subcommand)]
enum AuditCommand {
    /// Per (device, rule) progress summary.
    Summary(AuditSummaryArgs),
    /// Progress rows for one device.
    Timeline(AuditTimelineArgs),
    /// Stored snapshot of one progress row.
    Snapshot {
        /// Progress row id.
        id: i64,
    },
    /// Alert rollup, or fired alerts for one device.
    Alerts(AuditAlertsArgs),
    /// Delete every progress row.
    Clear,
}

#[derive(Debug, Clone, Args)]
struct AuditSummaryArgs {
    /// Exact rule name filter.
    #[arg(long)]
    rule: Option<String>,
    /// Device id substring filter.
    #[arg(long)]
    imei: Option<String>,
    #[arg(long, default_value_t = 1)]
    page: u32,
    #[arg(long, default_value_t = 25)]
    rows: u32,
}

#[derive(Debug, Clone, Args)]
struct AuditTimelineArgs {
    imei: String,
    #[arg(long)]
    rule: Option<String>,
    #[arg(long, default_value_t = 1)]
    page: u32,
    #[arg(long, default_value_t = 20)]
    rows: u32,
}

#[derive(Debug, Clone, Args)]
struct AuditAlertsArgs {
    /// Show fired alerts for this device instead of the rollup.
    #[arg(long)]
    imei: Option<String>,
    #[arg(long, default_value_t = 50)]
    limit: u32,
}

#[derive(Debug, Clone, Args)]
struct RulesArgs {
    #[command(subcommand)]
    command: RulesCommand,
}

#[derive(Debug, Clone, Subcommand)]
enum RulesCommand {
    /// List every stored rule.
    List,
    /// Add or replace a rule.
    Add(RuleAddArgs),
    /// Activate a stored rule.
    Enable { name: String },
    /// Deactivate a stored rule.
    Disable { name: String },
    /// Compile every active rule and parse its manifest.
    Check,
}

#[derive(Debug, Clone, Args)]
struct RuleAddArgs {
    name: String,
    /// Script body, e.g. `native:jammer_detection offline_minutes=5`.
    #[arg(long)]
    script: String,
    #[arg(long, default_value_t = DEFAULT_RULE_PRIORITY)]
    priority: i64,
    #[arg(long, default_value = "")]
    description: String,
    /// YAML audit manifest fragment.
    #[arg(long, value_name = "FILE")]
    manifest: Option<PathBuf>,
    /// Store the rule inactive.
    #[arg(long)]
    inactive: bool,
}

#[derive(Debug, Clone, Args)]
struct GeofenceArgs {
    #[command(subcommand)]
    command: GeofenceCommand,
}

#[derive(Debug, Clone, Subcommand)]
enum GeofenceCommand {
    /// Add a shape to a group.
    Add(GeofenceAddArgs),
    /// Test a coordinate against a group.
    Check(GeofenceCheckArgs),
}

#[derive(Debug, Clone, Args)]
#[command(group(ArgGroup::new("shape").required(true).args(["circle", "bbox"])))]
struct GeofenceAddArgs {
    group: String,
    name: String,
    /// `LAT,LON,RADIUS_M`
    #[arg(long, allow_hyphen_values = true)]
    circle: Option<String>,
    /// `MIN_LAT,MAX_LAT,MIN_LON,MAX_LON`
    #[arg(long, allow_hyphen_values = true)]
    bbox: Option<String>,
}

#[derive(Debug, Clone, Args)]
#[command(allow_negative_numbers = true)]
struct GeofenceCheckArgs {
    group: String,
    lat: f64,
    lon: f64,
}

#[derive(Debug, Clone, Args, Default)]
struct ConfigArgs {
    #[command(subcommand)]
    command: Option<ConfigCommand>,
}

#[derive(Debug, Clone, Subcommand)]
enum ConfigCommand {
    /// Print the config file path.
    Path,
    /// Print the effective configuration.
    Show,
    /// Validate the configuration.
    Validate,
}

#[derive(Debug, Clone, Args)]
struct CompletionsArgs {
    /// Shell to generate completion script for.
    #[arg(value_enum)]
    shell: CompletionShell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputMode {
    Human,
    Json,
}

/// CLI error type with explicit exit-code mapping.
#[derive(Debug, Error)]
pub enum CliError {
    /// Invalid user input at runtime.
    #[error("{0}")]
    User(String),
    /// Environment/runtime failure.
    #[error("{0}")]
    Runtime(String),
    /// Operation partially succeeded.
    #[error("{0}")]
    Partial(String),
    /// JSON serialization failed.
    #[error("failed to serialize output: {0}")]
    Json(#[from] serde_json::Error),
    /// Output write failed.
    #[error("failed to write output: {0}")]
    Io(#[from] io::Error),
}

impl CliError {
    /// Process exit code contract for the CLI.
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::User(_) => 1,
            Self::Runtime(_) | Self::Io(_) => 2,
            Self::Json(_) => 3,
            Self::Partial(_) => 4,
        }
    }
}

impl From<FreError> for CliError {
    fn from(error: FreError) -> Self {
        match error {
            FreError::InvalidConfig { .. }
            | FreError::MissingConfig { .. }
            | FreError::ConfigParse { .. }
            | FreError::ManifestParse { .. }
            | FreError::RuleCompile { .. }
            | FreError::NotFound { .. } => Self::User(error.to_string()),
            other => Self::Runtime(other.to_string()),
        }
    }
}

/// Install the tracing subscriber. `FRE_LOG` wins over `RUST_LOG`, which wins
/// over the `-v`/`-q` defaults.
pub fn init_logging(cli: &Cli) {
    let default = if cli.quiet {
        "error"
    } else if cli.verbose {
        "fleet_rule_engine=debug,fre=debug"
    } else {
        "fleet_rule_engine=info,fre=info"
    };
    let filter = EnvFilter::try_from_env("FRE_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

/// Dispatch CLI commands.
pub fn run(cli: &Cli) -> Result<(), CliError> {
    if cli.no_color {
        control::set_override(false);
    }

    match &cli.command {
        Command::Serve(args) => run_serve(cli, args),
        Command::Ingest(args) => run_ingest(cli, args),
        Command::Audit(args) => run_audit(cli, args),
        Command::Rules(args) => run_rules(cli, args),
        Command::Geofence(args) => run_geofence(cli, args),
        Command::Config(args) => run_config(cli, args),
        Command::Completions(args) => {
            let mut command = Cli::command();
            let binary_name = command.get_name().to_string();
            generate(args.shell, &mut command, binary_name, &mut io::stdout());
            Ok(())
        }
    }
}

fn load_config(cli: &Cli) -> Result<Config, CliError> {
    Ok(Config::load(cli.config.as_deref())?)
}

fn ensure_parent_dir(path: &Path) -> Result<(), CliError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| {
            CliError::Runtime(format!("failed to create {}: {e}", parent.display()))
        })?;
    }
    Ok(())
}

fn open_store(config: &Config) -> Result<SqliteStore, CliError> {
    ensure_parent_dir(&config.paths.sqlite_db)?;
    Ok(SqliteStore::open(&config.paths.sqlite_db)?)
}

fn open_audit(config: &Config) -> Result<SqliteAuditStore, CliError> {
    ensure_parent_dir(&config.paths.sqlite_db)?;
    Ok(SqliteAuditStore::open(&config.paths.sqlite_db)?)
}

// ──────────────────── serve ────────────────────

fn run_serve(cli: &Cli, args: &ServeArgs) -> Result<(), CliError> {
    let mut config = load_config(cli)?;
    if let Some(bind) = &args.bind {
        config.api.bind.clone_from(bind);
    }
    let api_enabled = config.api.enabled && !args.no_api;
    let bind = config.api.bind.clone();
    let base_path = config.api.base_path.clone();
    let sweep_interval = Duration::from_secs(config.engine.sweep_interval_secs);

    let (engine, audit) = Engine::open(config)?;
    let engine = Arc::new(engine);
    engine.notifier().notify(&NotificationEvent::EngineStarted {
        version: env!("CARGO_PKG_VERSION").to_string(),
        rules_loaded: engine.rule_set().len(),
    });

    let pool = Arc::new(engine.start_pool()?);
    let maintenance = engine.maintenance().spawn(sweep_interval)?;
    if args.stdin {
        spawn_stdin_feeder(Arc::clone(&pool))?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("fre-http")
        .build()
        .map_err(|e| CliError::Runtime(format!("failed to start async runtime: {e}")))?;

    let served = runtime.block_on(async {
        if api_enabled {
            let listener = tokio::net::TcpListener::bind(&bind)
                .await
                .map_err(|e| CliError::Runtime(format!("failed to bind {bind}: {e}")))?;
            let app = api::router(ApiState::new(Arc::clone(&engine), audit), &base_path);
            api::serve(listener, app, shutdown_signal()).await?;
        } else {
            shutdown_signal().await;
        }
        Ok::<(), CliError>(())
    });

    let stats = pool.shutdown();
    maintenance.shutdown();
    let uptime = engine.uptime();
    engine.notifier().notify(&NotificationEvent::EngineStopped {
        reason: if served.is_ok() { "signal" } else { "error" }.to_string(),
        uptime_secs: uptime.as_secs(),
    });
    served?;

    match output_mode(cli) {
        OutputMode::Human => {
            println!(
                "{} processed={} failed={} dropped={} uptime={}s",
                "fre stopped".bold(),
                stats.processed,
                stats.failed,
                stats.dropped,
                uptime.as_secs()
            );
        }
        OutputMode::Json => {
            write_json_line(&json!({
                "command": "serve",
                "pool": stats,
                "uptime_secs": uptime.as_secs(),
            }))?;
        }
    }
    Ok(())
}

fn spawn_stdin_feeder(pool: Arc<fleet_rule_engine::engine::WorkerPool>) -> Result<(), CliError> {
    thread::Builder::new()
        .name("fre-stdin".to_string())
        .spawn(move || {
            for line in io::stdin().lock().lines() {
                let Ok(line) = line else {
                    break;
                };
                if !line.trim().is_empty() {
                    pool.submit(line);
                }
            }
            tracing::info!("stdin closed, feeder stopped");
        })
        .map(|_| ())
        .map_err(|e| CliError::Runtime(format!("failed to spawn stdin thread: {e}")))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::warn!(%error, "ctrl-c handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                tracing::warn!(%error, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    tracing::info!("shutdown requested");
}

// ──────────────────── ingest ────────────────────

fn run_ingest(cli: &Cli, args: &IngestArgs) -> Result<(), CliError> {
    let mut config = load_config(cli)?;
    if args.progress {
        config.audit.progress_enabled = true;
    }
    let (engine, _audit) = Engine::open(config)?;

    let reader: Box<dyn Read> = match args.input.as_deref() {
        None => Box::new(io::stdin()),
        Some(path) if path == Path::new("-") => Box::new(io::stdin()),
        Some(path) => Box::new(fs::File::open(path).map_err(|e| {
            CliError::User(format!("cannot open {}: {e}", path.display()))
        })?),
    };

    let mut total = ProcessReport::default();
    let mut payloads = 0_usize;
    let mut rejected = 0_usize;
    for line in BufReader::new(reader).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        payloads += 1;
        match engine.process(&line) {
            Ok(report) => total.merge(&report),
            Err(_) => rejected += 1,
        }
    }
    let progress = engine.recorder().status();

    match output_mode(cli) {
        OutputMode::Human => {
            println!("{}", "Ingest complete".bold());
            println!("  payloads:   {payloads} ({rejected} rejected)");
            println!("  packets:    {}", total.packets);
            println!("  rules run:  {}", total.rules_run);
            let errors = total.rule_errors.to_string();
            println!(
                "  rule errors: {}",
                if total.rule_errors > 0 { errors.red() } else { errors.normal() }
            );
            println!("  aborted:    {}", total.aborted_packets);
            println!("  alerts won: {}", total.alerts_won.to_string().yellow());
            println!(
                "  audit rows: {} progress, {} alerts",
                progress.captured, progress.alerts_captured
            );
        }
        OutputMode::Json => {
            write_json_line(&json!({
                "command": "ingest",
                "payloads": payloads,
                "rejected": rejected,
                "report": total,
                "audit": progress,
            }))?;
        }
    }
    Ok(())
}

// ──────────────────── audit ────────────────────

fn run_audit(cli: &Cli, args: &AuditArgs) -> Result<(), CliError> {
    let config = load_config(cli)?;
    let audit = open_audit(&config)?;
    let mode = output_mode(cli);

    match &args.command {
        AuditCommand::Summary(a) => {
            let request = PageRequest::new(Some(a.page), Some(a.rows), 25)
                .sorted("last_frame_time", SortOrder::Desc);
            let page = audit.progress_summary(&request, a.rule.as_deref(), a.imei.as_deref())?;
            match mode {
                OutputMode::Human => {
                    println!(
                        "{:<18} {:<28} {:>5} {:>7}  {}",
                        "IMEI".bold(),
                        "RULE".bold(),
                        "STEP".bold(),
                        "FRAMES".bold(),
                        "LAST".bold()
                    );
                    for row in &page.rows {
                        println!(
                            "{:<18} {:<28} {:>5} {:>7}  {}",
                            row.imei, row.rule_name, row.max_step, row.total_frames, row.last_frame_time
                        );
                    }
                    println!("page {}/{} ({} groups)", page.page, page.total.max(1), page.records);
                }
                OutputMode::Json => write_json_line(&json!({
                    "command": "audit summary",
                    "page": page,
                }))?,
            }
        }
        AuditCommand::Timeline(a) => {
            let request = PageRequest::new(Some(a.page), Some(a.rows), 20)
                .sorted("execution_time", SortOrder::Asc);
            let page = audit.timeline(&a.imei, &request, a.rule.as_deref())?;
            match mode {
                OutputMode::Human => {
                    for row in &page.rows {
                        print_progress_row(row);
                    }
                    println!("page {}/{} ({} rows)", page.page, page.total.max(1), page.records);
                }
                OutputMode::Json => write_json_line(&json!({
                    "command": "audit timeline",
                    "imei": a.imei,
                    "page": page,
                }))?,
            }
        }
        AuditCommand::Snapshot { id } => {
            let snapshot = audit.snapshot_by_id(*id)?.ok_or_else(|| FreError::NotFound {
                entity: "snapshot",
                key: id.to_string(),
            })?;
            match mode {
                OutputMode::Human => println!("{}", serde_json::to_string_pretty(&snapshot)?),
                OutputMode::Json => write_json_line(&json!({
                    "command": "audit snapshot",
                    "id": id,
                    "snapshot": snapshot,
                }))?,
            }
        }
        AuditCommand::Alerts(a) => match &a.imei {
            Some(imei) => {
                let rows = audit.alert_details(imei, a.limit)?;
                match mode {
                    OutputMode::Human => rows.iter().for_each(print_alert_row),
                    OutputMode::Json => write_json_line(&json!({
                        "command": "audit alerts",
                        "imei": imei,
                        "alerts": rows,
                    }))?,
                }
            }
            None => {
                let rows = audit.alert_summaries(a.limit)?;
                match mode {
                    OutputMode::Human => {
                        for row in &rows {
                            println!(
                                "{:<18} {:>4} in 24h  last {} ({})  at {}",
                                row.imei,
                                row.total_alerts_24h.to_string().yellow(),
                                row.last_rule_executed,
                                row.last_alert_date,
                                row.last_alert_location
                            );
                        }
                        if rows.is_empty() {
                            println!("No alerts recorded.");
                        }
                    }
                    OutputMode::Json => write_json_line(&json!({
                        "command": "audit alerts",
                        "summaries": rows,
                    }))?,
                }
            }
        },
        AuditCommand::Clear => {
            let deleted = audit.clear_progress()?;
            match mode {
                OutputMode::Human => println!("Cleared {deleted} progress rows."),
                OutputMode::Json => write_json_line(&json!({
                    "command": "audit clear",
                    "deleted": deleted,
                }))?,
            }
        }
    }
    Ok(())
}

fn print_progress_row(row: &ProgressRow) {
    let phase = if row.is_post { "post" } else { "pre " };
    let stop = if row.stop_reason == "completed" || row.stop_reason == "alert_sent" {
        row.stop_reason.green()
    } else {
        row.stop_reason.normal()
    };
    println!(
        "#{:<6} {} {} step={} {} stage={} stop={} buffer={} geofence={}",
        row.id,
        row.execution_time.dimmed(),
        phase,
        row.step_number,
        row.rule_name.bold(),
        row.stage_reached,
        stop,
        row.buffer_size,
        row.geofence_eval
    );
}

fn print_alert_row(row: &AlertDetailRow) {
    println!(
        "#{:<6} {} {} speed={} at {:.6},{:.6}{}",
        row.id,
        row.alert_date,
        row.rule_name.red().bold(),
        row.speed,
        row.latitude,
        row.longitude,
        if row.telegram_sent { " [sent]" } else { "" }
    );
}

// ──────────────────── rules ────────────────────

fn run_rules(cli: &Cli, args: &RulesArgs) -> Result<(), CliError> {
    let config = load_config(cli)?;
    let store = open_store(&config)?;
    let mode = output_mode(cli);

    match &args.command {
        RulesCommand::List => {
            let rules = store.list_rules()?;
            match mode {
                OutputMode::Human => {
                    for rule in &rules {
                        let state = if rule.active { "active".green() } else { "inactive".dimmed() };
                        println!(
                            "{:>4} {:<28} {:>5} {:<8} {}",
                            rule.id,
                            rule.name.bold(),
                            rule.priority,
                            state,
                            rule.script
                        );
                    }
                    if rules.is_empty() {
                        println!("No rules stored.");
                    }
                }
                OutputMode::Json => write_json_line(&json!({
                    "command": "rules list",
                    "rules": rules,
                }))?,
            }
        }
        RulesCommand::Add(a) => {
            let manifest = a
                .manifest
                .as_deref()
                .map(|path| {
                    fs::read_to_string(path).map_err(|e| {
                        CliError::User(format!("cannot read {}: {e}", path.display()))
                    })
                })
                .transpose()?;
            let mut rule = RuleDefinition::new(&a.name, &a.script)
                .with_priority(a.priority)
                .with_description(&a.description);
            rule.active = !a.inactive;
            if let Some(manifest) = manifest {
                AuditManifest::new().parse_yaml(&a.name, &manifest)?;
                rule = rule.with_manifest(manifest);
            }
            NativeRuleCompiler::new(config.jammer.clone()).compile(&rule)?;
            let id = store.upsert_rule(&rule)?;
            match mode {
                OutputMode::Human => println!("Stored rule {} (id {id}).", a.name.bold()),
                OutputMode::Json => write_json_line(&json!({
                    "command": "rules add",
                    "id": id,
                    "name": a.name,
                }))?,
            }
        }
        RulesCommand::Enable { name } | RulesCommand::Disable { name } => {
            let active = matches!(args.command, RulesCommand::Enable { .. });
            store.set_rule_active(name, active)?;
            match mode {
                OutputMode::Human => println!(
                    "Rule {} {}.",
                    name.bold(),
                    if active { "enabled" } else { "disabled" }
                ),
                OutputMode::Json => write_json_line(&json!({
                    "command": if active { "rules enable" } else { "rules disable" },
                    "name": name,
                    "active": active,
                }))?,
            }
        }
        RulesCommand::Check => {
            let compiler = NativeRuleCompiler::new(config.jammer.clone());
            let results: Vec<Value> = store
                .load_active_rules()?
                .iter()
                .map(|rule| {
                    let compiled = compiler.compile(rule).err().map(|e| e.to_string());
                    let manifest = rule
                        .audit_manifest
                        .as_deref()
                        .and_then(|m| AuditManifest::new().parse_yaml(&rule.name, m).err())
                        .map(|e| e.to_string());
                    json!({
                        "name": rule.name,
                        "ok": compiled.is_none() && manifest.is_none(),
                        "compile_error": compiled,
                        "manifest_error": manifest,
                    })
                })
                .collect();
            let failed = results.iter().filter(|r| r["ok"] == false).count();

            match mode {
                OutputMode::Human => {
                    for result in &results {
                        let name = result["name"].as_str().unwrap_or_default();
                        if result["ok"] == true {
                            println!("{} {name}", "ok".green());
                        } else {
                            for key in ["compile_error", "manifest_error"] {
                                if let Some(error) = result[key].as_str() {
                                    println!("{} {name}: {error}", "FAIL".red().bold());
                                }
                            }
                        }
                    }
                }
                OutputMode::Json => write_json_line(&json!({
                    "command": "rules check",
                    "rules": results,
                    "failed": failed,
                }))?,
            }
            if failed > 0 {
                return Err(CliError::Partial(format!(
                    "{failed} of {} active rules failed checks",
                    results.len()
                )));
            }
        }
    }
    Ok(())
}

// ──────────────────── geofence ────────────────────

fn run_geofence(cli: &Cli, args: &GeofenceArgs) -> Result<(), CliError> {
    let config = load_config(cli)?;
    let store = open_store(&config)?;
    let mode = output_mode(cli);

    match &args.command {
        GeofenceCommand::Add(a) => {
            let kind = match (&a.circle, &a.bbox) {
                (Some(raw), _) => {
                    let v = parse_floats(raw, 3)?;
                    ShapeKind::Circle {
                        center_lat: v[0],
                        center_lon: v[1],
                        radius_m: v[2],
                    }
                }
                (None, Some(raw)) => {
                    let v = parse_floats(raw, 4)?;
                    ShapeKind::BoundingBox {
                        min_lat: v[0],
                        max_lat: v[1],
                        min_lon: v[2],
                        max_lon: v[3],
                    }
                }
                (None, None) => return Err(CliError::User("--circle or --bbox is required".into())),
            };
            let id = store.add_geofence(&a.group, &a.name, &kind)?;
            match mode {
                OutputMode::Human => println!(
                    "Added {} {} to group {} (id {id}).",
                    kind.label(),
                    a.name.bold(),
                    a.group
                ),
                OutputMode::Json => write_json_line(&json!({
                    "command": "geofence add",
                    "id": id,
                    "group": a.group,
                    "name": a.name,
                    "shape": kind,
                }))?,
            }
        }
        GeofenceCommand::Check(a) => {
            let shapes = store.geofences_by_group(&a.group)?;
            let matches: Vec<&str> = shapes
                .iter()
                .filter(|shape| shape.contains(a.lat, a.lon))
                .map(|shape| shape.name.as_str())
                .collect();
            match mode {
                OutputMode::Human => {
                    if matches.is_empty() {
                        println!(
                            "{} group {} ({} shapes)",
                            "outside".yellow(),
                            a.group,
                            shapes.len()
                        );
                    } else {
                        println!("{} {}: {}", "inside".green(), a.group, matches.join(", "));
                    }
                }
                OutputMode::Json => write_json_line(&json!({
                    "command": "geofence check",
                    "group": a.group,
                    "lat": a.lat,
                    "lon": a.lon,
                    "inside": !matches.is_empty(),
                    "shapes": shapes.len(),
                    "matches": matches,
                }))?,
            }
        }
    }
    Ok(())
}

fn parse_floats(raw: &str, expected: usize) -> Result<Vec<f64>, CliError> {
    let values = raw
        .split(',')
        .map(|part| {
            part.trim()
                .parse::<f64>()
                .map_err(|_| CliError::User(format!("not a number: {part:?}")))
        })
        .collect::<Result<Vec<_>, _>>()?;
    if values.len() != expected {
        return Err(CliError::User(format!(
            "expected {expected} comma-separated numbers, got {}",
            values.len()
        )));
    }
    Ok(values)
}

// ──────────────────── config ────────────────────

fn run_config(cli: &Cli, args: &ConfigArgs) -> Result<(), CliError> {
    match &args.command {
        None | Some(ConfigCommand::Path) => {
            let path = cli.config.clone().unwrap_or_else(Config::default_path);
            let exists = path.exists();

            match output_mode(cli) {
                OutputMode::Human => {
                    println!("{}", path.display());
                    if !exists {
                        println!("  (file does not exist; defaults will be used)");
                    }
                }
                OutputMode::Json => {
                    write_json_line(&json!({
                        "command": "config path",
                        "path": path.to_string_lossy(),
                        "exists": exists,
                    }))?;
                }
            }
            Ok(())
        }
        Some(ConfigCommand::Show) => {
            let config = load_config(cli)?;
            match output_mode(cli) {
                OutputMode::Human => {
                    let toml_str = toml::to_string_pretty(&config)
                        .map_err(|e| CliError::Runtime(format!("serialize config: {e}")))?;
                    println!("{toml_str}");
                }
                OutputMode::Json => {
                    write_json_line(&json!({
                        "command": "config show",
                        "config": serde_json::to_value(&config)?,
                    }))?;
                }
            }
            Ok(())
        }
        Some(ConfigCommand::Validate) => match Config::load(cli.config.as_deref()) {
            Ok(config) => {
                let hash = config.stable_hash()?;
                match output_mode(cli) {
                    OutputMode::Human => {
                        println!("Configuration is valid.");
                        println!("  Source: {}", config.paths.config_file.display());
                        println!("  Hash: {hash}");
                    }
                    OutputMode::Json => {
                        write_json_line(&json!({
                            "command": "config validate",
                            "valid": true,
                            "path": config.paths.config_file.to_string_lossy(),
                            "hash": hash,
                        }))?;
                    }
                }
                Ok(())
            }
            Err(e) => {
                match output_mode(cli) {
                    OutputMode::Human => eprintln!("Configuration is INVALID: {e}"),
                    OutputMode::Json => {
                        write_json_line(&json!({
                            "command": "config validate",
                            "valid": false,
                            "error": e.to_string(),
                        }))?;
                    }
                }
                Err(CliError::User(format!("invalid config: {e}")))
            }
        },
    }
}

// ──────────────────── output ────────────────────

fn write_json_line(payload: &Value) -> Result<(), CliError> {
    let mut stdout = io::stdout().lock();
    serde_json::to_writer(&mut stdout, payload)?;
    writeln!(stdout)?;
    Ok(())
}

fn output_mode(cli: &Cli) -> OutputMode {
    let env_mode = std::env::var("FRE_OUTPUT_FORMAT").ok();
    resolve_output_mode(cli.json, env_mode.as_deref(), io::stdout().is_terminal())
}

fn resolve_output_mode(json_flag: bool, env_mode: Option<&str>, stdout_is_tty: bool) -> OutputMode {
    if json_flag {
        return OutputMode::Json;
    }

    let fallback = if stdout_is_tty {
        OutputMode::Human
    } else {
        OutputMode::Json
    };

    match env_mode
        .map(str::trim)
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("json") => OutputMode::Json,
        Some("human") => OutputMode::Human,
        _ => fallback,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_global_flags_before_and_after_subcommand() {
        let before = Cli::try_parse_from([
            "fre",
            "--config",
            "/tmp/fre.toml",
            "--json",
            "--no-color",
            "-v",
            "rules",
            "list",
        ]);
        assert!(before.is_ok());

        let after = Cli::try_parse_from(["fre", "rules", "list", "--json", "--no-color", "-q"]);
        assert!(after.is_ok());
    }

    #[test]
    fn parses_every_subcommand() {
        let cases = [
            vec!["fre", "serve"],
            vec!["fre", "serve", "--bind", "0.0.0.0:9000", "--stdin"],
            vec!["fre", "serve", "--no-api"],
            vec!["fre", "ingest"],
            vec!["fre", "ingest", "payloads.jsonl", "--progress"],
            vec!["fre", "audit", "summary", "--rule", "jammer", "--rows", "10"],
            vec!["fre", "audit", "timeline", "860000000000001", "--page", "2"],
            vec!["fre", "audit", "snapshot", "42"],
            vec!["fre", "audit", "alerts", "--imei", "860000000000001"],
            vec!["fre", "audit", "clear"],
            vec!["fre", "rules", "add", "jammer", "--script", "native:jammer_detection"],
            vec!["fre", "rules", "enable", "jammer"],
            vec!["fre", "rules", "disable", "jammer"],
            vec!["fre", "rules", "check"],
            vec!["fre", "geofence", "add", "Taller", "Norte", "--circle", "19.4,-99.1,500"],
            vec!["fre", "geofence", "add", "Taller", "Sur", "--bbox", "-1,1,-2,2"],
            vec!["fre", "geofence", "check", "Taller", "19.4", "-99.1"],
            vec!["fre", "config", "validate"],
            vec!["fre", "completions", "bash"],
        ];
        for case in cases {
            let parsed = Cli::try_parse_from(case.clone());
            assert!(parsed.is_ok(), "failed to parse case: {case:?}");
        }
    }

    #[test]
    fn geofence_add_requires_exactly_one_shape() {
        assert!(Cli::try_parse_from(["fre", "geofence", "add", "G", "n"]).is_err());
        assert!(
            Cli::try_parse_from([
                "fre", "geofence", "add", "G", "n", "--circle", "1,2,3", "--bbox", "1,2,3,4"
            ])
            .is_err()
        );
    }

    #[test]
    fn output_mode_resolution_honors_precedence() {
        assert_eq!(
            resolve_output_mode(true, Some("human"), true),
            OutputMode::Json
        );
        assert_eq!(
            resolve_output_mode(false, Some("json"), true),
            OutputMode::Json
        );
        assert_eq!(
            resolve_output_mode(false, Some("human"), false),
            OutputMode::Human
        );
        assert_eq!(
            resolve_output_mode(false, Some("auto"), true),
            OutputMode::Human
        );
        assert_eq!(resolve_output_mode(false, None, false), OutputMode::Json);
    }

    #[test]
    fn parse_floats_checks_arity_and_numbers() {
        assert_eq!(parse_floats("1.5, -2,3", 3).unwrap(), vec![1.5, -2.0, 3.0]);
        assert!(matches!(parse_floats("1,2", 3), Err(CliError::User(_))));
        assert!(matches!(parse_floats("1,x,3", 3), Err(CliError::User(_))));
    }

    #[test]
    fn library_errors_map_to_exit_codes() {
        let user = CliError::from(FreError::NotFound {
            entity: "snapshot",
            key: "1".to_string(),
        });
        assert_eq!(user.exit_code(), 1);
        let runtime = CliError::from(FreError::Runtime {
            details: "boom".to_string(),
        });
        assert_eq!(runtime.exit_code(), 2);
    }
}
