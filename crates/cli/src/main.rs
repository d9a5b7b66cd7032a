//! Code flow command-line tool.
//!
//! Runs forward and back flows, and provides subcommands for inspecting
//! sync points and flow runs, managing escalated conflicts, viewing the
//! tracked dependency manifest and the audit log, and generating /
//! validating configuration files.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::DateTime;
use clap::{Parser, Subcommand};
use comfy_table::{presets::UTF8_FULL, Cell, Color, ContentArrangement, Table};
use tracing_subscriber::EnvFilter;

use codeflow_core::assets::{BuildAssetSource, EmptyAssetSource, JsonFileAssetSource};
use codeflow_core::config::AppConfig;
use codeflow_core::conflict::{ConflictRecord, ConflictResolver, Side};
use codeflow_core::db::Database;
use codeflow_core::errors::ConflictError;
use codeflow_core::mapping::MappingRegistry;
use codeflow_core::models::{Direction, FlowRequest, FlowResult, FlowStatus};
use codeflow_core::tracker::Tracker;
use codeflow_core::{CancellationToken, CodeFlowEngine};

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// Code flow command-line tool.
#[derive(Parser, Debug)]
#[command(
    name = "codeflow",
    version,
    about = "Flow changes between product repositories and a virtual monorepo"
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, global = true, default_value = "./codeflow.toml")]
    config: PathBuf,

    /// Log filter (e.g. `info`, `codeflow_core=debug`). Overrides the
    /// configured level.
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a flow for one mapping.
    Flow {
        #[command(subcommand)]
        direction: FlowDirection,
    },

    /// Show sync points and the latest runs per mapping.
    Status {
        /// Number of recent runs to show.
        #[arg(short, long, default_value = "10")]
        limit: u32,

        /// Also list every recorded sync point of this mapping.
        #[arg(long)]
        history: Option<String>,
    },

    /// Manage escalated conflicts.
    Conflicts {
        #[command(subcommand)]
        action: ConflictsAction,
    },

    /// Show the tracked dependency manifest of a mapping.
    Manifest {
        /// Mapping name.
        mapping: String,
    },

    /// Generate a default configuration file.
    Init {
        /// Output path for the generated config file.
        #[arg(short, long, default_value = "./codeflow.toml")]
        output: PathBuf,
    },

    /// Validate a configuration file.
    Validate,

    /// Show recent audit log entries.
    Audit {
        /// Maximum number of entries to show.
        #[arg(short, long, default_value = "20")]
        limit: u32,
    },
}

#[derive(Subcommand, Debug)]
enum FlowDirection {
    /// Product repository -> VMR subtree.
    Forward(FlowArgs),
    /// VMR subtree -> product repository.
    Backward(FlowArgs),
}

#[derive(clap::Args, Debug)]
struct FlowArgs {
    /// Mapping name.
    mapping: String,

    /// Build whose assets drive the version update.
    #[arg(short, long)]
    build: String,

    /// Source commit (SHA or branch) to flow up to.
    #[arg(short, long)]
    source: String,

    /// Package ID or glob left out of the version update (repeatable).
    #[arg(long = "exclude")]
    excluded_assets: Vec<String>,

    /// Target branch the working branch starts from.
    #[arg(long, default_value = "")]
    base: String,

    /// Branch the flowed change is destined for.
    #[arg(long, default_value = "main")]
    target: String,

    /// Discard the working copy on conflict instead of pushing the partial
    /// result.
    #[arg(long)]
    discard: bool,

    /// JSON file mapping build IDs to their published assets.
    #[arg(long)]
    assets: Option<PathBuf>,

    /// Print the flow result as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Subcommand, Debug)]
enum ConflictsAction {
    /// List conflicts.
    List {
        /// Filter by status: open, auto_resolved, resolved.
        #[arg(short, long)]
        status: Option<String>,

        /// Number of results.
        #[arg(long, default_value = "20")]
        limit: u32,
    },
    /// Mark an escalated conflict as resolved so the next run skips it.
    Resolve {
        /// Conflict ID.
        id: String,

        /// Who resolved it.
        #[arg(long, default_value = "cli")]
        by: String,
    },
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let log_level = cli.log_level.clone();
    match cli.command {
        Commands::Init { output } => {
            init_logging(log_level.as_deref().unwrap_or("warn"));
            cmd_init(&output).map(|_| ExitCode::SUCCESS)
        }
        Commands::Validate => {
            init_logging(log_level.as_deref().unwrap_or("warn"));
            cmd_validate(&cli.config).map(|_| ExitCode::SUCCESS)
        }
        Commands::Flow { direction } => {
            let config = load_config(&cli.config)?;
            init_logging(log_level.as_deref().unwrap_or(config.engine.log_level.as_str()));
            let db = open_database(&config)?;
            cmd_flow(config, db, direction).await
        }
        command => {
            // Inspection commands stay quiet unless asked.
            init_logging(log_level.as_deref().unwrap_or("warn"));
            let config = load_config(&cli.config)?;
            let db = open_database(&config)?;

            match command {
                Commands::Status { limit, history } => {
                    cmd_status(&config, &db, limit, history.as_deref())
                }
                Commands::Conflicts { action } => cmd_conflicts(&db, action),
                Commands::Manifest { mapping } => cmd_manifest(&config, db, &mapping),
                Commands::Audit { limit } => cmd_audit(&db, limit),
                Commands::Init { .. } | Commands::Validate | Commands::Flow { .. } => Ok(()),
            }
            .map(|_| ExitCode::SUCCESS)
        }
    }
}

/// Logs go to stderr so `--json` output stays machine-readable.
fn init_logging(filter: &str) {
    let filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .init();
}

// ---------------------------------------------------------------------------
// Config helpers
// ---------------------------------------------------------------------------

fn load_config(path: &Path) -> Result<AppConfig> {
    let mut config =
        AppConfig::load_from_file(path).context("failed to load configuration file")?;
    config
        .resolve_env_vars()
        .context("failed to resolve environment variables")?;
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn open_database(config: &AppConfig) -> Result<Database> {
    std::fs::create_dir_all(&config.engine.data_dir).with_context(|| {
        format!(
            "failed to create data directory {}",
            config.engine.data_dir.display()
        )
    })?;
    let db = Database::new(config.database_path()).context("failed to open database")?;
    db.initialize().context("failed to initialize database")?;
    Ok(db)
}

// ---------------------------------------------------------------------------
// Subcommand implementations
// ---------------------------------------------------------------------------

async fn cmd_flow(config: AppConfig, db: Database, direction: FlowDirection) -> Result<ExitCode> {
    let (direction, args) = match direction {
        FlowDirection::Forward(args) => (Direction::Forward, args),
        FlowDirection::Backward(args) => (Direction::Backward, args),
    };

    let assets: Arc<dyn BuildAssetSource> = match &args.assets {
        Some(path) => Arc::new(JsonFileAssetSource::new(path)),
        None => Arc::new(EmptyAssetSource),
    };
    let engine = CodeFlowEngine::new(config, Arc::new(db), assets)
        .context("failed to initialize code flow engine")?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            wait_for_interrupt().await;
            eprintln!("Interrupt received, cancelling flow...");
            cancel.cancel();
        });
    }

    let request = FlowRequest {
        mapping: args.mapping,
        direction,
        build_id: args.build,
        source_commit: args.source,
        excluded_assets: args.excluded_assets,
        base_branch: args.base,
        target_branch: args.target,
        discard_patches: args.discard,
    };

    let result = engine.flow(request, cancel).await;

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&result).context("failed to serialize flow result")?
        );
    } else {
        print_flow_result(&result);
    }

    Ok(match result.status {
        FlowStatus::Success | FlowStatus::NoOp => ExitCode::SUCCESS,
        FlowStatus::Conflict => ExitCode::from(2),
        FlowStatus::Cancelled => ExitCode::from(130),
        FlowStatus::Failed => ExitCode::FAILURE,
    })
}

/// Resolve on Ctrl+C or, on Unix, SIGTERM.
async fn wait_for_interrupt() {
    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received SIGINT (Ctrl+C)"),
        _ = terminate => tracing::info!("received SIGTERM"),
    }
}

fn print_flow_result(result: &FlowResult) {
    println!("Flow {}", result.run_id);
    println!("{}", "=".repeat(5 + result.run_id.len()));
    println!();
    println!("  Status      : {}", result.status);
    println!(
        "  New commit  : {}",
        result.new_sha.as_deref().unwrap_or("-")
    );
    println!("  Branch      : {}", result.branch.as_deref().unwrap_or("-"));
    println!("  Files       : {}", result.applied_files.len());
    if let Some(ref class) = result.error_class {
        println!("  Error class : {}", class);
    }
    if let Some(ref err) = result.error {
        println!("  Error       : {}", err);
    }

    if !result.dependency_updates.is_empty() || !result.rejected_updates.is_empty() {
        println!();
        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_content_arrangement(ContentArrangement::Dynamic);
        table.set_header(vec!["Package", "From", "To", "Outcome"]);
        for (update, outcome) in result
            .dependency_updates
            .iter()
            .map(|u| (u, Cell::new("updated").fg(Color::Green)))
            .chain(
                result
                    .rejected_updates
                    .iter()
                    .map(|u| (u, Cell::new("rejected").fg(Color::Red))),
            )
        {
            table.add_row(vec![
                Cell::new(&update.package_id),
                Cell::new(update.from.as_ref().map(|f| f.version.as_str()).unwrap_or("-")),
                Cell::new(&update.to.version),
                outcome,
            ]);
        }
        println!("{}", table);
    }

    if !result.conflicts.is_empty() {
        println!();
        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_content_arrangement(ContentArrangement::Dynamic);
        table.set_header(vec!["File", "Kind", "Resolution"]);
        for c in &result.conflicts {
            let resolution = if c.is_escalated() {
                Cell::new(c.resolution.to_string()).fg(Color::Red)
            } else {
                Cell::new(c.resolution.to_string())
            };
            table.add_row(vec![
                Cell::new(&c.file_path),
                Cell::new(c.kind.to_string()),
                resolution,
            ]);
        }
        println!("{}", table);
    }
}

fn cmd_init(output: &Path) -> Result<()> {
    let default_config = r#"# Code flow configuration
# See documentation for all available options.

[engine]
data_dir = "/var/lib/codeflow"
log_level = "info"
retry_on_concurrent_modification = true
archive_patches = false

[vmr]
remote = "https://github.com/example/vmr"
manifest_path = "src/source-manifest.json"
default_branch = "main"
token_env = "VMR_TOKEN"

[committer]
name = "codeflow"
email = "codeflow@example.com"

[[mappings]]
name = "runtime"
default_remote = "https://github.com/example/runtime"
default_ref = "main"
exclude = ["docs/**"]
# submodules = ["external/zlib"]
# submodule_pointers = true
# delete_wins = false
# generated_files = ["eng/dependencies.json"]

# [mappings.version_floors]
# "Example.Runtime" = "8.0.0"
"#;

    if output.exists() {
        anyhow::bail!(
            "file already exists: {}. Use a different path or remove the existing file.",
            output.display()
        );
    }

    std::fs::write(output, default_config).context("failed to write config file")?;

    println!("Default configuration written to {}", output.display());
    println!();
    println!("Next steps:");
    println!("  1. Edit the config file with your VMR and repository details");
    println!("  2. Set the referenced environment variables (VMR_TOKEN)");
    println!(
        "  3. Validate with: codeflow validate --config {}",
        output.display()
    );
    println!(
        "  4. Run a flow: codeflow --config {} flow forward runtime --build <id> --source <sha>",
        output.display()
    );

    Ok(())
}

fn cmd_validate(config_path: &Path) -> Result<()> {
    println!("Validating configuration: {}", config_path.display());
    println!();

    let mut config =
        AppConfig::load_from_file(config_path).context("failed to parse configuration")?;
    println!("  [OK] TOML structure is valid");

    let _ = config.resolve_env_vars();
    println!("  [OK] Environment variable references processed");

    match config.validate() {
        Ok(()) => println!("  [OK] All required fields are valid"),
        Err(e) => {
            println!("  [FAIL] Validation error: {}", e);
            anyhow::bail!("configuration validation failed");
        }
    }

    let registry = match MappingRegistry::from_app_config(&config) {
        Ok(r) => {
            println!("  [OK] {} mapping(s) are valid and disjoint", r.len());
            r
        }
        Err(e) => {
            println!("  [FAIL] Mapping error: {}", e);
            anyhow::bail!("configuration validation failed");
        }
    };

    println!();
    println!("Configuration summary:");
    println!("  VMR remote    : {}", config.vmr.remote);
    println!("  VMR branch    : {}", config.vmr.default_branch);
    println!(
        "  VMR token     : {}",
        match (&config.vmr.token_env, &config.vmr.token) {
            (None, _) => "not required",
            (Some(_), Some(_)) => "set",
            (Some(_), None) => "NOT SET",
        }
    );
    println!("  Manifest path : {}", config.vmr.manifest_path);
    println!("  Data directory: {}", config.engine.data_dir.display());
    println!();
    for mapping in registry.iter() {
        println!(
            "  {:<16} {} -> {}{}",
            mapping.name,
            mapping.default_remote,
            mapping.vmr_path,
            if mapping.delete_wins { " (delete wins)" } else { "" }
        );
    }
    println!();
    println!("Configuration is valid.");

    Ok(())
}

fn cmd_status(
    config: &AppConfig,
    db: &Database,
    limit: u32,
    history: Option<&str>,
) -> Result<()> {
    let registry =
        MappingRegistry::from_app_config(config).context("failed to load mappings")?;

    println!("Sync Points");
    println!("===========");
    println!();

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["Mapping", "Direction", "Source", "Target", "Gen", "Updated"]);
    for mapping in registry.iter() {
        for direction in [Direction::Forward, Direction::Backward] {
            let sp = db
                .get_sync_point(&mapping.name, direction)
                .context("failed to read sync point")?;
            match sp {
                Some(sp) => table.add_row(vec![
                    Cell::new(&mapping.name),
                    Cell::new(direction.to_string()),
                    Cell::new(short_sha(&sp.source_sha)),
                    Cell::new(short_sha(&sp.target_sha)),
                    Cell::new(sp.generation),
                    Cell::new(sp.created_at.format("%Y-%m-%d %H:%M").to_string()),
                ]),
                None => table.add_row(vec![
                    Cell::new(&mapping.name),
                    Cell::new(direction.to_string()),
                    Cell::new("never flowed").fg(Color::Yellow),
                    Cell::new("-"),
                    Cell::new("-"),
                    Cell::new("-"),
                ]),
            };
        }
    }
    println!("{}", table);

    if let Some(name) = history {
        let mapping = registry.resolve(name)?;
        println!();
        println!("Sync Point History: {}", mapping.name);
        println!("{}", "=".repeat(20 + mapping.name.len()));
        println!();
        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_content_arrangement(ContentArrangement::Dynamic);
        table.set_header(vec!["Direction", "Gen", "Source", "Target", "Recorded"]);
        for direction in [Direction::Forward, Direction::Backward] {
            let points = db
                .list_sync_point_history(&mapping.name, direction, limit)
                .context("failed to read sync point history")?;
            for sp in points {
                table.add_row(vec![
                    Cell::new(direction.to_string()),
                    Cell::new(sp.generation),
                    Cell::new(short_sha(&sp.source_sha)),
                    Cell::new(short_sha(&sp.target_sha)),
                    Cell::new(sp.created_at.format("%Y-%m-%d %H:%M:%S").to_string()),
                ]);
            }
        }
        println!("{}", table);
    }

    let runs = db
        .list_flow_runs(None, limit)
        .context("failed to list flow runs")?;
    println!();
    println!("Recent Runs");
    println!("===========");
    println!();
    if runs.is_empty() {
        println!("No flow runs recorded.");
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["ID", "Mapping", "Direction", "Build", "State", "Duration"]);
    for run in &runs {
        let state = match run.state.as_str() {
            "done" => Cell::new(&run.state).fg(Color::Green),
            "failed" => Cell::new(&run.state).fg(Color::Red),
            "conflict" | "cancelled" => Cell::new(&run.state).fg(Color::Yellow),
            _ => Cell::new(&run.state),
        };
        table.add_row(vec![
            Cell::new(truncate(&run.id, 8)),
            Cell::new(&run.mapping),
            Cell::new(run.direction.to_string()),
            Cell::new(&run.build_id),
            state,
            Cell::new(duration(&run.started_at, run.completed_at.as_deref())),
        ]);
    }
    println!("{}", table);

    Ok(())
}

fn cmd_conflicts(db: &Database, action: ConflictsAction) -> Result<()> {
    match action {
        ConflictsAction::List { status, limit } => {
            let conflicts = db
                .list_conflicts(status.as_deref(), limit)
                .context("failed to list conflicts")?;

            if conflicts.is_empty() {
                println!("No conflicts found.");
                return Ok(());
            }

            let mut table = Table::new();
            table.load_preset(UTF8_FULL);
            table.set_content_arrangement(ContentArrangement::Dynamic);
            table.set_header(vec![
                "ID", "Run", "File", "Kind", "Resolution", "Status", "Created",
            ]);
            for c in &conflicts {
                let status = match c.status.as_str() {
                    "open" => Cell::new(&c.status).fg(Color::Red),
                    _ => Cell::new(&c.status),
                };
                let record = c.to_record();
                table.add_row(vec![
                    Cell::new(&c.id),
                    Cell::new(truncate(&c.run_id, 8)),
                    Cell::new(&c.file_path),
                    Cell::new(describe_kind(&record)),
                    Cell::new(record.resolution.to_string()),
                    status,
                    Cell::new(&c.created_at[..10.min(c.created_at.len())]),
                ]);
            }
            println!("{}", table);
            println!();
            println!("{} conflict(s) shown", conflicts.len());

            Ok(())
        }

        ConflictsAction::Resolve { id, by } => match ConflictResolver::mark_resolved(db, &id, &by) {
            Ok(entry) => {
                println!("Conflict {} on '{}' resolved by {}", entry.id, entry.file_path, by);
                println!("Re-run the flow to continue from its working branch.");
                Ok(())
            }
            Err(ConflictError::AlreadyResolved(_)) => {
                println!("Conflict {} is not open; nothing to do.", id);
                Ok(())
            }
            Err(e) => Err(e).context("failed to resolve conflict"),
        },
    }
}

fn cmd_manifest(config: &AppConfig, db: Database, mapping: &str) -> Result<()> {
    let registry =
        MappingRegistry::from_app_config(config).context("failed to load mappings")?;
    let mapping = registry.resolve(mapping)?;
    let tracker = Tracker::new(Arc::new(db));

    let entries = tracker
        .manifest_entries(&mapping.name)
        .context("failed to read dependency manifest")?;
    if entries.is_empty() {
        println!("No dependencies recorded for '{}'.", mapping.name);
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["Package", "Version", "Commit", "Repository"]);
    for e in &entries {
        let floor = mapping.version_floors.get(&e.package_id);
        let version = match floor {
            Some(f) => format!("{} (floor {})", e.version, f),
            None => e.version.clone(),
        };
        table.add_row(vec![
            Cell::new(&e.package_id),
            Cell::new(version),
            Cell::new(short_sha(&e.sha)),
            Cell::new(&e.repository_url),
        ]);
    }
    println!("{}", table);

    Ok(())
}

fn cmd_audit(db: &Database, limit: u32) -> Result<()> {
    let entries = db
        .list_audit_log(limit)
        .context("failed to list audit entries")?;

    if entries.is_empty() {
        println!("No audit log entries found.");
        return Ok(());
    }

    println!("{:<26} {:<18} {:<12} {:<9} DETAILS", "TIMESTAMP", "ACTION", "MAPPING", "DIR");
    println!("{}", "-".repeat(100));

    for entry in &entries {
        println!(
            "{:<26} {:<18} {:<12} {:<9} {}{}",
            truncate(&entry.created_at, 25),
            entry.action,
            entry.mapping.as_deref().unwrap_or("-"),
            entry.direction.as_deref().unwrap_or("-"),
            if entry.success { "" } else { "[FAIL] " },
            truncate(entry.details.as_deref().unwrap_or(""), 50),
        );
    }

    println!();
    println!("{} entries shown", entries.len());

    Ok(())
}

// ---------------------------------------------------------------------------
// Utilities
// ---------------------------------------------------------------------------

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

/// Conflict kind, with the deleting side for delete/edit conflicts.
fn describe_kind(record: &ConflictRecord) -> String {
    match record.deleted_in {
        Some(Side::Source) => format!("{} (deleted in source)", record.kind),
        Some(Side::Target) => format!("{} (deleted in target)", record.kind),
        None => record.kind.to_string(),
    }
}

fn short_sha(sha: &str) -> &str {
    &sha[..sha.len().min(10)]
}

/// Human-readable run duration, or `running` while incomplete.
fn duration(started_at: &str, completed_at: Option<&str>) -> String {
    let Some(completed_at) = completed_at else {
        return "running".into();
    };
    match (
        DateTime::parse_from_rfc3339(started_at),
        DateTime::parse_from_rfc3339(completed_at),
    ) {
        (Ok(start), Ok(end)) => {
            let ms = (end - start).num_milliseconds().max(0);
            if ms < 1000 {
                format!("{}ms", ms)
            } else {
                format!("{:.1}s", ms as f64 / 1000.0)
            }
        }
        _ => "-".into(),
    }
}
