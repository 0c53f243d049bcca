//! Qualifier - screening session inspector
//!
//! The `qualifier` command reads the checkpoint store written by a
//! screening service and validates the files it is configured with.
//!
//! ## Commands
//!
//! - `sessions`: List resumable (or all) sessions
//! - `status`: Show per-entity progress of a session
//! - `results`: Dump the latest results of a session as JSON
//! - `prune`: Delete finished sessions older than a cutoff
//! - `check-criteria`: Validate a criterion file
//! - `check-config`: Validate a screening configuration file

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, Level};

use qualifier_core::obs::BatchSpan;
use qualifier_core::session::{EntityProgress, SessionManager, SessionStatusReport, SessionSummary};
use qualifier_core::{CriteriaSet, FinalStatus, ScreeningConfig};
use qualifier_store::{FsCheckpointStore, SessionId};

#[derive(Parser)]
#[command(name = "qualifier")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Inspect Qualifier screening sessions", long_about = None)]
struct Cli {
    /// Checkpoint store directory
    #[arg(
        long,
        global = true,
        env = "QUALIFIER_STORE_DIR",
        default_value = ".qualifier"
    )]
    store_dir: PathBuf,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Format {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// List sessions that can be resumed
    Sessions {
        /// Include completed and unreadable sessions
        #[arg(long)]
        all: bool,

        #[arg(long, value_enum, default_value_t = Format::Text)]
        format: Format,
    },

    /// Show per-entity progress of a session
    Status {
        /// Session ID
        session: String,

        #[arg(long, value_enum, default_value_t = Format::Text)]
        format: Format,
    },

    /// Write the latest result of every entity as JSON
    Results {
        /// Session ID
        session: String,

        /// Output file (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Delete finished sessions not updated for the given number of days
    Prune {
        #[arg(long, default_value = "30")]
        days: i64,
    },

    /// Validate a criterion file and summarize its audiences
    CheckCriteria {
        /// Criterion JSON file
        path: PathBuf,
    },

    /// Validate a screening configuration file
    CheckConfig {
        /// Configuration JSON file
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    qualifier_core::telemetry::init_tracing(cli.json, level);

    match cli.command {
        Commands::Sessions { all, format } => {
            let sessions = open_sessions(&cli.store_dir)?;
            print!("{}", cmd_sessions(&sessions, all, format).await?);
        }
        Commands::Status { session, format } => {
            let sessions = open_sessions(&cli.store_dir)?;
            print!("{}", cmd_status(&sessions, &session, format).await?);
        }
        Commands::Results { session, output } => {
            let sessions = open_sessions(&cli.store_dir)?;
            cmd_results(&sessions, &session, output.as_deref()).await?;
        }
        Commands::Prune { days } => {
            let sessions = open_sessions(&cli.store_dir)?;
            println!("{}", cmd_prune(&sessions, days).await?);
        }
        Commands::CheckCriteria { path } => println!("{}", cmd_check_criteria(&path)?),
        Commands::CheckConfig { path } => println!("{}", cmd_check_config(&path)?),
    }

    Ok(())
}

fn open_sessions(store_dir: &Path) -> Result<SessionManager> {
    let store = FsCheckpointStore::new(store_dir).with_context(|| {
        format!("Failed to open checkpoint store at {}", store_dir.display())
    })?;
    Ok(SessionManager::new(Arc::new(store)))
}

/// List sessions, resumable only unless `all` is set
async fn cmd_sessions(sessions: &SessionManager, all: bool, format: Format) -> Result<String> {
    let summaries = if all {
        sessions.list_sessions().await?
    } else {
        sessions.list_resumable().await?
    };

    match format {
        Format::Json => Ok(format!("{}\n", serde_json::to_string_pretty(&summaries)?)),
        Format::Text if summaries.is_empty() => Ok(if all {
            "No sessions found.\n".to_string()
        } else {
            "No resumable sessions.\n".to_string()
        }),
        Format::Text => Ok(render_sessions(&summaries)),
    }
}

fn render_sessions(summaries: &[SessionSummary]) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<36}  {:<9}  {:<20}  {:>9}  {:<19}  NOTE",
        "SESSION", "STATUS", "CRITERIA", "DONE", "UPDATED"
    );
    for s in summaries {
        let criteria = format!("{}@{}", s.criteria_version, short(&s.criteria_digest));
        let done = format!("{}/{}", s.progress.complete, s.progress.total);
        let note = s.not_resumable_reason.as_deref().unwrap_or("");
        let _ = writeln!(
            out,
            "{:<36}  {:<9}  {:<20}  {:>9}  {:<19}  {}",
            s.session_id,
            s.status,
            criteria,
            done,
            s.updated_at.format("%Y-%m-%d %H:%M:%S"),
            note
        );
    }
    out
}

/// Show one session's progress
async fn cmd_status(sessions: &SessionManager, session: &str, format: Format) -> Result<String> {
    let session_id = SessionId::from(session);
    let report = sessions
        .status(&session_id)
        .await
        .with_context(|| format!("Failed to read session '{}'", session))?;

    match format {
        Format::Json => Ok(format!("{}\n", serde_json::to_string_pretty(&report)?)),
        Format::Text => Ok(render_status(&report)),
    }
}

fn render_status(report: &SessionStatusReport) -> String {
    let mut out = String::new();
    let p = &report.progress;
    let v = &report.verdicts;
    let _ = writeln!(out, "session  {}", report.session_id);
    let _ = writeln!(out, "status   {}", report.status);
    let _ = writeln!(out, "criteria {}", report.criteria_version);
    let _ = writeln!(
        out,
        "progress {} complete, {} in progress, {} not started ({} total)",
        p.complete, p.in_progress, p.not_started, p.total
    );
    let _ = writeln!(
        out,
        "verdicts {} passed, {} not passed, {} indeterminate, {} errors",
        v.passed, v.not_passed, v.indeterminate, v.errors
    );
    let _ = writeln!(out);
    for entity in &report.entities {
        let _ = writeln!(
            out,
            "  {:<24} {:<24} {}",
            entity.entity_id,
            entity.stage.as_deref().unwrap_or("-"),
            progress_label(entity)
        );
    }
    out
}

fn progress_label(entity: &EntityProgress) -> String {
    match (&entity.stage, &entity.final_status) {
        (None, _) => "not started".to_string(),
        (Some(_), None) => "in progress".to_string(),
        (Some(_), Some(FinalStatus::FailedGeneral)) => "failed general".to_string(),
        (Some(_), Some(FinalStatus::NotQualifiedAny)) => "not qualified".to_string(),
        (Some(_), Some(FinalStatus::Completed)) => "completed".to_string(),
        (Some(_), Some(FinalStatus::Aborted { reason })) => format!("aborted: {}", reason),
    }
}

/// Dump the latest results of a session
async fn cmd_results(
    sessions: &SessionManager,
    session: &str,
    output: Option<&Path>,
) -> Result<()> {
    let session_id = SessionId::from(session);
    let _span = BatchSpan::enter(session);
    let results = sessions
        .results(&session_id)
        .await
        .with_context(|| format!("Failed to read results of session '{}'", session))?;
    let json = serde_json::to_string_pretty(&results)?;

    match output {
        Some(path) => {
            std::fs::write(path, &json)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            info!(entities = results.len(), path = %path.display(), "results written");
        }
        None => println!("{}", json),
    }
    Ok(())
}

/// Delete finished sessions older than `days`
async fn cmd_prune(sessions: &SessionManager, days: i64) -> Result<String> {
    anyhow::ensure!(days >= 0, "--days must not be negative");
    let older_than = chrono::TimeDelta::try_days(days)
        .with_context(|| format!("--days {} is out of range", days))?;
    let removed = sessions.prune(older_than).await?;
    if removed.is_empty() {
        return Ok("Nothing to prune.".to_string());
    }
    let ids: Vec<_> = removed.iter().map(|id| id.to_string()).collect();
    Ok(format!("Pruned {} session(s): {}", removed.len(), ids.join(", ")))
}

fn cmd_check_criteria(path: &Path) -> Result<String> {
    let criteria = CriteriaSet::from_json_file(path)
        .with_context(|| format!("Invalid criterion file {}", path.display()))?;

    let mut out = String::new();
    let _ = writeln!(
        out,
        "criteria {}@{}: {} criteria, {} general",
        criteria.version(),
        criteria.digest().short(),
        criteria.len(),
        criteria.general().len()
    );
    for (audience, (mandatory, nice_to_have)) in criteria.audience_summary() {
        let _ = writeln!(
            out,
            "  {:<20} {} mandatory, {} nice-to-have",
            audience, mandatory, nice_to_have
        );
    }
    Ok(out.trim_end().to_string())
}

fn cmd_check_config(path: &Path) -> Result<String> {
    let config = ScreeningConfig::from_json_file(path)
        .with_context(|| format!("Invalid configuration file {}", path.display()))?;
    Ok(format!(
        "config ok: {} concurrent companies, {} concurrent fetches, breaker opens after {} rate-limit failures",
        config.max_concurrent_companies,
        config.max_concurrent_fetches,
        config.breaker.failure_threshold
    ))
}

fn short(digest: &str) -> &str {
    &digest[..12.min(digest.len())]
}
