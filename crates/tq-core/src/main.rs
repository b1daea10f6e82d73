//! telq - local queue maintenance for the telemetry pipeline.
//!
//! Operates on a data directory holding the persisted queue:
//! - Inspect queue statistics and pending events
//! - Drain the queue into a JSON-lines file
//! - Erase a user's pending events, or purge everything
//!
//! Payloads go to stdout; logs go to stderr.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::DateTime;
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info};

use tq_common::{system_clock, Millis};
use tq_config::{
    resolve_config_path, resolve_data_dir, ConfigSource, PipelineConfig, ResolvedPath, ValidationError,
};
use tq_core::exit_codes::ExitCode;
use tq_core::logging::{init_logging, LogConfig, LogFormat, LogLevel};
use tq_core::{Analytics, DispatchOutcome, JsonlFileSink};
use tq_queue::{DurableQueue, FileStorage, QueueConfig, QueueError, StorageError};

/// telq - inspect and maintain the on-device telemetry queue
#[derive(Parser)]
#[command(name = "tq")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    global: GlobalOpts,
}

/// Global options available to all commands
#[derive(Args, Debug)]
struct GlobalOpts {
    /// Directory holding the persisted queue
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Path to a pipeline config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output format
    #[arg(long, short = 'f', global = true, value_enum, default_value_t = OutputFormat::Human)]
    format: OutputFormat,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show queue statistics
    Stats,

    /// List pending events (ids, names and delivery bookkeeping only)
    Inspect {
        /// Maximum number of events to list
        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Deliver the queue to a JSON-lines file
    Drain {
        /// Output file (appended to)
        #[arg(long)]
        out: PathBuf,

        /// Stop after this many flush cycles
        #[arg(long, default_value = "100")]
        max_cycles: usize,
    },

    /// Delete every pending event attributed to a user
    EraseUser {
        /// User id to erase
        user_id: String,
    },

    /// Empty the queue, its backup and any pending revocation marker
    Purge,

    /// Print the resolved configuration
    Config,
}

#[derive(Error, Debug)]
enum CliError {
    #[error("config error: {0}")]
    Config(#[from] ValidationError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Args(String),
}

impl CliError {
    fn exit_code(&self) -> ExitCode {
        match self {
            CliError::Config(_) => ExitCode::ConfigError,
            CliError::Storage(_) | CliError::Queue(_) => ExitCode::StorageError,
            CliError::Io(_) => ExitCode::IoError,
            CliError::Args(_) => ExitCode::ArgsError,
        }
    }
}

struct Context {
    config: PipelineConfig,
    config_path: ResolvedPath,
    data_dir: ResolvedPath,
    format: OutputFormat,
}

impl Context {
    fn data_dir(&self) -> Result<PathBuf, CliError> {
        self.data_dir
            .path
            .clone()
            .ok_or_else(|| CliError::Args("no data directory; pass --data-dir".to_string()))
    }

    fn open_store(&self) -> Result<FileStorage, CliError> {
        let dir = self.data_dir()?;
        debug!(path = %dir.display(), source = %self.data_dir.source, "Opening queue");
        Ok(FileStorage::open(dir)?)
    }

    fn open_queue(&self) -> Result<DurableQueue, CliError> {
        Ok(DurableQueue::new(
            Arc::new(self.open_store()?),
            QueueConfig::from(&self.config),
            system_clock(),
        ))
    }

    fn emit(&self, payload: &Value, human: impl FnOnce() -> String) {
        match self.format {
            OutputFormat::Json => println!(
                "{}",
                serde_json::to_string_pretty(payload).unwrap_or_else(|_| payload.to_string())
            ),
            OutputFormat::Human => println!("{}", human()),
        }
    }
}

fn load_config(cli: &GlobalOpts) -> Result<(PipelineConfig, ResolvedPath), CliError> {
    let resolved = resolve_config_path(cli.config.as_deref());
    if let Some(requested) = &cli.config {
        if resolved.source != ConfigSource::CliArgument {
            return Err(CliError::Args(format!(
                "config file not found: {}",
                requested.display()
            )));
        }
    }
    let mut config = match &resolved.path {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::default(),
    };
    config.apply_env_overrides()?;
    Ok((config, resolved))
}

fn format_time(ms: Option<Millis>) -> String {
    ms.and_then(DateTime::from_timestamp_millis)
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| "never".to_string())
}

fn main() {
    let cli = Cli::parse();

    let cli_level = if cli.global.quiet {
        Some(LogLevel::Error)
    } else {
        match cli.global.verbose {
            0 => None,
            1 => Some(LogLevel::Debug),
            _ => Some(LogLevel::Trace),
        }
    };
    let cli_format = match cli.global.format {
        OutputFormat::Json => Some(LogFormat::Jsonl),
        OutputFormat::Human => None,
    };

    let exit_code = match load_config(&cli.global) {
        Ok((config, config_path)) => {
            let log_config =
                LogConfig::from_env(cli_level, cli_format).with_debug_flag(config.debug);
            init_logging(&log_config);

            let ctx = Context {
                config,
                config_path,
                data_dir: resolve_data_dir(cli.global.data_dir.as_deref()),
                format: cli.global.format,
            };
            match run(&ctx, &cli.command) {
                Ok(code) => code,
                Err(e) => report_error(&e, cli.global.format),
            }
        }
        Err(e) => report_error(&e, cli.global.format),
    };

    std::process::exit(exit_code.as_i32());
}

fn report_error(err: &CliError, format: OutputFormat) -> ExitCode {
    let code = err.exit_code();
    match format {
        OutputFormat::Json => println!(
            "{}",
            json!({ "error": { "code": code.code_name(), "message": err.to_string() } })
        ),
        OutputFormat::Human => eprintln!("tq: {}", err),
    }
    code
}

fn run(ctx: &Context, command: &Commands) -> Result<ExitCode, CliError> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async {
        match command {
            Commands::Stats => run_stats(ctx).await,
            Commands::Inspect { limit } => run_inspect(ctx, *limit).await,
            Commands::Drain { out, max_cycles } => run_drain(ctx, out.clone(), *max_cycles).await,
            Commands::EraseUser { user_id } => run_erase_user(ctx, user_id).await,
            Commands::Purge => run_purge(ctx).await,
            Commands::Config => run_config(ctx),
        }
    })
}

async fn run_stats(ctx: &Context) -> Result<ExitCode, CliError> {
    let queue = ctx.open_queue()?;
    let stats = queue.get_stats().await;
    let purge_pending = queue.purge_pending().await;

    let payload = json!({
        "queued": stats.queued,
        "failed_syncs": stats.failed_syncs,
        "last_sync_time": stats.last_sync_time,
        "last_failed_sync_time": stats.last_failed_sync_time,
        "purge_pending": purge_pending,
    });
    ctx.emit(&payload, || {
        format!(
            "queued:            {}\nfailed syncs:      {}\nlast sync:         {}\nlast failed sync:  {}\npurge pending:     {}",
            stats.queued,
            stats.failed_syncs,
            format_time(stats.last_sync_time),
            format_time(stats.last_failed_sync_time),
            if purge_pending { "yes" } else { "no" },
        )
    });
    Ok(ExitCode::Clean)
}

async fn run_inspect(ctx: &Context, limit: usize) -> Result<ExitCode, CliError> {
    let queue = ctx.open_queue()?;
    let events = queue.get_all_events().await;
    let shown: Vec<Value> = events
        .iter()
        .take(limit)
        .map(|q| {
            json!({
                "id": q.id().as_str(),
                "name": q.event.name(),
                "timestamp": q.event.timestamp(),
                "session_id": q.event.session_id().as_str(),
                "queued_at": q.queued_at,
                "attempt_count": q.attempt_count,
            })
        })
        .collect();

    let payload = json!({ "total": events.len(), "events": shown });
    ctx.emit(&payload, || {
        let mut out = format!("{} pending event(s)", events.len());
        for q in events.iter().take(limit) {
            out.push_str(&format!(
                "\n{}  {:<24}  attempts={}  queued={}",
                q.id(),
                q.event.name(),
                q.attempt_count,
                format_time(Some(q.queued_at)),
            ));
        }
        out
    });
    Ok(ExitCode::Clean)
}

async fn run_drain(ctx: &Context, out: PathBuf, max_cycles: usize) -> Result<ExitCode, CliError> {
    let store = Arc::new(ctx.open_store()?);
    let sink = Arc::new(JsonlFileSink::new(out.clone()));
    let analytics = Analytics::builder(store, sink)
        .config(ctx.config.clone())
        .build();
    analytics.initialize().await;
    // Events were admitted under consent; an unfinished revocation purge
    // still runs first.
    analytics.set_consent(true).await;

    let mut delivered = 0;
    let mut last = None;
    for _ in 0..max_cycles {
        let outcome = analytics.flush().await;
        delivered += outcome.sent_events();
        let done = matches!(outcome, DispatchOutcome::Drained { batches: 0, .. });
        let progressing = matches!(outcome, DispatchOutcome::Drained { .. });
        last = Some(outcome);
        if done || !progressing {
            break;
        }
    }
    analytics.cleanup().await;

    let remaining = analytics.queue().len().await;
    info!(delivered, remaining, "Drain finished");
    let code = if remaining == 0 {
        ExitCode::Clean
    } else {
        ExitCode::Partial
    };
    let stopped = match &last {
        Some(DispatchOutcome::Failed { error, .. }) => Some(error.to_string()),
        Some(DispatchOutcome::Skipped(reason)) => Some(format!("{:?}", reason)),
        Some(DispatchOutcome::WentOffline { .. }) => Some("offline".to_string()),
        Some(DispatchOutcome::ConsentRevoked { .. }) => Some("consent revoked".to_string()),
        Some(DispatchOutcome::Unresolved { .. }) => {
            Some("delivered batch could not be removed from the queue".to_string())
        }
        _ => None,
    };

    let payload = json!({
        "delivered": delivered,
        "remaining": remaining,
        "out": out.display().to_string(),
        "stopped": stopped,
    });
    ctx.emit(&payload, || {
        let mut line = format!(
            "delivered {} event(s) to {}, {} remaining",
            delivered,
            out.display(),
            remaining
        );
        if let Some(reason) = &stopped {
            line.push_str(&format!(" (stopped: {})", reason));
        }
        line
    });
    Ok(code)
}

async fn run_erase_user(ctx: &Context, user_id: &str) -> Result<ExitCode, CliError> {
    if user_id.trim().is_empty() {
        return Err(CliError::Args("user id must not be empty".to_string()));
    }
    let queue = ctx.open_queue()?;
    let removed = queue.remove_events_for_user(user_id).await?;
    ctx.emit(&json!({ "removed": removed }), || {
        format!("removed {} event(s)", removed)
    });
    Ok(ExitCode::Clean)
}

async fn run_purge(ctx: &Context) -> Result<ExitCode, CliError> {
    let queue = ctx.open_queue()?;
    queue.clear().await?;
    queue.clear_purge_marker().await?;
    ctx.emit(&json!({ "purged": true }), || "queue purged".to_string());
    Ok(ExitCode::Clean)
}

fn run_config(ctx: &Context) -> Result<ExitCode, CliError> {
    let path = |r: &ResolvedPath| r.path.as_ref().map(|p| p.display().to_string());
    let payload = json!({
        "config_path": path(&ctx.config_path),
        "config_source": ctx.config_path.source.to_string(),
        "data_dir": path(&ctx.data_dir),
        "data_dir_source": ctx.data_dir.source.to_string(),
        "config": serde_json::to_value(&ctx.config).map_err(std::io::Error::other)?,
    });
    ctx.emit(&payload, || {
        format!(
            "config:   {} ({})\ndata dir: {} ({})\n{}",
            path(&ctx.config_path).unwrap_or_else(|| "-".to_string()),
            ctx.config_path.source,
            path(&ctx.data_dir).unwrap_or_else(|| "-".to_string()),
            ctx.data_dir.source,
            ctx.config.to_json_pretty(),
        )
    });
    Ok(ExitCode::Clean)
}
