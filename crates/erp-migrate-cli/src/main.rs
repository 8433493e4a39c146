//! erp-migrate CLI - resumable, auditable legacy-to-ERP migration.

use clap::{Parser, Subcommand};
use erp_migrate::audit::AuditReport;
use erp_migrate::control::{PageQuery, QuarantineFilter};
use erp_migrate::{
    Config, ErrorClass, FailureStage, JobReport, JobStatus, JobStore, LocalRuntime, MigrateError,
    SignedAuditReport,
};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "erp-migrate")]
#[command(about = "Resumable, auditable legacy-to-ERP data migration")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "migrate.yaml")]
    config: PathBuf,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a new migration run
    Run {
        /// Only migrate this entity type
        #[arg(long)]
        entity: Option<String>,

        /// Run identifier; job ids are <run-id>-<entity-type> [default: generated]
        #[arg(long)]
        run_id: Option<String>,

        /// Override maximum concurrent jobs
        #[arg(long)]
        workers: Option<usize>,
    },

    /// Resume the jobs of an earlier run from their checkpoints
    Resume {
        /// Run identifier given to (or printed by) `run`
        #[arg(long)]
        run_id: String,

        /// Only resume this entity type
        #[arg(long)]
        entity: Option<String>,

        /// Resume even if the mapping, thresholds or transforms changed
        #[arg(long)]
        force: bool,
    },

    /// Run the preflight gates without migrating anything
    Preflight {
        /// Only check this entity type
        #[arg(long)]
        entity: Option<String>,
    },

    /// Show a job summary, or list all jobs
    Status {
        /// Job to summarize
        job_id: Option<String>,
    },

    /// List quarantined records of a job
    Quarantine {
        job_id: String,

        /// Filter by failure stage (extract, transform, detect, reserve, load, snapshot)
        #[arg(long, value_parser = parse_stage)]
        stage: Option<FailureStage>,

        /// Filter by error class (transient, permanent)
        #[arg(long, value_parser = parse_class)]
        class: Option<ErrorClass>,

        /// Filter by error code
        #[arg(long)]
        code: Option<String>,

        #[arg(long, default_value = "50")]
        limit: usize,

        #[arg(long, default_value = "0")]
        offset: usize,
    },

    /// Show the checkpoints of a job
    Checkpoints { job_id: String },

    /// Show merge explanations of a job
    Explain {
        job_id: String,

        /// Only this legacy record
        #[arg(long)]
        legacy_id: Option<String>,
    },

    /// Show outcome statistics of a job
    Stats { job_id: String },

    /// Build the (signed) audit report of a job
    Audit {
        job_id: String,

        /// Write the report to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Verify a saved audit report against the configured signing key
    VerifyAudit { path: PathBuf },

    /// Undo every write of a job
    Rollback { job_id: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<(), MigrateError> {
    let cli = Cli::parse();

    // Setup logging
    setup_logging(&cli.verbosity, &cli.log_format)
        .map_err(|e| MigrateError::Config(e.to_string()))?;

    let mut config = Config::load(&cli.config)?.with_auto_tuning();
    info!("Loaded configuration from {:?}", cli.config);

    // Setup signal handling for graceful shutdown (SIGINT and SIGTERM)
    let cancel_token = setup_signal_handler().await?;

    match cli.command {
        Commands::Run {
            entity,
            run_id,
            workers,
        } => {
            if let Some(w) = workers {
                config.migration.max_concurrent_jobs = Some(w);
                config.validate()?;
            }
            let run_id = run_id.unwrap_or_else(Config::new_run_id);
            let jobs = config.jobs(&run_id, entity.as_deref(), false)?;
            if jobs.is_empty() {
                return Err(MigrateError::Config("no entities configured".to_string()));
            }
            let config_hash = config.hash();
            info!(
                "Starting run {} with {} jobs (config {})",
                run_id,
                jobs.len(),
                &config_hash[..12.min(config_hash.len())]
            );

            let runtime = LocalRuntime::open(config)?;
            let worker = runtime.worker();
            for job in jobs {
                worker.submit(job).await;
            }
            let reports = worker.run_until_idle(&cancel_token).await;
            print_reports(&run_id, &config_hash, &reports, cli.output_json)?;
            check_reports(&reports)?;
        }

        Commands::Resume {
            run_id,
            entity,
            force,
        } => {
            let runtime = LocalRuntime::open(config.clone())?;
            let store = runtime.job_store();
            let mut pending = Vec::new();
            for job in config.jobs(&run_id, entity.as_deref(), force)? {
                match store.get_job(&job.job_id).await? {
                    Some(record) if record.status.is_terminal() => {
                        info!("Job {} already {}; skipping", job.job_id, record.status);
                    }
                    Some(_) => pending.push(job),
                    None => warn!("Job {} was never started; skipping", job.job_id),
                }
            }
            if pending.is_empty() {
                return Err(MigrateError::State(format!(
                    "run '{}' has no unfinished jobs to resume",
                    run_id
                )));
            }

            let config_hash = config.hash();
            info!("Resuming {} jobs of run {}", pending.len(), run_id);
            let worker = runtime.worker();
            for job in pending {
                worker.submit(job).await;
            }
            let reports = worker.run_until_idle(&cancel_token).await;
            print_reports(&run_id, &config_hash, &reports, cli.output_json)?;
            check_reports(&reports)?;
        }

        Commands::Preflight { entity } => {
            let jobs = config.jobs("preflight", entity.as_deref(), false)?;
            let runtime = LocalRuntime::open(config)?;
            let orchestrator = runtime.orchestrator();
            let mut blocked = Vec::new();
            for job in &jobs {
                let report = orchestrator.preflight_only(job).await?;
                if cli.output_json {
                    println!("{}", serde_json::to_string_pretty(&report)?);
                } else {
                    println!("Preflight for {}:", job.entity_type());
                    for check in &report.checks {
                        let mark = if check.passed {
                            "PASS"
                        } else if check.overridden {
                            "OVERRIDDEN"
                        } else {
                            "FAIL"
                        };
                        println!("  [{}] {}: {}", mark, check.gate, check.diagnostic);
                    }
                }
                if !report.passed {
                    blocked.push(job.entity_type().to_string());
                }
            }
            if !blocked.is_empty() {
                return Err(MigrateError::gate(
                    "preflight",
                    format!("blocked entity types: {}", blocked.join(", ")),
                ));
            }
        }

        Commands::Status { job_id } => {
            let control = LocalRuntime::open(config)?.control_plane();
            match job_id {
                Some(job_id) => {
                    let summary = control.job_summary(&job_id).await?;
                    if cli.output_json {
                        println!("{}", serde_json::to_string_pretty(&summary)?);
                    } else {
                        println!("Job {} ({})", summary.job_id, summary.entity_type);
                        println!("  Status: {}", summary.status);
                        println!("  Runs: {}", summary.runs);
                        println!("  Loaded: {}", summary.loaded);
                        println!("  Skipped: {}", summary.skipped);
                        println!("  Manual review: {}", summary.manual_review);
                        println!("  Quarantined: {}", summary.quarantined);
                        for cp in &summary.checkpoints {
                            println!(
                                "  Checkpoint: {} processed, cursor {}{}",
                                cp.processed_count,
                                cp.cursor,
                                if cp.complete { " (complete)" } else { "" }
                            );
                        }
                        if let Some(err) = &summary.error {
                            println!("  Error: {}", err);
                        }
                    }
                }
                None => {
                    let jobs = control.list_jobs().await?;
                    if cli.output_json {
                        println!("{}", serde_json::to_string_pretty(&jobs)?);
                    } else if jobs.is_empty() {
                        println!("No jobs recorded");
                    } else {
                        for job in &jobs {
                            println!(
                                "{}  {}  {}  runs={}",
                                job.job_id, job.entity_type, job.status, job.runs
                            );
                        }
                    }
                }
            }
        }

        Commands::Quarantine {
            job_id,
            stage,
            class,
            code,
            limit,
            offset,
        } => {
            let control = LocalRuntime::open(config)?.control_plane();
            let filter = QuarantineFilter {
                entity_type: None,
                failure_stage: stage,
                error_class: class,
                error_code: code,
            };
            let page = control
                .quarantine_entries(&job_id, &filter, PageQuery::new(limit, offset))
                .await?;
            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&page)?);
            } else {
                println!(
                    "Quarantine for {}: {} entries (showing {} from {})",
                    job_id,
                    page.total,
                    page.data.len(),
                    page.offset
                );
                for entry in &page.data {
                    println!(
                        "  {} [{} / {} / {}] attempts={} {}",
                        entry.legacy_id,
                        entry.failure_stage,
                        entry.error_class,
                        entry.error_code,
                        entry.attempts,
                        entry.message
                    );
                }
            }
        }

        Commands::Checkpoints { job_id } => {
            let control = LocalRuntime::open(config)?.control_plane();
            let checkpoints = control.checkpoint_entries(&job_id).await?;
            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&checkpoints)?);
            } else {
                for cp in &checkpoints {
                    println!(
                        "{}  batch={}  processed={}  loaded={}  cursor={}  transform={}",
                        cp.entity_type,
                        cp.batch_index,
                        cp.processed_count,
                        cp.loaded_count,
                        cp.cursor,
                        cp.transform_version
                    );
                }
            }
        }

        Commands::Explain { job_id, legacy_id } => {
            let control = LocalRuntime::open(config)?.control_plane();
            let entries = control
                .merge_explanations(&job_id, legacy_id.as_deref())
                .await?;
            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else {
                for entry in &entries {
                    println!(
                        "{} -> {}  score={:.1}  decision={}",
                        entry.legacy_id,
                        entry.target_id,
                        entry.score,
                        entry.decision.as_str()
                    );
                    for e in &entry.explanations {
                        println!(
                            "    {} ({:?}): +{:.1}",
                            e.field, e.match_type, e.contribution
                        );
                    }
                }
            }
        }

        Commands::Stats { job_id } => {
            let control = LocalRuntime::open(config)?.control_plane();
            let stats = control.job_stats(&job_id).await?;
            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("Job {}: {} outcomes", stats.job_id, stats.total_outcomes);
                for (status, count) in &stats.by_status {
                    println!("  {}: {}", status, count);
                }
                if let Some(score) = stats.average_score {
                    println!("  Average score: {:.1}", score);
                }
                println!("  Quarantine rate: {:.1}%", stats.quarantine_rate * 100.0);
                println!("  Manual review rate: {:.1}%", stats.manual_review_rate * 100.0);
                if let Some(run) = &stats.last_run {
                    println!("  Last run: {}", run.summary());
                }
            }
        }

        Commands::Audit { job_id, output } => {
            let runtime = LocalRuntime::open(config.clone())?;
            let store = runtime.job_store();
            let report = AuditReport::build(store.as_ref(), &job_id).await?;
            if config.audit.signing_key.is_none() {
                warn!("No audit.signing_key configured; report will be unsigned");
            }
            let signed = report.sign(config.audit.signing_key.as_deref(), &config.audit.key_id)?;
            match output {
                Some(path) => {
                    signed.save(&path)?;
                    println!("Audit report for {} written to {:?}", job_id, path);
                    println!("  Digest: {}", signed.digest);
                }
                None => println!("{}", signed.to_json_pretty()?),
            }
        }

        Commands::VerifyAudit { path } => {
            let signed = SignedAuditReport::load(&path)?;
            signed.verify(config.audit.signing_key.as_deref())?;
            if cli.output_json {
                println!(
                    "{}",
                    serde_json::json!({
                        "job_id": signed.report.job_id,
                        "digest": signed.digest,
                        "signed": signed.is_signed(),
                        "verified": true,
                    })
                );
            } else {
                println!(
                    "Audit report for {} verified ({})",
                    signed.report.job_id,
                    if signed.is_signed() { "signature and digest" } else { "digest only" }
                );
            }
        }

        Commands::Rollback { job_id } => {
            let runtime = LocalRuntime::open(config)?;
            let result = runtime.rollback_engine().rollback(&job_id).await?;
            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("Rollback of {}:", job_id);
                println!("  Reverted: {}", result.reverted.len());
                println!("  Failed: {}", result.failed.len());
                for failure in &result.failed {
                    println!(
                        "    {}/{} (legacy {}): {}",
                        failure.entity_type, failure.target_id, failure.legacy_id, failure.error
                    );
                }
            }
            if !result.is_complete() {
                return Err(MigrateError::State(format!(
                    "{} records could not be reverted",
                    result.failed.len()
                )));
            }
        }
    }

    Ok(())
}

fn print_reports(
    run_id: &str,
    config_hash: &str,
    reports: &[JobReport],
    json: bool,
) -> Result<(), MigrateError> {
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "run_id": run_id,
                "config_hash": config_hash,
                "jobs": reports,
            }))?
        );
        return Ok(());
    }

    println!("\nRun {} finished", run_id);
    for report in reports {
        println!("  {} ({}): {}", report.job_id, report.entity_type, report.status);
        if let Some(result) = &report.result {
            println!("    {}", result.stats.summary());
        }
        if let Some(err) = &report.error {
            println!("    Error: {}", err);
        }
    }
    Ok(())
}

/// Turn unfinished jobs into a process error.
fn check_reports(reports: &[JobReport]) -> Result<(), MigrateError> {
    if reports.iter().any(|r| r.status == JobStatus::Cancelled) {
        return Err(MigrateError::Cancelled);
    }
    if let Some(blocked) = reports.iter().find(|r| r.status == JobStatus::Blocked) {
        return Err(MigrateError::gate(
            "preflight",
            blocked.error.clone().unwrap_or_else(|| blocked.job_id.clone()),
        ));
    }
    let failed: Vec<&str> = reports
        .iter()
        .filter(|r| r.status == JobStatus::Failed)
        .map(|r| r.job_id.as_str())
        .collect();
    if !failed.is_empty() {
        return Err(MigrateError::State(format!(
            "{} of {} jobs failed: {}",
            failed.len(),
            reports.len(),
            failed.join(", ")
        )));
    }
    Ok(())
}

fn parse_stage(s: &str) -> Result<FailureStage, String> {
    serde_json::from_value(serde_json::Value::String(s.to_lowercase()))
        .map_err(|_| format!("unknown failure stage '{}'", s))
}

fn parse_class(s: &str) -> Result<ErrorClass, String> {
    serde_json::from_value(serde_json::Value::String(s.to_lowercase()))
        .map_err(|_| format!("unknown error class '{}'", s))
}

fn setup_logging(verbosity: &str, format: &str) -> Result<(), String> {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    // Logs go to stderr so --output-json stays parseable.
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false)
        .with_writer(std::io::stderr);

    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    Ok(())
}

/// Setup signal handlers for graceful shutdown.
/// Handles both SIGINT (Ctrl-C) and SIGTERM.
/// Returns a CancellationToken that will be cancelled when a signal is received.
#[cfg(unix)]
async fn setup_signal_handler() -> Result<CancellationToken, MigrateError> {
    let cancel_token = CancellationToken::new();

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    let token_int = cancel_token.clone();
    tokio::spawn(async move {
        sigint.recv().await;
        eprintln!("\nReceived SIGINT. Stopping after the current batch...");
        token_int.cancel();
    });

    let token_term = cancel_token.clone();
    tokio::spawn(async move {
        sigterm.recv().await;
        eprintln!("\nReceived SIGTERM. Stopping after the current batch...");
        token_term.cancel();
    });

    Ok(cancel_token)
}

/// Setup signal handler for Windows (only Ctrl-C)
#[cfg(not(unix))]
async fn setup_signal_handler() -> Result<CancellationToken, MigrateError> {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nReceived Ctrl-C. Stopping after the current batch...");
            token.cancel();
        }
    });

    Ok(cancel_token)
}
