use std::path::PathBuf;
use std::sync::Arc;

use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use outbound_gate::compliance::{ComplianceGate, PrepareOptions, TracingAuditSink};
use outbound_gate::config::GovernanceConfig;
use outbound_gate::ratelimit::RateLimiter;
use outbound_gate::store::RedisCounterStore;

/// Operator tooling for the outbound governance pipeline.
#[derive(Debug, Parser)]
#[command(name = "outbound-gate", version, about)]
struct Cli {
    /// YAML configuration file (OUTBOUND_GATE__* variables override it)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Check that the counter store answers
    Health,
    /// Print today's contact budget
    Usage,
    /// Check whether a recipient may be contacted right now
    Check { recipient: String },
    /// Run a text through the compliance gate
    Prepare {
        /// Sender shown in the legal identification footer
        #[arg(long)]
        client_label: String,
        #[arg(long)]
        no_disclaimer: bool,
        #[arg(long)]
        no_identification: bool,
        text: String,
    },
    /// Check whether an inbound text is an opt-out request
    OptOut { text: String },
    /// Set or clear the suppression flag for a UTC day (YYYY-MM-DD)
    Suppress {
        date: NaiveDate,
        #[arg(long)]
        clear: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting outbound-gate");

    let config = GovernanceConfig::load(cli.config.as_deref())?;

    match cli.command {
        Command::Prepare {
            client_label,
            no_disclaimer,
            no_identification,
            text,
        } => {
            let gate = ComplianceGate::new(&config.compliance, Arc::new(TracingAuditSink))?;
            let prepared = gate.prepare_outbound(
                &text,
                &client_label,
                PrepareOptions {
                    add_disclaimer: !no_disclaimer,
                    add_identification: !no_identification,
                },
            );
            println!("{}", serde_json::to_string_pretty(&prepared)?);
        }
        Command::OptOut { text } => {
            let gate = ComplianceGate::new(&config.compliance, Arc::new(TracingAuditSink))?;
            println!("{}", gate.is_opt_out(&text));
        }
        Command::Health => {
            let store = RedisCounterStore::open(&config.store)?;
            let timeout = config.store.operation_timeout();
            let reachable = match tokio::time::timeout(timeout, store.ping()).await {
                Ok(Ok(())) => true,
                Ok(Err(e)) => {
                    warn!(error = %e, "Counter store ping failed");
                    false
                }
                Err(_) => {
                    warn!(timeout = ?timeout, "Counter store ping timed out");
                    false
                }
            };
            println!("{}", serde_json::json!({ "store_reachable": reachable }));
            if !reachable {
                std::process::exit(1);
            }
        }
        Command::Usage => {
            let limiter = open_limiter(&config)?;
            let report = limiter.daily_usage().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Check { recipient } => {
            let limiter = open_limiter(&config)?;
            let admission = limiter.check(&recipient).await;
            println!("{}", serde_json::to_string_pretty(&admission)?);
        }
        Command::Suppress { date, clear } => {
            let limiter = open_limiter(&config)?;
            limiter.set_suppression(date, !clear).await?;
            info!(date = %date, active = !clear, "Suppression flag updated");
        }
    }

    Ok(())
}

fn open_limiter(config: &GovernanceConfig) -> anyhow::Result<RateLimiter> {
    let store = RedisCounterStore::open(&config.store)?;
    Ok(RateLimiter::new(Arc::new(store), config))
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
