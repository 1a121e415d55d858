//! # till-ledger
//!
//! Operator and service entry point for the cash ledger.
//!
//! ```text
//! till-ledger [--config <PATH>] <COMMAND>
//!
//!   serve                          Run the reconciliation scheduler until Ctrl-C / SIGTERM
//!   ingest <FILE|->                Reconcile JSON-lines sale events
//!   recompute <STORE> <DATE>       Recompute one daily summary (YYYY-MM-DD)
//!   open <STORE> <TARGET>          Open today's shift with a float
//!   close <REGISTER> <ACTUAL>      Close a shift with the counted cash
//!   history <REGISTER> [LIMIT]     Print recent cash history
//!   verify <REGISTER>              Check the register's audit trail
//! ```
//!
//! Logging follows `RUST_LOG`, default `info,till=debug,sqlx=warn`.

use std::env;
use std::path::PathBuf;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use till_core::validation::{parse_amount, parse_business_date};
use till_core::SaleEvent;
use till_ledger::{LedgerConfig, LedgerService, Outcome, ServiceError};

const USAGE: &str = "\
Usage: till-ledger [--config <PATH>] <COMMAND>

Commands:
  serve                          Run the reconciliation scheduler until Ctrl-C / SIGTERM
  ingest <FILE|->                Reconcile JSON-lines sale events
  recompute <STORE> <DATE>       Recompute one daily summary (YYYY-MM-DD)
  open <STORE> <TARGET>          Open today's shift with a float
  close <REGISTER> <ACTUAL>      Close a shift with the counted cash
  history <REGISTER> [LIMIT]     Print recent cash history
  verify <REGISTER>              Check the register's audit trail";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let mut args: Vec<String> = env::args().skip(1).collect();

    let mut config_path: Option<PathBuf> = None;
    if let Some(pos) = args.iter().position(|a| a == "--config" || a == "-c") {
        if pos + 1 >= args.len() {
            eprintln!("{USAGE}");
            return Err("--config needs a path".into());
        }
        config_path = Some(PathBuf::from(args.remove(pos + 1)));
        args.remove(pos);
    }

    if args.is_empty() || args.iter().any(|a| a == "--help" || a == "-h") {
        println!("{USAGE}");
        return Ok(());
    }

    let config = LedgerConfig::load(config_path)?;
    let mut service = LedgerService::connect(config).await?;

    let result = run_command(&mut service, &args).await;
    service.shutdown().await;

    if let Err(e) = &result {
        error!(?e, status = e.status_code(), "Command failed");
    }
    result.map_err(Into::into)
}

fn arg(args: &[String], i: usize) -> Result<&str, ServiceError> {
    args.get(i)
        .map(String::as_str)
        .ok_or_else(|| ServiceError::InvalidConfig(format!("missing argument\n\n{USAGE}")))
}

async fn run_command(service: &mut LedgerService, args: &[String]) -> Result<(), ServiceError> {
    match arg(args, 0)? {
        "serve" => {
            service.start_scheduler();
            info!("Ledger service running");
            shutdown_signal().await;
            Ok(())
        }

        "ingest" => {
            let source = arg(args, 1)?;
            let stats = if source == "-" {
                ingest(service, BufReader::new(tokio::io::stdin())).await?
            } else {
                let file = tokio::fs::File::open(source).await?;
                ingest(service, BufReader::new(file)).await?
            };
            println!(
                "applied={} no_cash={} duplicate={} failed={}",
                stats.applied, stats.no_cash, stats.duplicate, stats.failed
            );
            Ok(())
        }

        "recompute" => {
            let store_id = arg(args, 1)?;
            let date = parse_business_date(arg(args, 2)?)?;
            let summary = service.aggregator().recompute(store_id, date).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }

        "open" => {
            let store_id = arg(args, 1)?;
            let target = parse_amount(arg(args, 2)?)?;
            let register = service.shifts().open_shift(store_id, target, None).await?;
            println!("{}", serde_json::to_string_pretty(&register)?);
            Ok(())
        }

        "close" => {
            let register_id = arg(args, 1)?;
            let actual = parse_amount(arg(args, 2)?)?;
            let report = service.shifts().close_shift(register_id, actual, None, None).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }

        "history" => {
            let register_id = arg(args, 1)?;
            let limit = match args.get(2) {
                Some(raw) => Some(
                    raw.parse::<u32>()
                        .map_err(|e| ServiceError::InvalidConfig(format!("limit: {e}")))?,
                ),
                None => None,
            };
            for row in service.shifts().history(register_id, limit).await? {
                println!(
                    "{:>5} {} {:<12} {:>12} {:>12} -> {:>12}  {}",
                    row.seq,
                    row.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    row.operation_type.as_str(),
                    row.amount(),
                    row.balance_before(),
                    row.balance_after(),
                    row.notes
                );
            }
            Ok(())
        }

        "verify" => {
            let register_id = arg(args, 1)?;
            let report = service.shifts().verify_chain(register_id).await?;
            if report.is_intact() {
                println!("ok: {} rows chained", report.rows_checked);
            } else {
                for brk in &report.breaks {
                    println!("break: {brk:?}");
                }
            }
            Ok(())
        }

        other => Err(ServiceError::InvalidConfig(format!("unknown command `{other}`\n\n{USAGE}"))),
    }
}

#[derive(Debug, Default)]
struct IngestStats {
    applied: usize,
    no_cash: usize,
    duplicate: usize,
    failed: usize,
}

/// Reconciles one JSON event per line. A bad line is logged and counted,
/// not fatal.
async fn ingest<R>(service: &LedgerService, reader: BufReader<R>) -> Result<IngestStats, ServiceError>
where
    R: AsyncRead + Unpin,
{
    let mut stats = IngestStats::default();
    let mut lines = reader.lines();
    let mut line_no = 0usize;

    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }

        let event: SaleEvent = match serde_json::from_str(&line) {
            Ok(event) => event,
            Err(e) => {
                warn!(line = line_no, error = %e, "Skipping malformed sale event");
                stats.failed += 1;
                continue;
            }
        };

        match service.process_with_retry(&event).await {
            Ok(Outcome::Applied { .. }) => stats.applied += 1,
            Ok(Outcome::NoCashMovement) => stats.no_cash += 1,
            Ok(Outcome::Duplicate) => stats.duplicate += 1,
            Err(e) => {
                error!(?e, line = line_no, sale_id = %event.sale_id, status = e.status_code(), "Sale event rejected");
                stats.failed += 1;
            }
        }
    }

    Ok(stats)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,till=debug,sqlx=warn"));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(?e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(?e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
