use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use std::time::Duration;
use tabled::{Table, Tabled};
use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

use flowrecon::config::Config;
use flowrecon::engine::stream::forward_lines;
use flowrecon::engine::{run_stream, RunSummary};
use flowrecon::FlowRecord;

/// Lines per message on the input channel
const LINES_PER_MESSAGE: usize = 1024;

#[derive(Parser)]
#[command(name = "flowrecon")]
#[command(author, version, about = "TCP flow reconstruction from packet header records")]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Reconstruct flows from JSON Lines packet records
    Run {
        /// Input file, `-` for stdin
        #[arg(short, long, default_value = "-")]
        input: String,

        /// Output file for flow records (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Write per-IP and per-pair traffic aggregates to this file
        #[arg(short, long)]
        aggregates: Option<PathBuf>,

        /// Number of shard workers (0 = one per CPU)
        #[arg(short, long)]
        workers: Option<usize>,

        /// Flow idle timeout in seconds
        #[arg(short, long)]
        timeout: Option<u64>,

        /// JSON file mapping addresses to their integer encoding
        #[arg(long)]
        ip_map: Option<PathBuf>,

        /// Print the run summary as JSON instead of a table
        #[arg(long)]
        json_summary: bool,
    },

    /// Generate default configuration file
    GenConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

/// Summary table row
#[derive(Tabled)]
struct SummaryRow {
    #[tabled(rename = "Metric")]
    metric: String,
    #[tabled(rename = "Value")]
    value: String,
}

impl SummaryRow {
    fn new(metric: impl Into<String>, value: impl ToString) -> Self {
        Self {
            metric: metric.into(),
            value: value.to_string(),
        }
    }
}

/// Load the config named on the command line, or the first one found in the
/// default locations
pub fn load_config(cli: &Cli) -> Result<Config> {
    match &cli.config {
        Some(path) => Config::load(path),
        None => Config::load_or_default(),
    }
}

pub async fn run_command(cli: Cli, config: Config) -> Result<()> {
    match cli.command {
        Commands::Run {
            input,
            output,
            aggregates,
            workers,
            timeout,
            ip_map,
            json_summary,
        } => {
            let mut config = config;
            if let Some(workers) = workers {
                config.engine.workers = workers;
            }
            if let Some(timeout) = timeout {
                config.flow.flow_timeout_seconds = timeout;
            }
            if ip_map.is_some() {
                config.filter.ip_map = ip_map;
            }
            config.engine.collect_aggregates |= aggregates.is_some();
            config.validate()?;
            cmd_run(config, input, output, aggregates, json_summary).await
        }
        Commands::GenConfig { output } => cmd_gen_config(output),
    }
}

async fn open_input(input: &str) -> Result<Box<dyn AsyncBufRead + Unpin + Send>> {
    if input == "-" {
        return Ok(Box::new(BufReader::new(tokio::io::stdin())));
    }
    let file = tokio::fs::File::open(input)
        .await
        .with_context(|| format!("Failed to open input: {}", input))?;
    Ok(Box::new(BufReader::new(file)))
}

async fn open_output(output: Option<&PathBuf>) -> Result<Box<dyn AsyncWrite + Unpin + Send>> {
    match output {
        Some(path) => {
            let file = tokio::fs::File::create(path)
                .await
                .with_context(|| format!("Failed to create output: {}", path.display()))?;
            Ok(Box::new(BufWriter::new(file)))
        }
        None => Ok(Box::new(BufWriter::new(tokio::io::stdout()))),
    }
}

async fn write_records<W: AsyncWrite + Unpin>(writer: &mut W, records: &[FlowRecord]) -> Result<()> {
    for record in records {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        writer.write_all(&line).await?;
    }
    Ok(())
}

async fn cmd_run(
    config: Config,
    input: String,
    output: Option<PathBuf>,
    aggregates: Option<PathBuf>,
    json_summary: bool,
) -> Result<()> {
    let reader = open_input(&input).await?;
    let mut writer = open_output(output.as_ref()).await?;

    let engine = config.build_engine()?;
    let depth = config.engine.channel_depth.max(1);
    let (in_tx, in_rx) = mpsc::channel(depth);
    let (out_tx, mut out_rx) = mpsc::channel::<Vec<FlowRecord>>(depth);
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

    let flush_every = Duration::from_millis(config.engine.flush_interval_ms);
    let reader_task = tokio::spawn(forward_lines(reader, in_tx, LINES_PER_MESSAGE, flush_every));

    let signal_tx = shutdown_tx.clone();
    let signal_task = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nShutting down...");
            let _ = signal_tx.send(());
        }
    });

    let driver = tokio::spawn(run_stream(engine, in_rx, out_tx, shutdown_rx));

    let mut written = 0u64;
    while let Some(chunk) = out_rx.recv().await {
        write_records(&mut writer, &chunk).await?;
        written += chunk.len() as u64;
    }

    let outcome = driver.await.context("Stream driver panicked")?;
    signal_task.abort();

    let mut engine = outcome.engine;
    if outcome.cancelled {
        reader_task.abort();
        // Flows still open at cancellation get the end-of-stream treatment
        let rest = engine.finish();
        write_records(&mut writer, &rest).await?;
        written += rest.len() as u64;
        warn!("Run cancelled, {} open flows finalized early", rest.len());
    } else if engine.input_exhausted() {
        reader_task.abort();
        info!("Row limit reached, rest of {} not read", input);
    } else {
        let lines = reader_task
            .await
            .context("Input reader panicked")?
            .with_context(|| format!("Failed to read input: {}", input))?;
        info!("Read {} lines from {}", lines, input);
    }
    writer.flush().await?;

    if let Some(path) = aggregates {
        if let Some(report) = engine.aggregates() {
            let json = serde_json::to_string_pretty(&report)?;
            tokio::fs::write(&path, json)
                .await
                .with_context(|| format!("Failed to write aggregates: {}", path.display()))?;
            info!("Aggregates written to {}", path.display());
        }
    }

    let summary = engine.summary();
    if json_summary {
        eprintln!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary, written);
    }

    Ok(())
}

fn format_timestamp(ts: Option<i64>) -> String {
    ts.and_then(DateTime::<Utc>::from_timestamp_micros)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S%.6f UTC").to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn print_summary(summary: &RunSummary, written: u64) {
    eprintln!("{}", "=== flowrecon run summary ===".bold());

    let mut rows = vec![
        SummaryRow::new("Rows read", summary.rows_read),
        SummaryRow::new("Packets processed", summary.packets_processed),
        SummaryRow::new("Bytes processed", summary.bytes_processed),
        SummaryRow::new("Skipped: malformed", summary.malformed),
        SummaryRow::new("Skipped: non-TCP", summary.non_tcp),
        SummaryRow::new("Skipped: missing port/address", summary.unkeyed),
        SummaryRow::new("Skipped: IP selection", summary.filtered),
        SummaryRow::new("Skipped: over row limit", summary.over_limit),
        SummaryRow::new("Out-of-order packets", summary.out_of_order),
        SummaryRow::new("Flows created", summary.flows_created),
        SummaryRow::new("Flows written", written),
        SummaryRow::new("Flows expired (timeout)", summary.flows_expired),
        SummaryRow::new("Flows evicted (table full)", summary.flows_evicted),
        SummaryRow::new("Workers", summary.workers),
        SummaryRow::new("Batches", summary.batches),
        SummaryRow::new("First packet", format_timestamp(summary.first_timestamp)),
        SummaryRow::new("Last packet", format_timestamp(summary.last_timestamp)),
    ];
    for (close_type, count) in &summary.close_types {
        rows.push(SummaryRow::new(format!("closeType {}", close_type), count));
    }
    for (reason, count) in &summary.invalid_reasons {
        rows.push(SummaryRow::new(format!("invalidReason {}", reason), count));
    }

    eprintln!("{}", Table::new(rows));

    let skipped = summary.malformed + summary.non_tcp + summary.unkeyed + summary.filtered + summary.over_limit;
    if skipped > 0 || summary.out_of_order > 0 {
        eprintln!(
            "{}",
            format!("{} rows skipped, {} out-of-order packets", skipped, summary.out_of_order).yellow()
        );
    } else {
        eprintln!("{}", "All rows accepted".green().bold());
    }
}

fn cmd_gen_config(output: Option<PathBuf>) -> Result<()> {
    let config = Config::default();
    let toml_str = config.to_toml()?;

    match output {
        Some(path) => {
            std::fs::write(&path, &toml_str)
                .with_context(|| format!("Failed to write config: {}", path.display()))?;
            println!("Configuration written to {}", path.display());
        }
        None => {
            println!("{}", toml_str);
        }
    }

    Ok(())
}
