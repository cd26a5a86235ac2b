//! CadenceDB CLI (cadence)
//!
//! Works directly against a local data directory, without a server:
//!
//! ```bash
//! # Load "timestamp value [duration]" lines
//! cadence --data-dir ./data write --label host=web-01 --label metric=cpu --duration 10 < cpu.txt
//!
//! # Read a range back
//! cadence --data-dir ./data read --label host=web-01 --label metric=cpu --start 0 --end 1000
//!
//! # Show the files backing a series
//! cadence --data-dir ./data inspect --label host=web-01 --label metric=cpu
//! ```

use anyhow::{bail, Context, Result};
use cadencedb_core::{Datapoint, ReadRequest, SeriesKey, StorageConfig, StorageEngine, Timestamp};
use clap::{Parser, Subcommand};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Lines buffered before they are handed to the engine
const WRITE_BATCH: usize = 10_000;

#[derive(Parser)]
#[command(name = "cadence")]
#[command(about = "CadenceDB local administration tool", long_about = None)]
struct Cli {
    /// Data directory
    #[arg(short, long, env = "CADENCEDB_DATA_DIR", default_value = "data")]
    data_dir: PathBuf,

    /// Worker threads
    #[arg(long, default_value_t = 4)]
    workers: usize,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write datapoints read from stdin, one "timestamp value [duration]" per line
    Write {
        /// Series label, repeatable
        #[arg(short, long = "label", value_parser = parse_label, required = true)]
        labels: Vec<(String, String)>,

        /// Duration for lines that do not carry one
        #[arg(long, default_value_t = 1)]
        duration: i64,
    },

    /// Read datapoints in [start, end)
    Read {
        #[arg(short, long = "label", value_parser = parse_label, required = true)]
        labels: Vec<(String, String)>,

        #[arg(long)]
        start: Timestamp,

        #[arg(long)]
        end: Timestamp,

        /// Most datapoints to return
        #[arg(long)]
        limit: Option<u64>,

        /// Return the last `limit` datapoints instead of the first
        #[arg(long)]
        prefer_latest: bool,

        /// Print a JSON array instead of text lines
        #[arg(long)]
        json: bool,
    },

    /// List the files backing a series
    Inspect {
        #[arg(short, long = "label", value_parser = parse_label, required = true)]
        labels: Vec<(String, String)>,

        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let engine = StorageEngine::open(StorageConfig {
        data_dir: cli.data_dir.clone(),
        worker_threads: cli.workers,
        background_flush: false,
        ..StorageConfig::default()
    })
    .with_context(|| format!("failed to open {}", cli.data_dir.display()))?;

    let stdout = io::stdout();
    let mut out = stdout.lock();

    match cli.command {
        Commands::Write { labels, duration } => {
            let key = SeriesKey::from_iter(labels);
            let stdin = io::stdin();
            let written = write_lines(&engine, &key, stdin.lock(), duration)?;
            writeln!(out, "wrote {written} datapoints to {key}")?;
        }
        Commands::Read {
            labels,
            start,
            end,
            limit,
            prefer_latest,
            json,
        } => {
            let key = SeriesKey::from_iter(labels);
            let request = ReadRequest {
                start,
                end,
                limit,
                prefer_latest,
            };
            if json {
                let (points, failure) = engine.read_partial(&key, request);
                serde_json::to_writer_pretty(&mut out, &points)?;
                writeln!(out)?;
                if let Some(e) = failure {
                    out.flush()?;
                    return Err(e).context(format!("read stopped after {} datapoints", points.len()));
                }
            } else {
                engine.read(&key, request, |chunk| {
                    for point in chunk {
                        writeln!(out, "{}", format_datapoint(point))?;
                    }
                    Ok(())
                })?;
            }
        }
        Commands::Inspect { labels, json } => {
            let key = SeriesKey::from_iter(labels);
            let files = engine.describe_series(&key)?;
            if json {
                serde_json::to_writer_pretty(&mut out, &files)?;
                writeln!(out)?;
            } else {
                writeln!(out, "{key} ({} files)", files.len())?;
                for file in &files {
                    writeln!(
                        out,
                        "  {:<8} [{}, {})  {}",
                        file.kind, file.min_timestamp, file.end_timestamp, file.file_name
                    )?;
                }
            }
        }
    }

    out.flush()?;
    engine.shutdown();
    Ok(())
}

/// Write every datapoint line from `input`, then flush and wait for the optimizer
fn write_lines(
    engine: &StorageEngine,
    key: &SeriesKey,
    input: impl BufRead,
    default_duration: i64,
) -> Result<usize> {
    let mut batch = Vec::with_capacity(WRITE_BATCH);
    let mut written = 0;

    for (number, line) in input.lines().enumerate() {
        let line = line.context("failed to read input")?;
        let point = parse_datapoint(&line, default_duration)
            .with_context(|| format!("line {}", number + 1))?;
        if let Some(point) = point {
            batch.push(point);
        }
        if batch.len() == WRITE_BATCH {
            written += engine.write(key, &batch)?;
            batch.clear();
        }
    }
    if !batch.is_empty() {
        written += engine.write(key, &batch)?;
    }

    engine.flush_all()?;
    engine.wait_idle()?;
    Ok(written)
}

/// Parse a `name=value` label
fn parse_label(s: &str) -> std::result::Result<(String, String), String> {
    match s.split_once('=') {
        Some((name, value)) if !name.is_empty() => Ok((name.to_string(), value.to_string())),
        _ => Err(format!("expected name=value, got '{s}'")),
    }
}

/// Parse a `timestamp value [duration]` line. Blank lines and `#` comments yield `None`.
fn parse_datapoint(line: &str, default_duration: i64) -> Result<Option<Datapoint>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }

    let mut fields = line.split_whitespace();
    let (Some(timestamp), Some(value)) = (fields.next(), fields.next()) else {
        bail!("expected 'timestamp value [duration]', got '{line}'");
    };
    let timestamp: Timestamp = timestamp
        .parse()
        .with_context(|| format!("invalid timestamp '{timestamp}'"))?;
    let value: f64 = value
        .parse()
        .with_context(|| format!("invalid value '{value}'"))?;
    let duration = match fields.next() {
        Some(d) => d.parse().with_context(|| format!("invalid duration '{d}'"))?,
        None => default_duration,
    };
    if fields.next().is_some() {
        bail!("too many fields in '{line}'");
    }

    Ok(Some(Datapoint::new(timestamp, value, duration)))
}

fn format_datapoint(point: &Datapoint) -> String {
    format!("{} {} {}", point.timestamp, point.value, point.duration)
}
