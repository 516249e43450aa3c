use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tollgate::clock::{Clock, SystemClock};
use tollgate::config::{GateConfig, LogFormat, LoggingSettings};
use tollgate::gate::{Admission, AdmissionGate, AdmissionRequest};
use tollgate::signing;

#[derive(Parser)]
#[command(name = "tollgate", version, about = "API request admission and integrity checks")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Compute the signature a client would send
    Sign {
        /// Shared HMAC secret
        #[arg(long)]
        secret: String,

        /// Epoch millis to sign; defaults to now
        #[arg(long)]
        timestamp: Option<i64>,

        /// Request body, signed header-style as "{timestamp}:{body}"
        #[arg(long, conflicts_with = "payload")]
        body: Option<String>,

        /// Payload, signed replay-style as "{payload}:{timestamp}"
        #[arg(long)]
        payload: Option<String>,
    },

    /// Load and validate a configuration file
    CheckConfig {
        path: PathBuf,
    },

    /// Run JSON-lines requests through an admission gate
    Simulate {
        /// Gate configuration file
        #[arg(long)]
        config: PathBuf,

        /// File with one JSON request per line
        input: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Sign {
            secret,
            timestamp,
            body,
            payload,
        } => {
            init_tracing(&LoggingSettings::default());
            let timestamp = timestamp.unwrap_or_else(|| SystemClock::new().now_millis());

            let (style, message) = match payload {
                Some(payload) => ("replay", signing::replay_message(&payload, timestamp)),
                None => (
                    "header",
                    signing::header_message(&timestamp.to_string(), body.as_deref().unwrap_or("")),
                ),
            };

            let signature = signing::sign(secret.as_bytes(), &message);
            println!(
                "{}",
                json!({ "style": style, "timestamp": timestamp, "signature": signature })
            );
        }

        Command::CheckConfig { path } => {
            let config = GateConfig::load(&path)
                .with_context(|| format!("invalid configuration at {}", path.display()))?;
            init_tracing(&config.logging);

            info!(path = %path.display(), "Configuration is valid");
            println!(
                "{}",
                json!({
                    "rate_limit": config.rate_limit.is_some(),
                    "quota": config.quota.is_some(),
                    "headers": config.headers.is_some(),
                    "replay": config.replay.is_some(),
                })
            );
        }

        Command::Simulate { config, input } => {
            let config = GateConfig::load(&config)
                .with_context(|| format!("invalid configuration at {}", config.display()))?;
            init_tracing(&config.logging);

            let gate = AdmissionGate::from_config(&config);
            simulate(&gate, &input)?;
        }
    }

    Ok(())
}

/// Feed each request in `input` through `gate`, printing one decision per line.
fn simulate(gate: &AdmissionGate, input: &Path) -> Result<()> {
    let file = File::open(input).with_context(|| format!("cannot open {}", input.display()))?;

    let mut admitted = 0usize;
    let mut rejected = 0usize;

    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line_no = index + 1;
        let line = line.with_context(|| format!("cannot read line {}", line_no))?;
        if line.trim().is_empty() {
            continue;
        }

        let request: AdmissionRequest = serde_json::from_str(&line)
            .with_context(|| format!("malformed request on line {}", line_no))?;

        let output = match gate.admit(&request) {
            Admission::Admitted { rate, quota } => {
                admitted += 1;
                json!({
                    "line": line_no,
                    "identifier": request.identifier,
                    "admitted": true,
                    "rate_remaining": rate.map(|r| r.remaining),
                    "quota_remaining": quota.map(|q| q.remaining),
                })
            }
            Admission::Rejected { stage, violation } => {
                rejected += 1;
                json!({
                    "line": line_no,
                    "identifier": request.identifier,
                    "admitted": false,
                    "stage": stage,
                    "reason": violation.to_string(),
                    "kind": format!("{:?}", violation.kind()),
                })
            }
        };
        println!("{}", output);
    }

    info!(admitted, rejected, "Simulation finished");
    Ok(())
}

fn init_tracing(settings: &LoggingSettings) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.level));

    match settings.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .with_writer(std::io::stderr)
            .init(),
    }
}
