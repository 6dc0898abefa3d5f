//! ValueBot Sweep Client
//!
//! Streams a valuation sweep from a running server, prints each source as it
//! resolves, then the consolidated estimate. Falls back to the full-sweep
//! endpoint when the stream breaks before anything was found.
//!
//! Usage:
//!   cargo run --bin valuebot-sweep -- "123 Main St, Tampa, FL 33601"
//!   cargo run --bin valuebot-sweep -- --server http://10.0.0.5:3000 --json "1 Elm St"

use anyhow::Result;
use clap::Parser;
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use valuebot_backend::client::{sweep_with_fallback, HttpTransport, SweepOutcome};
use valuebot_backend::consolidate::consolidate;
use valuebot_backend::models::{FetchEvent, SourceStatus};

/// Run one valuation sweep against a ValueBot server
#[derive(Parser, Debug)]
#[command(name = "valuebot-sweep")]
#[command(about = "Stream a multi-source property valuation for one address")]
struct Cli {
    /// Property address (quote it, or pass it as several words)
    #[arg(required = true)]
    address: Vec<String>,

    /// Server base URL
    #[arg(short, long, env = "VALUEBOT_URL", default_value = "http://localhost:3000")]
    server: String,

    /// Timeout for the fallback full sweep, in seconds
    #[arg(long, default_value = "600")]
    fallback_timeout: u64,

    /// Give up on the stream after this many seconds without an event
    #[arg(long, default_value = "600")]
    idle_timeout: u64,

    /// Print raw NDJSON events instead of a table
    #[arg(long)]
    json: bool,
}

fn print_event(event: &FetchEvent, json: bool) {
    if json {
        if let Ok(line) = serde_json::to_string(event) {
            println!("{}", line);
        }
        return;
    }

    match event.status {
        SourceStatus::Checking => println!("  {:<10} checking...", event.source),
        SourceStatus::Found => match event.estimate {
            Some(estimate) => println!(
                "  {:<10} ${:>12.0}  (${:.0} - ${:.0})",
                event.source,
                estimate,
                event.low.unwrap_or(estimate),
                event.high.unwrap_or(estimate)
            ),
            None => println!(
                "  {:<10} listed, no estimate  {}",
                event.source,
                event.url.as_deref().unwrap_or_default()
            ),
        },
        SourceStatus::NotFound => println!("  {:<10} not found", event.source),
        SourceStatus::Error => println!(
            "  {:<10} error: {}",
            event.source,
            event.error.as_deref().unwrap_or("unknown")
        ),
    }
}

async fn run(cli: Cli) -> Result<bool> {
    let address = cli.address.join(" ");
    let transport = HttpTransport::new(cli.server.clone(), Duration::from_secs(cli.fallback_timeout))
        .with_idle_timeout(Duration::from_secs(cli.idle_timeout));
    let json = cli.json;

    if !json {
        println!("Sweeping {}", address);
    }
    let outcome = sweep_with_fallback(&transport, &address, |event| print_event(event, json)).await?;

    if json {
        return Ok(!outcome.estimates().is_empty());
    }

    match &outcome {
        SweepOutcome::Completed { .. } => {}
        SweepOutcome::Partial { error, .. } => println!("\n(stream interrupted: {}; partial results)", error),
        SweepOutcome::Fallback(report) => {
            println!("\n(stream unavailable; full sweep returned {} results)", report.results.len());
            for estimate in &report.results {
                println!(
                    "  {:<10} ${:>12.0}  (${:.0} - ${:.0})",
                    estimate.source, estimate.estimate, estimate.low, estimate.high
                );
            }
        }
    }

    let values: Vec<f64> = outcome.estimates().iter().map(|e| e.estimate).collect();
    match consolidate(&values) {
        Some(summary) => {
            println!("\nBest estimate: ${:.0}", summary.best_estimate);
            println!("Median:        ${:.0}  ({} sources)", summary.median, values.len());
            if let Some(data) = outcome.property_data() {
                if let Some(sqft) = data.sqft {
                    println!("Living area:   {:.0} sqft", sqft);
                }
            }
            Ok(true)
        }
        None => {
            println!("\nNo source returned an estimate for this address.");
            Ok(false)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "valuebot_backend=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match run(Cli::parse()).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::from(2)
        }
    }
}
