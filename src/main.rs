use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use waypoint_resilience::error::{ErrorClassifier, ErrorContext};
use waypoint_resilience::*;

#[derive(Parser)]
#[command(name = "waypoint-resilience")]
#[command(about = "Inspect and exercise the Waypoint failure-handling layer")]
#[command(version = "1.0.0")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    /// Configuration file (defaults to the platform config directory)
    #[arg(short, long, global = true, env = "WAYPOINT_RESILIENCE_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the effective configuration
    Config,

    /// Normalize a failure message and print the resulting record
    Classify {
        /// Failure message, e.g. "database is locked"
        message: String,

        /// Operation the failure came from
        #[arg(short, long, default_value = "cli")]
        operation: String,
    },

    /// Drive a flaky operation through the retry executor
    Simulate {
        /// Number of calls that fail before the operation succeeds
        #[arg(short, long, default_value = "2")]
        failures: u32,

        /// Retries allowed per call
        #[arg(short, long, default_value = "3")]
        max_retries: u32,

        /// Times to invoke the operation
        #[arg(short, long, default_value = "1")]
        runs: u32,

        /// Resource key guarded by the circuit breaker
        #[arg(short, long, default_value = "simulated-api")]
        key: String,

        /// Initial backoff delay, e.g. "50ms"
        #[arg(long, default_value = "50ms", value_parser = humantime::parse_duration)]
        delay: Duration,
    },
}

fn init_logging(debug: bool, json: bool) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<ResilienceConfig> {
    let config = match path {
        Some(path) => ResilienceConfig::load_from(Some(path.as_path())),
        None => ResilienceConfig::load(),
    };
    config.context("Failed to load resilience configuration")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug, cli.json_logs);

    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Config => {
            if let Some(path) = cli.config.or_else(ResilienceConfig::default_path) {
                println!("# source: {}", path.display());
            }
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Commands::Classify { message, operation } => {
            let record =
                ErrorClassifier::normalize(message, Some(ErrorContext::for_operation(operation)));
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        Commands::Simulate {
            failures,
            max_retries,
            runs,
            key,
            delay,
        } => {
            simulate(config, failures, max_retries, runs, &key, delay).await?;
        }
    }

    Ok(())
}

async fn simulate(
    config: ResilienceConfig,
    failures: u32,
    max_retries: u32,
    runs: u32,
    key: &str,
    delay: Duration,
) -> Result<()> {
    let resilience = Resilience::new(config)?;
    let calls = Arc::new(AtomicU32::new(0));

    let options = resilience
        .retry_options()
        .with_max_retries(max_retries)
        .with_delays(delay, delay.max(resilience.config().retry.max_delay))
        .on_retry(|error, retry| {
            println!("  retry #{} after: {}", retry, error.message);
        });

    for run in 1..=runs {
        println!("Run {}/{}", run, runs);
        let counter = Arc::clone(&calls);
        let result = resilience
            .with_retry(
                move || {
                    let call = counter.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if call < failures {
                            Err(ErrorRecord::network(format!("simulated failure #{}", call + 1)))
                        } else {
                            Ok(call + 1)
                        }
                    }
                },
                options.clone(),
                key,
            )
            .await;

        match result {
            Ok(call) => println!("  succeeded on call {}", call),
            Err(error) => println!("  failed: {}", error),
        }
    }

    let status = resilience.circuit_status(key);
    println!(
        "\nCircuit '{}': {} ({} consecutive failures)",
        key, status.state, status.failure_count
    );
    println!("Total calls: {}", calls.load(Ordering::SeqCst));

    let statistics = resilience.dispatcher().statistics();
    println!("\nDispatcher statistics:");
    println!("{}", serde_json::to_string_pretty(&statistics)?);

    Ok(())
}
