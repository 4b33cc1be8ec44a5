use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use futures::future::join_all;
use serde_json::json;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use sluice::config::{LoggingConfig, SluiceConfig};
use sluice::error::{Result as SluiceResult, SluiceError};
use sluice::ratelimit::{AggregateResult, RateLimitBackend, RateLimiter, RuleOverrides, RuleSet};

/// Check targets against configured rate limit rules.
#[derive(Debug, Parser)]
#[command(name = "sluice", version, about)]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, default_value = "sluice.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Check a target and print one JSON line per decision
    Check {
        /// The target to check
        target: String,

        /// Number of checks to run
        #[arg(short = 'n', long, default_value_t = 1)]
        times: u32,

        /// Pause between checks, in milliseconds
        #[arg(long, default_value_t = 0)]
        interval_ms: u64,

        /// Use the suspending check path
        #[arg(long = "async")]
        use_async: bool,

        /// Checks to run concurrently per round (suspending path only)
        #[arg(long, default_value_t = 1)]
        concurrency: usize,

        /// Per-check rule overrides as JSON
        #[arg(long)]
        overrides: Option<String>,

        /// Sleep for the suggested wait after each allowed check
        #[arg(long)]
        honor_wait: bool,
    },
    /// Validate the configured rules and print them
    Validate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = SluiceConfig::load(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;
    init_tracing(&config.logging);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting sluice");

    match cli.command {
        Command::Validate => {
            let rules = config.build_rules()?;
            if rules.is_empty() {
                warn!("No rules configured");
            }
            print!("{}", serde_yaml::to_string(&RuleSet { rules })?);
        }
        Command::Check {
            target,
            times,
            interval_ms,
            use_async,
            concurrency,
            overrides,
            honor_wait,
        } => {
            let limiter = config.build_limiter()?;
            let overrides = overrides
                .as_deref()
                .map(RuleOverrides::from_json)
                .transpose()?;

            let run = CheckRun {
                limiter: &limiter,
                target: &target,
                overrides: overrides.as_ref(),
                use_async,
                concurrency: concurrency.max(1),
                honor_wait,
            };

            for round in 0..times {
                if round > 0 && interval_ms > 0 {
                    tokio::time::sleep(Duration::from_millis(interval_ms)).await;
                }

                tokio::select! {
                    outcome = run.round() => outcome?,
                    _ = signal::ctrl_c() => {
                        info!("Received Ctrl+C, stopping");
                        break;
                    }
                }
            }
        }
    }

    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

struct CheckRun<'a, B> {
    limiter: &'a RateLimiter<B>,
    target: &'a str,
    overrides: Option<&'a RuleOverrides>,
    use_async: bool,
    concurrency: usize,
    honor_wait: bool,
}

impl<B: RateLimitBackend> CheckRun<'_, B> {
    async fn round(&self) -> anyhow::Result<()> {
        let outcomes = if self.use_async {
            join_all((0..self.concurrency).map(|_| self.check_async())).await
        } else {
            vec![self.check_sync()]
        };

        let mut longest_wait = Duration::ZERO;
        for outcome in outcomes {
            if let Ok(aggregate) = &outcome {
                if !aggregate.is_limit() {
                    longest_wait = longest_wait.max(aggregate.wait());
                }
            }
            println!("{}", self.render(outcome)?);
        }

        if self.honor_wait && !longest_wait.is_zero() {
            tokio::time::sleep(longest_wait).await;
        }
        Ok(())
    }

    fn check_sync(&self) -> SluiceResult<AggregateResult> {
        match self.overrides {
            Some(overrides) => self.limiter.check_with_overrides(self.target, overrides),
            None => self.limiter.check(self.target),
        }
    }

    async fn check_async(&self) -> SluiceResult<AggregateResult> {
        match self.overrides {
            Some(overrides) => {
                self.limiter
                    .check_with_overrides_async(self.target, overrides)
                    .await
            }
            None => self.limiter.check_async(self.target).await,
        }
    }

    /// One JSON line per decision. Throttled checks are reported, other
    /// errors end the run.
    fn render(&self, outcome: SluiceResult<AggregateResult>) -> anyhow::Result<String> {
        let line = match outcome {
            Ok(aggregate) => json!({
                "target": self.target,
                "is_limit": aggregate.is_limit(),
                "wait_ms": aggregate.wait_ms(),
                "results": aggregate.results,
            }),
            Err(SluiceError::Throttled { target, rule }) => json!({
                "target": target,
                "is_limit": true,
                "throttled_by": rule,
            }),
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::to_string(&line)?)
    }
}
