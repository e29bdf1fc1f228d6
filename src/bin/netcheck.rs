//! netcheck - the probe CLI that runs inside NetworkAssertion Job pods
//!
//! `run` executes a probe configuration file and prints the output document
//! to stdout. `http` and `dns` run a single ad-hoc check.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{Value, json};

use netchecks::cli::{display_version, init_probe_logging};
use netchecks::models::{AssertionConfig, ResolvedConfig, Rule};
use netchecks::runner::{RunOptions, run_from_config};

/// Network probes for netchecks
#[derive(Parser, Debug)]
#[command(name = "netcheck")]
#[command(about = "Run network assertions and report the results as JSON", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Carry out all network assertions in the given config file
    Run {
        /// Config file with netcheck assertions
        #[arg(long)]
        config: PathBuf,

        /// Keep sensitive fields such as headers in the output
        #[arg(long)]
        disable_redaction: bool,

        /// Log progress to stderr
        #[arg(long, short = 'v')]
        verbose: bool,

        /// Copy context values into each result
        #[arg(long)]
        include_context: bool,
    },
    /// Carry out a http network check
    Http {
        /// URL to request
        #[arg(long, default_value = "https://github.com/status")]
        url: String,

        /// HTTP method
        #[arg(long, default_value = "get")]
        method: String,

        /// Timeout in seconds
        #[arg(long, short = 't', default_value_t = 30.0)]
        timeout: f64,

        /// Expect the request to fail
        #[arg(long)]
        should_fail: bool,

        #[arg(long, short = 'v')]
        verbose: bool,
    },
    /// Carry out a dns check
    Dns {
        /// Host to look up
        #[arg(long, default_value = "github.com")]
        host: String,

        /// DNS server to use instead of the system resolver
        #[arg(long)]
        server: Option<String>,

        /// Timeout in seconds
        #[arg(long, short = 't', default_value_t = 30.0)]
        timeout: f64,

        /// Expect the lookup to fail
        #[arg(long)]
        should_fail: bool,

        #[arg(long, short = 'v')]
        verbose: bool,
    },
    /// Display version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Command::Run {
            config,
            disable_redaction,
            verbose,
            include_context,
        } => {
            init_probe_logging(verbose);
            let options = RunOptions {
                disable_redaction,
                verbose,
                include_context,
            };
            run_config_file(&config, &options).await
        }
        Command::Http {
            url,
            method,
            timeout,
            should_fail,
            verbose,
        } => {
            init_probe_logging(verbose);
            let rule = json!({
                "type": "http",
                "url": url,
                "method": method,
                "timeout": timeout,
            });
            run_single(rule, should_fail, verbose).await
        }
        Command::Dns {
            host,
            server,
            timeout,
            should_fail,
            verbose,
        } => {
            init_probe_logging(verbose);
            let mut rule = json!({
                "type": "dns",
                "host": host,
                "timeout": timeout,
            });
            if let Some(server) = server {
                rule["server"] = Value::String(server);
            }
            run_single(rule, should_fail, verbose).await
        }
        Command::Version => {
            display_version("netcheck");
            Ok(())
        }
    }
}

async fn run_config_file(path: &Path, options: &RunOptions) -> Result<()> {
    tracing::info!("Loading assertions from {}", path.display());
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let config: ResolvedConfig = serde_json::from_str(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    let output = run_from_config(&config, options).await?;
    println!(
        "{}",
        serde_json::to_string_pretty(&output).context("Failed to serialize output")?
    );
    Ok(())
}

/// Run one ad-hoc rule and print its result record
async fn run_single(mut rule: Value, should_fail: bool, verbose: bool) -> Result<()> {
    if should_fail {
        rule["expected"] = Value::String("fail".to_string());
    }
    tracing::debug!("Options: {}", rule);

    let rule = Rule::from_value(rule).context("Rule must be a JSON object")?;
    let config = ResolvedConfig {
        contexts: Vec::new(),
        assertions: vec![AssertionConfig {
            name: "netcheck".to_string(),
            rules: vec![rule],
        }],
    };
    let options = RunOptions {
        verbose,
        ..Default::default()
    };

    let output = run_from_config(&config, &options).await?;
    let Some((_, result)) = output.results().next() else {
        anyhow::bail!("Probe produced no result");
    };
    println!(
        "{}",
        serde_json::to_string_pretty(result).context("Failed to serialize result")?
    );
    Ok(())
}
