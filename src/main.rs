//! netchecks-operator - turns NetworkAssertions into probe workloads and
//! PolicyReports
//!
//! Watches NetworkAssertion resources and the probe pods created for them
//! using the Kubernetes Watch API.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kube::CustomResourceExt;

use netchecks::cli::{display_version, init_logging};
use netchecks::config::{self, ConfigLoader};
use netchecks::models::NetworkAssertion;
use netchecks::operator::{MetricsRecorder, NoopMetrics, Operator, TracingMetrics};

/// Kubernetes operator for NetworkAssertions
#[derive(Parser, Debug)]
#[command(name = "netchecks-operator")]
#[command(about = "Runs NetworkAssertion probes and records their results as PolicyReports", long_about = None)]
struct Args {
    /// Enable debug logging
    #[arg(long, short = 'd')]
    debug: bool,

    /// Only watch this namespace (default: all namespaces)
    #[arg(long, short = 'n')]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the NetworkAssertion CRD as YAML
    Crd,
    /// Print the effective settings, or a single value
    Config {
        /// Settings key (e.g., "probe.image.tag")
        key: Option<String>,
    },
    /// Display version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.debug);

    match args.command {
        Some(Command::Crd) => {
            let yaml = serde_yaml::to_string(&NetworkAssertion::crd())
                .context("Failed to serialize CRD")?;
            print!("{}", yaml);
            return Ok(());
        }
        Some(Command::Config { key }) => return handle_config_command(key),
        Some(Command::Version) => {
            display_version("netchecks-operator");
            return Ok(());
        }
        None => {}
    }

    let settings = Arc::new(ConfigLoader::load().context("Failed to load settings")?);
    tracing::debug!(
        image = %settings.probe.image.reference(),
        max_results = settings.policy_report_max_results,
        "Settings loaded"
    );

    let metrics: Arc<dyn MetricsRecorder> = if settings.metrics.enabled {
        Arc::new(TracingMetrics)
    } else {
        Arc::new(NoopMetrics)
    };

    tracing::debug!("Initializing Kubernetes client");
    let client = netchecks::kube::create_client().await?;

    Operator::new(client, settings, args.namespace, metrics)
        .run()
        .await
}

fn handle_config_command(key: Option<String>) -> Result<()> {
    let settings = ConfigLoader::load().context("Failed to load settings")?;

    match key {
        Some(key) => println!("{}", config::get_config_value(&settings, &key)?),
        None => {
            let yaml = serde_yaml::to_string(&settings).context("Failed to serialize settings")?;
            print!("{}", yaml);
        }
    }
    Ok(())
}
