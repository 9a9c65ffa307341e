//! Drilldown CLI — validate analysis configurations, print the queries they
//! build, and inspect chart display options.

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use drilldown_core::chart::{display_options, ChartDisplayConfig, ChartType};
use drilldown_core::config::AppConfig;
use drilldown_core::executor::CaptureExecutor;
use drilldown_session::{AnalysisConfig, AnalysisSession};
use serde_json::json;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "drilldown")]
#[command(about = "Analytical query composition and execution toolkit")]
#[command(version)]
struct Cli {
    /// Optional TOML settings file (environment overrides use DRILLDOWN__*)
    #[arg(long, env = "DRILLDOWN_CONFIG")]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Report validation errors and warnings for an analysis file
    Validate {
        /// Path to a JSON analysis configuration
        file: String,
    },

    /// Print the query objects an analysis file builds
    Build {
        /// Path to a JSON analysis configuration
        file: String,
    },

    /// Compile the built queries offline and print the dry-run output
    DryRun {
        /// Path to a JSON analysis configuration
        file: String,
    },

    /// List display options for a chart type, or translate an option map
    DisplayOptions {
        /// Chart type, e.g. bar, pie, sankey, retention_heatmap
        chart: String,

        /// JSON object of option overrides to translate
        #[arg(long)]
        options: Option<String>,
    },
}

fn read_analysis(path: &str) -> anyhow::Result<AnalysisConfig> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {path}"))
}

fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "drilldown=info".into()),
        )
        .json()
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let settings = AppConfig::load(cli.config.as_deref()).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });
    info!(
        debounce_ms = settings.scheduler.debounce_ms,
        binding_key_limit = settings.funnel.binding_key_limit,
        "Configuration loaded"
    );

    match cli.command {
        Commands::Validate { file } => {
            let analysis = read_analysis(&file)?;
            let errors = analysis.validation_errors();
            let warnings = analysis.validation_warnings();
            print_json(&json!({
                "mode": analysis.mode(),
                "errors": errors
                    .iter()
                    .map(|e| json!({"error": e, "message": e.to_string()}))
                    .collect::<Vec<_>>(),
                "warnings": warnings
                    .iter()
                    .map(|w| json!({"warning": w, "message": w.to_string()}))
                    .collect::<Vec<_>>(),
            }))?;
            if !errors.is_empty() {
                std::process::exit(1);
            }
        }

        Commands::Build { file } => {
            let analysis = read_analysis(&file)?;
            print_json(&analysis.built_queries()?)?;
        }

        Commands::DryRun { file } => {
            let analysis = read_analysis(&file)?;
            let session =
                AnalysisSession::with_config(Arc::new(CaptureExecutor::empty()), settings, analysis);
            for result in session.dry_run().await? {
                println!("{}", result.sql);
                print_json(&result.analysis)?;
            }
        }

        Commands::DisplayOptions { chart, options } => {
            let chart: ChartType = serde_json::from_value(json!(chart.as_str()))
                .with_context(|| format!("unknown chart type {chart}"))?;
            match options {
                None => print_json(&display_options(chart))?,
                Some(raw) => {
                    let map: serde_json::Map<String, serde_json::Value> =
                        serde_json::from_str(&raw).context("options must be a JSON object")?;
                    print_json(&ChartDisplayConfig::from_options(chart, &map)?)?;
                }
            }
        }
    }

    Ok(())
}
