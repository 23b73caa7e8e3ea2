//! Flowtrace - operator tooling for persisted execution traces
//!
//! A suspended process leaves its execution log on disk. These commands read
//! that log back, render it, and export it when the process never resumes.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use flowtrace_core::clock::system_clock;
use flowtrace_core::telemetry::persistence::STATE_FILENAME;
use flowtrace_core::telemetry::{
    FlowSteps, JsonLinesExporter, OtlpHttpExporter, SpanExporter, TelemetryExporter,
    TelemetryWriter,
};
use flowtrace_core::TelemetryConfig;

/// Log levels
#[derive(Debug, Clone, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn to_filter_directive(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Log output formats
#[derive(Debug, Clone, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[clap(
    name = "flowtrace",
    about = "Inspect and export persisted workflow execution traces",
    version
)]
struct Cli {
    #[clap(subcommand)]
    command: Command,

    /// Set log level
    #[clap(long, default_value = "info", global = true)]
    log_level: LogLevel,

    /// Log output format
    #[clap(long, value_enum, default_value = "text", global = true)]
    log_format: LogFormat,
}

#[derive(Parser, Debug)]
enum Command {
    /// Print the step tree of a persisted execution log
    Inspect {
        /// State file, or the directory containing opentelemetry.json
        state: PathBuf,

        /// Print the normalized JSON document instead of the tree
        #[clap(long)]
        json: bool,
    },

    /// Export a persisted execution log as one trace
    Export {
        /// State file, or the directory containing opentelemetry.json
        state: PathBuf,

        /// Telemetry configuration (YAML)
        #[clap(long)]
        config: Option<PathBuf>,

        /// Override the OTLP/HTTP endpoint
        #[clap(long)]
        endpoint: Option<String>,

        /// Report the process as failed
        #[clap(long)]
        failed: bool,

        /// Append spans to a JSON-lines file instead of sending them
        #[clap(long)]
        jsonl: Option<PathBuf>,
    },

    /// Validate a telemetry configuration file
    ValidateConfig {
        /// Telemetry configuration (YAML)
        config: PathBuf,
    },
}

fn initialize_tracing(log_level: &LogLevel, log_format: &LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.to_filter_directive()));

    match log_format {
        // logs go to stderr; stdout carries command output
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .with_writer(std::io::stderr)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init(),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    initialize_tracing(&cli.log_level, &cli.log_format);

    match cli.command {
        Command::Inspect { state, json } => inspect_command(&state, json),
        Command::Export {
            state,
            config,
            endpoint,
            failed,
            jsonl,
        } => export_command(&state, config.as_deref(), endpoint, failed, jsonl),
        Command::ValidateConfig { config } => validate_config_command(&config),
    }
}

fn resolve_state_path(path: &Path) -> PathBuf {
    if path.is_dir() {
        path.join(STATE_FILENAME)
    } else {
        path.to_path_buf()
    }
}

fn load_flow_steps(path: &Path) -> Result<FlowSteps> {
    let path = resolve_state_path(path);
    debug!("Loading execution log from {}", path.display());

    let bytes = fs::read(&path).with_context(|| format!("Failed to read {}", path.display()))?;
    FlowSteps::from_json(&bytes, system_clock())
        .with_context(|| format!("Failed to parse execution log {}", path.display()))
}

fn load_config(path: Option<&Path>) -> Result<TelemetryConfig> {
    match path {
        Some(path) => TelemetryConfig::from_yaml_file(path)
            .with_context(|| format!("Failed to load telemetry config {}", path.display())),
        None => Ok(TelemetryConfig::default()),
    }
}

fn inspect_command(state: &Path, json: bool) -> Result<()> {
    let flow_steps = load_flow_steps(state)?;

    if json {
        let output = serde_json::to_string_pretty(&flow_steps.to_persisted())?;
        println!("{output}");
    } else {
        print!("{}", TelemetryWriter::format_step_tree(&flow_steps));
    }
    Ok(())
}

fn export_command(
    state: &Path,
    config: Option<&Path>,
    endpoint: Option<String>,
    failed: bool,
    jsonl: Option<PathBuf>,
) -> Result<()> {
    let mut config = load_config(config)?;
    if let Some(endpoint) = endpoint {
        config.endpoint = endpoint;
    }
    config.validate().context("Invalid telemetry configuration")?;

    let flow_steps = load_flow_steps(state)?;
    let open = flow_steps.open_steps().len();
    if open > 0 {
        info!("{} step(s) never ended and will be closed at export time", open);
    }

    let span_exporter: Arc<dyn SpanExporter> = match jsonl {
        Some(path) => {
            let exporter = JsonLinesExporter::new(path);
            debug!("Writing spans to {}", exporter.path().display());
            Arc::new(exporter)
        }
        None => {
            let exporter =
                OtlpHttpExporter::from_config(&config).context("Failed to create OTLP exporter")?;
            debug!("Exporting spans to {}", exporter.url());
            Arc::new(exporter)
        }
    };

    let trace_id = TelemetryExporter::new(span_exporter, &config, system_clock())
        .export(&flow_steps, !failed)
        .context("Failed to export trace")?;

    println!("{trace_id}");
    if let Some(link) = config.render_link(&trace_id.to_hex()) {
        println!("{link}");
    }
    Ok(())
}

fn validate_config_command(path: &Path) -> Result<()> {
    let config = load_config(Some(path))?;

    let mut kinds: Vec<&str> = config.steps_to_trace.iter().map(|k| k.as_str()).collect();
    kinds.sort_unstable();

    println!("Configuration OK: {}", path.display());
    println!("  enabled: {}", config.enabled);
    println!("  endpoint: {}", config.endpoint);
    println!("  serviceName: {}", config.service_name);
    println!("  stepsToTrace: {}", kinds.join(", "));
    if let Some(link) = &config.link {
        println!("  link: {link}");
    }
    Ok(())
}
