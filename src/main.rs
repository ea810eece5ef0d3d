/*!
 * Courier CLI - Command Line Interface
 *
 * Publishes one message through a configured broker, pings every configured
 * broker, or validates a configuration file.
 */

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use courier::{
    config::{CourierConfig, LogLevel},
    logging, BackendKind, BrokerMetadata, BrokerProducerExt, BrokerRegistry,
};
use courier_observability::MetricsRegistry;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "courier")]
#[command(version, about = "Publish messages through pooled, resilient broker adapters", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short = 'c', long = "config", value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level, overrides the configuration file
    #[arg(long, value_enum, global = true)]
    log_level: Option<LogLevelArg>,

    /// Debug logging
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Publish one JSON message
    Publish {
        /// Backend section to publish through (amqp, socket, log, mqtt)
        #[arg(short, long)]
        backend: BackendKind,

        /// Topic; the configured default destination when omitted
        #[arg(short, long, default_value = "")]
        topic: String,

        /// JSON payload
        message: String,

        /// Header as KEY=VALUE, repeatable
        #[arg(short = 'H', long = "header", value_name = "KEY=VALUE")]
        headers: Vec<String>,

        /// Print the prometheus metrics after publishing
        #[arg(long)]
        metrics: bool,
    },

    /// Lease a connection on every configured backend and ping it
    Ping,

    /// Validate the configuration file and list the configured backends
    CheckConfig {
        /// Print the effective configuration, defaults filled in
        #[arg(long)]
        print: bool,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevelArg {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevelArg> for LogLevel {
    fn from(arg: LogLevelArg) -> Self {
        match arg {
            LogLevelArg::Error => LogLevel::Error,
            LogLevelArg::Warn => LogLevel::Warn,
            LogLevelArg::Info => LogLevel::Info,
            LogLevelArg::Debug => LogLevel::Debug,
            LogLevelArg::Trace => LogLevel::Trace,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => CourierConfig::from_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => CourierConfig::default(),
    };

    let mut log_config = config.logging.clone();
    if let Some(level) = cli.log_level {
        log_config.log_level = level.into();
    }
    log_config.verbose |= cli.verbose;
    if let Err(e) = logging::init_logging(&log_config) {
        eprintln!("Warning: Failed to initialize logging: {}", e);
    }

    match cli.command {
        Commands::Publish {
            backend,
            topic,
            message,
            headers,
            metrics,
        } => publish(&config, backend, topic, &message, &headers, metrics).await,
        Commands::Ping => ping(&config).await,
        Commands::CheckConfig { print } => check_config(&config, print),
    }
}

/// Cancelled on Ctrl-C
fn interrupt_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            trigger.cancel();
        }
    });
    cancel
}

fn parse_header(raw: &str) -> anyhow::Result<(String, String)> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => bail!("invalid header '{}', expected KEY=VALUE", raw),
    }
}

async fn publish(
    config: &CourierConfig,
    backend: BackendKind,
    topic: String,
    message: &str,
    headers: &[String],
    print_metrics: bool,
) -> anyhow::Result<()> {
    let payload: serde_json::Value =
        serde_json::from_str(message).context("message is not valid JSON")?;

    let mut metadata = BrokerMetadata::new(topic);
    for raw in headers {
        let (key, value) = parse_header(raw)?;
        metadata = metadata.with_header(key, value);
    }

    let registry = BrokerRegistry::from_config(config, MetricsRegistry::new()?)?;
    let producer = registry
        .producer(backend.as_str())
        .with_context(|| format!("no [{}] section in the configuration", backend))?;

    let cancel = interrupt_token();
    let outcome = producer.publish_message(&payload, &metadata, &cancel).await;
    registry.shutdown();

    let receipt = outcome?;
    println!(
        "published {} bytes to {} via {}",
        receipt.size, receipt.destination, receipt.backend
    );
    if print_metrics {
        print!("{}", registry.metrics().render()?);
    }
    Ok(())
}

async fn ping(config: &CourierConfig) -> anyhow::Result<()> {
    let registry = BrokerRegistry::from_config(config, MetricsRegistry::new()?)?;
    if registry.is_empty() {
        bail!("no backend is configured");
    }

    let cancel = interrupt_token();
    let mut failures = 0;
    for (name, result) in registry.ping_all(&cancel).await {
        match result {
            Ok(()) => println!("{:<8} ok", name),
            Err(e) => {
                failures += 1;
                println!("{:<8} FAILED: {}", name, e);
            }
        }
    }
    registry.shutdown();

    if failures > 0 {
        bail!("{} backend(s) failed the ping", failures);
    }
    Ok(())
}

fn check_config(config: &CourierConfig, print: bool) -> anyhow::Result<()> {
    config.validate()?;
    let backends = config.configured_backends();
    if backends.is_empty() {
        println!("configuration is valid, no backend configured");
    } else {
        let names: Vec<&str> = backends.iter().map(BackendKind::as_str).collect();
        println!("configuration is valid, backends: {}", names.join(", "));
    }
    if print {
        print!("{}", config.to_toml_string()?);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_header() {
        assert_eq!(
            parse_header("tenant=acme").unwrap(),
            ("tenant".to_string(), "acme".to_string())
        );
        assert_eq!(
            parse_header("trace=a=b").unwrap(),
            ("trace".to_string(), "a=b".to_string())
        );
        assert!(parse_header("novalue").is_err());
        assert!(parse_header("=x").is_err());
    }

    #[test]
    fn test_cli_parses_publish() {
        let cli = Cli::try_parse_from([
            "courier", "publish", "-b", "mqtt", "-t", "sensors/1", "-H", "a=b", "{}",
        ])
        .unwrap();
        match cli.command {
            Commands::Publish {
                backend,
                topic,
                headers,
                ..
            } => {
                assert_eq!(backend, BackendKind::Mqtt);
                assert_eq!(topic, "sensors/1");
                assert_eq!(headers, vec!["a=b".to_string()]);
            }
            _ => panic!("expected publish"),
        }
    }
}
