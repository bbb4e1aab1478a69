use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use alw_adapters::{
    BroadcastNotifier, FileSnapshotStore, HttpFetcherConfig, HttpLadderFetcher, TracingAnalytics,
};
use alw_monitor::{InstanceSettings, Monitor, MonitorConfig, MonitorHandle};
use alw_web::{AppState, MonitorStatusSource};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "alw-cli")]
#[command(about = "Arena Ladder Watch command-line interface")]
struct Cli {
    /// Path to the instance registry.
    #[arg(long, default_value = "instances.yaml")]
    config: PathBuf,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Start every enabled monitor plus the status server (default).
    Run,
    /// Validate the registry and report credential availability.
    Check,
}

#[derive(Debug, Clone, Deserialize)]
struct InstanceRegistry {
    instances: Vec<InstanceSpec>,
}

#[derive(Debug, Clone, Deserialize)]
struct InstanceSpec {
    region: String,
    bracket: String,
    locale: String,
    /// Name of the environment variable holding this instance's API key.
    credential_env: String,
    #[serde(default = "default_enabled")]
    enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// Runtime knobs resolved from the environment, with defaults sized for a
/// single API key shared across the full region/bracket deployment.
#[derive(Debug, Clone)]
struct RuntimeConfig {
    web_port: u16,
    data_dir: PathBuf,
    api_base_url: String,
    tick_interval: Duration,
    concurrency_ceiling: usize,
    window_capacity: usize,
    top_n: usize,
    http_timeout: Duration,
    user_agent: String,
}

impl RuntimeConfig {
    fn from_env() -> Self {
        Self {
            web_port: env_parsed("ALW_WEB_PORT", 8080),
            data_dir: std::env::var("ALW_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./snapshots")),
            api_base_url: std::env::var("ALW_API_BASE_URL")
                .unwrap_or_else(|_| HttpFetcherConfig::default().base_url),
            tick_interval: Duration::from_millis(env_parsed("ALW_TICK_INTERVAL_MS", 5000)),
            concurrency_ceiling: env_parsed("ALW_CONCURRENCY_CEILING", 5),
            window_capacity: env_parsed("ALW_WINDOW_CAPACITY", 10),
            top_n: env_parsed("ALW_TOP_N", 4000),
            http_timeout: Duration::from_secs(env_parsed("ALW_HTTP_TIMEOUT_SECS", 20)),
            user_agent: std::env::var("ALW_USER_AGENT")
                .unwrap_or_else(|_| "alw-bot/0.1".to_string()),
        }
    }
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn load_registry(path: &PathBuf) -> Result<InstanceRegistry> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let registry = load_registry(&cli.config)?;
    let runtime = RuntimeConfig::from_env();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(registry, runtime).await,
        Commands::Check => check(registry),
    }
}

fn check(registry: InstanceRegistry) -> Result<()> {
    for spec in &registry.instances {
        let credential = if std::env::var(&spec.credential_env).is_ok() {
            "credential present"
        } else {
            "credential MISSING"
        };
        let status = if spec.enabled { "enabled" } else { "disabled" };
        println!(
            "{}/{} locale={} env={} [{status}, {credential}]",
            spec.region, spec.bracket, spec.locale, spec.credential_env
        );
    }
    Ok(())
}

async fn run(registry: InstanceRegistry, runtime: RuntimeConfig) -> Result<()> {
    let fetcher = Arc::new(
        HttpLadderFetcher::new(HttpFetcherConfig {
            base_url: runtime.api_base_url.clone(),
            timeout: runtime.http_timeout,
            user_agent: Some(runtime.user_agent.clone()),
        })
        .context("building ladder fetcher")?,
    );
    let analytics = Arc::new(TracingAnalytics);
    let notifier = Arc::new(BroadcastNotifier::new(64));

    let mut handles: Vec<MonitorHandle> = Vec::new();
    for spec in registry.instances.into_iter().filter(|s| s.enabled) {
        let credential = std::env::var(&spec.credential_env).with_context(|| {
            format!(
                "environment variable {} for instance {}/{}",
                spec.credential_env, spec.region, spec.bracket
            )
        })?;

        let settings = InstanceSettings {
            credential,
            region: spec.region.clone(),
            bracket: spec.bracket.clone(),
            locale: spec.locale.clone(),
        };
        let config = MonitorConfig {
            tick_interval: runtime.tick_interval,
            concurrency_ceiling: runtime.concurrency_ceiling,
            history_capacity: runtime.window_capacity,
            top_n: Some(runtime.top_n),
            settings,
        };
        let store = Arc::new(FileSnapshotStore::new(
            runtime.data_dir.join(&spec.region).join(&spec.bracket),
        ));

        let handle = Monitor::new(
            config,
            fetcher.clone(),
            store,
            analytics.clone(),
            notifier.clone(),
        )
        .start()
        .await?;
        handles.push(handle);
    }

    if handles.is_empty() {
        warn!("no enabled instances in the registry; nothing to monitor");
        return Ok(());
    }

    let status_sources = handles
        .iter()
        .map(|h| MonitorStatusSource {
            instance: h.label().to_string(),
            state: h.state(),
        })
        .collect();
    let web_port = runtime.web_port;
    let web_task = tokio::spawn(async move {
        if let Err(err) = alw_web::serve(AppState::new(status_sources), web_port).await {
            warn!(error = %err, "status server exited");
        }
    });

    info!(monitors = handles.len(), "all monitors running; Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;

    info!("shutdown requested");
    web_task.abort();
    for handle in handles {
        handle.stop().await?;
    }
    Ok(())
}
