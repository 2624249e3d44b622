//! Dev build operator CLI.
//!
//! Runs the lifecycle core offline against an in-memory store: validate a
//! request, aggregate captured platform results, or replay completion events
//! into a fresh fan-out build.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use serde::de::DeserializeOwned;

use devbuild_core::clients::{FanoutTrigger, JobPoll, JobSystemClient, TriggerEvent};
use devbuild_core::events::{CompletionEvent, CompletionHandler};
use devbuild_core::models::{BuildSpec, Caller, PipelineEngine, PlatformResult, SaveOptions};
use devbuild_core::services::aggregator::aggregate;
use devbuild_core::services::validator::normalize;
use devbuild_core::services::{system_clock, Backends, FanoutBackend, JenkinsBackend, TokioSpawner};
use devbuild_core::store::MemoryStore;
use devbuild_core::{ClientError, DevBuildConfig, DevBuildService};

#[derive(Parser)]
#[command(name = "devbuild", version, about = "Dev build lifecycle tooling")]
struct Cli {
    /// Print collected metrics in Prometheus text format to stderr on exit
    #[arg(long, global = true)]
    metrics: bool,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Normalise a build request and print it, or the validation error
    Validate {
        /// JSON build spec
        #[arg(long)]
        spec: PathBuf,
    },
    /// Aggregate a JSON list of platform results
    Aggregate {
        #[arg(long)]
        results: PathBuf,
    },
    /// Create a fan-out build and replay completion events into it
    Replay {
        /// JSON build spec; the engine is forced to fan-out
        #[arg(long)]
        spec: PathBuf,
        /// JSON list of completion events, re-addressed to the new build
        #[arg(long)]
        events: PathBuf,
        #[arg(long, env = "DEVBUILD_USER", default_value = "devbuild-cli")]
        user: String,
    },
}

/// Job system stand-in that refuses every call.
struct OfflineJobs;

#[async_trait]
impl JobSystemClient for OfflineJobs {
    async fn trigger(&self, job: &str, _params: &BTreeMap<String, String>) -> Result<i64, ClientError> {
        Err(ClientError::Rejected(format!("job {job} cannot run offline")))
    }

    async fn resolve_handle(&self, _queue_handle: i64) -> Result<i64, ClientError> {
        Err(ClientError::Rejected("no job system in offline mode".into()))
    }

    async fn poll_result(&self, _job: &str, _number: i64) -> Result<JobPoll, ClientError> {
        Err(ClientError::Rejected("no job system in offline mode".into()))
    }

    fn build_url(&self, job: &str, number: i64) -> String {
        format!("offline://{job}/{number}")
    }
}

/// Fan-out trigger sink that only logs.
struct LoggingTrigger;

#[async_trait]
impl FanoutTrigger for LoggingTrigger {
    async fn send(&self, event: &TriggerEvent) -> Result<(), ClientError> {
        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            subject = %event.subject,
            "Trigger event (not delivered)"
        );
        Ok(())
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
}

fn offline_service(config: Arc<DevBuildConfig>) -> DevBuildService {
    let store = Arc::new(MemoryStore::new());
    let clock = system_clock();
    let backends = Backends {
        monolithic: Arc::new(JenkinsBackend::new(
            config.clone(),
            Arc::new(OfflineJobs),
            store.clone(),
            Arc::new(TokioSpawner),
            clock.clone(),
        )),
        fanout: Arc::new(FanoutBackend::new(config.clone(), Arc::new(LoggingTrigger))),
    };
    DevBuildService::new(config, store, backends).with_clock(clock)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    if log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_writer(std::io::stderr)
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .init();
    }

    let cli = Cli::parse();
    let metrics = if cli.metrics {
        match metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder() {
            Ok(handle) => Some(handle),
            Err(e) => {
                tracing::warn!("Failed to install Prometheus recorder: {}", e);
                None
            }
        }
    } else {
        None
    };
    let config = Arc::new(DevBuildConfig::from_env());

    match cli.cmd {
        Cmd::Validate { spec } => {
            let spec: BuildSpec = read_json(&spec)?;
            let normalized = normalize(spec, &config)?;
            println!("{}", serde_json::to_string_pretty(&normalized)?);
        }
        Cmd::Aggregate { results } => {
            let results: Vec<PlatformResult> = read_json(&results)?;
            let agg = aggregate(&results);
            let out = serde_json::json!({
                "phase": agg.phase,
                "startedAt": agg.started_at,
                "endedAt": agg.ended_at,
                "report": agg.report,
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        Cmd::Replay { spec, events, user } => {
            let mut spec: BuildSpec = read_json(&spec)?;
            spec.pipeline_engine = PipelineEngine::Fanout;
            let events: Vec<CompletionEvent> = read_json(&events)?;

            let service = Arc::new(offline_service(config.clone()));
            let record = service
                .create(spec, SaveOptions::default(), &Caller::new(user))
                .await?;
            tracing::info!(build_id = record.id, events = events.len(), "Replaying events");

            let handler = CompletionHandler::new(service.clone());
            let source = format!(
                "{}/{}",
                config.trigger_event_source.trim_end_matches('/'),
                record.id
            );
            for mut event in events {
                event.correlation_id = record.id.to_string();
                event.source = source.clone();
                if let Err(e) = handler.handle(&event).await {
                    tracing::warn!(name = %event.name, error = %e, "Event rejected");
                }
            }

            let record = service.get(record.id, Default::default()).await?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
    }

    if let Some(handle) = metrics {
        eprintln!("{}", handle.render());
    }
    Ok(())
}
