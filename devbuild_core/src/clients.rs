//! Ports to the systems that physically run builds and host sources.
//!
//! Implementations live outside the core (HTTP clients, message brokers).
//! Every call may block on the network; none of them retries internally.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ClientError;

/// Poll snapshot of one job run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobPoll {
    /// `SUCCESS`, `FAILURE`, `ABORTED`, ... or `None` while still running.
    pub result_code: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
}

/// Jenkins-style job system running the monolithic pipeline.
#[async_trait]
pub trait JobSystemClient: Send + Sync {
    /// Queue a parameterised job; returns the queue handle.
    async fn trigger(
        &self,
        job: &str,
        params: &BTreeMap<String, String>,
    ) -> Result<i64, ClientError>;

    /// Wait for a queued item to become a numbered run.
    async fn resolve_handle(&self, queue_handle: i64) -> Result<i64, ClientError>;

    async fn poll_result(&self, job: &str, number: i64) -> Result<JobPoll, ClientError>;

    fn build_url(&self, job: &str, number: i64) -> String;
}

#[async_trait]
pub trait SourceControlClient: Send + Sync {
    /// Resolve a branch, tag or pull ref to a full commit hash.
    async fn resolve_commit(
        &self,
        owner: &str,
        repo: &str,
        git_ref: &str,
    ) -> Result<String, ClientError>;
}

/// Outbound CloudEvent-shaped message asking the fan-out system to start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub source: String,
    pub subject: String,
    pub user: String,
    pub data: serde_json::Value,
}

#[async_trait]
pub trait FanoutTrigger: Send + Sync {
    async fn send(&self, event: &TriggerEvent) -> Result<(), ClientError>;
}
