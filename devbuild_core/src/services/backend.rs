//! Execution strategies, one per pipeline engine.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::error::{ClientError, Result};
use crate::models::{BuildRecord, BuildStatus, PipelineEngine};

/// A backend that runs builds for one engine.
#[async_trait]
pub trait PipelineBackend: Send + Sync {
    /// Start executing a freshly persisted record. Must not wait for the
    /// build itself.
    async fn trigger(&self, record: &BuildRecord) -> std::result::Result<(), ClientError>;

    /// Refresh status from the executing system. `None` means the backend
    /// has nothing to poll.
    async fn sync(&self, _record: &BuildRecord, _now: DateTime<Utc>) -> Result<Option<BuildStatus>> {
        Ok(None)
    }

    /// Fill display-only fields owned by this backend.
    fn decorate(&self, _status: &mut BuildStatus) {}
}

/// The backend registry. Selecting by engine happens here and nowhere else.
#[derive(Clone)]
pub struct Backends {
    pub monolithic: Arc<dyn PipelineBackend>,
    pub fanout: Arc<dyn PipelineBackend>,
}

impl Backends {
    pub fn get(&self, engine: PipelineEngine) -> &dyn PipelineBackend {
        match engine {
            PipelineEngine::Monolithic => self.monolithic.as_ref(),
            PipelineEngine::Fanout => self.fanout.as_ref(),
        }
    }
}

pub type BoxTask = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Where detached background work runs.
pub trait TaskSpawner: Send + Sync {
    fn spawn(&self, task: BoxTask);
}

/// Spawns onto the ambient tokio runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSpawner;

impl TaskSpawner for TokioSpawner {
    fn spawn(&self, task: BoxTask) {
        tokio::spawn(task);
    }
}

/// Wall-clock source, replaceable in tests.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(Utc::now)
}

/// Concurrency token for the next write: `now`, or just after `previous` when
/// the clock has not moved past it.
pub fn advance_token(now: DateTime<Utc>, previous: DateTime<Utc>) -> DateTime<Utc> {
    if now > previous {
        now
    } else {
        previous + Duration::microseconds(1)
    }
}
