//! Fan-out backend: emits one trigger event, results arrive later per platform.

use std::sync::Arc;

use async_trait::async_trait;

use crate::clients::{FanoutTrigger, TriggerEvent};
use crate::config::DevBuildConfig;
use crate::error::ClientError;
use crate::models::{BuildRecord, BuildStatus};
use crate::services::backend::PipelineBackend;

pub struct FanoutBackend {
    config: Arc<DevBuildConfig>,
    trigger: Arc<dyn FanoutTrigger>,
}

impl FanoutBackend {
    pub fn new(config: Arc<DevBuildConfig>, trigger: Arc<dyn FanoutTrigger>) -> Self {
        Self { config, trigger }
    }
}

/// Build the outbound event announcing a persisted record.
pub fn trigger_event(
    config: &DevBuildConfig,
    record: &BuildRecord,
) -> Result<TriggerEvent, ClientError> {
    let data = serde_json::to_value(&record.spec).map_err(anyhow::Error::from)?;
    Ok(TriggerEvent {
        id: uuid::Uuid::new_v4().to_string(),
        event_type: config.trigger_event_type.clone(),
        source: format!(
            "{}/{}",
            config.trigger_event_source.trim_end_matches('/'),
            record.id
        ),
        subject: record.id.to_string(),
        user: record.meta.created_by.clone(),
        data,
    })
}

#[async_trait]
impl PipelineBackend for FanoutBackend {
    async fn trigger(&self, record: &BuildRecord) -> Result<(), ClientError> {
        let event = trigger_event(&self.config, record)?;
        self.trigger.send(&event).await?;
        tracing::info!(build_id = record.id, event_id = %event.id, "Fan-out trigger sent");
        Ok(())
    }

    fn decorate(&self, status: &mut BuildStatus) {
        let Some(state) = status.fanout_state.as_mut() else {
            return;
        };
        let base = self.config.fanout_dashboard_url.trim_end_matches('/');
        for result in &mut state.platform_results {
            if !result.name.is_empty() {
                result.url = Some(format!("{base}/{}", result.name));
            }
        }
    }
}
