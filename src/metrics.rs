/// Platform counters served on `/metrics` for external monitoring.
use crate::db::SessionStore;
use crate::queue::AnalysisQueue;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformMetrics {
    pub sessions_processed: u64,
    pub queue_size: usize,
    pub active_agents: u64,
}

impl PlatformMetrics {
    /// Gather the counters. A counter that fails or exceeds `timeout` is
    /// logged and reported as 0 so monitoring scrapes never fail.
    pub async fn collect(
        store: &dyn SessionStore,
        queue: &dyn AnalysisQueue,
        timeout: Duration,
    ) -> Self {
        let sessions_processed = match tokio::time::timeout(timeout, store.count_sessions()).await
        {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "failed to count sessions");
                0
            }
            Err(_) => {
                tracing::warn!("timed out counting sessions");
                0
            }
        };

        let active_agents =
            match tokio::time::timeout(timeout, store.count_active_agents()).await {
                Ok(Ok(n)) => n,
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "failed to count active agents");
                    0
                }
                Err(_) => {
                    tracing::warn!("timed out counting active agents");
                    0
                }
            };

        Self {
            sessions_processed,
            queue_size: queue.queue_size(),
            active_agents,
        }
    }
}
