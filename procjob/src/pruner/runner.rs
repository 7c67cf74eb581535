use std::{ops::Sub, time::Duration};

use chrono::{TimeDelta, Utc};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::registry::JobRegistry;

use super::PrunerConfig;

pub(crate) struct PrunerRunner {
    config: PrunerConfig,
    registry: JobRegistry,
}

impl PrunerRunner {
    pub fn new(registry: JobRegistry, config: PrunerConfig) -> Self {
        Self { registry, config }
    }

    pub fn spawn(self, tracker: &TaskTracker, cancellation_token: CancellationToken) {
        tracker.spawn({
            async move {
                loop {
                    let Some(next) = self.config.schedule.upcoming(Utc).next() else {
                        tracing::warn!("No future scheduled time for pruner, stopping it");
                        break;
                    };
                    let delay = next
                        .sub(Utc::now())
                        .sub(TimeDelta::milliseconds(10))
                        .to_std()
                        .unwrap_or(Duration::ZERO);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {
                            self.prune();
                            // Don't run twice for the same scheduled time.
                            if let Ok(delay) = next.sub(Utc::now()).to_std() {
                                tokio::time::sleep(delay).await;
                            }
                        }
                        _ = cancellation_token.cancelled() => {
                            tracing::debug!("Shutting down the job pruner");
                            break;
                        },
                    }
                }
            }
        });
    }

    pub(crate) fn prune(&self) {
        for prune_spec in &self.config.pruners {
            match self.registry.prune(prune_spec) {
                Ok(0) => {}
                Ok(removed) => tracing::debug!(
                    removed,
                    status = %prune_spec.status,
                    "Pruned {removed} {} jobs",
                    prune_spec.status
                ),
                Err(err) => tracing::error!(?err, "Failed to clean up jobs with error {err}"),
            }
        }
    }
}
