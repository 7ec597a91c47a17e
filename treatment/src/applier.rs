use crate::counter;
use crate::feed::{UpdateEvent, UpdateFeed};
use crate::management::ManagementClient;
use crate::metrics_defs::{FEED_MESSAGE_APPLIED, FEED_MESSAGE_DROPPED};
use crate::store::{LoadError, SegmentIndexStore};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, Interval, MissedTickBehavior};

const FEED_ERROR_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub enum Command {
    // Trigger a full reload outside of the normal poll interval.
    // The worker replies once the reload attempt finishes.
    Refresh(oneshot::Sender<Result<(), LoadError>>),
    // Stop consuming the feed, drain it and exit
    Shutdown,
}

/// Single writer of the store. Applies feed events strictly in arrival order
/// and periodically reloads the full snapshot when polling is enabled.
pub struct UpdateApplier {
    store: Arc<SegmentIndexStore>,
    management: Arc<dyn ManagementClient>,
    feed: Box<dyn UpdateFeed>,
    poll_interval: Option<Duration>,
    teardown_timeout: Duration,
}

impl UpdateApplier {
    pub fn new(
        store: Arc<SegmentIndexStore>,
        management: Arc<dyn ManagementClient>,
        feed: Box<dyn UpdateFeed>,
        poll_interval: Option<Duration>,
        teardown_timeout: Duration,
    ) -> Self {
        UpdateApplier {
            store,
            management,
            feed,
            poll_interval,
            teardown_timeout,
        }
    }

    /// Initial full load. The store cannot serve without it.
    pub async fn bootstrap(&self) -> Result<(), LoadError> {
        self.store.load_snapshot().await
    }

    /// Runs until the Shutdown command is received or every command sender
    /// is dropped, then tears down the feed.
    pub async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        let mut ticker = self.poll_interval.map(|period| {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });
        let mut feed_open = true;

        loop {
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(Command::Refresh(reply)) => {
                        let result = self.store.load_snapshot().await;
                        if let Err(err) = &result {
                            tracing::error!(error = %err, "Requested refresh failed");
                        }
                        let _ = reply.send(result);
                    }
                    Some(Command::Shutdown) | None => break,
                },
                message = self.feed.receive(), if feed_open => match message {
                    Ok(Some(payload)) => self.handle_message(&payload).await,
                    Ok(None) => {
                        tracing::warn!("Update feed closed, relying on polling");
                        feed_open = false;
                    }
                    Err(err) => {
                        tracing::error!(error = %err, "Failed to receive from update feed");
                        tokio::time::sleep(FEED_ERROR_BACKOFF).await;
                    }
                },
                _ = tick(&mut ticker) => {
                    if let Err(err) = self.store.load_snapshot().await {
                        tracing::error!(error = %err, "Periodic reload failed");
                    }
                }
            }
        }

        self.teardown(feed_open).await;
    }

    async fn teardown(&mut self, feed_open: bool) {
        let teardown_timeout = self.teardown_timeout;
        let drain = async {
            if let Err(err) = self.feed.close().await {
                tracing::warn!(error = %err, "Failed to close update feed");
            }
            if !feed_open {
                return;
            }
            loop {
                match self.feed.receive().await {
                    Ok(Some(payload)) => self.handle_message(&payload).await,
                    Ok(None) => break,
                    Err(err) => {
                        tracing::warn!(error = %err, "Failed to drain update feed");
                        break;
                    }
                }
            }
        };

        if tokio::time::timeout(teardown_timeout, drain)
            .await
            .is_err()
        {
            tracing::warn!("Timed out tearing down update feed");
        }
        tracing::info!("Update applier stopped");
    }

    /// Decodes and applies one message. Undecodable messages and events of
    /// projects this instance does not serve are dropped.
    pub async fn handle_message(&self, payload: &[u8]) {
        let event: UpdateEvent = match serde_json::from_slice(payload) {
            Ok(event) => event,
            Err(err) => {
                tracing::warn!(error = %err, "Dropping malformed update message");
                counter!(FEED_MESSAGE_DROPPED, "reason" => "malformed").increment(1);
                return;
            }
        };

        let project_id = event.project_id();
        if !self.store.is_subscribed(project_id) {
            tracing::debug!(project_id, kind = event.kind(), "Ignoring update of unsubscribed project");
            counter!(FEED_MESSAGE_DROPPED, "reason" => "unsubscribed").increment(1);
            return;
        }

        let kind = event.kind();
        self.apply(event).await;
        counter!(FEED_MESSAGE_APPLIED, "type" => kind).increment(1);
    }

    async fn apply(&self, event: UpdateEvent) {
        match event {
            UpdateEvent::ExperimentCreated { experiment } => {
                tracing::debug!(experiment_id = experiment.id, "Inserting experiment");
                self.store.insert_experiment(experiment);
            }
            UpdateEvent::ExperimentUpdated { experiment } => {
                tracing::debug!(experiment_id = experiment.id, "Updating experiment");
                self.store.update_experiment(experiment);
            }
            UpdateEvent::ProjectSettingsCreated { project_settings } => {
                let project_id = project_settings.project_id;
                let segmenter_types = match self.management.list_segmenters(project_id).await {
                    Ok(segmenters) => segmenters
                        .into_iter()
                        .map(|s| (s.name, s.r#type))
                        .collect(),
                    Err(err) => {
                        tracing::warn!(
                            project_id,
                            error = %err,
                            "Failed to fetch segmenters of new project"
                        );
                        HashMap::new()
                    }
                };
                self.store
                    .insert_project_settings(project_settings, segmenter_types);
            }
            UpdateEvent::ProjectSettingsUpdated { project_settings } => {
                self.store.update_project_settings(project_settings);
            }
            UpdateEvent::ProjectSegmenterCreated {
                project_id,
                segmenter,
            }
            | UpdateEvent::ProjectSegmenterUpdated {
                project_id,
                segmenter,
            } => {
                self.store
                    .upsert_segmenter_type(project_id, segmenter.name, segmenter.r#type);
            }
            UpdateEvent::ProjectSegmenterDeleted {
                project_id,
                segmenter_name,
            } => {
                self.store.delete_segmenter_type(project_id, &segmenter_name);
            }
        }
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}
