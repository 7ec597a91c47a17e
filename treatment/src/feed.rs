use crate::types::{Experiment, ProjectId, ProjectSettings, SegmenterConfig};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// A change published by the management service. Every event carries the
/// full new state of the changed entity.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UpdateEvent {
    ExperimentCreated {
        experiment: Experiment,
    },
    ExperimentUpdated {
        experiment: Experiment,
    },
    ProjectSettingsCreated {
        project_settings: ProjectSettings,
    },
    ProjectSettingsUpdated {
        project_settings: ProjectSettings,
    },
    ProjectSegmenterCreated {
        project_id: ProjectId,
        segmenter: SegmenterConfig,
    },
    ProjectSegmenterUpdated {
        project_id: ProjectId,
        segmenter: SegmenterConfig,
    },
    ProjectSegmenterDeleted {
        project_id: ProjectId,
        segmenter_name: String,
    },
}

impl UpdateEvent {
    pub fn project_id(&self) -> ProjectId {
        match self {
            UpdateEvent::ExperimentCreated { experiment }
            | UpdateEvent::ExperimentUpdated { experiment } => experiment.project_id,
            UpdateEvent::ProjectSettingsCreated { project_settings }
            | UpdateEvent::ProjectSettingsUpdated { project_settings } => {
                project_settings.project_id
            }
            UpdateEvent::ProjectSegmenterCreated { project_id, .. }
            | UpdateEvent::ProjectSegmenterUpdated { project_id, .. }
            | UpdateEvent::ProjectSegmenterDeleted { project_id, .. } => *project_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            UpdateEvent::ExperimentCreated { .. } => "experiment_created",
            UpdateEvent::ExperimentUpdated { .. } => "experiment_updated",
            UpdateEvent::ProjectSettingsCreated { .. } => "project_settings_created",
            UpdateEvent::ProjectSettingsUpdated { .. } => "project_settings_updated",
            UpdateEvent::ProjectSegmenterCreated { .. } => "project_segmenter_created",
            UpdateEvent::ProjectSegmenterUpdated { .. } => "project_segmenter_updated",
            UpdateEvent::ProjectSegmenterDeleted { .. } => "project_segmenter_deleted",
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum FeedError {
    #[error("update feed transport error: {0}")]
    Transport(String),
}

/// Source of encoded update events. Messages handed out by `receive` count
/// as acknowledged.
#[async_trait]
pub trait UpdateFeed: Send + Sync {
    /// Waits for the next message. `None` means the feed is closed and fully
    /// drained. Must be cancel safe.
    async fn receive(&mut self) -> Result<Option<Vec<u8>>, FeedError>;

    /// Stops accepting new messages. Already buffered messages remain
    /// available to `receive`.
    async fn close(&mut self) -> Result<(), FeedError>;
}

/// In-process feed backed by a tokio channel.
pub struct ChannelFeed {
    rx: mpsc::Receiver<Vec<u8>>,
}

impl ChannelFeed {
    pub fn new(buffer: usize) -> (mpsc::Sender<Vec<u8>>, Self) {
        let (tx, rx) = mpsc::channel(buffer);
        (tx, ChannelFeed { rx })
    }
}

#[async_trait]
impl UpdateFeed for ChannelFeed {
    async fn receive(&mut self) -> Result<Option<Vec<u8>>, FeedError> {
        Ok(self.rx.recv().await)
    }

    async fn close(&mut self) -> Result<(), FeedError> {
        self.rx.close();
        Ok(())
    }
}

/// Feed that never delivers anything, for deployments relying on polling.
#[derive(Default)]
pub struct NoopFeed {
    closed: bool,
}

#[async_trait]
impl UpdateFeed for NoopFeed {
    async fn receive(&mut self) -> Result<Option<Vec<u8>>, FeedError> {
        if self.closed {
            return Ok(None);
        }
        std::future::pending().await
    }

    async fn close(&mut self) -> Result<(), FeedError> {
        self.closed = true;
        Ok(())
    }
}
