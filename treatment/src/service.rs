use crate::applier::{Command, UpdateApplier};
use crate::config::Config;
use crate::feed::UpdateFeed;
use crate::index::SegmentFilter;
use crate::management::{HttpManagementClient, ManagementClient, ManagementError};
use crate::resolver::{self, RequestFilter, ResolveError, Resolution};
use crate::segmenters::{RequestValues, SegmenterError, SegmenterRegistry};
use crate::selector::{self, SelectError, SelectedTreatment};
use crate::store::{DumpError, LoadError, SegmentIndexStore};
use crate::types::{Experiment, ExperimentType, ProjectId, ProjectSettings};
use chrono::Utc;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

#[derive(thiserror::Error, Debug)]
pub enum TreatmentError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Select(#[from] SelectError),

    #[error(transparent)]
    Segmenter(#[from] SegmenterError),

    #[error("failed to load experiments: {0}")]
    Load(#[from] LoadError),

    #[error("management service error: {0}")]
    Management(#[from] ManagementError),

    #[error("failed to dump experiments: {0}")]
    Dump(#[from] DumpError),

    #[error("the update applier is not running")]
    ApplierStopped,
}

impl TreatmentError {
    /// Errors caused by the request rather than by this service.
    pub fn is_client_error(&self) -> bool {
        match self {
            TreatmentError::Resolve(ResolveError::ProjectNotFound(_)) => true,
            TreatmentError::Select(err) => err.is_client_error(),
            TreatmentError::Segmenter(_) => true,
            _ => false,
        }
    }
}

/// Everything decided for one request.
#[derive(Clone, Debug)]
pub struct FetchedTreatment {
    pub filters: Vec<SegmentFilter>,
    pub experiment: Option<Arc<Experiment>>,
    pub selected: SelectedTreatment,
}

struct TreatmentServiceInner {
    store: Arc<SegmentIndexStore>,
    segmenters: SegmenterRegistry,
    dump_directory: PathBuf,
    handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
    tx: mpsc::Sender<Command>,
}

/// Serving core of the treatment service. Cheap to clone; all clones share
/// one store and one background update applier.
#[derive(Clone)]
pub struct TreatmentService {
    inner: Arc<TreatmentServiceInner>,
}

impl TreatmentService {
    pub async fn from_config(
        config: &Config,
        feed: Box<dyn UpdateFeed>,
    ) -> Result<Self, TreatmentError> {
        let management = HttpManagementClient::new(
            config.management_service.url.as_str(),
            config.management_service.timeout(),
        )?
        .with_max_retries(config.management_service.max_retries);

        Self::start(config, Arc::new(management), feed).await
    }

    /// Loads the initial snapshot and spawns the update applier. Fails if the
    /// snapshot cannot be loaded.
    pub async fn start(
        config: &Config,
        management: Arc<dyn ManagementClient>,
        feed: Box<dyn UpdateFeed>,
    ) -> Result<Self, TreatmentError> {
        let store = Arc::new(SegmentIndexStore::new(
            management.clone(),
            config.project_ids.clone(),
            config.management_service.timeout(),
        ));

        let applier = UpdateApplier::new(
            store.clone(),
            management,
            feed,
            config.poll_interval(),
            config.teardown_timeout(),
        );
        applier.bootstrap().await?;

        // Channel to send commands to the applier. All writes happen from its task.
        let (tx, rx) = mpsc::channel::<Command>(64);
        let handle = tokio::spawn(applier.run(rx));

        Ok(TreatmentService {
            inner: Arc::new(TreatmentServiceInner {
                store,
                segmenters: SegmenterRegistry::from_config(&config.segmenters),
                dump_directory: config.debug.output_path.clone(),
                handle: Mutex::new(Some(handle)),
                tx,
            }),
        })
    }

    pub fn store(&self) -> &SegmentIndexStore {
        &self.inner.store
    }

    pub fn is_ready(&self) -> bool {
        self.inner.store.is_ready()
    }

    pub fn dump_directory(&self) -> &Path {
        &self.inner.dump_directory
    }

    pub async fn get_experiment(
        &self,
        project_id: ProjectId,
        request_filter: &RequestFilter,
    ) -> Result<Resolution, TreatmentError> {
        Ok(resolver::resolve(&self.inner.store, project_id, request_filter).await?)
    }

    pub fn get_treatment(
        &self,
        experiment: Option<&Experiment>,
        randomization_value: Option<&str>,
    ) -> Result<SelectedTreatment, TreatmentError> {
        // Switchback assignment only varies with the time window.
        let randomization_value = match experiment.map(|e| e.r#type) {
            Some(ExperimentType::Switchback) => None,
            _ => randomization_value,
        };
        Ok(selector::select(experiment, randomization_value)?)
    }

    pub fn dump_experiments(&self, directory: &Path) -> Result<PathBuf, TreatmentError> {
        let path = self.inner.store.dump_to_directory(directory)?;
        tracing::info!(path = %path.display(), "Dumped experiments");
        Ok(path)
    }

    /// Runs the segmenter transforms over the raw request values, resolves
    /// the experiment and selects its treatment.
    pub async fn fetch_treatment(
        &self,
        project_id: ProjectId,
        request_values: &RequestValues,
    ) -> Result<FetchedTreatment, TreatmentError> {
        let settings = self
            .inner
            .store
            .find_project_settings(project_id)
            .await
            .ok_or(ResolveError::ProjectNotFound(project_id))?;

        let request_filter = self.request_filter(&settings, request_values)?;
        let resolution =
            resolver::resolve_at(&self.inner.store, &settings, &request_filter, Utc::now())?;

        let randomization_value = request_values
            .get(&settings.randomization_key)
            .and_then(randomization_value);
        let selected = self.get_treatment(
            resolution.experiment.as_deref(),
            randomization_value.as_deref(),
        )?;

        tracing::debug!(
            project_id,
            experiment_id = resolution.experiment.as_ref().map(|e| e.id),
            treatment = %selected.treatment.name,
            "Fetched treatment"
        );

        Ok(FetchedTreatment {
            filters: resolution.filters,
            experiment: resolution.experiment,
            selected,
        })
    }

    fn request_filter(
        &self,
        settings: &ProjectSettings,
        request_values: &RequestValues,
    ) -> Result<RequestFilter, SegmenterError> {
        let mut request_filter = RequestFilter::new();
        for name in &settings.segmenters.names {
            let required = settings
                .segmenters
                .variables
                .get(name)
                .map(Vec::as_slice)
                .unwrap_or_default();
            let segmenter_type = self.inner.store.segmenter_type(settings.project_id, name);
            let values =
                self.inner
                    .segmenters
                    .transform(name, request_values, required, segmenter_type)?;
            request_filter.insert(name.clone(), values);
        }
        Ok(request_filter)
    }

    /// Reloads the full snapshot now instead of at the next poll.
    pub async fn refresh(&self) -> Result<(), TreatmentError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.inner
            .tx
            .send(Command::Refresh(reply_tx))
            .await
            .map_err(|_| TreatmentError::ApplierStopped)?;

        reply_rx
            .await
            .map_err(|_| TreatmentError::ApplierStopped)??;
        Ok(())
    }

    /// Stops the update applier and waits for it to drain the feed.
    pub async fn shutdown(&self) -> Result<(), TreatmentError> {
        // The applier may already be gone
        let _ = self.inner.tx.send(Command::Shutdown).await;

        let handle = self.inner.handle.lock().take();
        if let Some(handle) = handle {
            handle.await.map_err(|_| TreatmentError::ApplierStopped)?;
        }
        Ok(())
    }
}

fn randomization_value(raw: &serde_json::Value) -> Option<String> {
    match raw {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
