use crate::histogram;
use crate::index::{ExperimentIndex, ExperimentMatch, IndexSummary, SegmentFilter};
use crate::management::{ExperimentQuery, ManagementClient, ManagementError};
use crate::metrics_defs::{BOOTSTRAP_DURATION, BOOTSTRAP_EXPERIMENTS};
use crate::negative_cache::NegativeCache;
use crate::types::{
    Experiment, ExperimentId, ExperimentStatus, ProjectId, ProjectSettings, SegmenterType,
};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{AcquireError, Semaphore, SemaphorePermit};

// Bootstrap asks for every experiment active at some point between now and
// this far into the future.
const ACTIVE_WINDOW_HOURS: i64 = 855_360;

#[derive(thiserror::Error, Debug)]
pub enum LoadError {
    #[error("Another load operation is in progress")]
    ConcurrentLoad(#[from] AcquireError),
    #[error("Management service error: {0}")]
    Management(#[from] ManagementError),
}

#[derive(thiserror::Error, Debug)]
pub enum DumpError {
    #[error("could not write dump: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not serialize dump: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Default)]
struct StoreData {
    // Insertion order is kept so that dumps and candidate lists are stable.
    experiments: HashMap<ProjectId, IndexMap<ExperimentId, ExperimentIndex>>,
    project_settings: HashMap<ProjectId, Arc<ProjectSettings>>,
    segmenter_types: HashMap<ProjectId, HashMap<String, SegmenterType>>,
}

/// In-memory cache of project settings, segmenter types and the per-project
/// experiment indexes. Readers take a shared lock; mutators and snapshot
/// swaps take the exclusive lock.
pub struct SegmentIndexStore {
    management: Arc<dyn ManagementClient>,
    subscribed_project_ids: Vec<ProjectId>,
    fetch_timeout: Duration,
    data: RwLock<StoreData>,
    update_lock: Semaphore,
    // Used by the readiness probe. Initially false and set to true once any
    // snapshot has been loaded.
    ready: AtomicBool,
    negative_cache: NegativeCache,
}

impl SegmentIndexStore {
    pub fn new(
        management: Arc<dyn ManagementClient>,
        subscribed_project_ids: Vec<ProjectId>,
        fetch_timeout: Duration,
    ) -> Self {
        SegmentIndexStore {
            management,
            subscribed_project_ids,
            fetch_timeout,
            data: RwLock::new(StoreData::default()),
            update_lock: Semaphore::new(1),
            ready: AtomicBool::new(false),
            negative_cache: NegativeCache::new(),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    /// An empty subscription list means every project is served.
    pub fn is_subscribed(&self, project_id: ProjectId) -> bool {
        self.subscribed_project_ids.is_empty() || self.subscribed_project_ids.contains(&project_id)
    }

    /// Loads settings, segmenter types and active experiments for every
    /// subscribed project, then swaps them in as one snapshot. When no
    /// subscription is configured, all projects known to the management
    /// service are loaded. A subscribed project that cannot be fetched fails
    /// the whole load and leaves the previous snapshot in place.
    pub async fn load_snapshot(&self) -> Result<(), LoadError> {
        // Hold permit for the duration of this function
        let _permit = self.get_permit().await?;
        let started = Instant::now();

        let project_ids = if self.subscribed_project_ids.is_empty() {
            self.management.list_projects().await?
        } else {
            self.subscribed_project_ids.clone()
        };

        let mut snapshot = StoreData::default();
        let mut experiment_count = 0;

        for project_id in project_ids {
            let settings = self.management.get_project_settings(project_id).await?;
            let segmenter_types: HashMap<String, SegmenterType> = self
                .management
                .list_segmenters(project_id)
                .await?
                .into_iter()
                .map(|s| (s.name, s.r#type))
                .collect();

            let experiments = self
                .fetch_active_experiments(project_id, &segmenter_types)
                .await?;
            experiment_count += experiments.len();

            let indexes = experiments
                .into_iter()
                .filter(|e| e.status == ExperimentStatus::Active)
                .map(|e| (e.id, ExperimentIndex::new(Arc::new(e))))
                .collect();

            snapshot.experiments.insert(project_id, indexes);
            snapshot
                .project_settings
                .insert(project_id, Arc::new(settings));
            snapshot.segmenter_types.insert(project_id, segmenter_types);
        }

        *self.data.write() = snapshot;
        self.negative_cache.invalidate_all();
        self.ready.store(true, Ordering::Relaxed);

        histogram!(BOOTSTRAP_DURATION).record(started.elapsed().as_secs_f64());
        histogram!(BOOTSTRAP_EXPERIMENTS).record(experiment_count as f64);
        tracing::info!(
            experiments = experiment_count,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Loaded experiment snapshot"
        );

        Ok(())
    }

    async fn fetch_active_experiments(
        &self,
        project_id: ProjectId,
        segmenter_types: &HashMap<String, SegmenterType>,
    ) -> Result<Vec<Experiment>, ManagementError> {
        let now = Utc::now();
        let mut query = ExperimentQuery {
            status: ExperimentStatus::Active,
            start_time: now,
            end_time: now + chrono::Duration::hours(ACTIVE_WINDOW_HOURS),
            page: 1,
        };

        let first = self.management.list_experiments(project_id, &query).await?;
        let pages = first.paging.as_ref().map(|p| p.pages).unwrap_or(1);
        let mut records = first.data;

        for page in 2..=pages {
            query.page = page;
            let next = self.management.list_experiments(project_id, &query).await?;
            records.extend(next.data);
        }

        tracing::debug!(project_id, pages, "Fetched experiments from management service");

        records
            .into_iter()
            .map(|record| record.into_experiment(segmenter_types))
            .collect()
    }

    /// Guard that ensures only one load operation is in progress at a time.
    async fn get_permit(&self) -> Result<SemaphorePermit<'_>, AcquireError> {
        self.update_lock.acquire().await
    }

    /// Returns cached settings, fetching them from the management service on
    /// a miss for subscribed projects. Failed fetches are remembered briefly
    /// in the negative cache.
    pub async fn find_project_settings(
        &self,
        project_id: ProjectId,
    ) -> Option<Arc<ProjectSettings>> {
        if !self.is_subscribed(project_id) {
            return None;
        }

        let cached = self.data.read().project_settings.get(&project_id).cloned();
        if cached.is_some() {
            return cached;
        }

        if self.negative_cache.contains(project_id) {
            return None;
        }

        let fetched = tokio::time::timeout(
            self.fetch_timeout,
            self.management.get_project_settings(project_id),
        )
        .await;

        match fetched {
            Ok(Ok(settings)) => {
                let mut data = self.data.write();
                let settings = data
                    .project_settings
                    .entry(project_id)
                    .or_insert_with(|| Arc::new(settings))
                    .clone();
                Some(settings)
            }
            Ok(Err(err)) if err.is_not_found() => {
                tracing::debug!(project_id, "Project unknown to management service");
                self.negative_cache.insert(project_id);
                None
            }
            Ok(Err(err)) => {
                tracing::warn!(project_id, error = %err, "Failed to fetch project settings");
                self.negative_cache.insert(project_id);
                None
            }
            Err(_) => {
                tracing::warn!(project_id, "Timed out fetching project settings");
                self.negative_cache.insert(project_id);
                None
            }
        }
    }

    pub fn segmenter_type(&self, project_id: ProjectId, name: &str) -> Option<SegmenterType> {
        self.data
            .read()
            .segmenter_types
            .get(&project_id)
            .and_then(|types| types.get(name))
            .copied()
    }

    pub fn find_experiment(
        &self,
        project_id: ProjectId,
        experiment_id: ExperimentId,
    ) -> Option<Arc<Experiment>> {
        self.data
            .read()
            .experiments
            .get(&project_id)
            .and_then(|experiments| experiments.get(&experiment_id))
            .map(|index| index.experiment.clone())
    }

    pub fn find_experiments(
        &self,
        project_id: ProjectId,
        filters: &[SegmentFilter],
    ) -> Vec<ExperimentMatch> {
        self.find_experiments_at(project_id, filters, Utc::now())
    }

    /// Returns every experiment of the project that is running at `now` and
    /// does not have a None match on any filter.
    pub fn find_experiments_at(
        &self,
        project_id: ProjectId,
        filters: &[SegmentFilter],
        now: DateTime<Utc>,
    ) -> Vec<ExperimentMatch> {
        let data = self.data.read();
        let Some(experiments) = data.experiments.get(&project_id) else {
            return Vec::new();
        };

        experiments
            .values()
            .filter(|index| index.is_eligible_at(now))
            .filter_map(|index| {
                index.match_filters(filters).map(|segmenter_matches| ExperimentMatch {
                    experiment: index.experiment.clone(),
                    segmenter_matches,
                })
            })
            .collect()
    }

    /// No-op if the experiment is inactive or already indexed.
    pub fn insert_experiment(&self, experiment: Experiment) {
        if experiment.status != ExperimentStatus::Active {
            return;
        }

        let mut data = self.data.write();
        let experiments = data.experiments.entry(experiment.project_id).or_default();
        experiments
            .entry(experiment.id)
            .or_insert_with(|| ExperimentIndex::new(Arc::new(experiment)));
    }

    /// Replaces the indexed experiment, removing it when it became inactive.
    /// An unseen active experiment is inserted.
    pub fn update_experiment(&self, experiment: Experiment) {
        let mut data = self.data.write();
        let experiments = data.experiments.entry(experiment.project_id).or_default();

        if experiment.status != ExperimentStatus::Active {
            experiments.shift_remove(&experiment.id);
            return;
        }

        let id = experiment.id;
        let index = ExperimentIndex::new(Arc::new(experiment));
        match experiments.get_mut(&id) {
            Some(existing) => *existing = index,
            None => {
                experiments.insert(id, index);
            }
        }
    }

    /// Caches settings for a newly created project. Settings already known,
    /// e.g. fetched on demand, are kept; segmenter types are still added for
    /// names the project does not have yet.
    pub fn insert_project_settings(
        &self,
        settings: ProjectSettings,
        segmenter_types: HashMap<String, SegmenterType>,
    ) {
        let project_id = settings.project_id;
        let mut data = self.data.write();

        let known_types = data.segmenter_types.entry(project_id).or_default();
        for (name, segmenter_type) in segmenter_types {
            known_types.entry(name).or_insert(segmenter_type);
        }

        if data.project_settings.contains_key(&project_id) {
            return;
        }

        data.project_settings
            .insert(project_id, Arc::new(settings));
        data.experiments.entry(project_id).or_default();
        drop(data);

        self.negative_cache.invalidate(project_id);
    }

    pub fn update_project_settings(&self, settings: ProjectSettings) {
        let project_id = settings.project_id;
        self.data
            .write()
            .project_settings
            .insert(project_id, Arc::new(settings));
        self.negative_cache.invalidate(project_id);
    }

    pub fn upsert_segmenter_type(
        &self,
        project_id: ProjectId,
        name: String,
        segmenter_type: SegmenterType,
    ) {
        self.data
            .write()
            .segmenter_types
            .entry(project_id)
            .or_default()
            .insert(name, segmenter_type);
    }

    pub fn delete_segmenter_type(&self, project_id: ProjectId, name: &str) {
        if let Some(types) = self.data.write().segmenter_types.get_mut(&project_id) {
            types.remove(name);
        }
    }

    pub fn summaries(&self) -> BTreeMap<ProjectId, Vec<IndexSummary>> {
        self.data
            .read()
            .experiments
            .iter()
            .map(|(project_id, experiments)| {
                (
                    *project_id,
                    experiments.values().map(ExperimentIndex::summary).collect(),
                )
            })
            .collect()
    }

    /// Writes every project's experiment indexes as JSON.
    pub fn dump_snapshot<W: Write>(&self, writer: W) -> Result<(), DumpError> {
        serde_json::to_writer(writer, &self.summaries())?;
        Ok(())
    }

    /// Dumps the snapshot to a new timestamped file in `directory` and
    /// returns its path.
    pub fn dump_to_directory(&self, directory: &Path) -> Result<PathBuf, DumpError> {
        std::fs::create_dir_all(directory)?;
        let file_name = format!("{}.json", Utc::now().format("%Y-%m-%dT%H-%M-%S"));
        let path = directory.join(file_name);

        let file = std::fs::File::create(&path)?;
        let mut writer = std::io::BufWriter::new(file);
        self.dump_snapshot(&mut writer)?;
        writer.flush()?;

        Ok(path)
    }
}
