use crate::index::ExperimentIndex;
use crate::management::{
    ExperimentQuery, ExperimentRecord, ManagementClient, ManagementError, Page, Paging,
};
use crate::types::{
    Experiment, ExperimentId, ExperimentStatus, ExperimentTier, ExperimentType, ProjectId,
    ProjectSegmenters, ProjectSettings, SegmenterConfig, SegmenterType, SegmenterValue, Treatment,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

pub fn project_settings(project_id: ProjectId, segmenters: &[&str]) -> ProjectSettings {
    ProjectSettings {
        project_id,
        username: format!("project-{project_id}"),
        passkey: "passkey".into(),
        randomization_key: "order_id".into(),
        enable_s2id_clustering: false,
        segmenters: ProjectSegmenters {
            names: segmenters.iter().map(|s| s.to_string()).collect(),
            variables: HashMap::new(),
        },
    }
}

pub fn treatment(name: &str, traffic: u32) -> Treatment {
    Treatment {
        name: name.into(),
        configuration: serde_json::json!({"name": name}),
        traffic,
    }
}

pub struct ExperimentBuilder {
    experiment: Experiment,
}

impl ExperimentBuilder {
    /// An active A/B experiment of project 1 running from a day ago until a
    /// day from now.
    pub fn new(id: ExperimentId) -> Self {
        let now = Utc::now();
        ExperimentBuilder {
            experiment: Experiment {
                id,
                project_id: 1,
                name: format!("exp-{id}"),
                status: ExperimentStatus::Active,
                tier: ExperimentTier::Default,
                r#type: ExperimentType::AB,
                interval: 0,
                start_time: now - chrono::Duration::days(1),
                end_time: now + chrono::Duration::days(1),
                segments: HashMap::new(),
                treatments: vec![treatment("control", 100)],
            },
        }
    }

    pub fn project(mut self, project_id: ProjectId) -> Self {
        self.experiment.project_id = project_id;
        self
    }

    pub fn name(mut self, name: &str) -> Self {
        self.experiment.name = name.into();
        self
    }

    pub fn inactive(mut self) -> Self {
        self.experiment.status = ExperimentStatus::Inactive;
        self
    }

    pub fn tier(mut self, tier: ExperimentTier) -> Self {
        self.experiment.tier = tier;
        self
    }

    pub fn switchback(mut self, interval: u32) -> Self {
        self.experiment.r#type = ExperimentType::Switchback;
        self.experiment.interval = interval;
        self
    }

    pub fn window(mut self, start_time: DateTime<Utc>, end_time: DateTime<Utc>) -> Self {
        self.experiment.start_time = start_time;
        self.experiment.end_time = end_time;
        self
    }

    pub fn segment(mut self, segmenter: &str, values: Vec<SegmenterValue>) -> Self {
        self.experiment.segments.insert(segmenter.into(), values);
        self
    }

    pub fn treatments(mut self, treatments: Vec<Treatment>) -> Self {
        self.experiment.treatments = treatments;
        self
    }

    pub fn build(self) -> Experiment {
        self.experiment
    }

    pub fn build_index(self) -> ExperimentIndex {
        ExperimentIndex::new(Arc::new(self.experiment))
    }
}

fn to_record(experiment: &Experiment) -> ExperimentRecord {
    ExperimentRecord {
        id: experiment.id,
        project_id: experiment.project_id,
        name: experiment.name.clone(),
        status: experiment.status,
        tier: experiment.tier,
        r#type: experiment.r#type,
        interval: Some(experiment.interval),
        start_time: experiment.start_time,
        end_time: experiment.end_time,
        segment: experiment
            .segments
            .iter()
            .map(|(name, values)| {
                let raw = values
                    .iter()
                    .map(|v| serde_json::to_value(v).unwrap())
                    .collect();
                (name.clone(), raw)
            })
            .collect(),
        treatments: experiment.treatments.clone(),
    }
}

/// In-memory management service. Unknown projects answer 404.
#[derive(Clone, Default)]
pub struct FakeManagementClient {
    projects: BTreeMap<ProjectId, ProjectSettings>,
    segmenters: HashMap<ProjectId, Vec<SegmenterConfig>>,
    experiments: Vec<Experiment>,
    page_size: usize,
    settings_fetches: Arc<AtomicUsize>,
}

impl FakeManagementClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_project(mut self, settings: ProjectSettings) -> Self {
        self.projects.insert(settings.project_id, settings);
        self
    }

    pub fn with_segmenter(
        mut self,
        project_id: ProjectId,
        name: &str,
        segmenter_type: SegmenterType,
    ) -> Self {
        self.segmenters
            .entry(project_id)
            .or_default()
            .push(SegmenterConfig {
                name: name.into(),
                r#type: segmenter_type,
            });
        self
    }

    pub fn with_experiment(mut self, experiment: Experiment) -> Self {
        self.experiments.push(experiment);
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn settings_fetches(&self) -> usize {
        self.settings_fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ManagementClient for FakeManagementClient {
    async fn list_projects(&self) -> Result<Vec<ProjectId>, ManagementError> {
        Ok(self.projects.keys().copied().collect())
    }

    async fn get_project_settings(
        &self,
        project_id: ProjectId,
    ) -> Result<ProjectSettings, ManagementError> {
        self.settings_fetches.fetch_add(1, Ordering::SeqCst);
        self.projects
            .get(&project_id)
            .cloned()
            .ok_or(ManagementError::Status(StatusCode::NOT_FOUND))
    }

    async fn list_experiments(
        &self,
        project_id: ProjectId,
        query: &ExperimentQuery,
    ) -> Result<Page<Vec<ExperimentRecord>>, ManagementError> {
        let matching: Vec<ExperimentRecord> = self
            .experiments
            .iter()
            .filter(|e| e.project_id == project_id && e.status == query.status)
            .map(to_record)
            .collect();

        let total = matching.len();
        let page_size = if self.page_size == 0 {
            total.max(1)
        } else {
            self.page_size
        };
        let pages = total.div_ceil(page_size).max(1);
        let data = matching
            .into_iter()
            .skip((query.page as usize - 1) * page_size)
            .take(page_size)
            .collect();

        Ok(Page {
            data,
            paging: Some(Paging {
                page: query.page,
                pages: pages as u32,
                total: total as u32,
            }),
        })
    }

    async fn list_segmenters(
        &self,
        project_id: ProjectId,
    ) -> Result<Vec<SegmenterConfig>, ManagementError> {
        Ok(self.segmenters.get(&project_id).cloned().unwrap_or_default())
    }
}
