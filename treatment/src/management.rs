const BASE_DELAY: Duration = Duration::from_millis(500);
const DEFAULT_MAX_RETRIES: u32 = 3;

use crate::types::{
    Experiment, ExperimentId, ExperimentStatus, ExperimentTier, ExperimentType, ProjectId,
    ProjectSettings, SegmenterConfig, SegmenterType, Treatment,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::time::{Duration, sleep};

#[derive(thiserror::Error, Debug)]
pub enum ManagementError {
    #[error("management request failed: {0}")]
    ReqwestError(#[from] reqwest::Error),
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
    #[error("management service returned {0}")]
    Status(StatusCode),
    #[error("management service unavailable")]
    RetriesExceeded,
    #[error("invalid experiment {experiment_id}: {reason}")]
    InvalidRecord {
        experiment_id: ExperimentId,
        reason: String,
    },
}

impl ManagementError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ManagementError::Status(StatusCode::NOT_FOUND))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Paging {
    pub page: u32,
    pub pages: u32,
    #[serde(default)]
    pub total: u32,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Page<T> {
    pub data: T,
    #[serde(default)]
    pub paging: Option<Paging>,
}

#[derive(Debug, Deserialize)]
struct ProjectRecord {
    id: ProjectId,
}

/// Filter for listing experiments.
#[derive(Debug, Clone, PartialEq)]
pub struct ExperimentQuery {
    pub status: ExperimentStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub page: u32,
}

/// An experiment as the management service serializes it. Segment values are
/// untyped until checked against the project's segmenter types.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExperimentRecord {
    pub id: ExperimentId,
    pub project_id: ProjectId,
    pub name: String,
    pub status: ExperimentStatus,
    #[serde(default)]
    pub tier: ExperimentTier,
    #[serde(rename = "type")]
    pub r#type: ExperimentType,
    #[serde(default)]
    pub interval: Option<u32>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    #[serde(default)]
    pub segment: HashMap<String, Vec<serde_json::Value>>,
    #[serde(default)]
    pub treatments: Vec<Treatment>,
}

impl ExperimentRecord {
    /// Converts the record using the project's segmenter types. Segments of
    /// segmenters the project does not declare are dropped.
    pub fn into_experiment(
        self,
        segmenter_types: &HashMap<String, SegmenterType>,
    ) -> Result<Experiment, ManagementError> {
        let mut segments = HashMap::with_capacity(self.segment.len());

        for (name, raw_values) in self.segment {
            let Some(segmenter_type) = segmenter_types.get(&name) else {
                tracing::debug!(
                    experiment_id = self.id,
                    segmenter = %name,
                    "Dropping segment of undeclared segmenter"
                );
                continue;
            };

            let values = raw_values
                .iter()
                .map(|raw| {
                    segmenter_type
                        .coerce(raw)
                        .ok_or_else(|| ManagementError::InvalidRecord {
                            experiment_id: self.id,
                            reason: format!("{raw} is not a valid {segmenter_type} for {name}"),
                        })
                })
                .collect::<Result<Vec<_>, _>>()?;
            segments.insert(name, values);
        }

        Ok(Experiment {
            id: self.id,
            project_id: self.project_id,
            name: self.name,
            status: self.status,
            tier: self.tier,
            r#type: self.r#type,
            interval: self.interval.unwrap_or_default(),
            start_time: self.start_time,
            end_time: self.end_time,
            segments,
            treatments: self.treatments,
        })
    }
}

/// Read access to the experiment management service.
#[async_trait]
pub trait ManagementClient: Send + Sync {
    async fn list_projects(&self) -> Result<Vec<ProjectId>, ManagementError>;

    async fn get_project_settings(
        &self,
        project_id: ProjectId,
    ) -> Result<ProjectSettings, ManagementError>;

    async fn list_experiments(
        &self,
        project_id: ProjectId,
        query: &ExperimentQuery,
    ) -> Result<Page<Vec<ExperimentRecord>>, ManagementError>;

    async fn list_segmenters(
        &self,
        project_id: ProjectId,
    ) -> Result<Vec<SegmenterConfig>, ManagementError>;
}

pub struct HttpManagementClient {
    client: reqwest::Client,
    base_url: String,
    base_delay: Duration,
    max_retries: u32,
}

impl HttpManagementClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ManagementError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(HttpManagementClient {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            base_delay: BASE_DELAY,
            max_retries: DEFAULT_MAX_RETRIES,
        })
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, ManagementError> {
        const RETRIABLE_STATUS_CODES: &[StatusCode] = &[
            StatusCode::TOO_MANY_REQUESTS,     // 429
            StatusCode::INTERNAL_SERVER_ERROR, // 500
            StatusCode::BAD_GATEWAY,           // 502
            StatusCode::SERVICE_UNAVAILABLE,   // 503
            StatusCode::GATEWAY_TIMEOUT,       // 504
        ];

        let mut url = Url::parse(&format!("{}/{}", self.base_url, path))
            .map_err(|e| ManagementError::InvalidUrl(e.to_string()))?;
        for (key, value) in query {
            url.query_pairs_mut().append_pair(key, value);
        }

        let mut retries = 0;

        loop {
            let response = self.client.get(url.clone()).send().await?;
            let status = response.status();

            if status.is_success() {
                return Ok(response.json::<T>().await?);
            }

            if !RETRIABLE_STATUS_CODES.contains(&status) {
                return Err(ManagementError::Status(status));
            }
            if retries >= self.max_retries {
                return Err(ManagementError::RetriesExceeded);
            }

            let delay = self.base_delay * 2_u32.pow(retries);
            tracing::warn!(%url, %status, retries, "Retrying management request");
            sleep(delay).await;
            retries += 1;
        }
    }
}

#[async_trait]
impl ManagementClient for HttpManagementClient {
    async fn list_projects(&self) -> Result<Vec<ProjectId>, ManagementError> {
        let page: Page<Vec<ProjectRecord>> = self.get_json("projects", &[]).await?;
        Ok(page.data.into_iter().map(|p| p.id).collect())
    }

    async fn get_project_settings(
        &self,
        project_id: ProjectId,
    ) -> Result<ProjectSettings, ManagementError> {
        let page: Page<ProjectSettings> = self
            .get_json(&format!("projects/{project_id}/settings"), &[])
            .await?;
        Ok(page.data)
    }

    async fn list_experiments(
        &self,
        project_id: ProjectId,
        query: &ExperimentQuery,
    ) -> Result<Page<Vec<ExperimentRecord>>, ManagementError> {
        let status = match query.status {
            ExperimentStatus::Active => "active",
            ExperimentStatus::Inactive => "inactive",
        };
        let params = [
            ("status", status.to_string()),
            ("start_time", query.start_time.to_rfc3339()),
            ("end_time", query.end_time.to_rfc3339()),
            ("page", query.page.to_string()),
        ];

        self.get_json(&format!("projects/{project_id}/experiments"), &params)
            .await
    }

    async fn list_segmenters(
        &self,
        project_id: ProjectId,
    ) -> Result<Vec<SegmenterConfig>, ManagementError> {
        let page: Page<Vec<SegmenterConfig>> = self
            .get_json(&format!("projects/{project_id}/segmenters"), &[])
            .await?;
        Ok(page.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SegmenterValue;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> HttpManagementClient {
        HttpManagementClient::new(&server.uri(), Duration::from_secs(5))
            .unwrap()
            .with_base_delay(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_list_projects() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/projects"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"id": 1, "username": "first"}, {"id": 2, "username": "second"}]
            })))
            .mount(&mock_server)
            .await;

        let projects = client(&mock_server).list_projects().await.unwrap();
        assert_eq!(projects, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_get_project_settings() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/projects/3/settings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {
                    "project_id": 3,
                    "username": "xp",
                    "randomization_key": "order_id",
                    "segmenters": {
                        "names": ["country", "s2_ids"],
                        "variables": {"s2_ids": ["latitude", "longitude"]}
                    }
                }
            })))
            .mount(&mock_server)
            .await;

        let settings = client(&mock_server).get_project_settings(3).await.unwrap();
        assert_eq!(settings.randomization_key, "order_id");
        assert_eq!(settings.segmenters.names, vec!["country", "s2_ids"]);
        assert!(!settings.enable_s2id_clustering);
    }

    #[tokio::test]
    async fn test_list_experiments_query() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/projects/1/experiments"))
            .and(query_param("status", "active"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{
                    "id": 5,
                    "project_id": 1,
                    "name": "exp-5",
                    "status": "active",
                    "type": "Switchback",
                    "interval": 30,
                    "start_time": "2024-01-01T00:00:00Z",
                    "end_time": "2024-06-01T00:00:00Z",
                    "segment": {"days_of_week": [1.0, 2]},
                    "treatments": [{"name": "control", "traffic": 100}]
                }],
                "paging": {"page": 2, "pages": 2, "total": 11}
            })))
            .mount(&mock_server)
            .await;

        let query = ExperimentQuery {
            status: ExperimentStatus::Active,
            start_time: Utc::now(),
            end_time: Utc::now(),
            page: 2,
        };
        let page = client(&mock_server)
            .list_experiments(1, &query)
            .await
            .unwrap();
        assert_eq!(page.paging.unwrap().pages, 2);

        let types = HashMap::from([("days_of_week".to_string(), SegmenterType::Integer)]);
        let experiment = page.data.into_iter().next().unwrap().into_experiment(&types).unwrap();
        assert_eq!(experiment.interval, 30);
        assert_eq!(
            experiment.segments["days_of_week"],
            vec![SegmenterValue::Integer(1), SegmenterValue::Integer(2)]
        );
    }

    #[tokio::test]
    async fn test_retries_then_succeeds() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/projects/1/segmenters"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/projects/1/segmenters"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"name": "country", "type": "string"}]
            })))
            .mount(&mock_server)
            .await;

        let segmenters = client(&mock_server).list_segmenters(1).await.unwrap();
        assert_eq!(segmenters[0].r#type, SegmenterType::String);
    }

    #[tokio::test]
    async fn test_retries_exceeded() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/projects"))
            .respond_with(ResponseTemplate::new(502))
            .expect(4)
            .mount(&mock_server)
            .await;

        let result = client(&mock_server).list_projects().await;
        assert!(matches!(result, Err(ManagementError::RetriesExceeded)));
    }

    #[tokio::test]
    async fn test_not_found_is_not_retried() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/projects/9/settings"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&mock_server)
            .await;

        let err = client(&mock_server)
            .get_project_settings(9)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(err.to_string().contains("404"));
    }

    #[test]
    fn test_invalid_segment_value() {
        let record: ExperimentRecord = serde_json::from_value(json!({
            "id": 8,
            "project_id": 1,
            "name": "exp-8",
            "status": "active",
            "type": "A/B",
            "start_time": "2024-01-01T00:00:00Z",
            "end_time": "2024-06-01T00:00:00Z",
            "segment": {"country": [1], "legacy": ["x"]}
        }))
        .unwrap();

        let types = HashMap::from([("country".to_string(), SegmenterType::String)]);
        let err = record.clone().into_experiment(&types).unwrap_err();
        assert!(matches!(
            err,
            ManagementError::InvalidRecord { experiment_id: 8, .. }
        ));

        let types = HashMap::from([("legacy".to_string(), SegmenterType::String)]);
        let experiment = record.into_experiment(&types).unwrap();
        assert!(!experiment.segments.contains_key("country"));
        assert_eq!(
            experiment.segments["legacy"],
            vec![SegmenterValue::String("x".into())]
        );
    }
}
