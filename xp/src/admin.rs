use crate::http::{ResponseBody, make_boxed_error_response, make_json_response};
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::Service;
use hyper::{Request, Response, StatusCode};
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use treatment::TreatmentService;

/// Health, readiness and debugging endpoints of the treatment service.
pub struct AdminService {
    service: TreatmentService,
}

impl AdminService {
    pub fn new(service: TreatmentService) -> Self {
        Self { service }
    }
}

async fn route(service: &TreatmentService, path: &str) -> Response<ResponseBody> {
    let ok_body = || Full::new(Bytes::from("ok\n")).boxed();

    match path {
        "/health" => Response::new(ok_body()),
        "/ready" => match service.is_ready() {
            true => Response::new(ok_body()),
            false => make_boxed_error_response(StatusCode::SERVICE_UNAVAILABLE),
        },
        "/debug/experiments" => {
            let directory = service.dump_directory().to_path_buf();
            let dumped = {
                let service = service.clone();
                tokio::task::spawn_blocking(move || service.dump_experiments(&directory)).await
            };
            match dumped {
                Ok(Ok(path)) => make_json_response(
                    StatusCode::OK,
                    &serde_json::json!({ "path": path.display().to_string() }),
                ),
                Ok(Err(err)) => {
                    tracing::error!(error = %err, "Failed to dump experiments");
                    make_json_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        &serde_json::json!({ "error": err.to_string() }),
                    )
                }
                Err(err) => {
                    tracing::error!(error = %err, "Experiment dump task failed");
                    make_boxed_error_response(StatusCode::INTERNAL_SERVER_ERROR)
                }
            }
        }
        _ => make_boxed_error_response(StatusCode::NOT_FOUND),
    }
}

impl Service<Request<Incoming>> for AdminService {
    type Response = Response<ResponseBody>;
    type Error = Infallible;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let service = self.service.clone();

        Box::pin(async move { Ok(route(&service, req.uri().path()).await) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use treatment::config::Config as TreatmentServiceConfig;
    use treatment::feed::NoopFeed;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn mount(server: &MockServer, route: &str, body: serde_json::Value) {
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_admin_routes() {
        let mock_server = MockServer::start().await;
        mount(
            &mock_server,
            "/projects/1/settings",
            json!({"data": {"project_id": 1, "segmenters": {"names": ["country"]}}}),
        )
        .await;
        mount(
            &mock_server,
            "/projects/1/segmenters",
            json!({"data": [{"name": "country", "type": "string"}]}),
        )
        .await;
        mount(
            &mock_server,
            "/projects/1/experiments",
            json!({
                "data": [{
                    "id": 2,
                    "project_id": 1,
                    "name": "exp-2",
                    "status": "active",
                    "type": "A/B",
                    "start_time": "2024-01-01T00:00:00Z",
                    "end_time": "2999-01-01T00:00:00Z",
                    "segment": {"country": ["SG"]},
                    "treatments": [{"name": "control", "traffic": 100}]
                }],
                "paging": {"page": 1, "pages": 1, "total": 1}
            }),
        )
        .await;

        let dump_dir = tempfile::tempdir().unwrap();
        let config: TreatmentServiceConfig = serde_yaml::from_str(&format!(
            r#"
            project_ids: [1]
            management_service:
                url: {}
            debug:
                output_path: {}
            "#,
            mock_server.uri(),
            dump_dir.path().display()
        ))
        .unwrap();

        let service = TreatmentService::from_config(&config, Box::new(NoopFeed::default()))
            .await
            .unwrap();

        assert_eq!(route(&service, "/health").await.status(), StatusCode::OK);
        assert_eq!(route(&service, "/ready").await.status(), StatusCode::OK);
        assert_eq!(
            route(&service, "/unknown").await.status(),
            StatusCode::NOT_FOUND
        );

        let response = route(&service, "/debug/experiments").await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        let dumped = std::path::PathBuf::from(body["path"].as_str().unwrap());
        assert!(dumped.starts_with(dump_dir.path()));
        assert!(std::fs::read_to_string(dumped).unwrap().contains("\"ExperimentId\":2"));

        service.shutdown().await.unwrap();
    }
}
