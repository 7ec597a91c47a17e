use crate::config::SegmenterRunner as SegmenterRunnerConfig;
use crate::types::{SegmenterType, SegmenterValue};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Raw request attributes, keyed by request field name.
pub type RequestValues = HashMap<String, Value>;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum SegmenterError {
    #[error("invalid value for segmenter {segmenter}: {value} is not a valid {expected}")]
    InvalidValue {
        segmenter: String,
        value: String,
        expected: String,
    },
}

/// Turns raw request attributes into the ordered candidate values of one
/// segmenter, most specific first.
pub trait SegmenterRunner: Send + Sync {
    fn transform(
        &self,
        segmenter: &str,
        request_values: &RequestValues,
        segmenter_type: Option<SegmenterType>,
    ) -> Result<Vec<SegmenterValue>, SegmenterError>;
}

/// Reads one request field and coerces it to the segmenter's declared type.
/// Arrays yield one candidate per element, in order.
#[derive(Debug, Default, Clone)]
pub struct TypedRunner {
    source: Option<String>,
}

impl TypedRunner {
    pub fn new(source: Option<String>) -> Self {
        TypedRunner { source }
    }

    fn coerce(
        segmenter: &str,
        raw: &Value,
        segmenter_type: Option<SegmenterType>,
    ) -> Result<SegmenterValue, SegmenterError> {
        let coerced = match segmenter_type {
            Some(segmenter_type) => segmenter_type.coerce(raw),
            None => SegmenterValue::from_json(raw),
        };

        coerced.ok_or_else(|| SegmenterError::InvalidValue {
            segmenter: segmenter.to_string(),
            value: raw.to_string(),
            expected: segmenter_type
                .map(|t| t.to_string())
                .unwrap_or_else(|| "scalar".to_string()),
        })
    }
}

impl SegmenterRunner for TypedRunner {
    fn transform(
        &self,
        segmenter: &str,
        request_values: &RequestValues,
        segmenter_type: Option<SegmenterType>,
    ) -> Result<Vec<SegmenterValue>, SegmenterError> {
        let field = self.source.as_deref().unwrap_or(segmenter);

        match request_values.get(field) {
            None | Some(Value::Null) => Ok(Vec::new()),
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| Self::coerce(segmenter, item, segmenter_type))
                .collect(),
            Some(raw) => Ok(vec![Self::coerce(segmenter, raw, segmenter_type)?]),
        }
    }
}

/// Name-keyed segmenter transforms. Segmenters without a registered runner
/// use a [`TypedRunner`] reading the field of the same name.
#[derive(Clone, Default)]
pub struct SegmenterRegistry {
    runners: HashMap<String, Arc<dyn SegmenterRunner>>,
    fallback: TypedRunner,
}

impl SegmenterRegistry {
    pub fn from_config(config: &HashMap<String, SegmenterRunnerConfig>) -> Self {
        let mut registry = SegmenterRegistry::default();
        for (name, runner) in config {
            registry.register(name.clone(), Arc::new(TypedRunner::new(runner.source.clone())));
        }
        registry
    }

    pub fn register(&mut self, name: String, runner: Arc<dyn SegmenterRunner>) {
        self.runners.insert(name, runner);
    }

    /// Computes the candidate values of `segmenter`. If any of the required
    /// request variables is missing the segmenter resolves to no values, so
    /// that only experiments not constrained on it can match.
    pub fn transform(
        &self,
        segmenter: &str,
        request_values: &RequestValues,
        required_variables: &[String],
        segmenter_type: Option<SegmenterType>,
    ) -> Result<Vec<SegmenterValue>, SegmenterError> {
        let missing = required_variables
            .iter()
            .any(|name| request_values.get(name).is_none_or(Value::is_null));
        if missing {
            return Ok(Vec::new());
        }

        match self.runners.get(segmenter) {
            Some(runner) => runner.transform(segmenter, request_values, segmenter_type),
            None => self
                .fallback
                .transform(segmenter, request_values, segmenter_type),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(values: Value) -> RequestValues {
        serde_json::from_value(values).unwrap()
    }

    struct FixedRunner(Vec<SegmenterValue>);

    impl SegmenterRunner for FixedRunner {
        fn transform(
            &self,
            _segmenter: &str,
            _request_values: &RequestValues,
            _segmenter_type: Option<SegmenterType>,
        ) -> Result<Vec<SegmenterValue>, SegmenterError> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn test_typed_runner() {
        let registry = SegmenterRegistry::default();
        let values = request(json!({"days_of_week": 3.0, "country": "SG"}));

        assert_eq!(
            registry
                .transform("days_of_week", &values, &[], Some(SegmenterType::Integer))
                .unwrap(),
            vec![SegmenterValue::Integer(3)]
        );
        assert_eq!(
            registry.transform("country", &values, &[], None).unwrap(),
            vec![SegmenterValue::String("SG".into())]
        );
        assert!(
            registry
                .transform("service_type", &values, &[], Some(SegmenterType::Integer))
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn test_typed_runner_array() {
        let registry = SegmenterRegistry::default();
        let values = request(json!({"s2_ids": [3, "4", 5.9]}));

        assert_eq!(
            registry
                .transform("s2_ids", &values, &[], Some(SegmenterType::Integer))
                .unwrap(),
            vec![
                SegmenterValue::Integer(3),
                SegmenterValue::Integer(4),
                SegmenterValue::Integer(5)
            ]
        );
    }

    #[test]
    fn test_invalid_value() {
        let registry = SegmenterRegistry::default();
        let values = request(json!({"country": 65}));

        let err = registry
            .transform("country", &values, &[], Some(SegmenterType::String))
            .unwrap_err();
        assert_eq!(
            err,
            SegmenterError::InvalidValue {
                segmenter: "country".into(),
                value: "65".into(),
                expected: "string".into(),
            }
        );
    }

    #[test]
    fn test_missing_required_variable() {
        let mut registry = SegmenterRegistry::default();
        registry.register(
            "s2_ids".into(),
            Arc::new(FixedRunner(vec![SegmenterValue::Integer(1)])),
        );

        let required = vec!["latitude".to_string(), "longitude".to_string()];
        let values = request(json!({"latitude": 1.29, "longitude": null}));
        assert!(
            registry
                .transform("s2_ids", &values, &required, None)
                .unwrap()
                .is_empty()
        );

        let values = request(json!({"latitude": 1.29, "longitude": 103.85}));
        assert_eq!(
            registry.transform("s2_ids", &values, &required, None).unwrap(),
            vec![SegmenterValue::Integer(1)]
        );
    }

    #[test]
    fn test_configured_source() {
        let config = HashMap::from([(
            "country".to_string(),
            SegmenterRunnerConfig {
                source: Some("country_code".into()),
            },
        )]);
        let registry = SegmenterRegistry::from_config(&config);
        let values = request(json!({"country_code": "ID", "country": "SG"}));

        assert_eq!(
            registry
                .transform("country", &values, &[], Some(SegmenterType::String))
                .unwrap(),
            vec![SegmenterValue::String("ID".into())]
        );
    }
}
