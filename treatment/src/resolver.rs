//! Picks the single experiment applying to a request.
//!
//! Candidates are the eligible experiments without a None match on any
//! segmenter. Ties are broken, while more than one candidate remains, by:
//!
//! 1. match strength, walking segmenters in the project's configured order
//!    and preferring Exact over Weak;
//! 2. lookup granularity, preferring the most specific request value of a
//!    multi-valued segmenter that some candidate matches exactly;
//! 3. tier, preferring Override over Default.
//!
//! Anything still tied is reported as ambiguous rather than picked at random.

use crate::counter;
use crate::index::{ExperimentMatch, MatchStrength, SegmentFilter};
use crate::metrics_defs::RESOLVER_OUTCOME;
use crate::store::SegmentIndexStore;
use crate::types::{Experiment, ExperimentId, ExperimentTier, ProjectId, ProjectSettings, SegmenterValue};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;

pub type RequestFilter = HashMap<String, Vec<SegmenterValue>>;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum ResolveError {
    #[error("unable to find project settings for project {0}")]
    ProjectNotFound(ProjectId),

    #[error("more than 1 experiment of the same match strength encountered: {experiment_ids:?}")]
    Ambiguous { experiment_ids: Vec<ExperimentId> },
}

#[derive(Clone, Debug)]
pub struct Resolution {
    /// The filters the request was matched with, in segmenter order.
    pub filters: Vec<SegmentFilter>,
    pub experiment: Option<Arc<Experiment>>,
}

pub async fn resolve(
    store: &SegmentIndexStore,
    project_id: ProjectId,
    request_filter: &RequestFilter,
) -> Result<Resolution, ResolveError> {
    let settings = store
        .find_project_settings(project_id)
        .await
        .ok_or(ResolveError::ProjectNotFound(project_id))?;

    resolve_at(store, &settings, request_filter, Utc::now())
}

/// Builds one filter per configured segmenter. Segmenters missing from the
/// request get no candidate values and request keys the project does not
/// configure are ignored.
pub fn build_filters(settings: &ProjectSettings, request_filter: &RequestFilter) -> Vec<SegmentFilter> {
    settings
        .segmenters
        .names
        .iter()
        .map(|name| {
            SegmentFilter::new(
                name.clone(),
                request_filter.get(name).cloned().unwrap_or_default(),
            )
        })
        .collect()
}

pub fn resolve_at(
    store: &SegmentIndexStore,
    settings: &ProjectSettings,
    request_filter: &RequestFilter,
    now: DateTime<Utc>,
) -> Result<Resolution, ResolveError> {
    let filters = build_filters(settings, request_filter);
    let candidates = store.find_experiments_at(settings.project_id, &filters, now);

    match select_candidate(candidates, &filters) {
        Ok(experiment) => {
            let outcome = if experiment.is_some() { "matched" } else { "none" };
            counter!(RESOLVER_OUTCOME, "outcome" => outcome).increment(1);
            Ok(Resolution { filters, experiment })
        }
        Err(err) => {
            counter!(RESOLVER_OUTCOME, "outcome" => "ambiguous").increment(1);
            tracing::error!(project_id = settings.project_id, error = %err, "Ambiguous experiment resolution");
            Err(err)
        }
    }
}

fn select_candidate(
    mut candidates: Vec<ExperimentMatch>,
    filters: &[SegmentFilter],
) -> Result<Option<Arc<Experiment>>, ResolveError> {
    if candidates.len() > 1 {
        candidates = filter_by_match_strength(candidates, filters);
    }
    if candidates.len() > 1 {
        candidates = filter_by_granularity(candidates, filters);
    }
    if candidates.len() > 1 {
        candidates = filter_by_tier(candidates);
    }

    match candidates.len() {
        0 => Ok(None),
        1 => Ok(candidates.pop().map(|c| c.experiment)),
        _ => Err(ResolveError::Ambiguous {
            experiment_ids: candidates.iter().map(|c| c.experiment.id).collect(),
        }),
    }
}

fn strength(candidate: &ExperimentMatch, segmenter: &str) -> Option<MatchStrength> {
    candidate
        .segmenter_matches
        .get(segmenter)
        .map(|m| m.strength)
}

fn filter_by_match_strength(
    mut candidates: Vec<ExperimentMatch>,
    filters: &[SegmentFilter],
) -> Vec<ExperimentMatch> {
    for filter in filters {
        if candidates.len() <= 1 {
            break;
        }
        let any_exact = candidates
            .iter()
            .any(|c| strength(c, &filter.key) == Some(MatchStrength::Exact));
        if any_exact {
            candidates.retain(|c| strength(c, &filter.key) == Some(MatchStrength::Exact));
        }
    }
    candidates
}

fn filter_by_granularity(
    mut candidates: Vec<ExperimentMatch>,
    filters: &[SegmentFilter],
) -> Vec<ExperimentMatch> {
    let exact_on = |candidate: &ExperimentMatch, segmenter: &str, value: &SegmenterValue| {
        candidate
            .segmenter_matches
            .get(segmenter)
            .is_some_and(|m| m.strength == MatchStrength::Exact && m.value.as_ref() == Some(value))
    };

    for filter in filters.iter().filter(|f| f.values.len() > 1) {
        if candidates.len() <= 1 {
            break;
        }
        for value in &filter.values {
            if candidates.iter().any(|c| exact_on(c, &filter.key, value)) {
                candidates.retain(|c| exact_on(c, &filter.key, value));
                break;
            }
        }
    }
    candidates
}

fn filter_by_tier(candidates: Vec<ExperimentMatch>) -> Vec<ExperimentMatch> {
    let has_override = candidates
        .iter()
        .any(|c| c.experiment.tier == ExperimentTier::Override);
    if !has_override {
        return candidates;
    }
    candidates
        .into_iter()
        .filter(|c| c.experiment.tier == ExperimentTier::Override)
        .collect()
}
