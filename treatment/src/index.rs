use crate::types::{
    Experiment, ExperimentId, ExperimentStatus, ExperimentTier, SegmenterValue,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

/// How well an experiment's constraint on one segmenter fits a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchStrength {
    /// The experiment constrains the segmenter and admits a request value.
    Exact,
    /// The experiment does not constrain the segmenter.
    Weak,
    /// The experiment constrains the segmenter and admits none of the values.
    None,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Match {
    pub strength: MatchStrength,
    /// The request value that produced the match, if any.
    pub value: Option<SegmenterValue>,
}

impl Match {
    fn exact(value: SegmenterValue) -> Self {
        Match {
            strength: MatchStrength::Exact,
            value: Some(value),
        }
    }

    fn weak(value: Option<SegmenterValue>) -> Self {
        Match {
            strength: MatchStrength::Weak,
            value,
        }
    }

    fn none() -> Self {
        Match {
            strength: MatchStrength::None,
            value: None,
        }
    }
}

/// The candidate values a request carries for one segmenter. For multi-valued
/// segmenters such as s2 cell ids, values run from most to least granular.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SegmentFilter {
    pub key: String,
    pub values: Vec<SegmenterValue>,
}

impl SegmentFilter {
    pub fn new(key: impl Into<String>, values: Vec<SegmenterValue>) -> Self {
        SegmentFilter {
            key: key.into(),
            values,
        }
    }
}

/// An experiment found eligible for a request, with the per-segmenter match
/// detail the resolver ranks on.
#[derive(Clone, Debug)]
pub struct ExperimentMatch {
    pub experiment: Arc<Experiment>,
    pub segmenter_matches: HashMap<String, Match>,
}

#[derive(Clone, Debug, Default)]
struct AdmissibleValues {
    strings: HashSet<String>,
    integers: HashSet<i64>,
    // f64 bit patterns, with -0.0 folded onto 0.0
    reals: HashSet<u64>,
    booleans: Vec<bool>,
}

fn real_key(value: f64) -> u64 {
    if value == 0.0 {
        0f64.to_bits()
    } else {
        value.to_bits()
    }
}

impl AdmissibleValues {
    fn insert(&mut self, value: &SegmenterValue) {
        match value {
            SegmenterValue::Bool(b) => {
                if !self.booleans.contains(b) {
                    self.booleans.push(*b);
                }
            }
            SegmenterValue::Integer(i) => {
                self.integers.insert(*i);
            }
            SegmenterValue::Real(r) => {
                self.reals.insert(real_key(*r));
            }
            SegmenterValue::String(s) => {
                self.strings.insert(s.clone());
            }
        }
    }

    fn is_empty(&self) -> bool {
        self.strings.is_empty()
            && self.integers.is_empty()
            && self.reals.is_empty()
            && self.booleans.is_empty()
    }

    fn contains(&self, value: &SegmenterValue) -> bool {
        match value {
            SegmenterValue::Bool(b) => self.booleans.contains(b),
            SegmenterValue::Integer(i) => self.integers.contains(i),
            SegmenterValue::Real(r) => self.reals.contains(&real_key(*r)),
            SegmenterValue::String(s) => self.strings.contains(s),
        }
    }
}

/// Per-experiment lookup structure answering "does this experiment admit
/// this request value for this segmenter" without scanning lists.
#[derive(Clone, Debug)]
pub struct ExperimentIndex {
    segments: HashMap<String, AdmissibleValues>,
    pub experiment: Arc<Experiment>,
}

impl ExperimentIndex {
    pub fn new(experiment: Arc<Experiment>) -> Self {
        let segments = experiment
            .segments
            .iter()
            .map(|(name, values)| {
                let mut admissible = AdmissibleValues::default();
                for value in values {
                    admissible.insert(value);
                }
                (name.clone(), admissible)
            })
            .collect();

        ExperimentIndex {
            segments,
            experiment,
        }
    }

    pub fn is_active(&self) -> bool {
        self.experiment.status == ExperimentStatus::Active
    }

    /// Eligible iff active and `start_time <= now < end_time`.
    pub fn is_eligible_at(&self, now: DateTime<Utc>) -> bool {
        self.is_active() && self.experiment.start_time <= now && now < self.experiment.end_time
    }

    /// Computes the match of this experiment against the request values of a
    /// single segmenter. When several values are admitted, the first one in
    /// request order is reported.
    pub fn match_segment(&self, segmenter: &str, values: &[SegmenterValue]) -> Match {
        let Some(admissible) = self.segments.get(segmenter).filter(|a| !a.is_empty()) else {
            return Match::weak(values.first().cloned());
        };

        values
            .iter()
            .find(|value| admissible.contains(value))
            .map(|value| Match::exact(value.clone()))
            .unwrap_or_else(Match::none)
    }

    /// Matches every filter, or returns `None` as soon as one segmenter has no
    /// admissible value.
    pub fn match_filters(&self, filters: &[SegmentFilter]) -> Option<HashMap<String, Match>> {
        let mut matches = HashMap::with_capacity(filters.len());
        for filter in filters {
            let found = self.match_segment(&filter.key, &filter.values);
            if found.strength == MatchStrength::None {
                return None;
            }
            matches.insert(filter.key.clone(), found);
        }
        Some(matches)
    }

    pub fn summary(&self) -> IndexSummary {
        let mut summary = IndexSummary {
            string_sets: BTreeMap::new(),
            int_sets: BTreeMap::new(),
            real_sets: BTreeMap::new(),
            bool_sets: BTreeMap::new(),
            start_time: self.experiment.start_time,
            end_time: self.experiment.end_time,
            experiment_id: self.experiment.id,
            status: self.experiment.status,
            tier: self.experiment.tier,
        };

        for (name, admissible) in &self.segments {
            if !admissible.strings.is_empty() {
                let mut values: Vec<_> = admissible.strings.iter().cloned().collect();
                values.sort();
                summary.string_sets.insert(name.clone(), values);
            }
            if !admissible.integers.is_empty() {
                let mut values: Vec<_> = admissible.integers.iter().copied().collect();
                values.sort_unstable();
                summary.int_sets.insert(name.clone(), values);
            }
            if !admissible.reals.is_empty() {
                let mut values: Vec<_> =
                    admissible.reals.iter().map(|b| f64::from_bits(*b)).collect();
                values.sort_by(f64::total_cmp);
                summary.real_sets.insert(name.clone(), values);
            }
            if !admissible.booleans.is_empty() {
                let mut values = admissible.booleans.clone();
                values.sort_unstable();
                summary.bool_sets.insert(name.clone(), values);
            }
        }

        summary
    }
}

/// Serializable view of an index entry, written out by experiment dumps.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct IndexSummary {
    pub string_sets: BTreeMap<String, Vec<String>>,
    pub int_sets: BTreeMap<String, Vec<i64>>,
    pub real_sets: BTreeMap<String, Vec<f64>>,
    pub bool_sets: BTreeMap<String, Vec<bool>>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub experiment_id: ExperimentId,
    pub status: ExperimentStatus,
    pub tier: ExperimentTier,
}
