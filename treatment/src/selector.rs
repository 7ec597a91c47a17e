use crate::types::{Experiment, ExperimentType, Treatment};
use chrono::{DateTime, Utc};

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// 32-bit FNV-1a. Assignment must stay bit-for-bit reproducible, so this is
/// not swapped for a faster hasher.
pub fn fnv1a_32(data: &[u8]) -> u32 {
    data.iter().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ u32::from(*byte)).wrapping_mul(FNV_PRIME)
    })
}

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum SelectError {
    #[error("randomization key's value is nil")]
    MissingRandomizationValue,

    #[error("switchback experiment {0} has no interval")]
    InvalidInterval(i64),

    #[error("experiment {0} has no treatments")]
    NoTreatments(i64),

    #[error("experiment {0} allocates no traffic")]
    NoTrafficAllocated(i64),

    #[error("weighted choice failed to select a treatment for experiment {0}")]
    NoWeightedChoice(i64),
}

impl SelectError {
    pub fn is_client_error(&self) -> bool {
        matches!(self, SelectError::MissingRandomizationValue)
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct SelectedTreatment {
    pub treatment: Treatment,
    /// Window the assignment was made in, for switchback experiments.
    pub switchback_window_id: Option<i64>,
}

pub fn select(
    experiment: Option<&Experiment>,
    randomization_value: Option<&str>,
) -> Result<SelectedTreatment, SelectError> {
    select_at(experiment, randomization_value, Utc::now())
}

/// Picks the treatment of `experiment` for a request. Without an experiment
/// the empty treatment is returned.
pub fn select_at(
    experiment: Option<&Experiment>,
    randomization_value: Option<&str>,
    now: DateTime<Utc>,
) -> Result<SelectedTreatment, SelectError> {
    let Some(experiment) = experiment else {
        return Ok(SelectedTreatment::default());
    };

    match experiment.r#type {
        ExperimentType::AB => {
            let value = randomization_value.ok_or(SelectError::MissingRandomizationValue)?;
            let seed = format!("{value}-{}", experiment.id);
            let treatment = weighted_choice(experiment, &seed)?;
            Ok(SelectedTreatment {
                treatment: treatment.clone(),
                switchback_window_id: None,
            })
        }
        ExperimentType::Switchback => switchback(experiment, randomization_value, now),
    }
}

fn switchback(
    experiment: &Experiment,
    randomization_value: Option<&str>,
    now: DateTime<Utc>,
) -> Result<SelectedTreatment, SelectError> {
    if experiment.interval == 0 {
        return Err(SelectError::InvalidInterval(experiment.id));
    }
    if experiment.treatments.is_empty() {
        return Err(SelectError::NoTreatments(experiment.id));
    }

    // floor(elapsed minutes / interval), also for requests before the start
    let elapsed_seconds = (now - experiment.start_time).num_seconds();
    let window_id = elapsed_seconds.div_euclid(i64::from(experiment.interval) * 60);

    let cyclical = experiment.treatments.iter().all(|t| t.traffic == 0);
    let treatment = if cyclical {
        let position = window_id.rem_euclid(experiment.treatments.len() as i64) as usize;
        &experiment.treatments[position]
    } else {
        let seed = format!(
            "{}-{window_id}-{}",
            randomization_value.unwrap_or_default(),
            experiment.id
        );
        weighted_choice(experiment, &seed)?
    };

    Ok(SelectedTreatment {
        treatment: treatment.clone(),
        switchback_window_id: Some(window_id),
    })
}

fn weighted_choice<'a>(experiment: &'a Experiment, seed: &str) -> Result<&'a Treatment, SelectError> {
    if experiment.treatments.is_empty() {
        return Err(SelectError::NoTreatments(experiment.id));
    }

    let total: u64 = experiment
        .treatments
        .iter()
        .map(|t| u64::from(t.traffic))
        .sum();
    if total == 0 {
        return Err(SelectError::NoTrafficAllocated(experiment.id));
    }

    let roll = u64::from(fnv1a_32(seed.as_bytes())) % total;

    let mut threshold = 0;
    for treatment in &experiment.treatments {
        threshold += u64::from(treatment.traffic);
        if roll < threshold {
            return Ok(treatment);
        }
    }

    Err(SelectError::NoWeightedChoice(experiment.id))
}
