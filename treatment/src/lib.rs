pub mod applier;
pub mod config;
pub mod feed;
pub mod index;
pub mod management;
pub mod metrics_defs;
pub mod negative_cache;
pub mod resolver;
pub mod segmenters;
pub mod selector;
pub mod service;
pub mod store;
pub mod types;

#[cfg(test)]
mod testutils;

pub use service::{FetchedTreatment, TreatmentError, TreatmentService};
