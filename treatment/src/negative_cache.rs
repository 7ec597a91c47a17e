// Lightweight negative cache which temporarily remembers project settings fetches
// that failed, so an unknown project id does not hit the management service on
// every request.
use crate::counter;
use crate::metrics_defs::{NEGATIVE_CACHE_HIT, NEGATIVE_CACHE_MISS};
use crate::types::ProjectId;
use moka::sync::Cache;
use std::time::Duration;

const SIZE: u64 = 1000;
const TTL_SECS: u64 = 5;

pub struct NegativeCache {
    cache: Cache<ProjectId, ()>,
}

impl NegativeCache {
    pub fn new() -> Self {
        Self::with_ttl(Duration::from_secs(TTL_SECS))
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(SIZE)
            .time_to_live(ttl)
            .build();

        NegativeCache { cache }
    }

    pub fn insert(&self, project_id: ProjectId) {
        self.cache.insert(project_id, ());
    }

    pub fn invalidate(&self, project_id: ProjectId) {
        self.cache.invalidate(&project_id);
    }

    pub fn invalidate_all(&self) {
        self.cache.invalidate_all();
    }

    pub fn contains(&self, project_id: ProjectId) -> bool {
        let cache_hit = self.cache.contains_key(&project_id);
        let metric_def = if cache_hit {
            NEGATIVE_CACHE_HIT
        } else {
            NEGATIVE_CACHE_MISS
        };
        counter!(metric_def).increment(1);
        cache_hit
    }
}

impl Default for NegativeCache {
    fn default() -> Self {
        Self::new()
    }
}
