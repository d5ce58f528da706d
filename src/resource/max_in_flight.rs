use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::{Mutex, PoisonError};
use tracing::debug;

use super::{ConsumableResource, ResourceResponse};

/// Caps the number of runs holding this resource at once.
///
/// The only stateful resource: it tracks holders by run id and relies on
/// `release`/`recover` to stay accurate across completion and restarts.
#[derive(Debug)]
pub struct MaxInFlight {
    limit: usize,
    active: Mutex<BTreeSet<String>>,
}

impl MaxInFlight {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            active: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[async_trait]
impl ConsumableResource for MaxInFlight {
    async fn request(
        &self,
        _workflow_name: &str,
        _workflow_version: &str,
        run_id: &str,
        _input: Option<&Value>,
    ) -> ResourceResponse {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if active.contains(run_id) {
            return ResourceResponse::Available;
        }
        if active.len() >= self.limit {
            return ResourceResponse::Denied(vec![format!(
                "{} runs already in flight (limit {})",
                active.len(),
                self.limit
            )]);
        }
        active.insert(run_id.to_string());
        ResourceResponse::Available
    }

    async fn release(&self, _workflow_name: &str, _workflow_version: &str, run_id: &str) {
        let removed = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(run_id);
        debug!(run_id, removed, "Released in-flight slot");
    }

    async fn recover(&self, _workflow_name: &str, _workflow_version: &str, run_id: &str) {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(run_id.to_string());
    }
}
