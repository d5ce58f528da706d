//! Consumable resources: admission gates consulted before a run is created.

pub mod alert_inhibit;
pub mod max_in_flight;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::types::InputType;

pub use alert_inhibit::{AlertInhibitor, InhibitReport};
pub use max_in_flight::MaxInFlight;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResourceResponse {
    Available,
    Denied(Vec<String>),
}

impl ResourceResponse {
    pub fn is_available(&self) -> bool {
        matches!(self, ResourceResponse::Available)
    }
}

#[async_trait]
pub trait ConsumableResource: Send + Sync {
    /// Called once when the target is built, with the resource's configured name.
    async fn startup(&self, name: &str) -> Result<()> {
        let _ = name;
        Ok(())
    }

    /// Shape of the per-run input this resource accepts, if any.
    fn input_type(&self) -> Option<InputType> {
        None
    }

    async fn request(
        &self,
        workflow_name: &str,
        workflow_version: &str,
        run_id: &str,
        input: Option<&Value>,
    ) -> ResourceResponse;

    /// The run holding this resource reached a terminal phase, or its admission
    /// was rolled back because another resource denied it.
    async fn release(&self, workflow_name: &str, workflow_version: &str, run_id: &str) {
        let _ = (workflow_name, workflow_version, run_id);
    }

    /// A resumed run already holds this resource.
    async fn recover(&self, workflow_name: &str, workflow_version: &str, run_id: &str) {
        let _ = (workflow_name, workflow_version, run_id);
    }
}
