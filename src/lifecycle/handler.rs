use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, PoisonError};

use super::OutputProvisioningHandler;
use crate::types::{ExternalId, ProvisionedOutput};

/// Fans every callback out to all delegates, in registration order.
pub struct CompositeHandler<Tx> {
    delegates: Vec<Arc<dyn OutputProvisioningHandler<Tx>>>,
}

impl<Tx> CompositeHandler<Tx> {
    pub fn new() -> Self {
        Self {
            delegates: Vec::new(),
        }
    }

    pub fn with(mut self, delegate: Arc<dyn OutputProvisioningHandler<Tx>>) -> Self {
        self.delegates.push(delegate);
        self
    }

    pub fn len(&self) -> usize {
        self.delegates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.delegates.is_empty()
    }
}

impl<Tx> Default for CompositeHandler<Tx> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Tx> OutputProvisioningHandler<Tx> for CompositeHandler<Tx> {
    fn provision_file(
        &self,
        external_ids: &BTreeSet<ExternalId>,
        storage_path: &str,
        checksum: &str,
        metatype: &str,
        labels: &BTreeMap<String, String>,
        tx: &mut Tx,
    ) {
        for delegate in &self.delegates {
            delegate.provision_file(external_ids, storage_path, checksum, metatype, labels, tx);
        }
    }

    fn provision_url(
        &self,
        external_ids: &BTreeSet<ExternalId>,
        url: &str,
        labels: &BTreeMap<String, String>,
        tx: &mut Tx,
    ) {
        for delegate in &self.delegates {
            delegate.provision_url(external_ids, url, labels, tx);
        }
    }
}

/// Records every provisioned artifact in arrival order.
#[derive(Debug, Default)]
pub struct OutputCollector {
    records: Mutex<Vec<ProvisionedOutput>>,
}

impl OutputCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<ProvisionedOutput> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn take(&self) -> Vec<ProvisionedOutput> {
        std::mem::take(&mut *self.records.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn push(&self, record: ProvisionedOutput) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
    }
}

impl<Tx> OutputProvisioningHandler<Tx> for OutputCollector {
    fn provision_file(
        &self,
        external_ids: &BTreeSet<ExternalId>,
        storage_path: &str,
        checksum: &str,
        metatype: &str,
        labels: &BTreeMap<String, String>,
        _tx: &mut Tx,
    ) {
        self.push(ProvisionedOutput::File {
            external_ids: external_ids.clone(),
            storage_path: storage_path.to_string(),
            checksum: checksum.to_string(),
            metatype: metatype.to_string(),
            labels: labels.clone(),
        });
    }

    fn provision_url(
        &self,
        external_ids: &BTreeSet<ExternalId>,
        url: &str,
        labels: &BTreeMap<String, String>,
        _tx: &mut Tx,
    ) {
        self.push(ProvisionedOutput::Url {
            external_ids: external_ids.clone(),
            url: url.to_string(),
            labels: labels.clone(),
        });
    }
}
