//! Which pricing rows and option values are referenced by services.
//!
//! Services themselves are owned elsewhere; [`ServiceLedger`] keeps just enough
//! of them (pricing reference, status, selected option values) to answer the
//! in-use questions the reconcilers ask.
use crate::error::PricingError;
use crate::store::{Store, encode, keys};
use sled::Batch;
use std::sync::Arc;
use tracing::debug;

/// Answers in-use questions for the edit and delete guards.
pub trait ServiceUsageOracle: Send + Sync {
    /// A service that is not canceled references the pricing row.
    fn is_pricing_in_use(&self, pricing_id: u64) -> Result<bool, PricingError>;

    /// A service that is not canceled has the value selected, optionally
    /// restricted to one pricing row of that value.
    fn is_option_value_in_use(
        &self,
        value_id: u64,
        pricing_id: Option<u64>,
    ) -> Result<bool, PricingError>;

    /// Any service, whatever its status, references the pricing row.
    fn is_pricing_referenced(&self, pricing_id: u64) -> Result<bool, PricingError>;
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    #[n(0)]
    Pending,
    #[n(1)]
    InReview,
    #[n(2)]
    Active,
    #[n(3)]
    Suspended,
    #[n(4)]
    Canceled,
}

impl ServiceStatus {
    pub fn is_live(&self) -> bool {
        !matches!(self, ServiceStatus::Canceled)
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct SelectedOption {
    #[n(0)]
    pub option_id: u64,
    #[n(1)]
    pub value_id: u64,
    #[n(2)]
    pub pricing_id: u64,
    #[n(3)]
    pub quantity: u32,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct ServiceRecord {
    #[n(0)]
    pub id: u64,
    #[n(1)]
    pub pricing_id: u64,
    #[n(2)]
    pub status: ServiceStatus,
    #[n(3)]
    pub options: Vec<SelectedOption>,
}

#[derive(Clone)]
pub struct ServiceLedger {
    store: Store,
}

impl ServiceLedger {
    pub fn new(instance: Arc<sled::Db>) -> Self {
        Self {
            store: Store::new(instance),
        }
    }

    /// Record a service bound to `pricing_id` with the given selections.
    pub fn record_service(
        &self,
        pricing_id: u64,
        status: ServiceStatus,
        options: Vec<SelectedOption>,
    ) -> anyhow::Result<ServiceRecord> {
        let id = self.store.db().generate_id()? + 1;
        let record = ServiceRecord {
            id,
            pricing_id,
            status,
            options,
        };

        let mut batch = Batch::default();
        batch.insert(keys::service(id).as_bytes(), encode(&record)?);
        batch.insert(keys::service_by_pricing(pricing_id, id).as_bytes(), Vec::<u8>::new());
        for selected in &record.options {
            batch.insert(
                keys::service_by_value(selected.value_id, id).as_bytes(),
                encode(&selected.pricing_id)?,
            );
        }
        self.store.db().apply_batch(batch)?;

        debug!(service_id = id, pricing_id, "recorded service");
        Ok(record)
    }

    pub fn get(&self, service_id: u64) -> anyhow::Result<Option<ServiceRecord>> {
        Ok(self.store.get(&keys::service(service_id))?)
    }

    pub fn set_status(&self, service_id: u64, status: ServiceStatus) -> anyhow::Result<ServiceRecord> {
        let key = keys::service(service_id);
        let record = self.store.transaction(|tx| {
            let mut record: ServiceRecord = tx.require(&key, "service", service_id)?;
            record.status = status;
            tx.put(&key, &record)?;
            Ok(record)
        })?;
        Ok(record)
    }

    fn services_under(&self, prefix: &str) -> Result<Vec<ServiceRecord>, PricingError> {
        let mut services = Vec::new();
        for key in self.store.scan_keys(prefix)? {
            let id = service_id_from_key(&key);
            if let Some(record) = self.store.get::<ServiceRecord>(&keys::service(id))? {
                services.push(record);
            }
        }
        Ok(services)
    }
}

fn service_id_from_key(key: &str) -> u64 {
    key.rsplit('/')
        .next()
        .and_then(|id| id.parse().ok())
        .unwrap_or_default()
}

impl ServiceUsageOracle for ServiceLedger {
    fn is_pricing_in_use(&self, pricing_id: u64) -> Result<bool, PricingError> {
        Ok(self
            .services_under(&keys::service_by_pricing_prefix(pricing_id))?
            .iter()
            .any(|service| service.status.is_live()))
    }

    fn is_option_value_in_use(
        &self,
        value_id: u64,
        pricing_id: Option<u64>,
    ) -> Result<bool, PricingError> {
        Ok(self
            .services_under(&keys::service_by_value_prefix(value_id))?
            .iter()
            .filter(|service| service.status.is_live())
            .any(|service| {
                service.options.iter().any(|selected| {
                    selected.value_id == value_id
                        && pricing_id.is_none_or(|pricing| selected.pricing_id == pricing)
                })
            }))
    }

    fn is_pricing_referenced(&self, pricing_id: u64) -> Result<bool, PricingError> {
        Ok(!self
            .services_under(&keys::service_by_pricing_prefix(pricing_id))?
            .is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn ledger() -> (tempfile::TempDir, ServiceLedger) {
        let temp_dir = tempdir().unwrap();
        let db = Arc::new(sled::open(temp_dir.path().join("ledger.db")).unwrap());
        (temp_dir, ServiceLedger::new(db))
    }

    #[test]
    fn canceled_services_do_not_count_as_in_use() {
        let (_dir, ledger) = ledger();
        let service = ledger
            .record_service(7, ServiceStatus::Active, vec![])
            .unwrap();

        assert!(ledger.is_pricing_in_use(7).unwrap());
        assert!(!ledger.is_pricing_in_use(8).unwrap());

        ledger.set_status(service.id, ServiceStatus::Canceled).unwrap();
        assert!(!ledger.is_pricing_in_use(7).unwrap());
        assert!(ledger.is_pricing_referenced(7).unwrap());
    }

    #[test]
    fn option_value_usage_by_pricing() {
        let (_dir, ledger) = ledger();
        ledger
            .record_service(
                1,
                ServiceStatus::Suspended,
                vec![SelectedOption {
                    option_id: 3,
                    value_id: 4,
                    pricing_id: 5,
                    quantity: 1,
                }],
            )
            .unwrap();

        assert!(ledger.is_option_value_in_use(4, None).unwrap());
        assert!(ledger.is_option_value_in_use(4, Some(5)).unwrap());
        assert!(!ledger.is_option_value_in_use(4, Some(6)).unwrap());
        assert!(!ledger.is_option_value_in_use(9, None).unwrap());
    }
}
