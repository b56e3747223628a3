use anyhow::Context;
use async_trait::async_trait;
use dashmap::DashMap;
use std::path::Path;
use std::sync::Arc;

use crate::models::{BuyerConfig, BuyerServiceConfig, LeadData};
use crate::response_parser::{ResponseMappingConfig, ResponseMappingSource};

/// Read-mostly store of buyer configurations.
///
/// Writes replace a whole `BuyerConfig` by id; readers holding an `Arc` keep
/// seeing the snapshot they started with.
#[derive(Default)]
pub struct BuyerRegistry {
    buyers: DashMap<String, Arc<BuyerConfig>>,
}

impl BuyerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_buyers(buyers: impl IntoIterator<Item = BuyerConfig>) -> Self {
        let registry = Self::new();
        for buyer in buyers {
            registry.upsert(buyer);
        }
        registry
    }

    /// Loads a JSON array of buyer configurations.
    pub fn from_json_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading buyer config {}", path.display()))?;
        let buyers: Vec<BuyerConfig> = serde_json::from_str(&raw)
            .with_context(|| format!("parsing buyer config {}", path.display()))?;

        tracing::info!("Loaded {} buyer(s) from {}", buyers.len(), path.display());
        Ok(Self::from_buyers(buyers))
    }

    /// Atomically replaces the buyer with the same id.
    pub fn upsert(&self, buyer: BuyerConfig) -> Option<Arc<BuyerConfig>> {
        self.buyers.insert(buyer.id.clone(), Arc::new(buyer))
    }

    pub fn remove(&self, buyer_id: &str) -> Option<Arc<BuyerConfig>> {
        self.buyers.remove(buyer_id).map(|(_, buyer)| buyer)
    }

    pub fn get(&self, buyer_id: &str) -> Option<Arc<BuyerConfig>> {
        self.buyers.get(buyer_id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn len(&self) -> usize {
        self.buyers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buyers.is_empty()
    }

    /// Active buyers whose active service config accepts this lead, highest
    /// priority first. Ties order by buyer id so the result is stable.
    pub fn eligible_buyers(&self, lead: &LeadData) -> Vec<Arc<BuyerConfig>> {
        let mut eligible: Vec<(u32, Arc<BuyerConfig>)> = self
            .buyers
            .iter()
            .filter_map(|entry| {
                let buyer = entry.value();
                let service = eligible_service(buyer, lead)?;
                Some((service.priority, Arc::clone(buyer)))
            })
            .collect();

        eligible.sort_by(|(pa, a), (pb, b)| pb.cmp(pa).then_with(|| a.id.cmp(&b.id)));
        eligible.into_iter().map(|(_, buyer)| buyer).collect()
    }

    /// Fresh eligibility check against the live configuration.
    pub fn is_eligible(&self, buyer_id: &str, lead: &LeadData) -> bool {
        self.get(buyer_id)
            .is_some_and(|buyer| eligible_service(&buyer, lead).is_some())
    }
}

/// The buyer's service config for this lead, if buyer, service and
/// restrictions all admit it.
pub fn eligible_service<'a>(
    buyer: &'a BuyerConfig,
    lead: &LeadData,
) -> Option<&'a BuyerServiceConfig> {
    if !buyer.active {
        return None;
    }
    let service = buyer
        .service_config(&lead.service_type_id)
        .filter(|s| s.active)?;

    if let Some(restrictions) = &service.restrictions {
        let zip = lead.zip_code.trim();
        if !restrictions.zip_prefixes.is_empty()
            && !restrictions
                .zip_prefixes
                .iter()
                .any(|prefix| zip.starts_with(prefix.trim()))
        {
            return None;
        }

        let compliance = lead.compliance.as_ref();
        if restrictions.require_trusted_form && !compliance.is_some_and(|c| c.has_trusted_form()) {
            return None;
        }
        if restrictions.require_jornaya && !compliance.is_some_and(|c| c.has_jornaya()) {
            return None;
        }
        if restrictions.require_tcpa_consent && !compliance.is_some_and(|c| c.tcpa_consent) {
            return None;
        }
    }
    Some(service)
}

#[async_trait]
impl ResponseMappingSource for BuyerRegistry {
    async fn load(&self, buyer_id: &str) -> Option<ResponseMappingConfig> {
        self.get(buyer_id)
            .and_then(|buyer| buyer.response_mapping.clone())
    }
}
