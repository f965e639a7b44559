//! VM provider collaborator: the boundary between a `Plan`'s hypothetical
//! nodes and whatever actually creates/destroys VMs.
//!
//! Grounded on the teacher's own `provider.rs` (`NodeId`, `ProviderError`,
//! the `Provider` enum dispatch shape), extended with the fallback-relevant
//! error variants named by `scheduler.py::_try_create_with_fallback`'s
//! string-matching on `ZONE_RESOURCE_POOL_EXHAUSTED`/`QUOTA_EXCEEDED`.

use crate::providers::fake::FakeProvider;
use crate::providers::gcp::GcpProvider;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeId(pub String);

/// Where and what to create: a concrete zone or a region left for the
/// provider to pick a zone within (mirrors `VMManager._choose_zone`, which
/// accepts either and disambiguates on `len(location.split('-')) == 2`).
#[derive(Debug, Clone)]
pub struct InstanceConfig {
    pub region: String,
    pub machine_type: String,
    pub disk_size_gb: u32,
}

impl InstanceConfig {
    pub fn new(region: impl Into<String>, machine_type: impl Into<String>) -> Self {
        InstanceConfig {
            region: region.into(),
            machine_type: machine_type.into(),
            disk_size_gb: 20,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// The provider couldn't create the resource at all.
    /// Bad permissions, invalid config, etc.
    #[error("creation failed: {message}")]
    CreationFailed { message: String },

    /// The requested zone/region has no capacity for this machine type
    /// right now. Distinguished from `CreationFailed` so the apply layer
    /// can drive same-price region fallback.
    #[error("zone resource pool exhausted for {machine_type} in {region}")]
    ZoneResourcePoolExhausted { region: String, machine_type: String },

    /// Project/region quota prevents creation. Also fallback-eligible.
    #[error("quota exceeded for {machine_type} in {region}")]
    QuotaExceeded { region: String, machine_type: String },

    /// Resource was created but the node never joined the cluster.
    #[error("node failed to join cluster within timeout: {node_id:?}")]
    JoinTimeout { node_id: Option<NodeId> },

    /// The requested machine type isn't available in this region at all.
    #[error("offering unavailable: {0}")]
    OfferingUnavailable(String),

    /// Underlying API/network error.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ProviderError {
    /// Whether this failure is the kind `_try_create_with_fallback` retries
    /// in an alternate same-price region, rather than propagating.
    pub fn is_fallback_eligible(&self) -> bool {
        matches!(
            self,
            ProviderError::ZoneResourcePoolExhausted { .. } | ProviderError::QuotaExceeded { .. }
        )
    }
}

/// Provide/destroy compute nodes from a given backend — GCP Compute Engine
/// in production, an in-memory fake in tests.
#[derive(Clone)]
pub enum Provider {
    Gcp(GcpProvider),
    Fake(FakeProvider),
}

impl Provider {
    /// Create a VM named `name` per `config`, bootstrap it onto the
    /// cluster, and return its provider-assigned id once it is running.
    pub async fn create(&self, name: &str, config: &InstanceConfig) -> Result<NodeId, ProviderError> {
        match self {
            Self::Gcp(p) => p.create(name, config).await,
            Self::Fake(p) => p.create(name, config).await,
        }
    }

    /// Drain and destroy the VM backing `node_name`.
    pub async fn delete(&self, node_name: &str) -> Result<(), ProviderError> {
        match self {
            Self::Gcp(p) => p.delete(node_name).await,
            Self::Fake(p) => p.delete(node_name).await,
        }
    }
}
