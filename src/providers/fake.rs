//! A deterministic, in-memory provider for testing apply/fallback logic
//! without real SSH/GCP — the crate's analogue of `VMManager`, grounded on
//! the teacher's own `providers::fake::FakeProvider` test-double shape.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::providers::provider::{InstanceConfig, NodeId, ProviderError};

/// What happens on the next `create()` call.
#[derive(Debug, Clone)]
pub enum CreateBehavior {
    /// Happy path — returns Ok(NodeId).
    Succeed,
    /// Returns Ok(NodeId) after sleeping for the given duration.
    SucceedAfterDelay(Duration),
    /// The requested zone/region has no capacity (fallback-eligible).
    ZoneResourcePoolExhausted,
    /// Quota prevents creation (fallback-eligible).
    QuotaExceeded,
    /// The machine type doesn't exist in this region at all.
    OfferingUnavailable,
    /// General creation failure (not fallback-eligible).
    CreationFailed(String),
    /// Node was created but never joined the cluster within timeout.
    JoinTimeout,
    /// Network/API blowup.
    InternalError(String),
}

/// What happens on the next `delete()` call.
#[derive(Debug, Clone)]
pub enum DeleteBehavior {
    /// Node removed successfully.
    Succeed,
    /// Returns Ok(()) but the node persists (silent no-op).
    Noop,
    /// Deletion failed.
    Fail(String),
}

/// Logged record of a `create()` call.
#[derive(Debug, Clone)]
pub struct CreateCall {
    pub name: String,
    pub region: String,
    pub machine_type: String,
    pub result_node_id: Option<NodeId>,
}

/// Logged record of a `delete()` call.
#[derive(Debug, Clone)]
pub struct DeleteCall {
    pub node_name: String,
}

#[derive(Debug)]
pub(crate) struct FakeProviderState {
    create_behaviors: VecDeque<CreateBehavior>,
    delete_behaviors: VecDeque<DeleteBehavior>,
    default_create: CreateBehavior,
    default_delete: DeleteBehavior,
    pub create_calls: Vec<CreateCall>,
    pub delete_calls: Vec<DeleteCall>,
}

/// Each call to `create()`/`delete()` pops the next behavior from a queue.
/// When the queue is empty, the configured default applies.
#[derive(Debug, Clone)]
pub struct FakeProvider {
    state: Arc<Mutex<FakeProviderState>>,
    next_id: Arc<AtomicU64>,
}

impl Default for FakeProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeProvider {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeProviderState {
                create_behaviors: VecDeque::new(),
                delete_behaviors: VecDeque::new(),
                default_create: CreateBehavior::Succeed,
                default_delete: DeleteBehavior::Succeed,
                create_calls: Vec::new(),
                delete_calls: Vec::new(),
            })),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn on_next_create(self, behavior: CreateBehavior) -> Self {
        self.state.lock().unwrap().create_behaviors.push_back(behavior);
        self
    }

    pub fn on_next_delete(self, behavior: DeleteBehavior) -> Self {
        self.state.lock().unwrap().delete_behaviors.push_back(behavior);
        self
    }

    pub fn with_default_create(self, behavior: CreateBehavior) -> Self {
        self.state.lock().unwrap().default_create = behavior;
        self
    }

    pub fn with_default_delete(self, behavior: DeleteBehavior) -> Self {
        self.state.lock().unwrap().default_delete = behavior;
        self
    }

    pub fn create_calls(&self) -> Vec<CreateCall> {
        self.state.lock().unwrap().create_calls.clone()
    }

    pub fn delete_calls(&self) -> Vec<DeleteCall> {
        self.state.lock().unwrap().delete_calls.clone()
    }

    fn next_node_id(&self) -> NodeId {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed);
        NodeId(format!("fake-node-{n}"))
    }

    pub async fn create(&self, name: &str, config: &InstanceConfig) -> Result<NodeId, ProviderError> {
        let behavior = {
            let mut state = self.state.lock().unwrap();
            state.create_behaviors.pop_front().unwrap_or_else(|| state.default_create.clone())
        };

        let result = match behavior {
            CreateBehavior::Succeed => Ok(self.next_node_id()),
            CreateBehavior::SucceedAfterDelay(d) => {
                tokio::time::sleep(d).await;
                Ok(self.next_node_id())
            }
            CreateBehavior::ZoneResourcePoolExhausted => Err(ProviderError::ZoneResourcePoolExhausted {
                region: config.region.clone(),
                machine_type: config.machine_type.clone(),
            }),
            CreateBehavior::QuotaExceeded => Err(ProviderError::QuotaExceeded {
                region: config.region.clone(),
                machine_type: config.machine_type.clone(),
            }),
            CreateBehavior::OfferingUnavailable => {
                Err(ProviderError::OfferingUnavailable(config.machine_type.clone()))
            }
            CreateBehavior::CreationFailed(msg) => Err(ProviderError::CreationFailed { message: msg }),
            CreateBehavior::JoinTimeout => Err(ProviderError::JoinTimeout { node_id: None }),
            CreateBehavior::InternalError(msg) => Err(ProviderError::Internal(anyhow::anyhow!(msg))),
        };

        let result_node_id = result.as_ref().ok().cloned();
        self.state.lock().unwrap().create_calls.push(CreateCall {
            name: name.to_string(),
            region: config.region.clone(),
            machine_type: config.machine_type.clone(),
            result_node_id,
        });

        result
    }

    pub async fn delete(&self, node_name: &str) -> Result<(), ProviderError> {
        let behavior = {
            let mut state = self.state.lock().unwrap();
            state.delete_behaviors.pop_front().unwrap_or_else(|| state.default_delete.clone())
        };

        self.state.lock().unwrap().delete_calls.push(DeleteCall {
            node_name: node_name.to_string(),
        });

        match behavior {
            DeleteBehavior::Succeed | DeleteBehavior::Noop => Ok(()),
            DeleteBehavior::Fail(msg) => Err(ProviderError::CreationFailed { message: msg }),
        }
    }
}
