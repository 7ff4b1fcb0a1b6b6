use async_trait::async_trait;
use flowcore::{InstanceId, InstanceState, StoreError, WorkflowStatus};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Persistence backend for instance snapshots
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Insert or replace the snapshot of an instance.
    async fn save(&self, state: &InstanceState) -> Result<(), StoreError>;

    async fn load(&self, id: InstanceId) -> Result<InstanceState, StoreError>;

    /// Snapshots, optionally filtered by status.
    async fn list(&self, status: Option<WorkflowStatus>) -> Result<Vec<InstanceState>, StoreError>;

    async fn remove(&self, id: InstanceId) -> Result<(), StoreError>;
}

/// In-process store; snapshots are lost when the process exits
#[derive(Default)]
pub struct MemoryStateStore {
    instances: RwLock<HashMap<InstanceId, InstanceState>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn save(&self, state: &InstanceState) -> Result<(), StoreError> {
        self.instances.write().await.insert(state.id, state.clone());
        Ok(())
    }

    async fn load(&self, id: InstanceId) -> Result<InstanceState, StoreError> {
        self.instances
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn list(&self, status: Option<WorkflowStatus>) -> Result<Vec<InstanceState>, StoreError> {
        let instances = self.instances.read().await;
        let mut states: Vec<InstanceState> = instances
            .values()
            .filter(|s| status.map_or(true, |wanted| s.status == wanted))
            .cloned()
            .collect();
        states.sort_by_key(|s| s.created_at);
        Ok(states)
    }

    async fn remove(&self, id: InstanceId) -> Result<(), StoreError> {
        self.instances
            .write()
            .await
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }
}
