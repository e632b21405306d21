//! Audit mirror for instances and saga executions
//!
//! The engine and orchestrator keep their own state in memory; every change
//! is also written here so history stays queryable by id. A failed write is
//! logged by the caller and never blocks a transition or a saga.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::engine::Instance;
use crate::saga::SagaExecution;

#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn save_instance(&self, instance: &Instance) -> Result<()>;
    async fn save_execution(&self, execution: &SagaExecution) -> Result<()>;
    async fn load_instance(&self, id: &str) -> Result<Option<Instance>>;
    async fn load_execution(&self, execution_id: &str) -> Result<Option<SagaExecution>>;
}

/// Default in-process mirror.
#[derive(Debug, Default)]
pub struct InMemoryAuditStore {
    instances: RwLock<HashMap<String, Instance>>,
    executions: RwLock<HashMap<String, SagaExecution>>,
}

impl InMemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn instance_count(&self) -> usize {
        self.instances.read().await.len()
    }

    pub async fn execution_count(&self) -> usize {
        self.executions.read().await.len()
    }
}

#[async_trait]
impl AuditStore for InMemoryAuditStore {
    async fn save_instance(&self, instance: &Instance) -> Result<()> {
        self.instances
            .write()
            .await
            .insert(instance.id.clone(), instance.clone());
        Ok(())
    }

    async fn save_execution(&self, execution: &SagaExecution) -> Result<()> {
        self.executions
            .write()
            .await
            .insert(execution.execution_id.clone(), execution.clone());
        Ok(())
    }

    async fn load_instance(&self, id: &str) -> Result<Option<Instance>> {
        Ok(self.instances.read().await.get(id).cloned())
    }

    async fn load_execution(&self, execution_id: &str) -> Result<Option<SagaExecution>> {
        Ok(self.executions.read().await.get(execution_id).cloned())
    }
}
