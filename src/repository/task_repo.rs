//! Task repository (部署任务数据访问)

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use uuid::Uuid;

use crate::{error::AppError, models::task::*};

/// 部署任务存储接口
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// 保存任务快照（覆盖同 id 的旧记录）
    async fn save(&self, task: &DeploymentTask) -> Result<(), AppError>;

    /// 获取任务
    async fn get(&self, id: Uuid) -> Result<Option<DeploymentTask>, AppError>;

    /// 列出任务，可按目标主机过滤，按创建时间倒序
    async fn list(&self, target_id: Option<&str>) -> Result<Vec<DeploymentTask>, AppError>;
}

/// 内存任务存储
#[derive(Clone, Default)]
pub struct InMemoryTaskStore {
    tasks: Arc<DashMap<Uuid, DeploymentTask>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn save(&self, task: &DeploymentTask) -> Result<(), AppError> {
        self.tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<DeploymentTask>, AppError> {
        Ok(self.tasks.get(&id).map(|entry| entry.value().clone()))
    }

    async fn list(&self, target_id: Option<&str>) -> Result<Vec<DeploymentTask>, AppError> {
        let mut tasks: Vec<DeploymentTask> = self
            .tasks
            .iter()
            .filter(|entry| target_id.map_or(true, |id| entry.value().target_id == id))
            .map(|entry| entry.value().clone())
            .collect();

        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(tasks)
    }
}
