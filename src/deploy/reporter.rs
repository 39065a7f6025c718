//! 任务上报
//! 每次修改任务后发布事件，并把快照交给存储

use std::sync::Arc;

use tracing::warn;

use crate::models::{DeploymentTask, ExecutionResult, LogEntry, TaskStatus};
use crate::realtime::{DeploymentEvent, EventBus};
use crate::repository::TaskStore;

/// 持有运行中的任务，统一处理日志、进度与状态变更
pub struct TaskReporter {
    task: DeploymentTask,
    events: Option<EventBus>,
    store: Option<Arc<dyn TaskStore>>,
}

impl TaskReporter {
    pub fn new(task: DeploymentTask) -> Self {
        Self {
            task,
            events: None,
            store: None,
        }
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn task(&self) -> &DeploymentTask {
        &self.task
    }

    pub fn into_task(self) -> DeploymentTask {
        self.task
    }

    pub async fn log(&mut self, entry: LogEntry) {
        self.publish(DeploymentEvent::Log {
            task_id: self.task.id,
            entry: entry.clone(),
        });
        self.task.append_log(entry);
        self.persist().await;
    }

    /// 上报进度（单调不减）
    pub async fn progress(&mut self, fraction: f64, last_result: Option<ExecutionResult>) {
        let previous = self.task.progress;
        let current = self.task.set_progress(fraction);
        if let Some(result) = &last_result {
            self.task.last_result = Some(result.clone());
        }
        if current == previous && last_result.is_none() {
            return;
        }

        self.publish(DeploymentEvent::Progress {
            task_id: self.task.id,
            fraction: current,
            last_result,
        });
        self.persist().await;
    }

    pub async fn start(&mut self) {
        let old = self.task.status;
        self.task.start();
        self.status_changed(old).await;
    }

    pub async fn complete(&mut self) {
        let old = self.task.status;
        self.task.complete();
        self.status_changed(old).await;
    }

    pub async fn fail(&mut self, error: impl Into<String>) {
        let old = self.task.status;
        self.task.fail(error);
        self.status_changed(old).await;
    }

    pub async fn cancel(&mut self) {
        let old = self.task.status;
        self.task.cancel();
        self.status_changed(old).await;
    }

    async fn status_changed(&mut self, old_status: TaskStatus) {
        if self.task.status == old_status {
            return;
        }
        self.publish(DeploymentEvent::TaskStatusChanged {
            task_id: self.task.id,
            old_status,
            new_status: self.task.status,
        });
        self.persist().await;
    }

    fn publish(&self, event: DeploymentEvent) {
        if let Some(events) = &self.events {
            events.publish(event);
        }
    }

    async fn persist(&self) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save(&self.task).await {
                warn!(task_id = %self.task.id, error = %e, "Failed to hand off task snapshot");
            }
        }
    }
}
