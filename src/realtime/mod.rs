//! 部署事件推送
//! 执行器只负责发布日志与进度事件，展示层自行订阅

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::models::{ExecutionResult, LogEntry, TaskStatus};

/// 部署事件
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeploymentEvent {
    /// 任务状态变更
    TaskStatusChanged {
        task_id: Uuid,
        old_status: TaskStatus,
        new_status: TaskStatus,
    },
    /// 日志条目
    Log { task_id: Uuid, entry: LogEntry },
    /// 进度更新
    Progress {
        task_id: Uuid,
        fraction: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        last_result: Option<ExecutionResult>,
    },
}

impl DeploymentEvent {
    pub fn task_id(&self) -> Uuid {
        match self {
            DeploymentEvent::TaskStatusChanged { task_id, .. }
            | DeploymentEvent::Log { task_id, .. }
            | DeploymentEvent::Progress { task_id, .. } => *task_id,
        }
    }

    /// 获取事件类型名称
    pub fn event_type(&self) -> &str {
        match self {
            DeploymentEvent::TaskStatusChanged { .. } => "task_status_changed",
            DeploymentEvent::Log { .. } => "log",
            DeploymentEvent::Progress { .. } => "progress",
        }
    }

    /// 序列化为 JSON 文本
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            serde_json::json!({ "type": "error", "message": e.to_string() }).to_string()
        })
    }
}

/// 事件总线
#[derive(Clone)]
pub struct EventBus {
    /// 广播发送器（用于向所有订阅者发送事件）
    sender: broadcast::Sender<DeploymentEvent>,
}

impl EventBus {
    /// 创建新的事件总线
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// 发布事件，返回接收者数量；没有订阅者时事件直接丢弃
    pub fn publish(&self, event: DeploymentEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    /// 订阅全部事件
    pub fn subscribe(&self) -> broadcast::Receiver<DeploymentEvent> {
        self.sender.subscribe()
    }

    /// 订阅特定任务的事件
    pub fn subscribe_to_task(&self, task_id: Uuid) -> TaskEventStream {
        TaskEventStream {
            receiver: self.subscribe(),
            task_id,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// 任务事件流（过滤特定任务的事件）
pub struct TaskEventStream {
    receiver: broadcast::Receiver<DeploymentEvent>,
    task_id: Uuid,
}

impl TaskEventStream {
    /// 接收下一个属于该任务的事件；总线关闭时返回 None
    pub async fn recv(&mut self) -> Option<DeploymentEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if event.task_id() == self.task_id => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(task_id = %self.task_id, skipped, "Event subscriber lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// 非阻塞地取出当前已到达的该任务事件
    pub fn drain(&mut self) -> Vec<DeploymentEvent> {
        let mut events = Vec::new();
        loop {
            match self.receiver.try_recv() {
                Ok(event) if event.task_id() == self.task_id => events.push(event),
                Ok(_) | Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return events,
            }
        }
    }
}
