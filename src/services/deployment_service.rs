//! 部署服务层
//! 提交、取消、查询部署任务；每次提交在后台执行一次完整的部署运行

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::deploy::{parse, CommandGroup, DeploymentExecutor, TaskReporter};
use crate::error::{AppError, Result};
use crate::models::{DeploymentRequest, DeploymentTask, LogEntry, Target};
use crate::pool::PoolStats;
use crate::realtime::{EventBus, TaskEventStream};
use crate::repository::TaskStore;
use crate::services::template::TemplateCatalog;

/// 运行中任务的控制句柄；`done` 在运行结束时写入最终快照
struct RunHandle {
    cancel: CancellationToken,
    done: watch::Receiver<Option<DeploymentTask>>,
}

impl RunHandle {
    fn is_finished(&self) -> bool {
        self.done.borrow().is_some()
    }
}

/// 部署服务
#[derive(Clone)]
pub struct DeploymentService {
    executor: DeploymentExecutor,
    store: Arc<dyn TaskStore>,
    templates: Arc<dyn TemplateCatalog>,
    event_bus: EventBus,
    runs: Arc<DashMap<Uuid, RunHandle>>,
}

impl DeploymentService {
    /// 创建新的部署服务
    pub fn new(
        executor: DeploymentExecutor,
        store: Arc<dyn TaskStore>,
        templates: Arc<dyn TemplateCatalog>,
    ) -> Self {
        Self {
            executor,
            store,
            templates,
            event_bus: EventBus::new(1000),
            runs: Arc::new(DashMap::new()),
        }
    }

    /// 设置事件总线（用于外部注入）
    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = event_bus;
        self
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    /// 提交部署，返回任务 ID
    #[instrument(skip(self, request), fields(target_id = %request.target.id))]
    pub async fn submit(&self, request: DeploymentRequest) -> Result<Uuid> {
        request.validate()?;

        let commands = self.resolve_commands(&request)?;
        let groups = parse(&commands);
        if groups.is_empty() {
            return Err(AppError::validation("No executable commands in deployment"));
        }

        let mut task = DeploymentTask::new(
            request.target.id.clone(),
            commands,
            request.variables.clone(),
        );
        if let Some(template_id) = &request.template_id {
            task = task.with_template(template_id.clone());
        }
        let task_id = task.id;
        self.store.save(&task).await?;

        info!(
            task_id = %task_id,
            groups = groups.len(),
            template = ?request.template_id,
            "Deployment submitted"
        );

        let reporter = TaskReporter::new(task)
            .with_events(self.event_bus.clone())
            .with_store(self.store.clone());
        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(None);

        self.runs.insert(
            task_id,
            RunHandle {
                cancel: cancel.clone(),
                done: done_rx,
            },
        );

        let executor = self.executor.clone();
        let runs = self.runs.clone();
        tokio::spawn(async move {
            let task = run_deployment(
                executor,
                request.target,
                groups,
                request.variables,
                reporter,
                cancel,
            )
            .await;
            done_tx.send_replace(Some(task));
            // 最终快照已写入存储，之后的查询与等待改由存储应答
            runs.remove(&task_id);
        });

        Ok(task_id)
    }

    fn resolve_commands(&self, request: &DeploymentRequest) -> Result<Vec<String>> {
        match &request.template_id {
            Some(template_id) => {
                let template = self
                    .templates
                    .get(template_id)
                    .ok_or_else(|| AppError::not_found(&format!("template {}", template_id)))?;
                template.render(&request.variables)
            }
            None if request.commands.is_empty() => Err(AppError::validation(
                "Either commands or template_id is required",
            )),
            None => Ok(request.commands.clone()),
        }
    }

    /// 取消运行中的任务；任务已结束时返回 false
    pub async fn cancel(&self, task_id: Uuid) -> Result<bool> {
        if let Some(run) = self.runs.get(&task_id) {
            if run.is_finished() || run.cancel.is_cancelled() {
                return Ok(false);
            }
            info!(task_id = %task_id, "Cancelling deployment");
            run.cancel.cancel();
            return Ok(true);
        }

        match self.store.get(task_id).await? {
            Some(_) => Ok(false),
            None => Err(AppError::not_found(&format!("task {}", task_id))),
        }
    }

    /// 等待任务结束并返回最终快照；可被多个调用方同时等待
    pub async fn wait(&self, task_id: Uuid) -> Result<DeploymentTask> {
        // 不能跨 await 持有 DashMap 的引用
        let done = self.runs.get(&task_id).map(|run| run.done.clone());
        let Some(mut done) = done else {
            return self.get_task(task_id).await;
        };

        let finished = done.wait_for(Option::is_some).await.map_err(|_| {
            error!(task_id = %task_id, "Deployment run aborted before finishing");
            AppError::internal_error("Deployment task aborted")
        })?;
        finished
            .clone()
            .ok_or_else(|| AppError::internal_error("Deployment task aborted"))
    }

    /// 仍在运行的任务数
    pub fn active_runs(&self) -> usize {
        self.runs.len()
    }

    /// 查询任务
    pub async fn get_task(&self, task_id: Uuid) -> Result<DeploymentTask> {
        self.store
            .get(task_id)
            .await?
            .ok_or_else(|| AppError::not_found(&format!("task {}", task_id)))
    }

    /// 列出任务
    pub async fn list_tasks(&self, target_id: Option<&str>) -> Result<Vec<DeploymentTask>> {
        self.store.list(target_id).await
    }

    /// 订阅任务事件
    pub fn subscribe(&self, task_id: Uuid) -> TaskEventStream {
        self.event_bus.subscribe_to_task(task_id)
    }

    /// 连接池统计
    pub async fn pool_stats(&self) -> PoolStats {
        self.executor.pool().stats().await
    }

    /// 取消全部运行并关闭连接池
    pub async fn shutdown(&self) {
        for run in self.runs.iter() {
            run.cancel.cancel();
        }
        self.executor.pool().shutdown().await;
    }
}

/// 一次完整的部署运行
async fn run_deployment(
    executor: DeploymentExecutor,
    target: Target,
    groups: Vec<CommandGroup>,
    variables: std::collections::HashMap<String, String>,
    mut reporter: TaskReporter,
    cancel: CancellationToken,
) -> DeploymentTask {
    reporter.start().await;
    let task_id = reporter.task().id;

    match executor
        .run(&target, &groups, variables, &mut reporter, &cancel)
        .await
    {
        Ok(outputs) => {
            reporter.complete().await;
            metrics::counter!("deploy_runs_total", "status" => "completed").increment(1);
            info!(task_id = %task_id, groups = outputs.len(), "Deployment completed");
        }
        Err(AppError::Cancelled) => {
            reporter.log(LogEntry::warning("Deployment cancelled")).await;
            reporter.cancel().await;
            metrics::counter!("deploy_runs_total", "status" => "cancelled").increment(1);
            info!(task_id = %task_id, "Deployment cancelled");
        }
        Err(e) => {
            let reason = e.failure_reason();
            reporter
                .log(LogEntry::warning(format!(
                    "Diagnosis: {}",
                    reason.diagnostic_hint()
                )))
                .await;
            reporter.fail(e.to_string()).await;
            metrics::counter!("deploy_runs_total", "status" => "failed").increment(1);
            warn!(
                task_id = %task_id,
                error_code = e.error_code(),
                reason = ?reason,
                error = %e,
                "Deployment failed"
            );
        }
    }

    reporter.into_task()
}
