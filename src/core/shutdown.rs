//! 关闭流程
//!
//! 信号（Ctrl+C / SIGTERM）取消全局令牌，运行中的作业随之收尾并写回最终状态；
//! 随后 ShutdownCoordinator 按注册顺序执行清理，每个清理都有超时上限。

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::tools::ToolExecutor;
use crate::workflow::Orchestrator;

/// 持有全局关闭令牌，并把系统信号接到令牌上
#[derive(Debug, Clone, Default)]
pub struct ShutdownManager {
    token: CancellationToken,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 作业以此为父令牌
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn trigger(&self, reason: &str) {
        if !self.token.is_cancelled() {
            tracing::info!(reason, "shutdown requested");
            self.token.cancel();
        }
    }

    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                manager.trigger("ctrl_c");
            }
        });

        #[cfg(unix)]
        {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    manager.trigger("sigterm");
                }
            });
        }
    }
}

#[async_trait::async_trait]
pub trait ShutdownCleanup: Send + Sync {
    async fn cleanup(&self) -> anyhow::Result<()>;

    fn name(&self) -> &'static str;
}

/// 按注册顺序执行清理；单个清理超时或失败只记日志，不影响后面的任务
pub struct ShutdownCoordinator {
    manager: Arc<ShutdownManager>,
    tasks: Vec<Box<dyn ShutdownCleanup>>,
    timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(manager: Arc<ShutdownManager>) -> Self {
        Self {
            manager,
            tasks: Vec::new(),
            timeout: Duration::from_secs(5),
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout = Duration::from_secs(secs);
        self
    }

    pub fn register<T: ShutdownCleanup + 'static>(&mut self, task: T) {
        self.tasks.push(Box::new(task));
    }

    /// 先取消全局令牌，再依次清理
    pub async fn run_cleanup(&self) {
        self.manager.trigger("cleanup");
        for task in &self.tasks {
            let name = task.name();
            match tokio::time::timeout(self.timeout, task.cleanup()).await {
                Ok(Ok(())) => tracing::debug!(task = name, "cleanup done"),
                Ok(Err(e)) => tracing::warn!(task = name, error = %e, "cleanup failed"),
                Err(_) => tracing::warn!(
                    task = name,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "cleanup timed out"
                ),
            }
        }
        tracing::info!(tasks = self.tasks.len(), "shutdown complete");
    }

    pub fn task_names(&self) -> Vec<&'static str> {
        self.tasks.iter().map(|t| t.name()).collect()
    }
}

/// 作业清理：取消所有运行中的作业并关闭进度通道
pub struct JobsCleanup {
    orchestrator: Arc<Orchestrator>,
}

impl JobsCleanup {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for JobsCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        let active = self.orchestrator.supervisor().active_jobs();
        if !active.is_empty() {
            tracing::info!(jobs = active.len(), "cancelling running jobs");
        }
        self.orchestrator.shutdown().await;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "Jobs"
    }
}

/// 执行器清理：停止线程池、停止指标刷新并刷出剩余指标
pub struct ExecutorCleanup {
    executor: Arc<ToolExecutor>,
}

impl ExecutorCleanup {
    pub fn new(executor: Arc<ToolExecutor>) -> Self {
        Self { executor }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for ExecutorCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        self.executor.shutdown().await;
        let stats = self.executor.stats();
        tracing::info!(
            total = stats.total_executions,
            failed = stats.failed_executions,
            cache_hits = stats.cache_hits,
            "tool executor stopped"
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "ToolExecutor"
    }
}

/// 后台任务清理：取消令牌后等待任务退出
pub struct BackgroundTaskCleanup {
    name: &'static str,
    token: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl BackgroundTaskCleanup {
    pub fn new(name: &'static str, token: CancellationToken, handle: JoinHandle<()>) -> Self {
        Self {
            name,
            token,
            handle: Mutex::new(Some(handle)),
        }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for BackgroundTaskCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        self.token.cancel();
        let handle = self.handle.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            handle
                .await
                .with_context(|| format!("background task '{}' did not exit cleanly", self.name))?;
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Flag(Arc<AtomicBool>);

    #[async_trait::async_trait]
    impl ShutdownCleanup for Flag {
        async fn cleanup(&self) -> anyhow::Result<()> {
            self.0.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn name(&self) -> &'static str {
            "Flag"
        }
    }

    #[tokio::test]
    async fn test_cleanup_cancels_job_token() {
        let manager = Arc::new(ShutdownManager::new());
        let job = manager.token().child_token();
        let called = Arc::new(AtomicBool::new(false));
        let mut coordinator = ShutdownCoordinator::new(Arc::clone(&manager));
        coordinator.register(Flag(Arc::clone(&called)));

        coordinator.run_cleanup().await;
        assert!(job.is_cancelled());
        assert!(called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_background_task_cleanup_stops_task() {
        let token = CancellationToken::new();
        let child = token.clone();
        let handle = tokio::spawn(async move { child.cancelled().await });
        let cleanup = BackgroundTaskCleanup::new("Reaper", token.clone(), handle);
        cleanup.cleanup().await.unwrap();
        assert!(token.is_cancelled());
        // 第二次调用没有可等待的任务
        cleanup.cleanup().await.unwrap();
    }

    struct Stuck;

    #[async_trait::async_trait]
    impl ShutdownCleanup for Stuck {
        async fn cleanup(&self) -> anyhow::Result<()> {
            std::future::pending::<()>().await;
            Ok(())
        }

        fn name(&self) -> &'static str {
            "Stuck"
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_cleanup_times_out_and_later_tasks_run() {
        let mut coordinator = ShutdownCoordinator::new(Arc::new(ShutdownManager::new())).with_timeout(1);
        let called = Arc::new(AtomicBool::new(false));
        coordinator.register(Stuck);
        coordinator.register(Flag(Arc::clone(&called)));
        assert_eq!(coordinator.task_names(), vec!["Stuck", "Flag"]);
        coordinator.run_cleanup().await;
        assert!(called.load(Ordering::SeqCst));
    }
}
