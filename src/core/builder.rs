//! 引擎构建器：按配置组装存储、重试协调器、执行器与编排器
//!
//! 命令行与集成测试共用同一套初始化逻辑；组件都可以单独注入替换。

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{AppConfig, BackendKind};
use crate::core::shutdown::{BackgroundTaskCleanup, ExecutorCleanup, JobsCleanup, ShutdownCoordinator};
use crate::core::Result;
use crate::retry::{FixProvider, RetryCoordinator};
use crate::session::{MemoryBackend, SessionBackend, SessionStore, SqliteBackend};
use crate::tools::{ToolExecutor, ToolRegistry, ToolValidator};
use crate::workflow::{Orchestrator, OrchestratorBuilder, ParameterEnricher, ProgressSink, StepKind};

/// 运行中的引擎：各组件共享句柄 + 后台清理任务
pub struct Engine {
    pub orchestrator: Arc<Orchestrator>,
    pub store: Arc<SessionStore>,
    pub executor: Arc<ToolExecutor>,
    pub coordinator: Arc<RetryCoordinator>,
    shutdown: CancellationToken,
    reaper: Option<JoinHandle<()>>,
}

impl Engine {
    /// 按「作业 → 清理任务 → 执行器」顺序注册关闭清理
    pub fn register_cleanups(&mut self, coordinator: &mut ShutdownCoordinator) {
        coordinator.register(JobsCleanup::new(Arc::clone(&self.orchestrator)));
        if let Some(handle) = self.reaper.take() {
            coordinator.register(BackgroundTaskCleanup::new(
                "SessionReaper",
                self.shutdown.clone(),
                handle,
            ));
        }
        coordinator.register(ExecutorCleanup::new(Arc::clone(&self.executor)));
    }

    /// 不经 ShutdownCoordinator 的直接关闭
    pub async fn shutdown(mut self) {
        self.orchestrator.shutdown().await;
        self.shutdown.cancel();
        if let Some(handle) = self.reaper.take() {
            let _ = handle.await;
        }
        self.executor.shutdown().await;
    }
}

pub struct EngineBuilder {
    config: AppConfig,
    registry: ToolRegistry,
    backend: Option<Arc<dyn SessionBackend>>,
    progress: Option<Arc<dyn ProgressSink>>,
    enricher: Option<Arc<dyn ParameterEnricher>>,
    validator: Option<Arc<dyn ToolValidator>>,
    fix_providers: Vec<Arc<dyn FixProvider>>,
    plan: Option<Vec<StepKind>>,
}

impl EngineBuilder {
    pub fn new(config: AppConfig, registry: ToolRegistry) -> Self {
        Self {
            config,
            registry,
            backend: None,
            progress: None,
            enricher: None,
            validator: None,
            fix_providers: Vec::new(),
            plan: None,
        }
    }

    /// 覆盖配置里的 [session].backend
    pub fn with_backend(mut self, backend: Arc<dyn SessionBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn with_progress(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress = Some(sink);
        self
    }

    pub fn with_enricher(mut self, enricher: Arc<dyn ParameterEnricher>) -> Self {
        self.enricher = Some(enricher);
        self
    }

    pub fn with_validator(mut self, validator: Arc<dyn ToolValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn with_fix_provider(mut self, provider: Arc<dyn FixProvider>) -> Self {
        self.fix_providers.push(provider);
        self
    }

    pub fn with_plan(mut self, plan: impl IntoIterator<Item = StepKind>) -> Self {
        self.plan = Some(plan.into_iter().collect());
        self
    }

    fn open_backend(&self) -> Result<Arc<dyn SessionBackend>> {
        if let Some(backend) = &self.backend {
            return Ok(Arc::clone(backend));
        }
        Ok(match self.config.session.backend {
            BackendKind::Sqlite => Arc::new(SqliteBackend::open(&self.config.session.db_path)?),
            BackendKind::Memory => Arc::new(MemoryBackend::new()),
        })
    }

    /// 必须在 tokio 运行时内调用（线程池、指标刷新、会话清理任务会立即启动）
    pub fn build(self) -> Result<Engine> {
        let cfg = &self.config;
        let store = Arc::new(SessionStore::new(
            self.open_backend()?,
            cfg.session.ttl(),
            cfg.session.lock_timeout(),
        ));

        let coordinator = Arc::new(RetryCoordinator::new(cfg.retry.default.clone(), cfg.circuit));
        for (name, policy) in &cfg.retry.policies {
            coordinator.set_policy(name.clone(), policy.clone());
        }
        for provider in &self.fix_providers {
            coordinator.register_fix_provider(Arc::clone(provider));
        }

        let mut executor = ToolExecutor::new(self.registry.clone(), cfg.executor.clone());
        if let Some(validator) = &self.validator {
            executor = executor.with_validator(Arc::clone(validator));
        }
        let executor = Arc::new(executor);

        let mut builder = OrchestratorBuilder::new(Arc::clone(&executor), Arc::clone(&coordinator), Arc::clone(&store))
            .config(cfg.workflow.clone());
        if let Some(plan) = &self.plan {
            builder = builder.plan(plan.iter().copied());
        }
        if let Some(sink) = &self.progress {
            builder = builder.progress(Arc::clone(sink));
        }
        if let Some(enricher) = &self.enricher {
            builder = builder.enricher(Arc::clone(enricher));
        }
        let orchestrator = Arc::new(builder.build()?);

        let shutdown = CancellationToken::new();
        let reaper = (cfg.session.cleanup_interval_secs > 0)
            .then(|| store.spawn_reaper(cfg.session.cleanup_interval(), shutdown.clone()));

        tracing::info!(
            app = %cfg.app.name,
            backend = ?cfg.session.backend,
            workers = cfg.executor.worker_pool_size,
            tools = executor.tool_names().len(),
            "engine ready"
        );
        Ok(Engine {
            orchestrator,
            store,
            executor,
            coordinator,
            shutdown,
            reaper,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendKind;
    use crate::core::ShutdownManager;
    use crate::retry::HeuristicFixProvider;
    use crate::tools::dry_run_registry;
    use crate::workflow::{JobArgs, JobRequest};

    fn memory_config() -> AppConfig {
        let mut cfg = AppConfig::default();
        cfg.session.backend = BackendKind::Memory;
        cfg.executor.worker_pool_size = 2;
        cfg
    }

    #[tokio::test]
    async fn test_engine_runs_job_and_shuts_down() {
        let engine = EngineBuilder::new(memory_config(), dry_run_registry())
            .with_fix_provider(Arc::new(HeuristicFixProvider::new()))
            .build()
            .unwrap();
        assert!(engine.coordinator.has_fix_providers());
        let result = engine
            .orchestrator
            .execute(
                JobRequest::new(JobArgs::new("https://github.com/acme/api")),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(result.success);
        assert!(engine.store.exists(&result.session_id).unwrap());
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_sqlite_backend_from_config() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut cfg = memory_config();
        cfg.session.backend = BackendKind::Sqlite;
        cfg.session.db_path = dir.path().join("nested").join("sessions.db");
        let mut engine = EngineBuilder::new(cfg, dry_run_registry()).build().unwrap();
        assert!(dir.path().join("nested").join("sessions.db").exists());

        let mut coordinator = ShutdownCoordinator::new(Arc::new(ShutdownManager::new()));
        engine.register_cleanups(&mut coordinator);
        assert_eq!(coordinator.task_names(), vec!["Jobs", "SessionReaper", "ToolExecutor"]);
        coordinator.run_cleanup().await;
    }

    #[tokio::test]
    async fn test_policies_from_config() {
        let mut cfg = memory_config();
        let mut push = cfg.retry.default.clone();
        push.max_attempts = 7;
        cfg.retry.policies.insert("push_image".into(), push);
        let engine = EngineBuilder::new(cfg, dry_run_registry()).build().unwrap();
        assert_eq!(engine.coordinator.policy_for("push_image").max_attempts, 7);
        assert_eq!(engine.coordinator.policy_for("build_image").max_attempts, 3);
        engine.shutdown().await;
    }
}
