//! 编排器构建器
//!
//! 流式组装 Orchestrator，build 时校验计划：每个步骤都有已注册的工具、无重复、依赖在前、无环。

use std::sync::Arc;

use crate::core::{Result, WorkflowError};
use crate::retry::RetryCoordinator;
use crate::session::SessionStore;
use crate::tools::ToolExecutor;
use crate::workflow::enrich::ParameterEnricher;
use crate::workflow::graph::validate_plan;
use crate::workflow::orchestrator::{Orchestrator, WorkflowConfig};
use crate::workflow::progress::{LogProgressSink, ProgressSink};
use crate::workflow::step::StepKind;
use crate::workflow::supervisor::JobSupervisor;

pub struct OrchestratorBuilder {
    executor: Arc<ToolExecutor>,
    coordinator: Arc<RetryCoordinator>,
    store: Arc<SessionStore>,
    plan: Vec<StepKind>,
    progress: Arc<dyn ProgressSink>,
    enricher: Option<Arc<dyn ParameterEnricher>>,
    supervisor: Option<Arc<JobSupervisor>>,
    config: WorkflowConfig,
}

impl OrchestratorBuilder {
    /// 默认计划为全部 11 个步骤，进度写日志
    pub fn new(executor: Arc<ToolExecutor>, coordinator: Arc<RetryCoordinator>, store: Arc<SessionStore>) -> Self {
        Self {
            executor,
            coordinator,
            store,
            plan: StepKind::all().to_vec(),
            progress: Arc::new(LogProgressSink),
            enricher: None,
            supervisor: None,
            config: WorkflowConfig::default(),
        }
    }

    pub fn plan(mut self, plan: impl IntoIterator<Item = StepKind>) -> Self {
        self.plan = plan.into_iter().collect();
        self
    }

    pub fn progress(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress = sink;
        self
    }

    pub fn enricher(mut self, enricher: Arc<dyn ParameterEnricher>) -> Self {
        self.enricher = Some(enricher);
        self
    }

    /// 多个编排器共享同一监管器时传入
    pub fn supervisor(mut self, supervisor: Arc<JobSupervisor>) -> Self {
        self.supervisor = Some(supervisor);
        self
    }

    pub fn config(mut self, config: WorkflowConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<Orchestrator> {
        if self.plan.is_empty() {
            return Err(WorkflowError::InvalidRequest("plan has no steps".to_string()));
        }
        for step in &self.plan {
            if self.executor.get_tool(step.name()).is_none() {
                return Err(WorkflowError::MissingStep(step.to_string()));
            }
        }
        validate_plan(&self.plan, |s| s.depends_on().to_vec())?;
        tracing::debug!(steps = self.plan.len(), "orchestrator plan validated");

        Ok(Orchestrator {
            executor: self.executor,
            coordinator: self.coordinator,
            store: self.store,
            plan: self.plan,
            progress: self.progress,
            enricher: self.enricher,
            supervisor: self.supervisor.unwrap_or_default(),
            config: self.config,
        })
    }
}
