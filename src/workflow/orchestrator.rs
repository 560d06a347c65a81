//! 工作流编排器
//!
//! 一次作业的主循环：
//! 1. 在作业监管器登记（同一会话不可并发），加会话锁取得或创建会话，从 `workflow_state` 恢复进度
//! 2. 从第一个未完成的步骤开始，逐步：参数增强 → 重试协调器（策略 + 熔断）→ 工具执行器
//! 3. 每步完成后写回状态槽位、持久化进度、上报进度（有超时上限，失败只记日志）
//! 4. 步骤失败进入修复模式；允许修复且有修复提供者时经 fix 路径再跑一轮，否则终止
//!
//! 整个作业受截止时间约束，超时以 DeadlineExceeded 终止。失败的作业返回已完成部分与 JobError。

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::core::{Result, WorkflowError};
use crate::retry::policy::duration_ms;
use crate::retry::{AttemptRecord, Metadata, RetryContext, RetryCoordinator};
use crate::session::{SessionStore, WORKFLOW_STATE_KEY};
use crate::tools::{ToolExecutor, ToolInput};
use crate::workflow::enrich::ParameterEnricher;
use crate::workflow::progress::{ProgressSink, ProgressUpdate};
use crate::workflow::step::StepKind;
use crate::workflow::supervisor::JobSupervisor;
use crate::workflow::types::{JobError, JobPhase, JobRequest, JobResult, StepResult, WorkflowState};

/// 编排配置（对应配置文件的 [workflow] 段）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    /// 请求未指定 timeout_secs 时的作业截止时间
    pub job_timeout_secs: u64,
    pub fix_on_failure: bool,
    #[serde(with = "duration_ms")]
    pub progress_timeout: Duration,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            job_timeout_secs: 1800,
            fix_on_failure: true,
            progress_timeout: Duration::from_millis(250),
        }
    }
}

struct StepFailure {
    step: Option<StepKind>,
    error: WorkflowError,
}

impl StepFailure {
    fn at(step: StepKind) -> impl FnOnce(WorkflowError) -> StepFailure {
        move |error| StepFailure {
            step: Some(step),
            error,
        }
    }
}

/// 单次 execute 的只读上下文
struct JobRun<'a> {
    request: &'a JobRequest,
    steps: Vec<StepKind>,
    cancel: CancellationToken,
    started: Instant,
}

pub struct Orchestrator {
    pub(crate) executor: Arc<ToolExecutor>,
    pub(crate) coordinator: Arc<RetryCoordinator>,
    pub(crate) store: Arc<SessionStore>,
    pub(crate) plan: Vec<StepKind>,
    pub(crate) progress: Arc<dyn ProgressSink>,
    pub(crate) enricher: Option<Arc<dyn ParameterEnricher>>,
    pub(crate) supervisor: Arc<JobSupervisor>,
    pub(crate) config: WorkflowConfig,
}

impl Orchestrator {
    pub fn plan(&self) -> &[StepKind] {
        &self.plan
    }

    pub fn executor(&self) -> &Arc<ToolExecutor> {
        &self.executor
    }

    pub fn coordinator(&self) -> &Arc<RetryCoordinator> {
        &self.coordinator
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn supervisor(&self) -> &Arc<JobSupervisor> {
        &self.supervisor
    }

    /// 持久化的作业状态；会话不存在或尚未开始时为 None
    pub fn job_state(&self, session_id: &str) -> Result<Option<WorkflowState>> {
        let stored = match self.store.get_workflow_state(session_id) {
            Ok(stored) => stored,
            Err(WorkflowError::SessionNotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        if !stored.contains_key("job_id") {
            return Ok(None);
        }
        Ok(Some(serde_json::from_value(Value::Object(stored))?))
    }

    /// 取消正在运行的作业
    pub fn cancel(&self, session_id: &str) -> bool {
        self.supervisor.cancel(session_id)
    }

    pub async fn execute(&self, request: JobRequest, cancel: &CancellationToken) -> Result<JobResult> {
        request.validate()?;
        let session_id = request.session_id.clone().unwrap_or_else(new_session_id);
        let registration = self.supervisor.register(&session_id, cancel)?;

        let run = JobRun {
            request: &request,
            steps: self
                .plan
                .iter()
                .copied()
                .filter(|s| s.is_enabled(&request.args))
                .collect(),
            cancel: registration.token().clone(),
            started: Instant::now(),
        };
        let timeout = Duration::from_secs(
            request
                .options
                .timeout_secs
                .unwrap_or(self.config.job_timeout_secs),
        );
        let deadline = run.started + timeout;

        let mut state = self.prepare(&session_id, &run).await?;
        tracing::info!(
            session_id = %session_id,
            repo_url = %state.repo_url,
            steps = run.steps.len(),
            completed = state.current_step,
            "job started"
        );

        let outcome = tokio::select! {
            biased;
            r = self.run_steps(&mut state, &run) => r,
            _ = tokio::time::sleep_until(deadline) => Err(StepFailure {
                step: None,
                error: WorkflowError::DeadlineExceeded(format!(
                    "job '{session_id}' exceeded {}s",
                    timeout.as_secs()
                )),
            }),
        };

        let job_error = match outcome {
            Ok(()) => {
                state.leave_fixing();
                state.phase = JobPhase::Succeeded;
                None
            }
            Err(mut failure) => {
                // 截止时间打断的作业停在当前步骤上
                if failure.step.is_none() {
                    failure.step = match state.phase {
                        JobPhase::Running(i) | JobPhase::FailedFixing(i) => run.steps.get(i).copied(),
                        _ => None,
                    };
                }
                run.cancel.cancel();
                state.fixing_mode = false;
                state.failed_step = failure.step;
                state.previous_error = Some(failure.error.to_string());
                state.phase = JobPhase::FailedTerminal;
                tracing::error!(
                    session_id = %session_id,
                    step = ?failure.step,
                    kind = %failure.error.kind(),
                    error = %failure.error,
                    "job failed"
                );
                Some(JobError::from_error(failure.step, &failure.error))
            }
        };

        // 作业令牌可能已取消，最终状态用独立令牌写入
        if let Err(e) = self.persist(&state, &CancellationToken::new()).await {
            tracing::error!(session_id = %session_id, error = %e, "failed to persist final workflow state");
        }
        let (status, message) = match &job_error {
            None => ("succeeded", "job completed".to_string()),
            Some(e) => ("failed", e.message.clone()),
        };
        self.emit(&state, &run, "job", status, message).await;
        tracing::info!(
            session_id = %session_id,
            success = job_error.is_none(),
            elapsed_ms = run.started.elapsed().as_millis() as u64,
            "job finished"
        );
        drop(registration);
        Ok(state.to_result(job_error))
    }

    /// 后台执行；返回的句柄可取消、可等待结果
    pub fn spawn(self: &Arc<Self>, mut request: JobRequest, cancel: &CancellationToken) -> JobHandle {
        let session_id = request
            .session_id
            .get_or_insert_with(new_session_id)
            .clone();
        let token = cancel.child_token();
        let job_token = token.clone();
        let orchestrator = Arc::clone(self);
        let handle = tokio::spawn(async move { orchestrator.execute(request, &job_token).await });
        JobHandle {
            session_id,
            cancel: token,
            handle,
        }
    }

    /// 加锁取得会话并恢复状态；新作业写入初始状态
    async fn prepare(&self, session_id: &str, run: &JobRun<'_>) -> Result<WorkflowState> {
        let guard = self.store.acquire_workflow_lock(session_id, &run.cancel).await?;
        let session = self.store.get_or_create_locked(&guard)?;
        let args = run.request.args.clone();

        let mut state = match session.metadata.get(WORKFLOW_STATE_KEY) {
            Some(stored) if stored.get("job_id").is_some() => {
                let mut state: WorkflowState = serde_json::from_value(stored.clone())?;
                if state.repo_url != args.repo_url {
                    return Err(WorkflowError::InvalidRequest(format!(
                        "session '{session_id}' belongs to '{}', not '{}'",
                        state.repo_url, args.repo_url
                    )));
                }
                tracing::info!(
                    session_id,
                    completed = state.completed_steps.len(),
                    previous_phase = ?state.phase,
                    "resuming job"
                );
                state.args = args;
                state
            }
            _ => WorkflowState::new(session_id, args, run.steps.len()),
        };

        state.total_steps = run.steps.len();
        state.current_step = completed_count(&state, &run.steps);
        state.leave_fixing();
        let first_incomplete = run
            .steps
            .iter()
            .position(|s| !state.is_completed(*s))
            .unwrap_or(run.steps.len());
        state.phase = JobPhase::Running(first_incomplete);

        let snapshot = state_map(&state)?;
        self.store.update_workflow_state_locked(&guard, move |ws| {
            ws.extend(snapshot);
            Ok(())
        })?;
        Ok(state)
    }

    async fn run_steps(&self, state: &mut WorkflowState, run: &JobRun<'_>) -> std::result::Result<(), StepFailure> {
        for (index, step) in run.steps.iter().copied().enumerate() {
            if state.is_completed(step) {
                tracing::debug!(step = %step, "step already completed, skipping");
                continue;
            }
            state.phase = JobPhase::Running(index);
            self.enrich(step, state).await;

            let policy = match &run.request.options.retry {
                Some(policy) => policy.clone(),
                None => self.coordinator.policy_for(step.name()),
            };
            let mut ctx = RetryContext::new(step.name(), policy.clone());
            let call = self.step_call(step, step_input(step, state), state.job_id.clone(), &run.cancel);
            let outcome = self.coordinator.run(&mut ctx, &run.cancel, None, call).await;
            record_attempts(state, step, index, &ctx.attempts, 0, outcome.as_ref().ok(), false);

            let err = match outcome {
                Ok(output) => {
                    self.complete_step(state, run, step, output).await?;
                    continue;
                }
                Err(e) => e,
            };
            if err.is_cancellation() || err.is_circuit_open() {
                return Err(StepFailure::at(step)(err));
            }

            state.enter_fixing(step, index, &err);
            self.persist(state, &run.cancel).await.map_err(StepFailure::at(step))?;
            self.emit(state, run, step.name(), "fixing", format!("{step} failed: {err}"))
                .await;

            let fix_enabled = run
                .request
                .options
                .fix_on_failure
                .unwrap_or(self.config.fix_on_failure);
            if !fix_enabled || !self.coordinator.has_fix_providers() {
                return Err(StepFailure::at(step)(err));
            }

            tracing::warn!(step = %step, error = %err, "step failed, retrying with fix providers");
            let mut fix_params = state.request_params.clone();
            let mut fix_ctx = RetryContext::new(step.name(), policy);
            let call = self.step_call(step, step_input(step, state), state.job_id.clone(), &run.cancel);
            let fixed = self
                .coordinator
                .run(&mut fix_ctx, &run.cancel, Some(&mut fix_params), call)
                .await;
            record_attempts(
                state,
                step,
                index,
                &fix_ctx.attempts,
                ctx.attempt_count(),
                fixed.as_ref().ok(),
                true,
            );
            match fixed {
                Ok(output) => {
                    state.request_params = fix_params;
                    state.leave_fixing();
                    self.complete_step(state, run, step, output).await?;
                }
                Err(e) => return Err(StepFailure::at(step)(e)),
            }
        }
        Ok(())
    }

    fn step_call<'a>(
        &'a self,
        step: StepKind,
        base: Value,
        session_id: String,
        cancel: &'a CancellationToken,
    ) -> impl FnMut(Metadata) -> BoxFuture<'a, Result<Value>> + 'a {
        move |fix: Metadata| {
            let input = ToolInput::new(session_id.clone(), with_fix_params(&base, fix));
            let executor = &self.executor;
            async move { executor.execute_tool(step.name(), input, cancel).await }.boxed()
        }
    }

    async fn complete_step(
        &self,
        state: &mut WorkflowState,
        run: &JobRun<'_>,
        step: StepKind,
        output: Value,
    ) -> std::result::Result<(), StepFailure> {
        step.apply_output(state, output);
        state.completed_steps.insert(step);
        state.current_step = completed_count(state, &run.steps);
        self.persist(state, &run.cancel).await.map_err(StepFailure::at(step))?;
        tracing::info!(step = %step, progress = %state.progress_label(), "step completed");
        self.emit(state, run, step.name(), "running", format!("{step} completed"))
            .await;
        Ok(())
    }

    async fn enrich(&self, step: StepKind, state: &mut WorkflowState) {
        let Some(enricher) = &self.enricher else {
            return;
        };
        match enricher.enrich(step, state).await {
            Ok(params) if !params.is_empty() => {
                tracing::debug!(step = %step, keys = params.len(), "request parameters enriched");
                state.request_params.extend(params);
            }
            Ok(_) => {}
            Err(reason) => {
                tracing::warn!(step = %step, %reason, "parameter enrichment failed, continuing");
            }
        }
    }

    async fn persist(&self, state: &WorkflowState, cancel: &CancellationToken) -> Result<()> {
        let snapshot = state_map(state)?;
        self.store
            .update_workflow_state(&state.job_id, cancel, move |ws| {
                ws.extend(snapshot);
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn emit(&self, state: &WorkflowState, run: &JobRun<'_>, stage: &str, status: &str, message: String) {
        let update = ProgressUpdate {
            stage: stage.to_string(),
            percent: state.percent(),
            message,
            status: status.to_string(),
            step: state.current_step,
            total: state.total_steps,
            eta_ms: eta_ms(run.started.elapsed(), state.current_step, state.total_steps),
            trace_id: Some(state.job_id.clone()),
            metadata: Metadata::new(),
        };
        match tokio::time::timeout(self.config.progress_timeout, self.progress.emit_detailed(update)).await {
            Ok(Ok(())) => {}
            Ok(Err(reason)) => {
                tracing::warn!(session_id = %state.job_id, stage, %reason, "progress emission failed");
            }
            Err(_) => {
                tracing::warn!(session_id = %state.job_id, stage, "progress emission timed out");
            }
        }
    }

    /// 取消所有作业并关闭进度通道
    pub async fn shutdown(&self) {
        self.supervisor.cancel_all();
        if let Err(reason) = self.progress.close().await {
            tracing::warn!(%reason, "failed to close progress sink");
        }
    }
}

/// spawn 返回的作业句柄
pub struct JobHandle {
    session_id: String,
    cancel: CancellationToken,
    handle: JoinHandle<Result<JobResult>>,
}

impl JobHandle {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub async fn join(self) -> Result<JobResult> {
        match self.handle.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(WorkflowError::Cancelled(format!("job '{}'", self.session_id))),
            Err(e) => Err(WorkflowError::TaskFailed(e.to_string())),
        }
    }
}

fn new_session_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn completed_count(state: &WorkflowState, steps: &[StepKind]) -> usize {
    steps.iter().filter(|s| state.is_completed(**s)).count()
}

fn state_map(state: &WorkflowState) -> Result<Metadata> {
    match serde_json::to_value(state)? {
        Value::Object(map) => Ok(map),
        _ => Err(WorkflowError::Serialization(
            "workflow state did not serialize to an object".to_string(),
        )),
    }
}

/// 工具输入：步骤声明的状态槽位 + `params` + `test_mode`
fn step_input(step: StepKind, state: &WorkflowState) -> Value {
    let mut data = match step.inputs(state) {
        Value::Object(map) => map,
        other => {
            let mut map = Metadata::new();
            map.insert("input".to_string(), other);
            map
        }
    };
    data.insert("params".to_string(), Value::Object(state.request_params.clone()));
    data.insert("test_mode".to_string(), json!(state.args.test_mode));
    Value::Object(data)
}

/// 把修复策略写入的参数合并进 `params`
fn with_fix_params(base: &Value, fix: Metadata) -> Value {
    let mut data = base.clone();
    if fix.is_empty() {
        return data;
    }
    if let Some(Value::Object(params)) = data.get_mut("params") {
        params.extend(fix);
    }
    data
}

fn record_attempts(
    state: &mut WorkflowState,
    step: StepKind,
    index: usize,
    attempts: &[AttemptRecord],
    offset: u32,
    output: Option<&Value>,
    fixing: bool,
) {
    let progress = format!("{}/{}", index + 1, state.total_steps);
    for attempt in attempts {
        let mut metadata = Metadata::new();
        metadata.insert("attempt".to_string(), json!(offset + attempt.attempt));
        metadata.insert("duration_ms".to_string(), json!(attempt.duration.as_millis() as u64));
        metadata.insert("progress".to_string(), json!(progress));
        if let Some(error) = &attempt.error {
            metadata.insert("error".to_string(), json!(error));
        }
        if let Some(fix) = &attempt.fix_applied {
            metadata.insert("fix".to_string(), json!(fix));
        }
        if fixing {
            metadata.insert("fixing_mode".to_string(), json!(true));
        }
        let data = match output {
            Some(value) if attempt.success => value.clone(),
            _ => Value::Null,
        };
        state.results.push(StepResult {
            step,
            success: attempt.success,
            data,
            metadata,
        });
    }
}

fn eta_ms(elapsed: Duration, done: usize, total: usize) -> Option<u64> {
    if done == 0 || done >= total {
        return None;
    }
    let per_step = elapsed.as_millis() as u64 / done as u64;
    Some(per_step * (total - done) as u64)
}
