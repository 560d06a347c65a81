//! 工作流类型定义
//!
//! 作业请求 / 结果、每次尝试的 StepResult、贯穿一次作业的 WorkflowState，以及作业阶段。

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::{ErrorKind, WorkflowError};
use crate::retry::{Metadata, RetryPolicy};
use crate::workflow::step::StepKind;

/// 作业输入参数
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobArgs {
    pub repo_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default)]
    pub scan: bool,
    /// None 视为 true
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deploy: Option<bool>,
    #[serde(default)]
    pub test_mode: bool,
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub extra: Metadata,
}

impl JobArgs {
    pub fn new(repo_url: impl Into<String>) -> Self {
        Self {
            repo_url: repo_url.into(),
            ..Self::default()
        }
    }

    pub fn deploy_enabled(&self) -> bool {
        self.deploy.unwrap_or(true)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobOptions {
    /// 作业整体超时；None 使用配置默认值
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default, rename = "async")]
    pub run_async: bool,
    /// 覆盖所有步骤的重试策略
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    #[serde(default)]
    pub fix_on_failure: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    pub args: JobArgs,
    /// 指定时恢复该会话上的作业
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub options: JobOptions,
}

impl JobRequest {
    pub fn new(args: JobArgs) -> Self {
        Self {
            args,
            session_id: None,
            options: JobOptions::default(),
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn validate(&self) -> Result<(), WorkflowError> {
        let url = self.args.repo_url.trim();
        if url.is_empty() {
            return Err(WorkflowError::InvalidRequest("repo_url is required".to_string()));
        }
        if url.chars().any(char::is_whitespace) {
            return Err(WorkflowError::InvalidRequest(format!("repo_url '{url}' contains whitespace")));
        }
        if let Some(id) = &self.session_id {
            if id.trim().is_empty() {
                return Err(WorkflowError::InvalidRequest("session_id is empty".to_string()));
            }
        }
        if self.options.timeout_secs == Some(0) {
            return Err(WorkflowError::InvalidRequest("timeout_secs must be positive".to_string()));
        }
        Ok(())
    }
}

/// 作业阶段：NotStarted → Running(i) → Succeeded | FailedFixing(i) | FailedTerminal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", content = "step_index", rename_all = "snake_case")]
pub enum JobPhase {
    NotStarted,
    Running(usize),
    FailedFixing(usize),
    Succeeded,
    FailedTerminal,
}

impl JobPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobPhase::Succeeded | JobPhase::FailedTerminal)
    }
}

/// 单次尝试的结果；一个步骤重试 N 次就有 N 条
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step: StepKind,
    pub success: bool,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub metadata: Metadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    pub step: Option<StepKind>,
    pub kind: ErrorKind,
    pub message: String,
}

impl JobError {
    pub fn from_error(step: Option<StepKind>, err: &WorkflowError) -> Self {
        Self {
            step,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub session_id: String,
    pub status: JobPhase,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scan_report: Option<Value>,
    pub steps: Vec<StepResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
}

impl JobResult {
    pub fn steps_for(&self, step: StepKind) -> impl Iterator<Item = &StepResult> {
        self.steps.iter().filter(move |r| r.step == step)
    }
}

/// 一次作业的可变上下文；序列化后存入会话元数据的 `workflow_state` 键
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub job_id: String,
    pub repo_url: String,
    pub args: JobArgs,
    #[serde(default)]
    pub results: Vec<StepResult>,
    #[serde(default)]
    pub analysis: Option<Value>,
    #[serde(default)]
    pub build_file: Option<Value>,
    #[serde(default)]
    pub build: Option<Value>,
    #[serde(default)]
    pub cluster: Option<Value>,
    #[serde(default)]
    pub scan_report: Option<Value>,
    #[serde(default)]
    pub current_step: usize,
    #[serde(default)]
    pub total_steps: usize,
    #[serde(default)]
    pub completed_steps: BTreeSet<StepKind>,
    #[serde(default)]
    pub fixing_mode: bool,
    #[serde(default)]
    pub previous_error: Option<String>,
    #[serde(default)]
    pub failed_step: Option<StepKind>,
    /// 修复策略 / 参数增强写入的自由参数，作为工具输入的 `params`
    #[serde(default)]
    pub request_params: Metadata,
    #[serde(default = "not_started")]
    pub phase: JobPhase,
}

fn not_started() -> JobPhase {
    JobPhase::NotStarted
}

impl WorkflowState {
    pub fn new(job_id: impl Into<String>, args: JobArgs, total_steps: usize) -> Self {
        Self {
            job_id: job_id.into(),
            repo_url: args.repo_url.clone(),
            args,
            results: Vec::new(),
            analysis: None,
            build_file: None,
            build: None,
            cluster: None,
            scan_report: None,
            current_step: 0,
            total_steps,
            completed_steps: BTreeSet::new(),
            fixing_mode: false,
            previous_error: None,
            failed_step: None,
            request_params: Metadata::new(),
            phase: JobPhase::NotStarted,
        }
    }

    pub fn is_completed(&self, step: StepKind) -> bool {
        self.completed_steps.contains(&step)
    }

    /// "3/10" 形式的进度
    pub fn progress_label(&self) -> String {
        format!("{}/{}", self.current_step, self.total_steps)
    }

    pub fn percent(&self) -> u8 {
        if self.total_steps == 0 {
            return 100;
        }
        ((self.current_step.min(self.total_steps) * 100) / self.total_steps) as u8
    }

    pub fn enter_fixing(&mut self, step: StepKind, index: usize, error: &WorkflowError) {
        self.fixing_mode = true;
        self.failed_step = Some(step);
        self.previous_error = Some(error.to_string());
        self.phase = JobPhase::FailedFixing(index);
    }

    pub fn leave_fixing(&mut self) {
        self.fixing_mode = false;
        self.failed_step = None;
        self.previous_error = None;
    }

    fn str_field(slot: &Option<Value>, key: &str) -> Option<String> {
        slot.as_ref()?.get(key)?.as_str().map(str::to_string)
    }

    pub fn to_result(&self, error: Option<JobError>) -> JobResult {
        JobResult {
            session_id: self.job_id.clone(),
            status: self.phase,
            success: self.phase == JobPhase::Succeeded,
            image_ref: Self::str_field(&self.build, "image_ref"),
            endpoint: Self::str_field(&self.cluster, "endpoint"),
            namespace: Self::str_field(&self.cluster, "namespace"),
            scan_report: self.scan_report.clone(),
            steps: self.results.clone(),
            error,
        }
    }
}
