//! 统一错误类型
//!
//! 按 ErrorKind 分为五类：Planning / Validation / Session / Execution / Cancellation。
//! 重试协调器依据 `is_retryable` 决定是否退避重试；取消类错误总是优先短路。

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::retry::classify::{classify_message, ErrorClass};

/// 编排过程中可能出现的所有错误
#[derive(Error, Debug)]
pub enum WorkflowError {
    // --- Planning ---
    #[error("Step '{0}' has no registered tool")]
    MissingStep(String),

    #[error("Step '{0}' appears more than once in the plan")]
    DuplicateStep(String),

    #[error("Step '{step}' depends on '{dependency}' which does not run before it")]
    InvalidOrdering { step: String, dependency: String },

    #[error("Cyclic dependency detected among steps: {0}")]
    CyclicDependency(String),

    // --- Validation ---
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Input validation failed for tool '{tool}': {reason}")]
    InputValidation { tool: String, reason: String },

    #[error("Output validation failed for tool '{tool}': {reason}")]
    OutputValidation { tool: String, reason: String },

    // --- Session ---
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session '{session_id}' was modified concurrently (expected version {expected}, found {actual})")]
    ConcurrentModification {
        session_id: String,
        expected: i64,
        actual: i64,
    },

    #[error("Timed out after {waited_ms}ms waiting for lock on session '{session_id}'")]
    LockTimeout { session_id: String, waited_ms: u64 },

    #[error("Session '{0}' already has a job running")]
    JobAlreadyRunning(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // --- Execution ---
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Tool '{tool}' failed: {message}")]
    ToolFailed { tool: String, message: String },

    #[error("Tool '{tool}' timed out after {timeout_ms}ms")]
    ToolTimeout { tool: String, timeout_ms: u64 },

    #[error("Worker pool is saturated, rejected call to '{0}'")]
    PoolSaturated(String),

    #[error("Worker pool is shut down")]
    PoolClosed,

    #[error("Circuit breaker is open for '{operation}'")]
    CircuitOpen { operation: String },

    #[error("Job task failed: {0}")]
    TaskFailed(String),

    #[error("Operation '{operation}' failed after {attempts} attempts: {source}")]
    RetryExhausted {
        operation: String,
        attempts: u32,
        #[source]
        source: Box<WorkflowError>,
    },

    // --- Cancellation ---
    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Deadline exceeded: {0}")]
    DeadlineExceeded(String),
}

/// 错误分类（对外暴露在 JobError 中）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Planning,
    Validation,
    Session,
    Execution,
    Cancellation,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Planning => "planning",
            ErrorKind::Validation => "validation",
            ErrorKind::Session => "session",
            ErrorKind::Execution => "execution",
            ErrorKind::Cancellation => "cancellation",
        };
        f.write_str(s)
    }
}

impl WorkflowError {
    pub fn kind(&self) -> ErrorKind {
        use WorkflowError::*;
        match self {
            MissingStep(_) | DuplicateStep(_) | InvalidOrdering { .. } | CyclicDependency(_) => {
                ErrorKind::Planning
            }
            InvalidRequest(_) | InputValidation { .. } | OutputValidation { .. } => {
                ErrorKind::Validation
            }
            SessionNotFound(_)
            | ConcurrentModification { .. }
            | LockTimeout { .. }
            | JobAlreadyRunning(_)
            | Storage(_)
            | Serialization(_) => ErrorKind::Session,
            ToolNotFound(_)
            | ToolFailed { .. }
            | ToolTimeout { .. }
            | PoolSaturated(_)
            | PoolClosed
            | CircuitOpen { .. }
            | TaskFailed(_)
            | RetryExhausted { .. } => ErrorKind::Execution,
            Cancelled(_) | DeadlineExceeded(_) => ErrorKind::Cancellation,
        }
    }

    /// 是否值得退避重试：只有瞬时的执行类错误会重试
    pub fn is_retryable(&self) -> bool {
        match self {
            WorkflowError::ToolFailed { message, .. } => {
                classify_message(message) != ErrorClass::Permanent
            }
            WorkflowError::ToolTimeout { .. } | WorkflowError::PoolSaturated(_) => true,
            _ => false,
        }
    }

    pub fn is_cancellation(&self) -> bool {
        self.kind() == ErrorKind::Cancellation
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, WorkflowError::CircuitOpen { .. })
    }

    /// 剥掉 RetryExhausted 包装，返回最后一次真实失败
    pub fn root(&self) -> &WorkflowError {
        match self {
            WorkflowError::RetryExhausted { source, .. } => source.root(),
            other => other,
        }
    }

    /// 错误细分标签（用于指标与修复策略匹配）
    pub fn class(&self) -> ErrorClass {
        match self.root() {
            WorkflowError::ToolTimeout { .. } => ErrorClass::Timeout,
            WorkflowError::ToolFailed { message, .. } => classify_message(message),
            WorkflowError::InputValidation { .. } | WorkflowError::OutputValidation { .. } => {
                ErrorClass::Validation
            }
            WorkflowError::PoolSaturated(_) => ErrorClass::Resource,
            _ => ErrorClass::Unknown,
        }
    }
}

impl From<rusqlite::Error> for WorkflowError {
    fn from(e: rusqlite::Error) -> Self {
        WorkflowError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for WorkflowError {
    fn from(e: serde_json::Error) -> Self {
        WorkflowError::Serialization(e.to_string())
    }
}

pub type Result<T, E = WorkflowError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds() {
        assert_eq!(
            WorkflowError::MissingStep("build_image".into()).kind(),
            ErrorKind::Planning
        );
        assert_eq!(
            WorkflowError::SessionNotFound("s1".into()).kind(),
            ErrorKind::Session
        );
        assert_eq!(
            WorkflowError::CircuitOpen { operation: "push_image".into() }.kind(),
            ErrorKind::Execution
        );
        assert_eq!(
            WorkflowError::DeadlineExceeded("job".into()).kind(),
            ErrorKind::Cancellation
        );
    }

    #[test]
    fn test_retryable() {
        let transient = WorkflowError::ToolFailed {
            tool: "build_image".into(),
            message: "connection reset by peer".into(),
        };
        assert!(transient.is_retryable());

        let permanent = WorkflowError::ToolFailed {
            tool: "push_image".into(),
            message: "unauthorized: authentication required".into(),
        };
        assert!(!permanent.is_retryable());

        assert!(!WorkflowError::InputValidation {
            tool: "x".into(),
            reason: "missing field".into()
        }
        .is_retryable());
        assert!(!WorkflowError::Cancelled("x".into()).is_retryable());
    }

    #[test]
    fn test_root_unwraps_exhausted() {
        let err = WorkflowError::RetryExhausted {
            operation: "build_image".into(),
            attempts: 3,
            source: Box::new(WorkflowError::ToolTimeout {
                tool: "build_image".into(),
                timeout_ms: 10,
            }),
        };
        assert!(matches!(err.root(), WorkflowError::ToolTimeout { .. }));
        assert_eq!(err.class(), ErrorClass::Timeout);
    }
}
