//! Dockhand - 容器化与部署作业编排引擎
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误类型、引擎组装、优雅关闭
//! - **observability**: 日志初始化
//! - **retry**: 重试策略、熔断器、修复提供者、重试协调器
//! - **session**: 会话记录、持久化后端、会话锁、会话存储
//! - **tools**: 工具注册表、执行器（线程池 / 缓存 / 校验 / 指标）、演练工具
//! - **workflow**: 步骤定义、作业类型、编排器

pub mod config;
pub mod core;
pub mod observability;
pub mod retry;
pub mod session;
pub mod tools;
pub mod workflow;

pub use crate::core::{Engine, EngineBuilder, ErrorKind, Result, WorkflowError};
pub use crate::workflow::{JobArgs, JobRequest, JobResult, Orchestrator, StepKind};
