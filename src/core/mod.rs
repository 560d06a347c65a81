//! 核心层：错误类型、引擎组装、优雅关闭

pub mod builder;
pub mod error;
pub mod shutdown;

pub use builder::{Engine, EngineBuilder};
pub use error::{ErrorKind, Result, WorkflowError};
pub use shutdown::{
    BackgroundTaskCleanup, ExecutorCleanup, JobsCleanup, ShutdownCleanup, ShutdownCoordinator, ShutdownManager,
};
