//! 重试与熔断：策略、错误分类、熔断器、修复提供者、协调器

pub mod circuit;
pub mod classify;
pub mod coordinator;
pub mod fix;
pub mod policy;

pub use circuit::{CallPermit, CircuitBreaker, CircuitConfig, CircuitRegistry, CircuitState};
pub use classify::{classify_message, ErrorClass};
pub use coordinator::{AttemptRecord, RetryContext, RetryCoordinator};
pub use fix::{FixProvider, FixStrategy, HeuristicFixProvider, Metadata};
pub use policy::{BackoffStrategy, RetryPolicy};
