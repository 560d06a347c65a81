//! 工具层：注册表、执行器（缓存 / 校验 / 线程池 / 指标）与演练工具

pub mod cache;
pub mod dry_run;
pub mod executor;
pub mod metrics;
pub mod pool;
pub mod registry;
pub mod validator;

pub use cache::{fingerprint, ResultCache};
pub use dry_run::{dry_run_registry, DryRunTool};
pub use executor::{ExecutorConfig, ExecutorStats, ToolExecutor};
pub use metrics::{MetricEntry, MetricsBuffer, MetricsSink, TracingMetricsSink};
pub use pool::{QueueFullPolicy, WorkerPool};
pub use registry::{Tool, ToolInput, ToolMetadata, ToolRegistry};
pub use validator::{RequiredFieldsValidator, ToolValidator};
