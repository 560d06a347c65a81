//! 工作流层：步骤定义、作业类型、计划校验、进度上报、参数增强、作业监管与编排器

pub mod builder;
pub mod enrich;
pub mod graph;
pub mod orchestrator;
pub mod progress;
pub mod step;
pub mod supervisor;
pub mod types;

pub use builder::OrchestratorBuilder;
pub use enrich::{AnalysisEnricher, ParameterEnricher};
pub use graph::{validate_plan, StepGraph};
pub use orchestrator::{JobHandle, Orchestrator, WorkflowConfig};
pub use progress::{ChannelProgressSink, LogProgressSink, NoopProgressSink, ProgressSink, ProgressUpdate};
pub use step::{image_name, StepKind};
pub use supervisor::{JobRegistration, JobSupervisor};
pub use types::{JobArgs, JobError, JobOptions, JobPhase, JobRequest, JobResult, StepResult, WorkflowState};
