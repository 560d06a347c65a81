//! 工具执行器
//!
//! execute_tool 依次做：缓存查找 → 输入校验 → 直接或经线程池调用（叠加超时与取消）→ 输出校验 →
//! 缓存写入 → 指标记录。每次调用输出一条结构化审计日志；耗时超过 P95 目标只告警不失败。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::{Result, WorkflowError};
use crate::retry::policy::duration_ms;
use crate::tools::cache::{fingerprint, ResultCache};
use crate::tools::metrics::{MetricEntry, MetricsBuffer, MetricsSink, TracingMetricsSink};
use crate::tools::pool::{QueueFullPolicy, WorkerPool};
use crate::tools::registry::{Tool, ToolInput, ToolRegistry};
use crate::tools::validator::ToolValidator;

/// 执行器配置（对应配置文件的 [executor] 段）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// 0 表示不用线程池，直接在调用方任务中执行
    pub worker_pool_size: usize,
    pub queue_policy: QueueFullPolicy,
    #[serde(with = "duration_ms")]
    pub execution_timeout: Duration,
    pub enable_caching: bool,
    #[serde(with = "duration_ms")]
    pub cache_ttl: Duration,
    pub cache_capacity: usize,
    pub enable_metrics: bool,
    pub metrics_buffer_size: usize,
    #[serde(with = "duration_ms")]
    pub metrics_flush_interval: Duration,
    pub enable_validation: bool,
    pub p95_target_micros: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: 10,
            queue_policy: QueueFullPolicy::Block,
            execution_timeout: Duration::from_secs(30),
            enable_caching: true,
            cache_ttl: Duration::from_secs(300),
            cache_capacity: 1000,
            enable_metrics: true,
            metrics_buffer_size: 1000,
            metrics_flush_interval: Duration::from_secs(1),
            enable_validation: true,
            p95_target_micros: 300,
        }
    }
}

/// 执行器统计快照
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorStats {
    pub active_executions: u64,
    pub total_executions: u64,
    pub failed_executions: u64,
    pub cache_hits: u64,
    pub budget_violations: u64,
    pub cache_size: u64,
}

#[derive(Debug, Default)]
struct Counters {
    active: AtomicU64,
    total: AtomicU64,
    failed: AtomicU64,
    cache_hits: AtomicU64,
    budget_violations: AtomicU64,
}

/// 活跃计数的 RAII 守卫，任何退出路径都会减一
struct ActiveGuard<'a>(&'a AtomicU64);

impl<'a> ActiveGuard<'a> {
    fn enter(counter: &'a AtomicU64) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter)
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

pub struct ToolExecutor {
    registry: ToolRegistry,
    config: ExecutorConfig,
    pool: Option<WorkerPool>,
    cache: ResultCache,
    metrics: Arc<MetricsBuffer>,
    validator: Option<Arc<dyn ToolValidator>>,
    counters: Counters,
    shutdown: CancellationToken,
    flusher: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ToolExecutor {
    /// 必须在 tokio 运行时内调用（线程池与指标刷新任务会立即启动）
    pub fn new(registry: ToolRegistry, config: ExecutorConfig) -> Self {
        Self::with_sink(registry, config, Arc::new(TracingMetricsSink))
    }

    pub fn with_sink(registry: ToolRegistry, config: ExecutorConfig, sink: Arc<dyn MetricsSink>) -> Self {
        let pool = (config.worker_pool_size > 0)
            .then(|| WorkerPool::new(config.worker_pool_size, config.queue_policy));
        let metrics = Arc::new(MetricsBuffer::new(config.metrics_buffer_size, sink));
        let shutdown = CancellationToken::new();
        let flusher = config
            .enable_metrics
            .then(|| metrics.spawn_flusher(config.metrics_flush_interval, shutdown.clone()));
        Self {
            registry,
            cache: ResultCache::new(config.cache_ttl, config.cache_capacity),
            config,
            pool,
            metrics,
            validator: None,
            counters: Counters::default(),
            shutdown,
            flusher: std::sync::Mutex::new(flusher),
        }
    }

    pub fn with_validator(mut self, validator: Arc<dyn ToolValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn get_tool(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.registry.get(name)
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.registry.tool_names()
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub async fn execute_tool(&self, tool_name: &str, input: ToolInput, cancel: &CancellationToken) -> Result<Value> {
        let _active = ActiveGuard::enter(&self.counters.active);
        self.counters.total.fetch_add(1, Ordering::Relaxed);
        let start = Instant::now();

        let tool = match self.registry.get(tool_name) {
            Some(t) => t,
            None => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                return Err(WorkflowError::ToolNotFound(tool_name.to_string()));
            }
        };

        let key = fingerprint(tool_name, &input.session_id, &input.data);
        if self.config.enable_caching {
            if let Some(hit) = self.cache.get(&key) {
                self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
                self.observe(tool_name, start.elapsed(), "ok", true);
                return Ok(hit);
            }
        }

        let session_id = input.session_id.clone();
        let result = self.run(&tool, tool_name, input, cancel).await;
        let outcome = outcome_label(&result);
        let elapsed = start.elapsed();

        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": tool_name,
            "session_id": session_id,
            "ok": result.is_ok(),
            "outcome": outcome,
            "duration_ms": elapsed.as_millis() as u64,
        });
        tracing::info!(audit = %audit, "tool");

        match &result {
            Ok(value) if self.config.enable_caching => self.cache.put(key, value.clone()),
            Ok(_) => {}
            Err(_) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.observe(tool_name, elapsed, outcome, false);
        result
    }

    async fn run(&self, tool: &Arc<dyn Tool>, name: &str, input: ToolInput, cancel: &CancellationToken) -> Result<Value> {
        if self.config.enable_validation {
            tool.validate(&input)
                .map_err(|reason| WorkflowError::InputValidation {
                    tool: name.to_string(),
                    reason,
                })?;
            if let Some(v) = &self.validator {
                v.validate_input(name, &input)
                    .map_err(|reason| WorkflowError::InputValidation {
                        tool: name.to_string(),
                        reason,
                    })?;
            }
        }

        let limit = match tool.metadata().timeout {
            Some(t) => t.min(self.config.execution_timeout),
            None => self.config.execution_timeout,
        };
        let call = cancel.child_token();
        let _guard = call.clone().drop_guard();
        let dispatch = async {
            match &self.pool {
                Some(pool) => pool.submit(Arc::clone(tool), input, call.clone()).await,
                None => Ok(tokio::select! {
                    _ = call.cancelled() => Err("cancelled".to_string()),
                    r = tool.execute(input, call.clone()) => r,
                }),
            }
        };

        let output = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(WorkflowError::Cancelled(name.to_string())),
            r = tokio::time::timeout(limit, dispatch) => match r {
                Err(_) => {
                    return Err(WorkflowError::ToolTimeout {
                        tool: name.to_string(),
                        timeout_ms: limit.as_millis() as u64,
                    })
                }
                Ok(Err(e)) => return Err(e),
                Ok(Ok(Err(message))) => {
                    return Err(WorkflowError::ToolFailed {
                        tool: name.to_string(),
                        message,
                    })
                }
                Ok(Ok(Ok(v))) => v,
            },
        };

        if self.config.enable_validation {
            if let Some(v) = &self.validator {
                v.validate_output(name, &output)
                    .map_err(|reason| WorkflowError::OutputValidation {
                        tool: name.to_string(),
                        reason,
                    })?;
            }
        }
        Ok(output)
    }

    fn observe(&self, tool: &str, elapsed: Duration, outcome: &str, cached: bool) {
        let micros = elapsed.as_micros() as u64;
        let over_budget = !cached && micros > self.config.p95_target_micros;
        if over_budget {
            self.counters.budget_violations.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                tool,
                duration_us = micros,
                target_us = self.config.p95_target_micros,
                "tool execution exceeded latency budget"
            );
        }
        if !self.config.enable_metrics {
            return;
        }
        self.metrics.record(
            MetricEntry::new("tool.duration_us", micros as f64)
                .label("tool", tool)
                .label("outcome", outcome)
                .label("cached", cached),
        );
        self.metrics.record(
            MetricEntry::new("tool.success", if outcome == "ok" { 1.0 } else { 0.0 })
                .label("tool", tool)
                .label("cached", cached),
        );
        if over_budget {
            self.metrics
                .record(MetricEntry::new("tool.budget_violation", 1.0).label("tool", tool));
        }
    }

    pub fn stats(&self) -> ExecutorStats {
        ExecutorStats {
            active_executions: self.counters.active.load(Ordering::Relaxed),
            total_executions: self.counters.total.load(Ordering::Relaxed),
            failed_executions: self.counters.failed.load(Ordering::Relaxed),
            cache_hits: self.counters.cache_hits.load(Ordering::Relaxed),
            budget_violations: self.counters.budget_violations.load(Ordering::Relaxed),
            cache_size: self.cache.len() as u64,
        }
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// 停止线程池与指标刷新，刷出剩余指标
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        if let Some(pool) = &self.pool {
            pool.shutdown().await;
        }
        let flusher = self
            .flusher
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = flusher {
            let _ = handle.await;
        }
        self.metrics.flush();
    }
}

fn outcome_label(result: &Result<Value>) -> &'static str {
    match result {
        Ok(_) => "ok",
        Err(WorkflowError::InputValidation { .. }) => "input_invalid",
        Err(WorkflowError::OutputValidation { .. }) => "output_invalid",
        Err(e) if e.is_cancellation() => "cancelled",
        Err(WorkflowError::ToolTimeout { .. }) => "timeout",
        Err(_) => "tool_error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::registry::ToolMetadata;
    use crate::tools::validator::RequiredFieldsValidator;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;

    struct Counting {
        calls: Arc<AtomicU32>,
        delay: Duration,
        fail: bool,
    }

    #[async_trait]
    impl Tool for Counting {
        fn metadata(&self) -> ToolMetadata {
            ToolMetadata::new("build_image", "build").with_timeout(Duration::from_millis(200))
        }

        fn validate(&self, input: &ToolInput) -> std::result::Result<(), String> {
            if input.data.get("reject").is_some() {
                return Err("rejected by tool".into());
            }
            Ok(())
        }

        async fn execute(&self, input: ToolInput, _cancel: CancellationToken) -> std::result::Result<Value, String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err("connection reset by peer".into());
            }
            Ok(json!({"image_id": "sha256:abc", "echo": input.data}))
        }
    }

    fn executor(pool: usize, delay: Duration, fail: bool) -> (ToolExecutor, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let mut registry = ToolRegistry::new();
        registry.register(Counting {
            calls: Arc::clone(&calls),
            delay,
            fail,
        });
        let config = ExecutorConfig {
            worker_pool_size: pool,
            ..ExecutorConfig::default()
        };
        (ToolExecutor::new(registry, config), calls)
    }

    #[tokio::test]
    async fn test_cache_hit_skips_tool() {
        let (exec, calls) = executor(2, Duration::ZERO, false);
        let cancel = CancellationToken::new();
        let input = ToolInput::new("s1", json!({"dockerfile": "FROM alpine"}));
        let a = exec.execute_tool("build_image", input.clone(), &cancel).await.unwrap();
        let b = exec.execute_tool("build_image", input, &cancel).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let stats = exec.stats();
        assert_eq!(stats.cache_hits, 1);
        assert_eq!(stats.total_executions, 2);
        assert_eq!(stats.cache_size, 1);
        assert_eq!(stats.active_executions, 0);
        exec.shutdown().await;
    }

    #[tokio::test]
    async fn test_failures_not_cached() {
        let (exec, calls) = executor(0, Duration::ZERO, true);
        let cancel = CancellationToken::new();
        let input = ToolInput::new("s1", json!({}));
        for _ in 0..2 {
            let err = exec.execute_tool("build_image", input.clone(), &cancel).await.unwrap_err();
            assert!(matches!(err, WorkflowError::ToolFailed { .. }));
            assert!(err.is_retryable());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(exec.stats().failed_executions, 2);
        assert_eq!(exec.stats().cache_size, 0);
    }

    #[tokio::test]
    async fn test_tool_timeout_is_min_of_limits() {
        let (exec, _) = executor(1, Duration::from_secs(5), false);
        let err = exec
            .execute_tool("build_image", ToolInput::new("s1", json!({})), &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            WorkflowError::ToolTimeout { timeout_ms, .. } => assert_eq!(timeout_ms, 200),
            other => panic!("unexpected: {other:?}"),
        }
        exec.shutdown().await;
    }

    #[tokio::test]
    async fn test_input_validation() {
        let (exec, calls) = executor(0, Duration::ZERO, false);
        let exec = exec.with_validator(Arc::new(
            RequiredFieldsValidator::new().require_input("build_image", &["dockerfile"]),
        ));
        let cancel = CancellationToken::new();
        let err = exec
            .execute_tool("build_image", ToolInput::new("s1", json!({"reject": 1})), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::InputValidation { .. }));
        let err = exec
            .execute_tool("build_image", ToolInput::new("s1", json!({})), &cancel)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("dockerfile"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let (exec, _) = executor(0, Duration::ZERO, false);
        let err = exec
            .execute_tool("push_image", ToolInput::new("s1", json!({})), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::ToolNotFound(_)));
    }

    #[tokio::test]
    async fn test_cancelled_call() {
        let (exec, _) = executor(1, Duration::from_millis(150), false);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = exec
            .execute_tool("build_image", ToolInput::new("s1", json!({})), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancellation());
        exec.shutdown().await;
    }

    #[test]
    fn test_outcome_labels() {
        assert_eq!(outcome_label(&Ok(json!(1))), "ok");
        assert_eq!(
            outcome_label(&Err(WorkflowError::ToolTimeout {
                tool: "x".into(),
                timeout_ms: 1
            })),
            "timeout"
        );
        assert_eq!(outcome_label(&Err(WorkflowError::Cancelled("x".into()))), "cancelled");
        assert_eq!(
            outcome_label(&Err(WorkflowError::OutputValidation {
                tool: "x".into(),
                reason: "r".into()
            })),
            "output_invalid"
        );
    }
}
