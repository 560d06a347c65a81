//! 重试协调器
//!
//! 把「熔断检查 → 执行 → 修复 → 退避」串成一个循环。每个操作名对应一个熔断器和一条可选的专属策略，
//! 所有等待都可以被 CancellationToken 打断。

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::core::{ErrorKind, Result, WorkflowError};
use crate::retry::circuit::{CallPermit, CircuitConfig, CircuitRegistry, CircuitState};
use crate::retry::fix::{FixProvider, Metadata};
use crate::retry::policy::RetryPolicy;

/// 单次尝试的记录
#[derive(Debug, Clone)]
pub struct AttemptRecord {
    /// 从 1 开始
    pub attempt: u32,
    pub success: bool,
    pub error: Option<String>,
    pub duration: Duration,
    /// 本次尝试中应用的修复策略名
    pub fix_applied: Option<String>,
}

/// 一次 run 的上下文：操作名、生效策略、尝试历史
#[derive(Debug, Clone)]
pub struct RetryContext {
    pub operation: String,
    pub policy: RetryPolicy,
    pub attempts: Vec<AttemptRecord>,
}

impl RetryContext {
    pub fn new(operation: impl Into<String>, policy: RetryPolicy) -> Self {
        Self {
            operation: operation.into(),
            policy,
            attempts: Vec::new(),
        }
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempts.len() as u32
    }

    pub fn last_error(&self) -> Option<&str> {
        self.attempts.iter().rev().find_map(|a| a.error.as_deref())
    }
}

pub struct RetryCoordinator {
    default_policy: RetryPolicy,
    policies: RwLock<HashMap<String, RetryPolicy>>,
    circuits: CircuitRegistry,
    fix_providers: RwLock<Vec<Arc<dyn FixProvider>>>,
}

impl Default for RetryCoordinator {
    fn default() -> Self {
        Self::new(RetryPolicy::default(), CircuitConfig::default())
    }
}

impl RetryCoordinator {
    pub fn new(default_policy: RetryPolicy, circuit: CircuitConfig) -> Self {
        Self {
            default_policy,
            policies: RwLock::new(HashMap::new()),
            circuits: CircuitRegistry::new(circuit),
            fix_providers: RwLock::new(Vec::new()),
        }
    }

    pub fn set_policy(&self, name: impl Into<String>, policy: RetryPolicy) {
        self.policies
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.into(), policy);
    }

    /// 操作专属策略；未注册时返回默认策略
    pub fn policy_for(&self, name: &str) -> RetryPolicy {
        self.policies
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
            .unwrap_or_else(|| self.default_policy.clone())
    }

    pub fn register_fix_provider(&self, provider: Arc<dyn FixProvider>) {
        tracing::debug!(provider = provider.name(), "fix provider registered");
        self.fix_providers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(provider);
    }

    pub fn has_fix_providers(&self) -> bool {
        !self
            .fix_providers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_empty()
    }

    pub fn circuit_state(&self, name: &str) -> Option<CircuitState> {
        self.circuits.state(name)
    }

    /// 用操作名的生效策略新建上下文
    pub fn context(&self, name: &str) -> RetryContext {
        RetryContext::new(name, self.policy_for(name))
    }

    pub async fn execute<T, F, Fut>(&self, name: &str, cancel: &CancellationToken, op: F) -> Result<T>
    where
        F: FnMut(Metadata) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut ctx = self.context(name);
        self.run(&mut ctx, cancel, None, op).await
    }

    pub async fn execute_with_policy<T, F, Fut>(
        &self,
        name: &str,
        policy: RetryPolicy,
        cancel: &CancellationToken,
        op: F,
    ) -> Result<T>
    where
        F: FnMut(Metadata) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut ctx = RetryContext::new(name, policy);
        self.run(&mut ctx, cancel, None, op).await
    }

    /// 同 execute，失败时额外询问修复提供者；metadata 会被修复策略修改
    pub async fn execute_with_fix<T, F, Fut>(
        &self,
        name: &str,
        cancel: &CancellationToken,
        metadata: &mut Metadata,
        op: F,
    ) -> Result<T>
    where
        F: FnMut(Metadata) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut ctx = self.context(name);
        self.run(&mut ctx, cancel, Some(metadata), op).await
    }

    /// 核心循环。`op` 每次收到当前元数据的副本；尝试历史写入 `ctx.attempts`
    pub async fn run<T, F, Fut>(
        &self,
        ctx: &mut RetryContext,
        cancel: &CancellationToken,
        mut fix: Option<&mut Metadata>,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut(Metadata) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let breaker = self.circuits.get(&ctx.operation);
        let max_attempts = ctx.policy.max_attempts.max(1);
        let mut attempt = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Err(WorkflowError::Cancelled(ctx.operation.clone()));
            }
            let Some(permit) = CallPermit::acquire(&breaker) else {
                tracing::warn!(operation = %ctx.operation, "circuit open, call rejected");
                return Err(WorkflowError::CircuitOpen {
                    operation: ctx.operation.clone(),
                });
            };

            attempt += 1;
            let started = Instant::now();
            let meta = fix.as_deref().cloned().unwrap_or_default();
            let mut err = match guarded(&mut op, meta, cancel, &ctx.operation).await {
                Ok(value) => {
                    permit.success();
                    ctx.attempts.push(AttemptRecord {
                        attempt,
                        success: true,
                        error: None,
                        duration: started.elapsed(),
                        fix_applied: None,
                    });
                    return Ok(value);
                }
                Err(e) => e,
            };
            settle(permit, &err);

            let mut fix_applied = None;
            if !err.is_cancellation() {
                if let Some(meta) = fix.as_deref_mut() {
                    if let Some(strategy) = self.apply_first_fix(&err, meta).await {
                        tracing::info!(
                            operation = %ctx.operation,
                            attempt,
                            strategy = %strategy,
                            "fix applied, re-running within attempt"
                        );
                        fix_applied = Some(strategy);
                        if let Some(permit) = CallPermit::acquire(&breaker) {
                            match guarded(&mut op, meta.clone(), cancel, &ctx.operation).await {
                                Ok(value) => {
                                    permit.success();
                                    ctx.attempts.push(AttemptRecord {
                                        attempt,
                                        success: true,
                                        error: None,
                                        duration: started.elapsed(),
                                        fix_applied,
                                    });
                                    return Ok(value);
                                }
                                Err(e) => {
                                    settle(permit, &e);
                                    err = e;
                                }
                            }
                        }
                    }
                }
            }

            ctx.attempts.push(AttemptRecord {
                attempt,
                success: false,
                error: Some(err.to_string()),
                duration: started.elapsed(),
                fix_applied,
            });

            if err.is_cancellation() || !err.is_retryable() {
                return Err(err);
            }
            if attempt >= max_attempts {
                tracing::warn!(operation = %ctx.operation, attempts = attempt, error = %err, "retries exhausted");
                return Err(WorkflowError::RetryExhausted {
                    operation: ctx.operation.clone(),
                    attempts: attempt,
                    source: Box::new(err),
                });
            }

            let delay = ctx.policy.delay(attempt - 1);
            tracing::warn!(
                operation = %ctx.operation,
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "attempt failed, backing off"
            );
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(WorkflowError::Cancelled(ctx.operation.clone()));
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// 按注册顺序找第一个可自动执行且应用成功的策略，返回其名称
    async fn apply_first_fix(&self, err: &WorkflowError, meta: &mut Metadata) -> Option<String> {
        let providers: Vec<Arc<dyn FixProvider>> = self
            .fix_providers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for provider in providers {
            let strategies = match provider.get_fix_strategies(err, meta).await {
                Ok(s) => s,
                Err(reason) => {
                    tracing::debug!(provider = provider.name(), %reason, "provider declined");
                    continue;
                }
            };
            for strategy in strategies.iter().filter(|s| s.automated) {
                match provider.apply_fix(strategy, meta).await {
                    Ok(()) => return Some(strategy.name.clone()),
                    Err(reason) => {
                        tracing::debug!(
                            provider = provider.name(),
                            strategy = %strategy.name,
                            %reason,
                            "fix strategy failed to apply"
                        );
                    }
                }
            }
        }
        None
    }
}

async fn guarded<T, F, Fut>(op: &mut F, meta: Metadata, cancel: &CancellationToken, name: &str) -> Result<T>
where
    F: FnMut(Metadata) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(WorkflowError::Cancelled(name.to_string())),
        r = op(meta) => r,
    }
}

/// 只有执行类失败计入熔断统计
fn settle(permit: CallPermit, err: &WorkflowError) {
    if err.kind() == ErrorKind::Execution && !err.is_circuit_open() {
        permit.failure();
    } else {
        permit.release();
    }
}
