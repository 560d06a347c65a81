//! 失败修复策略
//!
//! 步骤失败后，协调器按注册顺序询问 FixProvider：给出候选策略、应用第一个可自动执行的策略，
//! 然后在同一次尝试内重新执行一次。策略通过修改步骤的元数据（Metadata）生效。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::core::WorkflowError;
use crate::retry::classify::ErrorClass;

/// 步骤执行元数据（工具参数之外的调节旋钮）
pub type Metadata = serde_json::Map<String, Value>;

/// 一条候选修复策略
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixStrategy {
    pub name: String,
    pub description: String,
    /// 数值越小越优先
    pub priority: u32,
    /// false 表示只能作为建议输出，不会被自动应用
    pub automated: bool,
    #[serde(default)]
    pub parameters: Metadata,
}

impl FixStrategy {
    pub fn new(name: impl Into<String>, description: impl Into<String>, priority: u32) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            priority,
            automated: true,
            parameters: Metadata::new(),
        }
    }

    pub fn manual(mut self) -> Self {
        self.automated = false;
        self
    }

    pub fn with_param(mut self, key: &str, value: Value) -> Self {
        self.parameters.insert(key.to_string(), value);
        self
    }
}

/// 修复能力提供者
#[async_trait]
pub trait FixProvider: Send + Sync {
    fn name(&self) -> &str;

    /// 针对错误给出候选策略；Err 表示本提供者无法处理，协调器跳过它
    async fn get_fix_strategies(
        &self,
        error: &WorkflowError,
        metadata: &Metadata,
    ) -> Result<Vec<FixStrategy>, String>;

    /// 将策略应用到元数据上
    async fn apply_fix(&self, strategy: &FixStrategy, metadata: &mut Metadata) -> Result<(), String>;
}

/// 基于错误分类的启发式修复：超时放宽、构建降级、基础镜像固定
#[derive(Debug, Default)]
pub struct HeuristicFixProvider;

impl HeuristicFixProvider {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl FixProvider for HeuristicFixProvider {
    fn name(&self) -> &str {
        "heuristic"
    }

    async fn get_fix_strategies(
        &self,
        error: &WorkflowError,
        metadata: &Metadata,
    ) -> Result<Vec<FixStrategy>, String> {
        let mut strategies = match error.class() {
            ErrorClass::Timeout | ErrorClass::Resource => {
                let current = metadata
                    .get("timeout_multiplier")
                    .and_then(Value::as_f64)
                    .unwrap_or(1.0);
                vec![FixStrategy::new("extend_timeout", "Double the step timeout", 10)
                    .with_param("timeout_multiplier", json!(current * 2.0))]
            }
            ErrorClass::Build => vec![
                FixStrategy::new(
                    "conservative_build",
                    "Disable build cache and parallel stages",
                    10,
                )
                .with_param("no_cache", json!(true))
                .with_param("build_mode", json!("conservative")),
            ],
            ErrorClass::BaseImage => vec![FixStrategy::new(
                "pin_base_image",
                "Fall back to a pinned, known-good base image",
                5,
            )
            .with_param("pin_base_image", json!(true))],
            ErrorClass::Validation => vec![FixStrategy::new(
                "review_inputs",
                "Inputs are invalid; fix the request and resubmit",
                50,
            )
            .manual()],
            ErrorClass::Permanent => {
                return Err(format!("no fix for permanent error: {error}"));
            }
            _ => Vec::new(),
        };
        strategies.sort_by_key(|s| s.priority);
        Ok(strategies)
    }

    async fn apply_fix(&self, strategy: &FixStrategy, metadata: &mut Metadata) -> Result<(), String> {
        if !strategy.automated {
            return Err(format!("strategy '{}' requires manual action", strategy.name));
        }
        for (k, v) in &strategy.parameters {
            metadata.insert(k.clone(), v.clone());
        }
        let applied = metadata
            .entry("applied_fixes")
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Value::Array(list) = applied {
            list.push(Value::String(strategy.name.clone()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed(msg: &str) -> WorkflowError {
        WorkflowError::ToolFailed {
            tool: "build_image".into(),
            message: msg.into(),
        }
    }

    #[tokio::test]
    async fn test_timeout_extends_multiplier() {
        let provider = HeuristicFixProvider::new();
        let mut meta = Metadata::new();
        meta.insert("timeout_multiplier".into(), json!(2.0));
        let err = WorkflowError::ToolTimeout {
            tool: "build_image".into(),
            timeout_ms: 100,
        };
        let strategies = provider.get_fix_strategies(&err, &meta).await.unwrap();
        assert_eq!(strategies[0].name, "extend_timeout");
        provider.apply_fix(&strategies[0], &mut meta).await.unwrap();
        assert_eq!(meta["timeout_multiplier"], json!(4.0));
        assert_eq!(meta["applied_fixes"], json!(["extend_timeout"]));
    }

    #[tokio::test]
    async fn test_build_failure_goes_conservative() {
        let provider = HeuristicFixProvider::new();
        let strategies = provider
            .get_fix_strategies(&failed("build failed: step 4/9"), &Metadata::new())
            .await
            .unwrap();
        assert_eq!(strategies.len(), 1);
        assert_eq!(strategies[0].parameters["build_mode"], json!("conservative"));
    }

    #[tokio::test]
    async fn test_manual_strategy_not_applied() {
        let provider = HeuristicFixProvider::new();
        let err = WorkflowError::InputValidation {
            tool: "build_image".into(),
            reason: "missing dockerfile".into(),
        };
        let strategies = provider.get_fix_strategies(&err, &Metadata::new()).await.unwrap();
        assert!(!strategies[0].automated);
        let mut meta = Metadata::new();
        assert!(provider.apply_fix(&strategies[0], &mut meta).await.is_err());
        assert!(meta.is_empty());
    }

    #[tokio::test]
    async fn test_permanent_error_declined() {
        let provider = HeuristicFixProvider::new();
        let res = provider
            .get_fix_strategies(&failed("unauthorized: authentication required"), &Metadata::new())
            .await;
        assert!(res.is_err());
    }
}
