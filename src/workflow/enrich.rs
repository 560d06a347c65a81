//! 步骤执行前的参数增强

use async_trait::async_trait;

use crate::retry::Metadata;
use crate::workflow::step::StepKind;
use crate::workflow::types::WorkflowState;

/// 在步骤执行前补充 `request_params`（例如由分析结果推断的端口、构建参数）。
/// 返回的键值合并进状态；失败只记录日志，不影响步骤执行。
#[async_trait]
pub trait ParameterEnricher: Send + Sync {
    async fn enrich(&self, step: StepKind, state: &WorkflowState) -> Result<Metadata, String>;
}

/// 把分析结果里的语言 / 框架 / 端口带给后续步骤
#[derive(Debug, Default)]
pub struct AnalysisEnricher;

#[async_trait]
impl ParameterEnricher for AnalysisEnricher {
    async fn enrich(&self, step: StepKind, state: &WorkflowState) -> Result<Metadata, String> {
        let mut params = Metadata::new();
        if step == StepKind::AnalyzeRepository {
            return Ok(params);
        }
        let Some(analysis) = state.analysis.as_ref() else {
            return Ok(params);
        };
        for key in ["language", "framework", "port"] {
            if let Some(v) = analysis.get(key) {
                if !v.is_null() {
                    params.insert(key.to_string(), v.clone());
                }
            }
        }
        Ok(params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::types::JobArgs;
    use serde_json::json;

    #[tokio::test]
    async fn test_analysis_fields_forwarded() {
        let mut state = WorkflowState::new("s1", JobArgs::new("x"), 3);
        state.analysis = Some(json!({"language": "go", "port": 8080, "framework": null}));
        let params = AnalysisEnricher.enrich(StepKind::BuildImage, &state).await.unwrap();
        assert_eq!(params["language"], json!("go"));
        assert_eq!(params["port"], json!(8080));
        assert!(!params.contains_key("framework"));

        let params = AnalysisEnricher
            .enrich(StepKind::AnalyzeRepository, &state)
            .await
            .unwrap();
        assert!(params.is_empty());
    }
}
