//! 演练工具（无副作用）
//!
//! 每个步骤一个 DryRunTool，根据输入返回确定性的合成输出，供命令行演练与测试使用。

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::tools::registry::{Tool, ToolInput, ToolMetadata, ToolRegistry};
use crate::workflow::step::{image_name, StepKind};

const DEFAULT_PORT: u64 = 8080;
const DEFAULT_NAMESPACE: &str = "default";
const DRY_RUN_REGISTRY: &str = "localhost:5000";

pub struct DryRunTool {
    step: StepKind,
    latency: Duration,
}

impl DryRunTool {
    pub fn new(step: StepKind) -> Self {
        Self {
            step,
            latency: Duration::ZERO,
        }
    }

    /// 模拟耗时（可被取消）
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    fn category(&self) -> &'static str {
        use StepKind::*;
        match self.step {
            AnalyzeRepository | GenerateDockerfile | ResolveBaseImages => "analysis",
            BuildImage | TagImage => "build",
            PushImage => "registry",
            SecurityScan => "security",
            GenerateManifests | SetupCluster | DeployApplication | VerifyDeployment => "cluster",
        }
    }

    fn output(&self, data: &Value) -> Value {
        use StepKind::*;
        match self.step {
            AnalyzeRepository => {
                let repo_url = str_at(data, &["repo_url"]).unwrap_or_default();
                json!({
                    "repo_url": repo_url,
                    "branch": str_at(data, &["branch"]).unwrap_or("main"),
                    "language": guess_language(repo_url),
                    "framework": null,
                    "port": DEFAULT_PORT,
                })
            }
            GenerateDockerfile => {
                let language = str_at(data, &["analysis", "language"]).unwrap_or("generic");
                let port = u64_at(data, &["analysis", "port"]).unwrap_or(DEFAULT_PORT);
                let base = base_image(language);
                json!({
                    "path": "Dockerfile",
                    "base_image": base,
                    "content": format!("FROM {base}\nWORKDIR /app\nCOPY . .\nEXPOSE {port}\n"),
                })
            }
            ResolveBaseImages => {
                let base = str_at(data, &["build_file", "base_image"]).unwrap_or("alpine:3.19");
                json!({ "resolved_base_images": [base] })
            }
            BuildImage => {
                let name = str_at(data, &["image_name"]).unwrap_or("app");
                json!({
                    "image_name": name,
                    "image_id": format!("sha256:{:016x}", digest(&data["build_file"])),
                })
            }
            SecurityScan => json!({
                "scanner": "dry-run",
                "vulnerabilities": 0,
                "passed": true,
            }),
            TagImage => {
                let name = str_at(data, &["build", "image_name"]).unwrap_or("app");
                json!({ "image_ref": format!("{name}:latest") })
            }
            PushImage => {
                let image_ref = str_at(data, &["build", "image_ref"]).unwrap_or("app:latest");
                json!({
                    "registry": DRY_RUN_REGISTRY,
                    "image_ref": format!("{DRY_RUN_REGISTRY}/{image_ref}"),
                    "pushed": true,
                })
            }
            GenerateManifests => {
                let name = str_at(data, &["build", "image_name"]).unwrap_or("app");
                let port = u64_at(data, &["analysis", "port"]).unwrap_or(DEFAULT_PORT);
                json!({
                    "app": name,
                    "port": port,
                    "manifests": ["deployment.yaml", "service.yaml"],
                    "namespace": DEFAULT_NAMESPACE,
                })
            }
            SetupCluster => json!({
                "cluster": "dry-run",
                "namespace": DEFAULT_NAMESPACE,
            }),
            DeployApplication => {
                let cluster = &data["cluster"];
                let app = str_at(cluster, &["app"]).unwrap_or("app");
                let namespace = str_at(cluster, &["namespace"]).unwrap_or(DEFAULT_NAMESPACE);
                let port = u64_at(cluster, &["port"]).unwrap_or(DEFAULT_PORT);
                json!({
                    "deployed": true,
                    "endpoint": format!("http://{app}.{namespace}.svc.cluster.local:{port}"),
                })
            }
            VerifyDeployment => json!({ "healthy": true }),
        }
    }
}

#[async_trait]
impl Tool for DryRunTool {
    fn metadata(&self) -> ToolMetadata {
        ToolMetadata::new(self.step.name(), self.category())
    }

    fn validate(&self, input: &ToolInput) -> Result<(), String> {
        if self.step == StepKind::AnalyzeRepository && str_at(&input.data, &["repo_url"]).is_none() {
            return Err("repo_url must be a string".to_string());
        }
        Ok(())
    }

    async fn execute(&self, input: ToolInput, cancel: CancellationToken) -> Result<Value, String> {
        if !self.latency.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => return Err(format!("{} cancelled", self.step)),
                _ = tokio::time::sleep(self.latency) => {}
            }
        }
        tracing::debug!(step = %self.step, session_id = %input.session_id, "dry-run tool executed");
        Ok(self.output(&input.data))
    }
}

/// 为所有步骤注册演练工具
pub fn dry_run_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    for step in StepKind::all() {
        registry.register(DryRunTool::new(*step));
    }
    registry
}

fn str_at<'a>(value: &'a Value, path: &[&str]) -> Option<&'a str> {
    path.iter().try_fold(value, |v, key| v.get(key))?.as_str()
}

fn u64_at(value: &Value, path: &[&str]) -> Option<u64> {
    path.iter().try_fold(value, |v, key| v.get(key))?.as_u64()
}

fn digest(value: &Value) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.to_string().hash(&mut hasher);
    hasher.finish()
}

fn guess_language(repo_url: &str) -> &'static str {
    let name = image_name(repo_url);
    if name.contains("rs") || name.contains("rust") {
        "rust"
    } else if name.contains("go") {
        "go"
    } else if name.contains("py") {
        "python"
    } else if name.contains("node") || name.contains("js") {
        "node"
    } else {
        "generic"
    }
}

fn base_image(language: &str) -> &'static str {
    match language {
        "rust" => "rust:1.79-slim",
        "go" => "golang:1.22-alpine",
        "python" => "python:3.12-slim",
        "node" => "node:20-alpine",
        _ => "alpine:3.19",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_registry_covers_every_step() {
        let registry = dry_run_registry();
        assert_eq!(registry.len(), StepKind::all().len());
        for step in StepKind::all() {
            assert!(registry.contains(step.name()));
        }
    }

    #[tokio::test]
    async fn test_outputs_are_deterministic() {
        let tool = DryRunTool::new(StepKind::BuildImage);
        let input = ToolInput::new("s1", json!({"image_name": "shop", "build_file": {"path": "Dockerfile"}}));
        let a = tool.execute(input.clone(), CancellationToken::new()).await.unwrap();
        let b = tool.execute(input, CancellationToken::new()).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a["image_name"], json!("shop"));
    }

    #[tokio::test]
    async fn test_analyze_requires_repo_url() {
        let tool = DryRunTool::new(StepKind::AnalyzeRepository);
        assert!(tool.validate(&ToolInput::new("s1", json!({}))).is_err());
        assert!(tool
            .validate(&ToolInput::new("s1", json!({"repo_url": "https://x/go-api"})))
            .is_ok());
        let out = tool
            .execute(ToolInput::new("s1", json!({"repo_url": "https://x/go-api"})), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out["language"], json!("go"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_latency_is_cancellable() {
        let tool = DryRunTool::new(StepKind::VerifyDeployment).with_latency(Duration::from_secs(60));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = tool.execute(ToolInput::new("s1", json!({})), cancel).await.unwrap_err();
        assert!(err.contains("cancelled"));
    }
}
