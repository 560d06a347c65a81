//! 工具注册表
//!
//! 每个步骤对应一个工具（工具名 == 步骤名），实现 Tool trait；ToolRegistry 按名注册与查找，
//! ToolExecutor 在调用时叠加缓存、校验、超时与线程池调度。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// 工具静态描述
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolMetadata {
    pub name: String,
    pub version: String,
    /// 分组标签：analysis / build / registry / cluster / security
    pub category: String,
    /// 工具自身的超时上限；None 时只受执行器配置约束
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
}

impl ToolMetadata {
    pub fn new(name: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: "1.0.0".to_string(),
            category: category.into(),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// 一次工具调用的输入
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInput {
    pub session_id: String,
    pub data: Value,
}

impl ToolInput {
    pub fn new(session_id: impl Into<String>, data: Value) -> Self {
        Self {
            session_id: session_id.into(),
            data,
        }
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn metadata(&self) -> ToolMetadata;

    /// 执行前的自校验；默认接受任何输入
    fn validate(&self, _input: &ToolInput) -> Result<(), String> {
        Ok(())
    }

    /// 执行工具；实现应在 cancel 触发后尽快返回
    async fn execute(&self, input: ToolInput, cancel: CancellationToken) -> Result<Value, String>;
}

/// 工具注册表：按名称存储 Arc<dyn Tool>
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.metadata().name;
        if self.tools.insert(name.clone(), tool).is_some() {
            tracing::warn!(tool = %name, "tool re-registered, previous instance replaced");
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str);

    #[async_trait]
    impl Tool for Named {
        fn metadata(&self) -> ToolMetadata {
            ToolMetadata::new(self.0, "test")
        }

        async fn execute(&self, input: ToolInput, _cancel: CancellationToken) -> Result<Value, String> {
            Ok(input.data)
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = ToolRegistry::new();
        registry.register(Named("build_image"));
        registry.register(Named("analyze_repository"));
        assert!(registry.contains("build_image"));
        assert!(registry.get("push_image").is_none());
        assert_eq!(registry.tool_names(), vec!["analyze_repository", "build_image"]);
    }

    #[test]
    fn test_reregister_replaces() {
        let mut registry = ToolRegistry::new();
        registry.register(Named("tag_image"));
        registry.register(Named("tag_image"));
        assert_eq!(registry.len(), 1);
    }
}
