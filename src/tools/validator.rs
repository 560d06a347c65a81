//! 工具输入输出校验
//!
//! ToolValidator 由执行器在调用前后使用；RequiredFieldsValidator 按工具名检查必需字段。

use std::collections::HashMap;

use serde_json::Value;

use crate::tools::registry::ToolInput;

pub trait ToolValidator: Send + Sync {
    fn validate_input(&self, tool: &str, input: &ToolInput) -> Result<(), String>;

    fn validate_output(&self, tool: &str, output: &Value) -> Result<(), String>;
}

/// 按工具名登记必需的输入 / 输出字段
#[derive(Debug, Default, Clone)]
pub struct RequiredFieldsValidator {
    inputs: HashMap<String, Vec<String>>,
    outputs: HashMap<String, Vec<String>>,
}

impl RequiredFieldsValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn require_input(mut self, tool: &str, fields: &[&str]) -> Self {
        self.inputs
            .insert(tool.to_string(), fields.iter().map(|f| f.to_string()).collect());
        self
    }

    pub fn require_output(mut self, tool: &str, fields: &[&str]) -> Self {
        self.outputs
            .insert(tool.to_string(), fields.iter().map(|f| f.to_string()).collect());
        self
    }

    /// 默认步骤链路上各工具之间传递的关键字段
    pub fn for_default_plan() -> Self {
        Self::new()
            .require_input("analyze_repository", &["repo_url"])
            .require_input("generate_dockerfile", &["analysis"])
            .require_input("build_image", &["build_file", "image_name"])
            .require_input("tag_image", &["build"])
            .require_input("deploy_application", &["cluster"])
            .require_output("build_image", &["image_id"])
            .require_output("tag_image", &["image_ref"])
            .require_output("push_image", &["image_ref"])
            .require_output("deploy_application", &["endpoint"])
    }
}

fn check(value: &Value, fields: Option<&Vec<String>>, what: &str) -> Result<(), String> {
    let Some(fields) = fields else {
        return Ok(());
    };
    let obj = value
        .as_object()
        .ok_or_else(|| format!("{what} must be a JSON object"))?;
    let missing: Vec<&str> = fields
        .iter()
        .filter(|f| obj.get(f.as_str()).map_or(true, Value::is_null))
        .map(String::as_str)
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(format!("{what} missing required fields: {}", missing.join(", ")))
    }
}

impl ToolValidator for RequiredFieldsValidator {
    fn validate_input(&self, tool: &str, input: &ToolInput) -> Result<(), String> {
        if input.session_id.is_empty() {
            return Err("session_id is empty".to_string());
        }
        check(&input.data, self.inputs.get(tool), "input")
    }

    fn validate_output(&self, tool: &str, output: &Value) -> Result<(), String> {
        check(output, self.outputs.get(tool), "output")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_required_fields() {
        let v = RequiredFieldsValidator::new()
            .require_input("build_image", &["dockerfile", "image_name"])
            .require_output("build_image", &["image_id"]);

        let ok = ToolInput::new("s1", json!({"dockerfile": "FROM x", "image_name": "app"}));
        assert!(v.validate_input("build_image", &ok).is_ok());

        let missing = ToolInput::new("s1", json!({"dockerfile": "FROM x", "image_name": null}));
        let err = v.validate_input("build_image", &missing).unwrap_err();
        assert!(err.contains("image_name"));

        assert!(v.validate_output("build_image", &json!({"image_id": "sha256:1"})).is_ok());
        assert!(v.validate_output("build_image", &json!("text")).is_err());
        // 未登记的工具不检查字段
        assert!(v.validate_output("tag_image", &json!(null)).is_ok());
    }

    #[test]
    fn test_empty_session_rejected() {
        let v = RequiredFieldsValidator::new();
        assert!(v.validate_input("x", &ToolInput::new("", json!({}))).is_err());
    }

    #[test]
    fn test_default_plan_rules() {
        let v = RequiredFieldsValidator::for_default_plan();
        let input = ToolInput::new("s1", json!({"analysis": null}));
        assert!(v.validate_input("generate_dockerfile", &input).is_err());
        assert!(v.validate_output("tag_image", &json!({"image_ref": "web:latest"})).is_ok());
        assert!(v.validate_output("verify_deployment", &json!("anything")).is_ok());
    }
}
