//! 步骤定义
//!
//! StepKind 是封闭的步骤集合。每个变体本身无状态，静态声明：名称（同时是调度的工具名）、
//! 依赖、读取哪些状态槽位、输出落在哪里、对给定参数是否启用。

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::workflow::types::{JobArgs, WorkflowState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    AnalyzeRepository,
    GenerateDockerfile,
    ResolveBaseImages,
    BuildImage,
    SecurityScan,
    TagImage,
    PushImage,
    GenerateManifests,
    SetupCluster,
    DeployApplication,
    VerifyDeployment,
}

/// 输出写入的槽位
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Analysis,
    BuildFile,
    Build,
    Cluster,
    ScanReport,
}

impl StepKind {
    /// 默认执行顺序
    pub fn all() -> &'static [StepKind] {
        use StepKind::*;
        &[
            AnalyzeRepository,
            GenerateDockerfile,
            ResolveBaseImages,
            BuildImage,
            SecurityScan,
            TagImage,
            PushImage,
            GenerateManifests,
            SetupCluster,
            DeployApplication,
            VerifyDeployment,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            StepKind::AnalyzeRepository => "analyze_repository",
            StepKind::GenerateDockerfile => "generate_dockerfile",
            StepKind::ResolveBaseImages => "resolve_base_images",
            StepKind::BuildImage => "build_image",
            StepKind::SecurityScan => "security_scan",
            StepKind::TagImage => "tag_image",
            StepKind::PushImage => "push_image",
            StepKind::GenerateManifests => "generate_manifests",
            StepKind::SetupCluster => "setup_cluster",
            StepKind::DeployApplication => "deploy_application",
            StepKind::VerifyDeployment => "verify_deployment",
        }
    }

    pub fn depends_on(&self) -> &'static [StepKind] {
        use StepKind::*;
        match self {
            AnalyzeRepository | SetupCluster => &[],
            GenerateDockerfile => &[AnalyzeRepository],
            ResolveBaseImages | BuildImage => &[GenerateDockerfile],
            SecurityScan | TagImage => &[BuildImage],
            PushImage | GenerateManifests => &[TagImage],
            DeployApplication => &[GenerateManifests, SetupCluster],
            VerifyDeployment => &[DeployApplication],
        }
    }

    pub fn output_slot(&self) -> Slot {
        use StepKind::*;
        match self {
            AnalyzeRepository => Slot::Analysis,
            GenerateDockerfile | ResolveBaseImages => Slot::BuildFile,
            BuildImage | TagImage | PushImage => Slot::Build,
            SecurityScan => Slot::ScanReport,
            GenerateManifests | SetupCluster | DeployApplication | VerifyDeployment => Slot::Cluster,
        }
    }

    /// security_scan 仅在 scan=true 时执行；集群相关四步在 deploy=false 时跳过
    pub fn is_enabled(&self, args: &JobArgs) -> bool {
        use StepKind::*;
        match self {
            SecurityScan => args.scan,
            GenerateManifests | SetupCluster | DeployApplication | VerifyDeployment => args.deploy_enabled(),
            _ => true,
        }
    }

    /// 从状态中取出本步骤需要的输入
    pub fn inputs(&self, state: &WorkflowState) -> Value {
        use StepKind::*;
        let args = &state.args;
        match self {
            AnalyzeRepository => json!({
                "repo_url": args.repo_url,
                "branch": args.branch,
            }),
            GenerateDockerfile => json!({ "analysis": state.analysis }),
            ResolveBaseImages => json!({ "build_file": state.build_file }),
            BuildImage => json!({
                "build_file": state.build_file,
                "image_name": image_name(&args.repo_url),
            }),
            SecurityScan | TagImage | PushImage => json!({ "build": state.build }),
            GenerateManifests => json!({
                "analysis": state.analysis,
                "build": state.build,
            }),
            SetupCluster => json!({ "deploy": args.deploy_enabled() }),
            DeployApplication | VerifyDeployment => json!({ "cluster": state.cluster }),
        }
    }

    /// 把工具输出写入槽位。同一槽位的后续步骤做对象合并，首个写入者直接替换
    pub fn apply_output(&self, state: &mut WorkflowState, output: Value) {
        use StepKind::*;
        let replace = matches!(self, AnalyzeRepository | GenerateDockerfile | BuildImage | SecurityScan);
        let slot = match self.output_slot() {
            Slot::Analysis => &mut state.analysis,
            Slot::BuildFile => &mut state.build_file,
            Slot::Build => &mut state.build,
            Slot::Cluster => &mut state.cluster,
            Slot::ScanReport => &mut state.scan_report,
        };
        if replace {
            *slot = Some(output);
            return;
        }
        match output {
            Value::Object(update) => match slot {
                Some(Value::Object(existing)) => existing.extend(update),
                _ => *slot = Some(Value::Object(update)),
            },
            other => match slot {
                Some(Value::Object(existing)) => {
                    existing.insert(self.name().to_string(), other);
                }
                _ => *slot = Some(json!({ (self.name()): other })),
            },
        }
    }
}

/// 从仓库地址推导镜像名：取最后一段路径，去掉 .git，转小写
pub fn image_name(repo_url: &str) -> String {
    let last = repo_url
        .trim_end_matches('/')
        .rsplit(['/', ':'])
        .next()
        .unwrap_or("app");
    let name = last.trim_end_matches(".git").to_lowercase();
    if name.is_empty() {
        "app".to_string()
    } else {
        name
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for StepKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StepKind::all()
            .iter()
            .find(|k| k.name() == s)
            .copied()
            .ok_or_else(|| format!("unknown step '{s}'"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(scan: bool, deploy: Option<bool>) -> JobArgs {
        JobArgs {
            repo_url: "https://github.com/acme/Shop-API.git".into(),
            scan,
            deploy,
            ..JobArgs::default()
        }
    }

    #[test]
    fn test_names_round_trip() {
        for kind in StepKind::all() {
            assert_eq!(kind.name().parse::<StepKind>().unwrap(), *kind);
            assert_eq!(serde_json::to_value(kind).unwrap(), json!(kind.name()));
        }
        assert!("compile".parse::<StepKind>().is_err());
    }

    #[test]
    fn test_dependencies_precede_in_default_order() {
        let order = StepKind::all();
        for (i, kind) in order.iter().enumerate() {
            for dep in kind.depends_on() {
                let pos = order.iter().position(|k| k == dep).unwrap();
                assert!(pos < i, "{dep} must run before {kind}");
            }
        }
    }

    #[test]
    fn test_enabled_flags() {
        assert!(!StepKind::SecurityScan.is_enabled(&args(false, None)));
        assert!(StepKind::SecurityScan.is_enabled(&args(true, None)));
        assert!(StepKind::DeployApplication.is_enabled(&args(false, None)));
        assert!(!StepKind::DeployApplication.is_enabled(&args(false, Some(false))));
        assert!(StepKind::BuildImage.is_enabled(&args(false, Some(false))));
    }

    #[test]
    fn test_outputs_merge_into_shared_slot() {
        let mut state = WorkflowState::new("s1", args(false, None), 11);
        StepKind::BuildImage.apply_output(&mut state, json!({"image_id": "sha256:1"}));
        StepKind::TagImage.apply_output(&mut state, json!({"image_ref": "shop-api:latest"}));
        let build = state.build.as_ref().unwrap();
        assert_eq!(build["image_id"], json!("sha256:1"));
        assert_eq!(build["image_ref"], json!("shop-api:latest"));

        StepKind::BuildImage.apply_output(&mut state, json!({"image_id": "sha256:2"}));
        assert!(state.build.as_ref().unwrap().get("image_ref").is_none());
    }

    #[test]
    fn test_image_name() {
        assert_eq!(image_name("https://github.com/acme/Shop-API.git"), "shop-api");
        assert_eq!(image_name("git@github.com:acme/web.git"), "web");
        assert_eq!(image_name(""), "app");
    }
}
