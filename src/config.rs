//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `DOCKHAND__*` 覆盖（双下划线表示嵌套，如 `DOCKHAND__SESSION__TTL_SECS=600`）。

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::retry::{CircuitConfig, RetryPolicy};
use crate::tools::ExecutorConfig;
use crate::workflow::WorkflowConfig;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub log: LogSection,
    pub session: SessionSection,
    pub retry: RetrySection,
    pub circuit: CircuitConfig,
    pub executor: ExecutorConfig,
    pub workflow: WorkflowConfig,
}

/// [app] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: String,
    /// 进度通道容量
    pub progress_buffer: usize,
    /// 关闭时清理任务的超时（秒）
    pub shutdown_timeout_secs: u64,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: "dockhand".to_string(),
            progress_buffer: 256,
            shutdown_timeout_secs: 5,
        }
    }
}

/// [log] 段：默认日志级别，RUST_LOG 优先
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogSection {
    pub level: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Sqlite,
    Memory,
}

/// [session] 段：存储后端、TTL、清理周期、锁超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    pub backend: BackendKind,
    pub db_path: PathBuf,
    pub ttl_secs: u64,
    pub cleanup_interval_secs: u64,
    pub lock_timeout_ms: u64,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            backend: BackendKind::Sqlite,
            db_path: PathBuf::from("data/sessions.db"),
            ttl_secs: 86_400,
            cleanup_interval_secs: 300,
            lock_timeout_ms: 30_000,
        }
    }
}

impl SessionSection {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

/// [retry] 段：默认策略 + 按操作名覆盖（[retry.policies.build_image]）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub default: RetryPolicy,
    pub policies: HashMap<String, RetryPolicy>,
}

/// 从 config 目录加载配置，环境变量 DOCKHAND__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 DOCKHAND__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        } else {
            tracing::warn!(path = %path.display(), "config file not found, ignoring");
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("DOCKHAND")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.session.backend, BackendKind::Sqlite);
        assert_eq!(cfg.session.lock_timeout(), Duration::from_secs(30));
        assert_eq!(cfg.session.ttl(), Duration::from_secs(86_400));
        assert_eq!(cfg.retry.default.max_attempts, 3);
        assert_eq!(cfg.circuit.failure_threshold, 5);
        assert_eq!(cfg.executor.worker_pool_size, 10);
        assert_eq!(cfg.workflow.job_timeout_secs, 1800);
    }

    #[test]
    fn test_load_explicit_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[session]
backend = "memory"
ttl_secs = 60

[retry.policies.push_image]
max_attempts = 5
initial_delay = 200
max_delay = 4000
backoff_multiplier = 1.5

[circuit]
failure_threshold = 3

[executor]
worker_pool_size = 4
execution_timeout = 1000

[workflow]
fix_on_failure = false
"#
        )
        .unwrap();

        let cfg = load_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(cfg.session.backend, BackendKind::Memory);
        assert_eq!(cfg.session.ttl_secs, 60);
        let push = &cfg.retry.policies["push_image"];
        assert_eq!(push.max_attempts, 5);
        assert_eq!(push.initial_delay, Duration::from_millis(200));
        assert!(push.jitter);
        assert_eq!(cfg.circuit.failure_threshold, 3);
        assert_eq!(cfg.circuit.success_threshold, 2);
        assert_eq!(cfg.executor.worker_pool_size, 4);
        assert_eq!(cfg.executor.execution_timeout, Duration::from_secs(1));
        assert!(!cfg.workflow.fix_on_failure);
    }
}
