//! 工具错误分类
//!
//! 根据工具返回的错误文本归类（超时 / 网络 / 限流 / 资源 / 构建 / 永久性），
//! 用于决定是否重试以及挑选修复策略。

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// 错误细分类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Timeout,
    Network,
    RateLimit,
    Resource,
    Build,
    BaseImage,
    Validation,
    /// 重试无意义（未授权、不存在、参数非法）
    Permanent,
    Unknown,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Timeout => "timeout",
            ErrorClass::Network => "network",
            ErrorClass::RateLimit => "rate_limit",
            ErrorClass::Resource => "resource",
            ErrorClass::Build => "build",
            ErrorClass::BaseImage => "base_image",
            ErrorClass::Validation => "validation",
            ErrorClass::Permanent => "permanent",
            ErrorClass::Unknown => "unknown",
        }
    }
}

// 顺序即优先级：Permanent 先匹配
const PATTERNS: &[(ErrorClass, &str)] = &[
    (
        ErrorClass::Permanent,
        r"(?i)(unauthori[sz]ed|forbidden|permission denied|no such (file|repository)|not found|invalid argument)",
    ),
    (ErrorClass::Timeout, r"(?i)(timed? ?out|deadline exceeded)"),
    (ErrorClass::RateLimit, r"(?i)(rate limit|throttl|too many requests|\b429\b)"),
    (
        ErrorClass::Network,
        r"(?i)(connection (refused|reset)|temporary failure|service unavailable|\b50[234]\b|eof)",
    ),
    (ErrorClass::Resource, r"(?i)(no space left|out of memory|oom|disk quota)"),
    (
        ErrorClass::BaseImage,
        r"(?i)(manifest unknown|base image|pull access denied|failed to resolve)",
    ),
    (ErrorClass::Build, r"(?i)(build failed|returned a non-zero code|dockerfile)"),
];

fn compiled() -> &'static [(ErrorClass, Regex)] {
    static COMPILED: OnceLock<Vec<(ErrorClass, Regex)>> = OnceLock::new();
    COMPILED.get_or_init(|| {
        PATTERNS
            .iter()
            .filter_map(|(class, pattern)| match Regex::new(pattern) {
                Ok(re) => Some((*class, re)),
                Err(e) => {
                    tracing::error!(pattern, error = %e, "invalid error classification pattern");
                    None
                }
            })
            .collect()
    })
}

/// 对错误文本归类；未命中任何模式返回 Unknown
pub fn classify_message(message: &str) -> ErrorClass {
    compiled()
        .iter()
        .find(|(_, re)| re.is_match(message))
        .map(|(class, _)| *class)
        .unwrap_or(ErrorClass::Unknown)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_common_messages() {
        assert_eq!(classify_message("dial tcp: i/o timeout"), ErrorClass::Timeout);
        assert_eq!(classify_message("HTTP 503 Service Unavailable"), ErrorClass::Network);
        assert_eq!(classify_message("toomanyrequests: rate limit exceeded"), ErrorClass::RateLimit);
        assert_eq!(
            classify_message("denied: requested access to the resource is unauthorized"),
            ErrorClass::Permanent
        );
        assert_eq!(
            classify_message("failed to resolve source metadata for docker.io/library/nod:18"),
            ErrorClass::BaseImage
        );
        assert_eq!(
            classify_message("The command '/bin/sh -c npm ci' returned a non-zero code: 1"),
            ErrorClass::Build
        );
        assert_eq!(classify_message("something odd"), ErrorClass::Unknown);
    }
}
