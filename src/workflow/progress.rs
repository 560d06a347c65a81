//! 进度上报
//!
//! 编排器每完成一步、进入修复或终止时调用 ProgressSink。上报有超时上限，失败只记日志。

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::retry::Metadata;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub stage: String,
    pub percent: u8,
    pub message: String,
    /// running / fixing / succeeded / failed
    pub status: String,
    pub step: usize,
    pub total: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
}

#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn emit(&self, stage: &str, percent: u8, message: &str) -> Result<(), String>;

    /// 默认退化为 emit
    async fn emit_detailed(&self, update: ProgressUpdate) -> Result<(), String> {
        self.emit(&update.stage, update.percent, &update.message).await
    }

    async fn close(&self) -> Result<(), String> {
        Ok(())
    }
}

/// 无操作实现（无界面 / 测试）
#[derive(Debug, Default)]
pub struct NoopProgressSink;

#[async_trait]
impl ProgressSink for NoopProgressSink {
    async fn emit(&self, _stage: &str, _percent: u8, _message: &str) -> Result<(), String> {
        Ok(())
    }
}

/// 写 tracing 日志
#[derive(Debug, Default)]
pub struct LogProgressSink;

#[async_trait]
impl ProgressSink for LogProgressSink {
    async fn emit(&self, stage: &str, percent: u8, message: &str) -> Result<(), String> {
        tracing::info!(stage, percent, message, "progress");
        Ok(())
    }

    async fn emit_detailed(&self, update: ProgressUpdate) -> Result<(), String> {
        tracing::info!(
            stage = %update.stage,
            percent = update.percent,
            status = %update.status,
            step = update.step,
            total = update.total,
            trace_id = update.trace_id.as_deref().unwrap_or(""),
            "{}",
            update.message
        );
        Ok(())
    }
}

/// 有界通道：满时丢弃并返回错误，不阻塞调用方
pub struct ChannelProgressSink {
    tx: mpsc::Sender<ProgressUpdate>,
    closed: AtomicBool,
}

impl ChannelProgressSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ProgressUpdate>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                closed: AtomicBool::new(false),
            },
            rx,
        )
    }
}

#[async_trait]
impl ProgressSink for ChannelProgressSink {
    async fn emit(&self, stage: &str, percent: u8, message: &str) -> Result<(), String> {
        self.emit_detailed(ProgressUpdate {
            stage: stage.to_string(),
            percent,
            message: message.to_string(),
            status: "running".to_string(),
            step: 0,
            total: 0,
            eta_ms: None,
            trace_id: None,
            metadata: Metadata::new(),
        })
        .await
    }

    async fn emit_detailed(&self, update: ProgressUpdate) -> Result<(), String> {
        if self.closed.load(Ordering::Acquire) {
            return Err("progress sink closed".to_string());
        }
        self.tx.try_send(update).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => "progress channel full, update dropped".to_string(),
            mpsc::error::TrySendError::Closed(_) => "progress receiver dropped".to_string(),
        })
    }

    async fn close(&self) -> Result<(), String> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_sink_drops_when_full() {
        let (sink, mut rx) = ChannelProgressSink::new(1);
        assert!(sink.emit("analyze_repository", 10, "ok").await.is_ok());
        assert!(sink.emit("generate_dockerfile", 20, "ok").await.is_err());
        let first = rx.recv().await.unwrap();
        assert_eq!(first.stage, "analyze_repository");
        assert!(sink.emit("build_image", 30, "ok").await.is_ok());
    }

    #[tokio::test]
    async fn test_closed_sink_rejects() {
        let (sink, _rx) = ChannelProgressSink::new(4);
        sink.close().await.unwrap();
        assert!(sink.emit("x", 0, "y").await.is_err());
    }

    #[tokio::test]
    async fn test_noop_sink() {
        let sink = NoopProgressSink;
        assert!(sink.emit("x", 0, "y").await.is_ok());
        assert!(sink.close().await.is_ok());
    }
}
