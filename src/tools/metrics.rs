//! 执行指标缓冲
//!
//! 指标先进入内存缓冲，缓冲满或定时器触发时整批交给 MetricsSink。默认 sink 输出 tracing 事件。

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricEntry {
    pub name: String,
    pub value: f64,
    pub labels: BTreeMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

impl MetricEntry {
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            value,
            labels: BTreeMap::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn label(mut self, key: &str, value: impl ToString) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }
}

/// 指标落地
pub trait MetricsSink: Send + Sync {
    fn flush(&self, batch: &[MetricEntry]);
}

/// 把每条指标写成一条 debug 级 tracing 事件
#[derive(Debug, Default)]
pub struct TracingMetricsSink;

impl MetricsSink for TracingMetricsSink {
    fn flush(&self, batch: &[MetricEntry]) {
        for m in batch {
            let labels = serde_json::to_string(&m.labels).unwrap_or_default();
            tracing::debug!(metric = %m.name, value = m.value, %labels, "metric");
        }
        tracing::trace!(count = batch.len(), "metrics batch flushed");
    }
}

pub struct MetricsBuffer {
    capacity: usize,
    entries: Mutex<Vec<MetricEntry>>,
    sink: Arc<dyn MetricsSink>,
}

impl MetricsBuffer {
    pub fn new(capacity: usize, sink: Arc<dyn MetricsSink>) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: Mutex::new(Vec::with_capacity(capacity)),
            sink,
        }
    }

    /// 记录一条指标；缓冲达到容量时立即刷出
    pub fn record(&self, entry: MetricEntry) {
        let full = {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            entries.push(entry);
            entries.len() >= self.capacity
        };
        if full {
            self.flush();
        }
    }

    pub fn flush(&self) {
        let batch = {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *entries)
        };
        if !batch.is_empty() {
            self.sink.flush(&batch);
        }
    }

    pub fn pending(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// 周期性刷出；token 取消时做最后一次刷出后退出
    pub fn spawn_flusher(self: &Arc<Self>, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let buffer = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => buffer.flush(),
                }
            }
            buffer.flush();
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Collect(Mutex<Vec<usize>>);

    impl MetricsSink for Collect {
        fn flush(&self, batch: &[MetricEntry]) {
            self.0.lock().unwrap().push(batch.len());
        }
    }

    #[test]
    fn test_flush_on_capacity() {
        let sink = Arc::new(Collect::default());
        let buffer = MetricsBuffer::new(3, sink.clone());
        for i in 0..7 {
            buffer.record(MetricEntry::new("tool.duration_us", i as f64).label("tool", "build_image"));
        }
        assert_eq!(*sink.0.lock().unwrap(), vec![3, 3]);
        assert_eq!(buffer.pending(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_flush_and_final_flush() {
        let sink = Arc::new(Collect::default());
        let buffer = Arc::new(MetricsBuffer::new(100, sink.clone()));
        let shutdown = CancellationToken::new();
        let handle = buffer.spawn_flusher(Duration::from_secs(1), shutdown.clone());

        buffer.record(MetricEntry::new("a", 1.0));
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(*sink.0.lock().unwrap(), vec![1]);

        buffer.record(MetricEntry::new("b", 1.0));
        shutdown.cancel();
        handle.await.unwrap();
        assert_eq!(*sink.0.lock().unwrap(), vec![1, 1]);
    }

    #[test]
    fn test_entry_serializes_with_timestamp() {
        let entry = MetricEntry::new("tool.success", 1.0).label("outcome", "ok");
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["labels"]["outcome"], "ok");
        assert!(value["timestamp"].is_string());
        let back: MetricEntry = serde_json::from_value(value).unwrap();
        assert_eq!(back, entry);
    }
}
