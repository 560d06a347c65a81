//! 会话记录

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::retry::Metadata;

/// 一个作业的持久化记录。`updated_at`（微秒）即乐观并发版本号，每次写入严格递增
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    #[serde(default)]
    pub metadata: Metadata,
    pub created_at: i64,
    pub updated_at: i64,
    pub expires_at: i64,
}

pub fn now_micros() -> i64 {
    Utc::now().timestamp_micros()
}

impl Session {
    pub fn new(id: impl Into<String>, ttl_micros: i64) -> Self {
        let now = now_micros();
        Self {
            id: id.into(),
            metadata: Metadata::new(),
            created_at: now,
            updated_at: now,
            expires_at: now.saturating_add(ttl_micros),
        }
    }

    pub fn version(&self) -> i64 {
        self.updated_at
    }

    pub fn is_expired_at(&self, now: i64) -> bool {
        self.expires_at <= now
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(now_micros())
    }

    /// 写入前推进版本：取当前时间，但至少比上一版本大 1
    pub fn touch(&mut self) {
        self.updated_at = now_micros().max(self.updated_at + 1);
    }

    pub fn updated_at_utc(&self) -> DateTime<Utc> {
        Utc.timestamp_micros(self.updated_at)
            .single()
            .unwrap_or_default()
    }
}
