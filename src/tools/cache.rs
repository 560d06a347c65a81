//! 工具结果短期缓存
//!
//! 键为 `tool:session:长度(hex):哈希(hex)`，值带过期时间。超过容量时先清理过期项，
//! 仍超出则淘汰最早过期的条目。

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::RwLock;
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct CachedResult {
    value: Value,
    expires_at: Instant,
}

/// 缓存键：同一会话、同一工具、相同输入命中同一条目
pub fn fingerprint(tool: &str, session_id: &str, data: &Value) -> String {
    let encoded = data.to_string();
    let mut hasher = DefaultHasher::new();
    encoded.hash(&mut hasher);
    format!("{tool}:{session_id}:{:x}:{:016x}", encoded.len(), hasher.finish())
}

#[derive(Debug)]
pub struct ResultCache {
    ttl: Duration,
    capacity: usize,
    entries: RwLock<HashMap<String, CachedResult>>,
}

impl ResultCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity: capacity.max(1),
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        let now = Instant::now();
        {
            let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
            match entries.get(key) {
                Some(hit) if hit.expires_at > now => return Some(hit.value.clone()),
                Some(_) => {}
                None => return None,
            }
        }
        // 过期：顺手删除。读锁释放后可能已有新值写入，写锁下再判断一次
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        take_fresh(&mut entries, key, now)
    }

    pub fn put(&self, key: String, value: Value) {
        let now = Instant::now();
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.insert(
            key,
            CachedResult {
                value,
                expires_at: now + self.ttl,
            },
        );
        if entries.len() > self.capacity {
            entries.retain(|_, v| v.expires_at > now);
            while entries.len() > self.capacity {
                let oldest = entries
                    .iter()
                    .min_by_key(|(_, v)| v.expires_at)
                    .map(|(k, _)| k.clone());
                match oldest {
                    Some(k) => {
                        entries.remove(&k);
                    }
                    None => break,
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

/// 未过期返回值；过期则删除
fn take_fresh(entries: &mut HashMap<String, CachedResult>, key: &str, now: Instant) -> Option<Value> {
    match entries.get(key) {
        Some(hit) if hit.expires_at > now => Some(hit.value.clone()),
        Some(_) => {
            entries.remove(key);
            None
        }
        None => None,
    }
}
