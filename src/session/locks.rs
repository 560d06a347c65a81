//! 会话锁注册表
//!
//! 每个会话一把惰性创建的 tokio Mutex，注册表本身用独立的 std RwLock 保护（读锁快路径，写锁双重检查插入）。
//! 获取锁时同时观察取消令牌与锁超时；释放由 WorkflowLockGuard 的 Drop 保证。

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

use crate::core::{Result, WorkflowError};

/// 会话锁守卫；drop 或 unlock 时释放
#[derive(Debug)]
pub struct WorkflowLockGuard {
    session_id: String,
    _guard: OwnedMutexGuard<()>,
}

impl WorkflowLockGuard {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// 显式释放
    pub fn unlock(self) {
        tracing::trace!(session_id = %self.session_id, "session lock released");
    }
}

#[derive(Debug)]
pub struct SessionLocks {
    locks: RwLock<HashMap<String, Arc<Mutex<()>>>>,
    timeout: Duration,
}

impl SessionLocks {
    pub fn new(timeout: Duration) -> Self {
        Self {
            locks: RwLock::new(HashMap::new()),
            timeout,
        }
    }

    fn entry(&self, id: &str) -> Arc<Mutex<()>> {
        if let Some(lock) = self.locks.read().unwrap_or_else(|e| e.into_inner()).get(id) {
            return Arc::clone(lock);
        }
        let mut map = self.locks.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(map.entry(id.to_string()).or_default())
    }

    pub async fn acquire(&self, id: &str, cancel: &CancellationToken) -> Result<WorkflowLockGuard> {
        let lock = self.entry(id);
        let started = Instant::now();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(WorkflowError::Cancelled(format!("waiting for lock on session '{id}'"))),
            acquired = tokio::time::timeout(self.timeout, lock.lock_owned()) => match acquired {
                Ok(guard) => Ok(WorkflowLockGuard {
                    session_id: id.to_string(),
                    _guard: guard,
                }),
                Err(_) => {
                    tracing::warn!(session_id = %id, timeout_ms = self.timeout.as_millis() as u64, "session lock timeout");
                    Err(WorkflowError::LockTimeout {
                        session_id: id.to_string(),
                        waited_ms: started.elapsed().as_millis() as u64,
                    })
                }
            },
        }
    }

    /// 不等待；锁被占用时返回 None
    pub fn try_acquire(&self, id: &str) -> Option<WorkflowLockGuard> {
        let lock = self.entry(id);
        lock.try_lock_owned().ok().map(|guard| WorkflowLockGuard {
            session_id: id.to_string(),
            _guard: guard,
        })
    }

    /// 仅当注册表是唯一持有者（无人持锁、无人等待）时删除条目
    pub fn remove_if_idle(&self, id: &str) -> bool {
        let mut map = self.locks.write().unwrap_or_else(|e| e.into_inner());
        match map.get(id) {
            Some(lock) if Arc::strong_count(lock) == 1 => {
                map.remove(id);
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.locks.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lock_is_exclusive() {
        let locks = SessionLocks::new(Duration::from_millis(50));
        let cancel = CancellationToken::new();
        let guard = locks.acquire("s1", &cancel).await.unwrap();
        assert!(locks.try_acquire("s1").is_none());
        // 其他会话互不影响
        assert!(locks.try_acquire("s2").is_some());

        let err = locks.acquire("s1", &cancel).await.unwrap_err();
        assert!(matches!(err, WorkflowError::LockTimeout { .. }));

        guard.unlock();
        assert!(locks.try_acquire("s1").is_some());
    }

    #[tokio::test]
    async fn test_acquire_observes_cancel() {
        let locks = SessionLocks::new(Duration::from_secs(60));
        let _held = locks.acquire("s1", &CancellationToken::new()).await.unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = locks.acquire("s1", &cancel).await.unwrap_err();
        assert!(err.is_cancellation());
    }

    #[tokio::test]
    async fn test_remove_only_when_idle() {
        let locks = SessionLocks::new(Duration::from_secs(1));
        let guard = locks.acquire("s1", &CancellationToken::new()).await.unwrap();
        assert!(!locks.remove_if_idle("s1"));
        drop(guard);
        assert!(locks.remove_if_idle("s1"));
        assert!(locks.is_empty());
        assert!(!locks.remove_if_idle("missing"));
    }
}
