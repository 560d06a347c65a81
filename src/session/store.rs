//! 会话存储
//!
//! 在 SessionBackend 之上提供按会话加锁的读改写：update 持锁加载、修改、持久化；
//! update_with_version 额外比对版本号（乐观并发）。工作流状态辅助方法只操作元数据中的
//! `workflow_state` 子对象，并且总是返回副本。后台清理任务定期删除过期会话及其锁条目。

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::{Result, WorkflowError};
use crate::retry::Metadata;
use crate::session::backend::SessionBackend;
use crate::session::locks::{SessionLocks, WorkflowLockGuard};
use crate::session::types::{now_micros, Session};

/// 工作流状态在会话元数据中的键
pub const WORKFLOW_STATE_KEY: &str = "workflow_state";

/// 批量更新中每个会话的修改函数
pub type WorkflowStateMutator = Box<dyn FnOnce(&mut Metadata) -> Result<()> + Send>;

pub struct SessionStore {
    backend: Arc<dyn SessionBackend>,
    locks: SessionLocks,
    ttl: Duration,
}

impl SessionStore {
    pub fn new(backend: Arc<dyn SessionBackend>, ttl: Duration, lock_timeout: Duration) -> Self {
        Self {
            backend,
            locks: SessionLocks::new(lock_timeout),
            ttl,
        }
    }

    fn ttl_micros(&self) -> i64 {
        i64::try_from(self.ttl.as_micros()).unwrap_or(i64::MAX)
    }

    /// 过期记录视为不存在
    fn load_live(&self, id: &str) -> Result<Option<Session>> {
        Ok(self.backend.load(id)?.filter(|s| !s.is_expired()))
    }

    fn check_guard(guard: &WorkflowLockGuard, id: &str) -> Result<()> {
        if guard.session_id() == id {
            Ok(())
        } else {
            Err(WorkflowError::InvalidRequest(format!(
                "lock for session '{}' used to modify '{id}'",
                guard.session_id()
            )))
        }
    }

    pub async fn get_or_create(&self, id: &str, cancel: &CancellationToken) -> Result<Session> {
        let guard = self.locks.acquire(id, cancel).await?;
        self.get_or_create_locked(&guard)
    }

    /// 调用方已持有该会话的锁
    pub fn get_or_create_locked(&self, guard: &WorkflowLockGuard) -> Result<Session> {
        let id = guard.session_id();
        if let Some(session) = self.load_live(id)? {
            return Ok(session);
        }
        let session = Session::new(id, self.ttl_micros());
        self.backend.store(&session)?;
        tracing::debug!(session_id = %id, "session created");
        Ok(session)
    }

    pub fn get(&self, id: &str) -> Result<Session> {
        self.load_live(id)?
            .ok_or_else(|| WorkflowError::SessionNotFound(id.to_string()))
    }

    pub fn exists(&self, id: &str) -> Result<bool> {
        Ok(self.load_live(id)?.is_some())
    }

    /// 持锁读改写；mutate 返回错误时不写入任何内容
    pub async fn update<F>(&self, id: &str, cancel: &CancellationToken, mutate: F) -> Result<Session>
    where
        F: FnOnce(&mut Session) -> Result<()>,
    {
        let guard = self.locks.acquire(id, cancel).await?;
        self.update_locked(&guard, mutate)
    }

    pub fn update_locked<F>(&self, guard: &WorkflowLockGuard, mutate: F) -> Result<Session>
    where
        F: FnOnce(&mut Session) -> Result<()>,
    {
        let id = guard.session_id();
        let mut session = self.get(id)?;
        mutate(&mut session)?;
        session.touch();
        self.backend.store(&session)?;
        Ok(session)
    }

    /// 版本号与 `expected` 不一致时返回 ConcurrentModification，且不修改
    pub async fn update_with_version<F>(
        &self,
        id: &str,
        expected: i64,
        cancel: &CancellationToken,
        mutate: F,
    ) -> Result<Session>
    where
        F: FnOnce(&mut Session) -> Result<()>,
    {
        let guard = self.locks.acquire(id, cancel).await?;
        let current = self.get(id)?;
        if current.version() != expected {
            return Err(WorkflowError::ConcurrentModification {
                session_id: id.to_string(),
                expected,
                actual: current.version(),
            });
        }
        self.update_locked(&guard, mutate)
    }

    pub async fn delete(&self, id: &str, cancel: &CancellationToken) -> Result<bool> {
        let guard = self.locks.acquire(id, cancel).await?;
        let removed = self.backend.remove(id)?;
        guard.unlock();
        self.locks.remove_if_idle(id);
        Ok(removed)
    }

    /// 直接取得会话锁，用于把多次操作合成一个临界区
    pub async fn acquire_workflow_lock(&self, id: &str, cancel: &CancellationToken) -> Result<WorkflowLockGuard> {
        self.locks.acquire(id, cancel).await
    }

    /// 返回 `workflow_state` 子对象的副本；尚未写入时为空
    pub fn get_workflow_state(&self, id: &str) -> Result<Metadata> {
        let session = self.get(id)?;
        Ok(workflow_state_of(&session))
    }

    pub async fn update_workflow_state<F>(&self, id: &str, cancel: &CancellationToken, mutate: F) -> Result<Metadata>
    where
        F: FnOnce(&mut Metadata) -> Result<()>,
    {
        let guard = self.locks.acquire(id, cancel).await?;
        self.update_workflow_state_locked(&guard, mutate)
    }

    pub fn update_workflow_state_locked<F>(&self, guard: &WorkflowLockGuard, mutate: F) -> Result<Metadata>
    where
        F: FnOnce(&mut Metadata) -> Result<()>,
    {
        let session = self.update_locked(guard, |session| {
            let mut state = workflow_state_of(session);
            mutate(&mut state)?;
            session
                .metadata
                .insert(WORKFLOW_STATE_KEY.to_string(), Value::Object(state));
            Ok(())
        })?;
        Ok(workflow_state_of(&session))
    }

    /// 每个会话独立加锁、独立原子；整体不是原子的，调用方需逐个检查结果
    pub async fn batch_update_workflow_states(
        &self,
        updates: BTreeMap<String, WorkflowStateMutator>,
        cancel: &CancellationToken,
    ) -> BTreeMap<String, Result<Metadata>> {
        let futures = updates.into_iter().map(|(id, mutate)| async move {
            let outcome = self.update_workflow_state(&id, cancel, mutate).await;
            if let Err(e) = &outcome {
                tracing::warn!(session_id = %id, error = %e, "batch workflow state update failed");
            }
            (id, outcome)
        });
        join_all(futures).await.into_iter().collect()
    }

    pub fn ids(&self) -> Result<Vec<String>> {
        self.backend.ids()
    }

    pub fn lock_count(&self) -> usize {
        self.locks.len()
    }

    /// 清理过期会话；被占用的会话本轮跳过
    pub fn cleanup_expired(&self) -> Result<usize> {
        let now = now_micros();
        let mut removed = 0;
        for id in self.backend.expired(now)? {
            let Some(guard) = self.locks.try_acquire(&id) else {
                tracing::debug!(session_id = %id, "expired session is locked, skipping");
                continue;
            };
            // 持锁后复查：可能已被 get_or_create 替换为新记录
            let still_expired = self
                .backend
                .load(&id)?
                .map(|s| s.is_expired_at(now))
                .unwrap_or(false);
            if still_expired && self.backend.remove(&id)? {
                removed += 1;
            }
            guard.unlock();
            self.locks.remove_if_idle(&id);
        }
        if removed > 0 {
            tracing::info!(removed, "expired sessions cleaned up");
        }
        Ok(removed)
    }

    /// 周期性执行 cleanup_expired，直到 shutdown 取消
    pub fn spawn_reaper(self: &Arc<Self>, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = store.cleanup_expired() {
                            tracing::error!(error = %e, "session cleanup failed");
                        }
                    }
                }
            }
            tracing::debug!("session reaper stopped");
        })
    }
}

fn workflow_state_of(session: &Session) -> Metadata {
    match session.metadata.get(WORKFLOW_STATE_KEY) {
        Some(Value::Object(state)) => state.clone(),
        _ => Metadata::new(),
    }
}
