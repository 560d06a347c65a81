//! 作业监管：活跃作业注册表
//!
//! 每个正在运行的作业在此登记一个取消令牌（由调用方令牌派生），支持按会话 id 取消；
//! 同一会话不能同时运行两个作业。JobRegistration 在 drop 时自动注销。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

use crate::core::{Result, WorkflowError};

#[derive(Debug, Default)]
pub struct JobSupervisor {
    jobs: Mutex<HashMap<String, CancellationToken>>,
}

impl JobSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    fn jobs(&self) -> std::sync::MutexGuard<'_, HashMap<String, CancellationToken>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 登记作业；返回的注册项持有作业令牌，drop 时注销
    pub fn register(self: &Arc<Self>, session_id: &str, parent: &CancellationToken) -> Result<JobRegistration> {
        let mut jobs = self.jobs();
        if jobs.contains_key(session_id) {
            return Err(WorkflowError::JobAlreadyRunning(session_id.to_string()));
        }
        let token = parent.child_token();
        jobs.insert(session_id.to_string(), token.clone());
        Ok(JobRegistration {
            supervisor: Arc::clone(self),
            session_id: session_id.to_string(),
            token,
        })
    }

    /// 取消指定会话上的作业；不存在时返回 false
    pub fn cancel(&self, session_id: &str) -> bool {
        match self.jobs().get(session_id) {
            Some(token) => {
                tracing::info!(session_id, "job cancellation requested");
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        for token in self.jobs().values() {
            token.cancel();
        }
    }

    pub fn is_running(&self, session_id: &str) -> bool {
        self.jobs().contains_key(session_id)
    }

    pub fn active_jobs(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.jobs().keys().cloned().collect();
        ids.sort();
        ids
    }
}

pub struct JobRegistration {
    supervisor: Arc<JobSupervisor>,
    session_id: String,
    token: CancellationToken,
}

impl JobRegistration {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for JobRegistration {
    fn drop(&mut self) {
        self.supervisor.jobs().remove(&self.session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_rejects_duplicate() {
        let sup = Arc::new(JobSupervisor::new());
        let root = CancellationToken::new();
        let reg = sup.register("s1", &root).unwrap();
        assert!(matches!(
            sup.register("s1", &root),
            Err(WorkflowError::JobAlreadyRunning(_))
        ));
        assert_eq!(sup.active_jobs(), vec!["s1"]);
        drop(reg);
        assert!(!sup.is_running("s1"));
        assert!(sup.register("s1", &root).is_ok());
    }

    #[test]
    fn test_cancel_by_session() {
        let sup = Arc::new(JobSupervisor::new());
        let root = CancellationToken::new();
        let a = sup.register("a", &root).unwrap();
        let b = sup.register("b", &root).unwrap();
        assert!(sup.cancel("a"));
        assert!(a.token().is_cancelled());
        assert!(!b.token().is_cancelled());
        assert!(!sup.cancel("missing"));
        assert!(!root.is_cancelled());
    }

    #[test]
    fn test_parent_cancel_propagates() {
        let sup = Arc::new(JobSupervisor::new());
        let root = CancellationToken::new();
        let reg = sup.register("a", &root).unwrap();
        root.cancel();
        assert!(reg.token().is_cancelled());
    }
}
