//! 熔断器
//!
//! 每个操作名一个 CircuitBreaker（Closed / Open / HalfOpen），由 CircuitRegistry 惰性创建并在进程生命周期内保留。
//! 时间使用 tokio::time::Instant，测试中可以暂停并推进时钟。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// 熔断器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// 熔断阈值配置
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitConfig {
    /// Closed 状态下连续失败多少次后打开
    pub failure_threshold: u32,
    /// HalfOpen 状态下连续成功多少次后关闭
    pub success_threshold: u32,
    #[serde(with = "crate::retry::policy::duration_ms")]
    pub recovery_timeout: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

/// 调用前检查的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// 放行
    Allowed,
    /// 放行，且这是 HalfOpen 下的探测调用
    Probe,
    /// 拒绝（熔断中）
    Rejected,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitConfig,
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    last_failure: Option<Instant>,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
    /// 每放行一个探测加一，用来识别探测凭证
    probe_ticket: u64,
}

impl CircuitBreaker {
    pub fn new(config: CircuitConfig) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_failure: None,
            opened_at: None,
            probe_in_flight: false,
            probe_ticket: 0,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn last_failure(&self) -> Option<Instant> {
        self.last_failure
    }

    /// 尝试前调用：Open 且未到恢复时间则拒绝；到时间转 HalfOpen，同一时刻只放行一个探测
    pub fn admit(&mut self) -> Admission {
        match self.state {
            CircuitState::Closed => Admission::Allowed,
            CircuitState::Open => {
                let elapsed = self
                    .opened_at
                    .map(|t| t.elapsed() >= self.config.recovery_timeout)
                    .unwrap_or(true);
                if !elapsed {
                    return Admission::Rejected;
                }
                tracing::info!("circuit half-open, admitting probe");
                self.state = CircuitState::HalfOpen;
                self.consecutive_successes = 0;
                self.begin_probe()
            }
            CircuitState::HalfOpen => {
                if self.probe_in_flight {
                    Admission::Rejected
                } else {
                    self.begin_probe()
                }
            }
        }
    }

    fn begin_probe(&mut self) -> Admission {
        self.probe_in_flight = true;
        self.probe_ticket = self.probe_ticket.wrapping_add(1);
        Admission::Probe
    }

    pub fn record_success(&mut self) {
        self.probe_in_flight = false;
        match self.state {
            CircuitState::HalfOpen => {
                self.consecutive_successes += 1;
                if self.consecutive_successes >= self.config.success_threshold {
                    self.state = CircuitState::Closed;
                    self.consecutive_failures = 0;
                    self.consecutive_successes = 0;
                    self.opened_at = None;
                }
            }
            CircuitState::Closed => {
                self.consecutive_failures = 0;
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&mut self) {
        self.probe_in_flight = false;
        self.consecutive_failures += 1;
        self.consecutive_successes = 0;
        let now = Instant::now();
        self.last_failure = Some(now);
        match self.state {
            CircuitState::Closed if self.consecutive_failures >= self.config.failure_threshold => {
                self.state = CircuitState::Open;
                self.opened_at = Some(now);
            }
            CircuitState::HalfOpen => {
                self.state = CircuitState::Open;
                self.opened_at = Some(now);
            }
            _ => {}
        }
    }

    /// 结果不计入统计（校验失败、取消等），仅释放探测名额
    pub fn release_probe(&mut self) {
        self.probe_in_flight = false;
    }

    /// 仅当 `ticket` 仍是当前在途探测时释放；过期凭证不影响后来的探测
    pub fn abandon_probe(&mut self, ticket: u64) -> bool {
        if self.probe_in_flight && self.probe_ticket == ticket {
            self.probe_in_flight = false;
            true
        } else {
            false
        }
    }
}

/// 一次调用的放行凭证
///
/// 探测凭证在登记结果之前被丢弃（调用方 future 被取消、超时、任务中止）时归还探测名额，
/// 熔断器不会卡在 HalfOpen。
#[derive(Debug)]
pub struct CallPermit {
    breaker: Arc<Mutex<CircuitBreaker>>,
    probe: Option<u64>,
}

impl CallPermit {
    /// 熔断中返回 None
    pub fn acquire(breaker: &Arc<Mutex<CircuitBreaker>>) -> Option<Self> {
        let mut cb = lock(breaker);
        let probe = match cb.admit() {
            Admission::Rejected => return None,
            Admission::Allowed => None,
            Admission::Probe => Some(cb.probe_ticket),
        };
        Some(Self {
            breaker: Arc::clone(breaker),
            probe,
        })
    }

    pub fn is_probe(&self) -> bool {
        self.probe.is_some()
    }

    pub fn success(mut self) {
        self.probe = None;
        lock(&self.breaker).record_success();
    }

    pub fn failure(mut self) {
        self.probe = None;
        lock(&self.breaker).record_failure();
    }

    /// 结果不计入统计
    pub fn release(mut self) {
        if let Some(ticket) = self.probe.take() {
            lock(&self.breaker).abandon_probe(ticket);
        }
    }
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        if let Some(ticket) = self.probe.take() {
            if lock(&self.breaker).abandon_probe(ticket) {
                tracing::debug!("probe dropped before completion, slot released");
            }
        }
    }
}

fn lock(breaker: &Mutex<CircuitBreaker>) -> std::sync::MutexGuard<'_, CircuitBreaker> {
    breaker.lock().unwrap_or_else(|e| e.into_inner())
}

/// 熔断器注册表：操作名 -> 熔断器；读锁快路径，写锁双重检查插入
#[derive(Debug, Default)]
pub struct CircuitRegistry {
    config: CircuitConfig,
    breakers: RwLock<HashMap<String, Arc<Mutex<CircuitBreaker>>>>,
}

impl CircuitRegistry {
    pub fn new(config: CircuitConfig) -> Self {
        Self {
            config,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, name: &str) -> Arc<Mutex<CircuitBreaker>> {
        if let Some(b) = self
            .breakers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
        {
            return Arc::clone(b);
        }
        let mut map = self.breakers.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            map.entry(name.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(CircuitBreaker::new(self.config)))),
        )
    }

    /// 查询当前状态（不会创建新熔断器）
    pub fn state(&self, name: &str) -> Option<CircuitState> {
        let map = self.breakers.read().unwrap_or_else(|e| e.into_inner());
        map.get(name)
            .map(|b| b.lock().unwrap_or_else(|e| e.into_inner()).state())
    }

    pub fn len(&self) -> usize {
        self.breakers.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> CircuitConfig {
        CircuitConfig {
            failure_threshold: 3,
            success_threshold: 2,
            recovery_timeout: Duration::from_secs(30),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold() {
        let mut cb = CircuitBreaker::new(config());
        for _ in 0..2 {
            assert_eq!(cb.admit(), Admission::Allowed);
            cb.record_failure();
        }
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.admit(), Admission::Rejected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failures_when_closed() {
        let mut cb = CircuitBreaker::new(config());
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.consecutive_failures(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_single_probe_then_close() {
        let mut cb = CircuitBreaker::new(config());
        for _ in 0..3 {
            cb.record_failure();
        }
        tokio::time::advance(Duration::from_secs(31)).await;

        assert_eq!(cb.admit(), Admission::Probe);
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        // 探测未结束前不放行第二个
        assert_eq!(cb.admit(), Admission::Rejected);

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert_eq!(cb.admit(), Admission::Probe);
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.admit(), Admission::Allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let mut cb = CircuitBreaker::new(config());
        for _ in 0..3 {
            cb.record_failure();
        }
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(cb.admit(), Admission::Probe);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.admit(), Admission::Rejected);
    }

    #[test]
    fn test_registry_reuses_breaker() {
        let registry = CircuitRegistry::new(config());
        let a = registry.get("build_image");
        let b = registry.get("build_image");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.state("build_image"), Some(CircuitState::Closed));
        assert_eq!(registry.state("push_image"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_half_open_permit_releases_slot() {
        let breaker = Arc::new(Mutex::new(CircuitBreaker::new(config())));
        for _ in 0..3 {
            lock(&breaker).record_failure();
        }
        tokio::time::advance(Duration::from_secs(31)).await;

        let permit = CallPermit::acquire(&breaker).unwrap();
        assert!(permit.is_probe());
        assert!(CallPermit::acquire(&breaker).is_none());
        drop(permit);

        assert_eq!(lock(&breaker).state(), CircuitState::HalfOpen);
        let next = CallPermit::acquire(&breaker).unwrap();
        assert!(next.is_probe());
        next.success();
        assert_eq!(lock(&breaker).consecutive_failures(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_ticket_keeps_newer_half_open_call() {
        let mut cb = CircuitBreaker::new(config());
        for _ in 0..3 {
            cb.record_failure();
        }
        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(cb.admit(), Admission::Probe);
        let stale = cb.probe_ticket;
        cb.release_probe();
        assert_eq!(cb.admit(), Admission::Probe);
        assert!(!cb.abandon_probe(stale));
        assert_eq!(cb.admit(), Admission::Rejected);
    }
}
