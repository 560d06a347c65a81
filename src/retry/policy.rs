//! 重试策略与退避计算
//!
//! multiplier = 0 为固定间隔，= 1 为线性，其余为指数；结果总是不超过 max_delay。

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// 退避类型（由 backoff_multiplier 推导）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffStrategy {
    Fixed,
    Linear,
    Exponential,
}

/// 单个操作的重试策略（不可变配置）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(with = "duration_ms")]
    pub initial_delay: Duration,
    #[serde(with = "duration_ms")]
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// 是否叠加最多 10% 的随机抖动
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

fn default_jitter() -> bool {
    true
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_delay: Duration, max_delay: Duration, multiplier: f64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay,
            max_delay,
            backoff_multiplier: multiplier,
            jitter: true,
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    pub fn strategy(&self) -> BackoffStrategy {
        if self.backoff_multiplier <= 0.0 {
            BackoffStrategy::Fixed
        } else if (self.backoff_multiplier - 1.0).abs() < f64::EPSILON {
            BackoffStrategy::Linear
        } else {
            BackoffStrategy::Exponential
        }
    }

    /// 第 `retry` 次重试（从 0 开始）前的基础等待时间，不含抖动
    pub fn base_delay(&self, retry: u32) -> Duration {
        let initial = self.initial_delay.as_secs_f64();
        let secs = match self.strategy() {
            BackoffStrategy::Fixed => initial,
            BackoffStrategy::Linear => initial * f64::from(retry + 1),
            BackoffStrategy::Exponential => {
                initial * self.backoff_multiplier.powi(retry.min(i32::MAX as u32) as i32)
            }
        };
        cap(secs, self.max_delay)
    }

    /// 实际等待时间：基础值加最多 10% 抖动，仍不超过 max_delay
    pub fn delay(&self, retry: u32) -> Duration {
        let base = self.base_delay(retry);
        if !self.jitter || base.is_zero() {
            return base;
        }
        let jitter = rand::thread_rng().gen_range(0.0..=0.1) * base.as_secs_f64();
        cap(base.as_secs_f64() + jitter, self.max_delay)
    }
}

fn cap(secs: f64, max: Duration) -> Duration {
    if !secs.is_finite() || secs >= max.as_secs_f64() {
        return max;
    }
    Duration::from_secs_f64(secs.max(0.0))
}

/// Duration 以毫秒整数序列化，便于在 TOML / JSON 中书写
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn policy(multiplier: f64) -> RetryPolicy {
        RetryPolicy::new(5, Duration::from_millis(100), Duration::from_secs(2), multiplier)
    }

    #[test]
    fn test_strategy_from_multiplier() {
        assert_eq!(policy(0.0).strategy(), BackoffStrategy::Fixed);
        assert_eq!(policy(1.0).strategy(), BackoffStrategy::Linear);
        assert_eq!(policy(2.0).strategy(), BackoffStrategy::Exponential);
    }

    #[test]
    fn test_exponential_delays() {
        let p = policy(2.0).without_jitter();
        assert_eq!(p.delay(0), Duration::from_millis(100));
        assert_eq!(p.delay(1), Duration::from_millis(200));
        assert_eq!(p.delay(2), Duration::from_millis(400));
        assert_eq!(p.delay(10), Duration::from_secs(2));
    }

    #[test]
    fn test_linear_delays() {
        let p = policy(1.0).without_jitter();
        assert_eq!(p.delay(0), Duration::from_millis(100));
        assert_eq!(p.delay(2), Duration::from_millis(300));
    }

    #[test]
    fn test_jitter_stays_within_ten_percent() {
        let p = policy(2.0);
        for _ in 0..100 {
            let d = p.delay(1);
            assert!(d >= Duration::from_millis(200));
            assert!(d <= Duration::from_millis(220) + Duration::from_micros(1));
        }
    }

    #[test]
    fn test_policy_serde_in_millis() {
        let p: RetryPolicy = serde_json::from_str(
            r#"{"max_attempts":4,"initial_delay":250,"max_delay":5000,"backoff_multiplier":1.5}"#,
        )
        .unwrap();
        assert_eq!(p.initial_delay, Duration::from_millis(250));
        assert!(p.jitter);
    }

    proptest! {
        #[test]
        fn prop_non_decreasing_for_growth(
            mult in 1.01f64..5.0,
            init_ms in 1u64..2_000,
            max_ms in 1u64..60_000,
        ) {
            let p = RetryPolicy::new(10, Duration::from_millis(init_ms), Duration::from_millis(max_ms), mult);
            let mut prev = Duration::ZERO;
            for retry in 0..10 {
                let d = p.base_delay(retry);
                prop_assert!(d >= prev);
                prop_assert!(d <= p.max_delay);
                prev = d;
            }
        }

        #[test]
        fn prop_constant_for_zero_multiplier(
            init_ms in 0u64..2_000,
            max_ms in 1u64..60_000,
        ) {
            let p = RetryPolicy::new(10, Duration::from_millis(init_ms), Duration::from_millis(max_ms), 0.0);
            let first = p.base_delay(0);
            for retry in 1..10 {
                prop_assert_eq!(p.base_delay(retry), first);
            }
        }

        #[test]
        fn prop_jittered_delay_never_exceeds_max(
            mult in 0.0f64..5.0,
            init_ms in 0u64..5_000,
            max_ms in 1u64..10_000,
            retry in 0u32..20,
        ) {
            let p = RetryPolicy::new(20, Duration::from_millis(init_ms), Duration::from_millis(max_ms), mult);
            prop_assert!(p.delay(retry) <= p.max_delay);
        }
    }
}
