//! Retry backoff for failed instance creates.

use rand::Rng;
use std::time::Duration;

/// Exponential backoff with jitter: base 30s doubling to a 15 minute cap,
/// five attempts, then the pool records a failure reason and stops retrying
/// until its configuration changes.
#[derive(Debug, Clone)]
pub struct CreateBackoff {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
    /// 0.0 = deterministic, 0.5 = +-50% around the computed delay.
    pub jitter: f64,
}

impl Default for CreateBackoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(30),
            cap: Duration::from_secs(15 * 60),
            max_attempts: 5,
            jitter: 0.2,
        }
    }
}

impl CreateBackoff {
    /// Delay before the retry following `attempt` recorded failures. Zero
    /// failures (a freshly reset budget) retries immediately; `None` once
    /// the budget is exhausted.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 {
            return Some(Duration::ZERO);
        }
        if attempt >= self.max_attempts {
            return None;
        }
        let exp = self.base.as_secs_f64() * 2f64.powi(attempt.saturating_sub(1) as i32);
        let capped = exp.min(self.cap.as_secs_f64());
        let jittered = if self.jitter > 0.0 {
            let factor = 1.0 + rand::thread_rng().gen_range(-self.jitter..=self.jitter);
            capped * factor
        } else {
            capped
        };
        Some(Duration::from_secs_f64(jittered.max(0.0)))
    }

    pub fn exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> CreateBackoff {
        CreateBackoff {
            jitter: 0.0,
            ..CreateBackoff::default()
        }
    }

    #[test]
    fn delays_double_from_base() {
        let b = no_jitter();
        assert_eq!(b.delay_for(1).unwrap(), Duration::from_secs(30));
        assert_eq!(b.delay_for(2).unwrap(), Duration::from_secs(60));
        assert_eq!(b.delay_for(3).unwrap(), Duration::from_secs(120));
    }

    #[test]
    fn fresh_budget_retries_immediately() {
        assert_eq!(no_jitter().delay_for(0).unwrap(), Duration::ZERO);
    }

    #[test]
    fn delay_is_capped() {
        let b = CreateBackoff {
            base: Duration::from_secs(300),
            cap: Duration::from_secs(600),
            max_attempts: 10,
            jitter: 0.0,
        };
        assert_eq!(b.delay_for(5).unwrap(), Duration::from_secs(600));
    }

    #[test]
    fn budget_exhausts() {
        let b = no_jitter();
        assert!(b.delay_for(4).is_some());
        assert!(b.delay_for(5).is_none());
        assert!(b.exhausted(5));
        assert!(!b.exhausted(4));
    }

    #[test]
    fn jitter_stays_in_band() {
        let b = CreateBackoff {
            jitter: 0.5,
            ..CreateBackoff::default()
        };
        for _ in 0..100 {
            let d = b.delay_for(1).unwrap();
            assert!(d >= Duration::from_secs(15));
            assert!(d <= Duration::from_secs(45));
        }
    }
}
