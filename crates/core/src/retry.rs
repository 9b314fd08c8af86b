use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Backoff curve used when reconnecting to infrastructure (scanner, broker,
/// database) and when retrying a failed scheduled job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RetryStrategy {
    /// `base * multiplier^attempt`, clamped to `max`.
    Exponential {
        #[serde(with = "millis")]
        base: Duration,
        #[serde(with = "millis")]
        max: Duration,
        multiplier: f64,
    },
    /// The same delay before every attempt.
    Constant {
        #[serde(with = "millis")]
        delay: Duration,
    },
}

impl RetryStrategy {
    /// Delay before the zero-based retry `attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self {
            Self::Exponential {
                base,
                max,
                multiplier,
            } => {
                // Attempts are small counts; saturate rather than wrap.
                let exp = i32::try_from(attempt).unwrap_or(i32::MAX);
                let raw = base.as_secs_f64() * multiplier.powi(exp);
                let clamped = if raw.is_finite() {
                    raw.min(max.as_secs_f64())
                } else {
                    max.as_secs_f64()
                };
                Duration::from_secs_f64(clamped)
            }
            Self::Constant { delay } => *delay,
        }
    }
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self::Exponential {
            base: Duration::from_millis(200),
            max: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_doubles_then_clamps() {
        let strategy = RetryStrategy::Exponential {
            base: Duration::from_millis(100),
            max: Duration::from_millis(500),
            multiplier: 2.0,
        };
        assert_eq!(strategy.delay_for(0), Duration::from_millis(100));
        assert_eq!(strategy.delay_for(1), Duration::from_millis(200));
        assert_eq!(strategy.delay_for(2), Duration::from_millis(400));
        assert_eq!(strategy.delay_for(3), Duration::from_millis(500));
        assert_eq!(strategy.delay_for(u32::MAX), Duration::from_millis(500));
    }

    #[test]
    fn constant_never_changes() {
        let strategy = RetryStrategy::Constant {
            delay: Duration::from_millis(250),
        };
        for attempt in 0..5 {
            assert_eq!(strategy.delay_for(attempt), Duration::from_millis(250));
        }
    }

    #[test]
    fn default_is_exponential() {
        assert!(matches!(
            RetryStrategy::default(),
            RetryStrategy::Exponential { .. }
        ));
    }

    #[test]
    fn deserializes_from_toml_style_json() {
        let s: RetryStrategy = serde_json::from_str(
            r#"{"kind":"exponential","base":50,"max":1000,"multiplier":3.0}"#,
        )
        .unwrap();
        assert_eq!(s.delay_for(1), Duration::from_millis(150));
    }
}
