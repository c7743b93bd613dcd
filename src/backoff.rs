//! Retry backoff strategies.

use crate::error::{ConveyorError, Result};
use crate::job::Job;
use crate::options::{BackoffKind, BackoffOptions, QueueSettings};

/// Custom strategy: `(attempts_made, failure_reason, job) -> millis`.
/// A non-positive return skips the delay; `Err` aborts the retry and fails
/// the job with the strategy's message.
pub type BackoffStrategyFn = dyn Fn(u32, Option<&str>, &Job) -> Result<i64> + Send + Sync;

/// Delay before the next try, `None` when the job can re-enter `wait`
/// immediately.
pub fn compute_delay(
    backoff: &BackoffOptions,
    attempts_made: u32,
    failed_reason: Option<&str>,
    job: &Job,
    settings: &QueueSettings,
) -> Result<Option<u64>> {
    let attempts_made = attempts_made.max(1);
    match backoff {
        BackoffOptions::Millis(ms) => Ok(nonzero(*ms as i64)),
        BackoffOptions::Strategy(s) => match s.kind {
            BackoffKind::Fixed => Ok(nonzero(s.delay.unwrap_or(0) as i64)),
            BackoffKind::Exponential => {
                let base = s.delay.unwrap_or(0) as i64;
                Ok(nonzero(base.saturating_mul(
                    1i64 << (attempts_made - 1).min(62),
                )))
            }
            BackoffKind::Custom => {
                let name = s
                    .options
                    .as_ref()
                    .and_then(|o| o.get("name"))
                    .and_then(|n| n.as_str())
                    .unwrap_or("custom");
                let strategy = settings
                    .backoff_strategies
                    .get(name)
                    .ok_or_else(|| ConveyorError::UnknownBackoffStrategy(name.to_string()))?;
                let ms = strategy(attempts_made, failed_reason, job)?;
                Ok(nonzero(ms))
            }
        },
    }
}

fn nonzero(ms: i64) -> Option<u64> {
    if ms > 0 {
        Some(ms as u64)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::BackoffStrategyOptions;
    use std::sync::Arc;

    fn job() -> Job {
        Job::stub_for_tests()
    }

    #[test]
    fn fixed_delay() {
        let b = BackoffOptions::Millis(250);
        let d = compute_delay(&b, 1, None, &job(), &QueueSettings::default()).unwrap();
        assert_eq!(d, Some(250));
        let d = compute_delay(&b, 5, None, &job(), &QueueSettings::default()).unwrap();
        assert_eq!(d, Some(250));
    }

    #[test]
    fn exponential_doubles_per_attempt() {
        let b = BackoffOptions::Strategy(BackoffStrategyOptions {
            kind: BackoffKind::Exponential,
            delay: Some(10_000),
            options: None,
        });
        let s = QueueSettings::default();
        assert_eq!(compute_delay(&b, 1, None, &job(), &s).unwrap(), Some(10_000));
        assert_eq!(compute_delay(&b, 2, None, &job(), &s).unwrap(), Some(20_000));
        assert_eq!(compute_delay(&b, 3, None, &job(), &s).unwrap(), Some(40_000));
        assert_eq!(compute_delay(&b, 4, None, &job(), &s).unwrap(), Some(80_000));
    }

    #[test]
    fn custom_strategy_resolved_by_name() {
        let mut s = QueueSettings::default();
        s.backoff_strategies.insert(
            "linear".to_string(),
            Arc::new(|attempts, _err, _job| Ok(attempts as i64 * 100)),
        );
        let b = BackoffOptions::Strategy(BackoffStrategyOptions {
            kind: BackoffKind::Custom,
            delay: None,
            options: Some(serde_json::json!({"name": "linear"})),
        });
        assert_eq!(compute_delay(&b, 3, None, &job(), &s).unwrap(), Some(300));
    }

    #[test]
    fn non_positive_custom_skips_delay() {
        let mut s = QueueSettings::default();
        s.backoff_strategies
            .insert("now".to_string(), Arc::new(|_, _, _| Ok(0)));
        let b = BackoffOptions::Strategy(BackoffStrategyOptions {
            kind: BackoffKind::Custom,
            delay: None,
            options: Some(serde_json::json!({"name": "now"})),
        });
        assert_eq!(compute_delay(&b, 1, None, &job(), &s).unwrap(), None);
    }

    #[test]
    fn unknown_custom_strategy_is_an_error() {
        let b = BackoffOptions::Strategy(BackoffStrategyOptions {
            kind: BackoffKind::Custom,
            delay: None,
            options: Some(serde_json::json!({"name": "missing"})),
        });
        let err = compute_delay(&b, 1, None, &job(), &QueueSettings::default());
        assert!(matches!(err, Err(ConveyorError::UnknownBackoffStrategy(_))));
    }
}
