//! Backoff value sequences for retrying callers.
//!
//! A retry of N attempts waits N-1 times; the generator drives the policy
//! through those steps synthetically and records each requested delay without
//! sleeping.

use std::time::Duration;

use crate::config::RetryConfig;
use crate::error::{Result, RuntimeError};

/// Backoff policy recognized by the generator.
///
/// Randomized (jittered) policies are deliberately unsupported: the generated
/// sequence must be identical across invocations.
#[derive(Debug, Clone, PartialEq)]
pub enum BackoffPolicy {
    /// No waiting between attempts
    None,

    /// Fixed delay between attempts
    Fixed { interval: Duration },

    /// Exponentially growing delay, capped at `max`
    Exponential {
        initial: Duration,
        multiplier: f64,
        max: Duration,
    },
}

impl BackoffPolicy {
    /// Derive a policy from a retry configuration.
    ///
    /// Fails with `InvalidPolicy` when the configuration requests jitter.
    pub fn from_retry_config(config: &RetryConfig) -> Result<Self> {
        if config.jitter {
            return Err(RuntimeError::InvalidPolicy(
                "Jittered retry timing cannot produce a deterministic sequence".to_string(),
            ));
        }
        if config.multiplier <= 1.0 {
            return Ok(BackoffPolicy::Fixed {
                interval: config.base_delay,
            });
        }
        Ok(BackoffPolicy::Exponential {
            initial: config.base_delay,
            multiplier: config.multiplier,
            max: config.max_delay,
        })
    }
}

/// Generate the ordered delays a caller waits between `max_attempts`
/// attempts.
///
/// Returns exactly `max_attempts - 1` values. Idempotent: identical inputs
/// yield identical sequences.
pub fn generate_backoff_values(
    max_attempts: u32,
    policy: &BackoffPolicy,
) -> Result<Vec<Duration>> {
    if max_attempts == 0 {
        return Err(RuntimeError::InvalidPolicy(
            "'max_attempts' must be >= 1".to_string(),
        ));
    }
    let steps = (max_attempts - 1) as usize;

    match policy {
        BackoffPolicy::None => Ok(vec![Duration::ZERO; steps]),
        BackoffPolicy::Fixed { interval } => Ok(vec![*interval; steps]),
        BackoffPolicy::Exponential {
            initial,
            multiplier,
            max,
        } => {
            if *multiplier < 1.0 {
                return Err(RuntimeError::InvalidPolicy(format!(
                    "Exponential multiplier must be >= 1.0, got {multiplier}"
                )));
            }
            // Drive the policy through the steps, recording what each sleep
            // would have been.
            let mut values = Vec::with_capacity(steps);
            let mut next = (*initial).min(*max);
            for _ in 0..steps {
                values.push(next);
                let scaled = next.as_nanos() as f64 * multiplier;
                next = if scaled >= max.as_nanos() as f64 {
                    *max
                } else {
                    Duration::from_nanos(scaled as u64)
                };
            }
            Ok(values)
        }
    }
}
