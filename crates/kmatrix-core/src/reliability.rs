//! Reduction of stored results to a reliability rate and a pass/fail gate.
//!
//! Both functions are pure: the rate is computed from an explicit result set
//! at decision time, never from a counter updated during scheduling.

use std::str::FromStr;

use kmatrix_state::{RunResult, Verdict};
use serde::{Deserialize, Serialize};

use crate::error::{KmatrixError, Result};

/// How `Timeout` results count toward the rate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutPolicy {
    /// A timeout is a non-successful terminal result.
    #[default]
    Count,
    /// Timeouts are left out of numerator and denominator.
    Exclude,
}

impl FromStr for TimeoutPolicy {
    type Err = KmatrixError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "count" => Ok(TimeoutPolicy::Count),
            "exclude" => Ok(TimeoutPolicy::Exclude),
            other => Err(KmatrixError::Config(format!(
                "unknown timeout policy {other:?} (expected count or exclude)"
            ))),
        }
    }
}

/// Verdict counts over a result set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tally {
    pub success: usize,
    pub test_failed: usize,
    pub timeout: usize,
    pub infra_error: usize,
}

impl Tally {
    pub fn from_results(results: &[RunResult]) -> Self {
        results.iter().fold(Tally::default(), |mut t, r| {
            match r.verdict() {
                Verdict::Success => t.success += 1,
                Verdict::TestFailed => t.test_failed += 1,
                Verdict::Timeout => t.timeout += 1,
                Verdict::InfraError { .. } => t.infra_error += 1,
            }
            t
        })
    }

    pub fn total(&self) -> usize {
        self.success + self.test_failed + self.timeout + self.infra_error
    }

    /// Success / terminal results. `None` when nothing counts.
    pub fn rate(&self, policy: TimeoutPolicy) -> Option<f64> {
        let denominator = match policy {
            TimeoutPolicy::Count => self.total(),
            TimeoutPolicy::Exclude => self.total() - self.timeout,
        };
        (denominator > 0).then(|| self.success as f64 / denominator as f64)
    }
}

/// Success rate of `results`; `None` for an empty set.
pub fn rate(results: &[RunResult], policy: TimeoutPolicy) -> Option<f64> {
    Tally::from_results(results).rate(policy)
}

/// `true` when `rate` meets `threshold`.
pub fn passes(rate: f64, threshold: f64) -> bool {
    rate >= threshold
}

/// Gate decision for one result set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateVerdict {
    pub passed: bool,
    pub rate: Option<f64>,
    pub threshold: f64,
    pub tally: Tally,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReliabilityEvaluator {
    threshold: f64,
    policy: TimeoutPolicy,
}

impl Default for ReliabilityEvaluator {
    fn default() -> Self {
        ReliabilityEvaluator {
            threshold: 1.0,
            policy: TimeoutPolicy::Count,
        }
    }
}

impl ReliabilityEvaluator {
    /// Fails with `Config` unless `0 < threshold <= 1`.
    pub fn new(threshold: f64, policy: TimeoutPolicy) -> Result<Self> {
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(KmatrixError::Config(format!(
                "threshold {threshold} is outside (0, 1]"
            )));
        }
        Ok(ReliabilityEvaluator { threshold, policy })
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn policy(&self) -> TimeoutPolicy {
        self.policy
    }

    /// An empty set never passes.
    pub fn evaluate(&self, results: &[RunResult]) -> GateVerdict {
        let tally = Tally::from_results(results);
        let rate = tally.rate(self.policy);
        let passed = rate.is_some_and(|r| passes(r, self.threshold));

        let message = match rate {
            None => "no terminal results to evaluate".to_string(),
            Some(r) => format!(
                "success rate {:.2} ({}/{}) {} threshold {:.2}",
                r,
                tally.success,
                match self.policy {
                    TimeoutPolicy::Count => tally.total(),
                    TimeoutPolicy::Exclude => tally.total() - tally.timeout,
                },
                if passed { "meets" } else { "is below" },
                self.threshold
            ),
        };

        GateVerdict {
            passed,
            rate,
            threshold: self.threshold,
            tally,
            message,
        }
    }
}
