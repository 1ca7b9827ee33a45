//! Scheduler configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tuning knobs for planning and scheduling a verification run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Number of refinement batches the unit ordering is split into
    /// (default: 5). The planned level count may be lower when the network
    /// has fewer abstractable units.
    pub num_batches: usize,

    /// Extra time a solver gets past its attempt timeout before the attempt
    /// is cancelled (default: 2 seconds)
    pub grace: Duration,

    /// Upper bound on the bound-tightening pre-check (default: 60 seconds)
    pub precheck_timeout: Duration,

    /// Seed for the Random policy (default: 0)
    pub random_seed: u64,

    /// Slack allowed when checking that a witness lies in the input box
    pub input_tolerance: f64,

    /// Fold sign-stable ReLUs before solving (default: true)
    pub simplify: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            num_batches: 5,
            grace: Duration::from_secs(2),
            precheck_timeout: Duration::from_secs(60),
            random_seed: 0,
            input_tolerance: 1e-6,
            simplify: true,
        }
    }
}

impl SchedulerConfig {
    pub fn with_num_batches(mut self, num_batches: usize) -> Self {
        self.num_batches = num_batches;
        self
    }

    pub fn with_random_seed(mut self, seed: u64) -> Self {
        self.random_seed = seed;
        self
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SchedulerConfig::default();
        assert_eq!(config.num_batches, 5);
        assert_eq!(config.grace, Duration::from_secs(2));
        assert_eq!(config.precheck_timeout, Duration::from_secs(60));
        assert_eq!(config.random_seed, 0);
        assert!(config.simplify);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: SchedulerConfig =
            serde_json::from_str(r#"{"num_batches": 3, "simplify": false}"#).unwrap();
        assert_eq!(config.num_batches, 3);
        assert!(!config.simplify);
        assert_eq!(config.grace, Duration::from_secs(2));
    }

    #[test]
    fn test_roundtrip() {
        let config = SchedulerConfig::default().with_num_batches(7).with_random_seed(42);
        let json = serde_json::to_string(&config).unwrap();
        let back: SchedulerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
