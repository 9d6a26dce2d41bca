//! Runtime configuration of the calibration engine.
//!
//! Every field has a default, so a YAML file only needs to name what it
//! changes:
//!
//! ```yaml
//! solver:
//!   max_iterations: 50
//! retry:
//!   max_consecutive_failures: 5
//!   backoff_ms: 200
//! idle_interval_ms: 20
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

use crate::calibrator::CalibrationError;

/// Options handed to the Levenberg-Marquardt minimizer for every round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverOptions {
    /// Iteration budget of a single round.
    pub max_iterations: usize,
    /// Solver verbosity, 0 is silent.
    pub verbosity: usize,
    pub min_abs_decrease: Option<f64>,
    pub min_rel_decrease: Option<f64>,
    pub min_error: Option<f64>,
}

impl Default for SolverOptions {
    fn default() -> Self {
        SolverOptions {
            max_iterations: 100,
            verbosity: 0,
            min_abs_decrease: None,
            min_rel_decrease: None,
            min_error: None,
        }
    }
}

impl SolverOptions {
    pub(crate) fn to_optimizer_options(&self) -> tiny_solver::optimizer::OptimizerOptions {
        let mut options = tiny_solver::optimizer::OptimizerOptions {
            max_iteration: self.max_iterations,
            verbosity_level: self.verbosity,
            ..Default::default()
        };
        if let Some(v) = self.min_abs_decrease {
            options.min_abs_error_decrease_threshold = v;
        }
        if let Some(v) = self.min_rel_decrease {
            options.min_rel_error_decrease_threshold = v;
        }
        if let Some(v) = self.min_error {
            options.min_error_threshold = v;
        }
        options
    }
}

/// What the background loop does after a failed round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Stop the loop after this many failures in a row. `None` retries
    /// forever.
    pub max_consecutive_failures: Option<usize>,
    /// Pause after a failed round, in milliseconds.
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_consecutive_failures: None,
            backoff_ms: 100,
        }
    }
}

impl RetryPolicy {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    /// `true` once `consecutive_failures` exhausts the policy.
    pub fn exhausted(&self, consecutive_failures: usize) -> bool {
        self.max_consecutive_failures
            .is_some_and(|limit| consecutive_failures >= limit)
    }
}

/// Configuration of a [`crate::Calibrator`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibratorConfig {
    pub solver: SolverOptions,
    pub retry: RetryPolicy,
    /// Sleep between checks while there is nothing to solve, in milliseconds.
    pub idle_interval_ms: u64,
}

impl Default for CalibratorConfig {
    fn default() -> Self {
        CalibratorConfig {
            solver: SolverOptions::default(),
            retry: RetryPolicy::default(),
            idle_interval_ms: 10,
        }
    }
}

impl CalibratorConfig {
    pub fn idle_interval(&self) -> Duration {
        Duration::from_millis(self.idle_interval_ms)
    }

    /// Loads a configuration from a YAML file.
    pub fn load_from_yaml(path: &str) -> Result<Self, CalibrationError> {
        let contents = fs::read_to_string(path)?;
        Self::from_yaml_str(&contents)
    }

    /// Parses a configuration from a YAML string.
    pub fn from_yaml_str(contents: &str) -> Result<Self, CalibrationError> {
        let config: CalibratorConfig = serde_yaml::from_str(contents)
            .map_err(|e| CalibrationError::Config(e.to_string()))?;
        if config.solver.max_iterations == 0 {
            return Err(CalibrationError::Config(
                "solver.max_iterations must be at least 1".to_string(),
            ));
        }
        Ok(config)
    }

    /// Serializes the configuration to YAML.
    pub fn to_yaml_string(&self) -> Result<String, CalibrationError> {
        serde_yaml::to_string(self).map_err(|e| CalibrationError::Config(e.to_string()))
    }
}
