//! Scenarios
//!
//! Each scenario runs a fixed step sequence against injected platforms and
//! produces a [`ScenarioReport`]. Teardown always runs; its failures are
//! recorded next to, never in place of, the scenario outcome.

pub mod hotplug;
pub mod pod_stress;

pub use hotplug::*;
pub use pod_stress::*;

use crate::domain::ports::ExecutionEnvironment;
use crate::error::{Error, ErrorCategory, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt::Display;
use tracing::{error, info};

/// One completed step
#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub step: String,
    pub at: DateTime<Utc>,
}

/// Ordered log of the steps a scenario completed
#[derive(Debug)]
pub struct StepLog {
    scenario: String,
    started_at: DateTime<Utc>,
    steps: Vec<StepRecord>,
}

impl StepLog {
    pub fn new(scenario: impl Into<String>) -> Self {
        Self {
            scenario: scenario.into(),
            started_at: Utc::now(),
            steps: Vec::new(),
        }
    }

    pub fn record(&mut self, step: impl Into<String>) {
        let step = step.into();
        info!("[{}] {}", self.scenario, step);
        self.steps.push(StepRecord {
            step,
            at: Utc::now(),
        });
    }

    /// Close the log into a report
    pub fn finish(
        self,
        environment: ExecutionEnvironment,
        outcome: Result<()>,
        teardown_errors: Vec<String>,
    ) -> ScenarioReport {
        let (error, error_category) = match &outcome {
            Ok(()) => (None, None),
            Err(e) => (Some(e.to_string()), Some(e.category())),
        };
        let report = ScenarioReport {
            scenario: self.scenario,
            environment,
            started_at: self.started_at,
            finished_at: Utc::now(),
            passed: outcome.is_ok(),
            error,
            error_category,
            steps: self.steps,
            teardown_errors,
        };

        if report.passed {
            info!(
                "Scenario {} PASSED after {} steps",
                report.scenario,
                report.steps.len()
            );
        } else {
            error!(
                "Scenario {} FAILED after {} steps: {}",
                report.scenario,
                report.steps.len(),
                report.error.as_deref().unwrap_or_default()
            );
        }
        report
    }
}

/// Outcome of one scenario run, serializable to JSON
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub scenario: String,
    pub environment: ExecutionEnvironment,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_category: Option<ErrorCategory>,
    pub steps: Vec<StepRecord>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub teardown_errors: Vec<String>,
}

/// Fail with a consistency error unless `holds`
pub fn ensure(
    holds: bool,
    check: &str,
    expected: impl Display,
    actual: impl Display,
) -> Result<()> {
    if holds {
        Ok(())
    } else {
        Err(Error::consistency(check, expected, actual))
    }
}

/// Run one teardown action, collecting its failure instead of raising it
pub(crate) fn collect_teardown(errors: &mut Vec<String>, what: &str, outcome: Result<()>) {
    if let Err(e) = outcome {
        error!("Teardown of {} failed: {}", what, e);
        errors.push(format!("{}: {}", what, e));
    }
}
