//! Per-resource scenario state machine.
//!
//! ```text
//! Created -> Validating -> Converged | Failed
//! Converged -> Mutating -> Validating
//! Converged -> Disrupted -> Validating
//! Failed -> Validating            (collision scenarios only)
//! ```

use std::fmt;

use conv_core::{HarnessError, HarnessResult};
use serde::Serialize;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ScenarioState {
    Created,
    Validating,
    Converged,
    Mutating,
    Disrupted,
    Failed,
}

impl fmt::Display for ScenarioState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ScenarioState::Created => "Created",
            ScenarioState::Validating => "Validating",
            ScenarioState::Converged => "Converged",
            ScenarioState::Mutating => "Mutating",
            ScenarioState::Disrupted => "Disrupted",
            ScenarioState::Failed => "Failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct ScenarioTracker {
    scenario: String,
    resource: String,
    expects_failure: bool,
    history: Vec<ScenarioState>,
}

impl ScenarioTracker {
    /// A tracker in state `Created`. `expects_failure` allows `Failed` and the way back
    /// out of it.
    pub fn new(scenario: &str, resource: &str, expects_failure: bool) -> Self {
        Self {
            scenario: scenario.to_string(),
            resource: resource.to_string(),
            expects_failure,
            history: vec![ScenarioState::Created],
        }
    }

    pub fn state(&self) -> ScenarioState { *self.history.last().unwrap_or(&ScenarioState::Created) }

    pub fn history(&self) -> &[ScenarioState] { &self.history }

    fn allowed(&self, from: ScenarioState, to: ScenarioState) -> bool {
        use ScenarioState::*;
        match (from, to) {
            (Created, Validating) => true,
            (Validating, Converged) | (Validating, Failed) => true,
            (Converged, Mutating) | (Converged, Disrupted) => true,
            (Mutating, Validating) | (Disrupted, Validating) => true,
            (Failed, Validating) => self.expects_failure,
            _ => false,
        }
    }

    pub fn advance(&mut self, to: ScenarioState) -> HarnessResult<()> {
        let from = self.state();
        if from == to {
            return Ok(());
        }
        if !self.allowed(from, to) {
            return Err(HarnessError::IllegalTransition {
                scenario: format!("{} ({})", self.scenario, self.resource),
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        debug!(scenario = %self.scenario, resource = %self.resource, %from, %to, "scenario state");
        self.history.push(to);
        if to == ScenarioState::Failed && !self.expects_failure {
            return Err(HarnessError::Expectation(format!(
                "{}: driver deployment {} reached phase Failed",
                self.scenario, self.resource
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ScenarioState::*;

    #[test]
    fn normal_lifecycle() {
        let mut t = ScenarioTracker::new("s", "d", false);
        for s in [Validating, Converged, Mutating, Validating, Converged, Disrupted, Validating, Converged] {
            t.advance(s).unwrap();
        }
        assert_eq!(t.state(), Converged);
        assert_eq!(t.history().len(), 9);
    }

    #[test]
    fn failed_is_a_test_failure_outside_collision() {
        let mut t = ScenarioTracker::new("s", "d", false);
        t.advance(Validating).unwrap();
        assert!(matches!(t.advance(Failed), Err(HarnessError::Expectation(_))));
        assert!(matches!(t.advance(Validating), Err(HarnessError::IllegalTransition { .. })));
    }

    #[test]
    fn collision_may_leave_failed() {
        let mut t = ScenarioTracker::new("collision", "d", true);
        t.advance(Validating).unwrap();
        t.advance(Failed).unwrap();
        t.advance(Validating).unwrap();
        t.advance(Converged).unwrap();
    }

    #[test]
    fn skipping_validation_is_illegal() {
        let mut t = ScenarioTracker::new("s", "d", false);
        let err = t.advance(Converged).unwrap_err();
        assert!(err.to_string().contains("Created -> Converged"), "{}", err);
        // Staying put is a no-op.
        t.advance(Created).unwrap();
    }
}
