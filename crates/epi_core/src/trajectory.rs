use serde::{Deserialize, Serialize};

/// Work done while producing a trajectory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrationStats {
    pub accepted_steps: usize,
    pub rejected_steps: usize,
    pub evaluations: usize,
}

/// Solution values at the requested output times.
///
/// `states[i]` holds the state at `times[i]`, ordered as `state_names`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    state_names: Vec<String>,
    times: Vec<f64>,
    states: Vec<Vec<f64>>,
    stats: IntegrationStats,
}

impl Trajectory {
    pub(crate) fn new(
        state_names: Vec<String>,
        times: Vec<f64>,
        states: Vec<Vec<f64>>,
        stats: IntegrationStats,
    ) -> Self {
        debug_assert_eq!(times.len(), states.len());
        Self {
            state_names,
            times,
            states,
            stats,
        }
    }

    pub fn state_names(&self) -> &[String] {
        &self.state_names
    }

    pub fn times(&self) -> &[f64] {
        &self.times
    }

    pub fn states(&self) -> &[Vec<f64>] {
        &self.states
    }

    pub fn stats(&self) -> IntegrationStats {
        self.stats
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    pub fn time(&self, index: usize) -> Option<f64> {
        self.times.get(index).copied()
    }

    pub fn state(&self, index: usize) -> Option<&[f64]> {
        self.states.get(index).map(Vec::as_slice)
    }

    pub fn final_state(&self) -> Option<&[f64]> {
        self.states.last().map(Vec::as_slice)
    }

    /// One state variable across all output times.
    pub fn variable(&self, name: &str) -> Option<Vec<f64>> {
        let idx = self.state_names.iter().position(|n| n == name)?;
        Some(self.states.iter().map(|row| row[idx]).collect())
    }

    /// `(time, state)` pairs in time order.
    pub fn iter(&self) -> impl Iterator<Item = (f64, &[f64])> {
        self.times
            .iter()
            .copied()
            .zip(self.states.iter().map(Vec::as_slice))
    }

    /// Sum of all state variables at each output time.
    pub fn totals(&self) -> Vec<f64> {
        self.states.iter().map(|row| row.iter().sum()).collect()
    }
}
