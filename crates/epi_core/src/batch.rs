//! Batch integration over many parameter vectors and initial states.
//!
//! Members share nothing but the read-only model and covariates, so they are
//! integrated on scoped worker threads. Results always come back in input
//! order regardless of which worker finished first.

use crate::covariate::CovariateTable;
use crate::error::TrajectoryError;
use crate::integrator::{integrate_from, IntegratorSettings};
use crate::model::{ModelDefinition, ParameterVector};
use crate::trajectory::Trajectory;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use thiserror::Error;

/// One independent integration in a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchMember {
    pub params: ParameterVector,
    /// Overrides the model initializer when present.
    #[serde(default)]
    pub initial_state: Option<Vec<f64>>,
}

impl BatchMember {
    pub fn new(params: ParameterVector) -> Self {
        Self {
            params,
            initial_state: None,
        }
    }

    pub fn with_initial_state(params: ParameterVector, initial_state: Vec<f64>) -> Self {
        Self {
            params,
            initial_state: Some(initial_state),
        }
    }

    /// Every combination of parameter vector and initial state, parameters outermost.
    pub fn grid(params: &[ParameterVector], initial_states: &[Vec<f64>]) -> Vec<Self> {
        params
            .iter()
            .flat_map(|p| {
                initial_states
                    .iter()
                    .map(move |x0| Self::with_initial_state(p.clone(), x0.clone()))
            })
            .collect()
    }
}

/// Copies of `base` with `name` set to each of `values`.
pub fn sweep(base: &ParameterVector, name: &str, values: &[f64]) -> Vec<ParameterVector> {
    values
        .iter()
        .map(|&value| base.clone().with(name, value))
        .collect()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchMode {
    /// Every member runs regardless of sibling failures.
    #[default]
    Independent,
    /// No new member starts after the first failure.
    FailFast,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchSettings {
    pub mode: BatchMode,
    /// Worker threads; `0` uses the available parallelism.
    pub threads: usize,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum BatchMemberError {
    #[error(transparent)]
    Failed(#[from] TrajectoryError),
    #[error("Skipped after an earlier member failed.")]
    Skipped,
}

/// Per-member outcomes, in input order.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchResult {
    results: Vec<Result<Trajectory, BatchMemberError>>,
}

impl BatchResult {
    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn results(&self) -> &[Result<Trajectory, BatchMemberError>] {
        &self.results
    }

    pub fn into_results(self) -> Vec<Result<Trajectory, BatchMemberError>> {
        self.results
    }

    pub fn all_succeeded(&self) -> bool {
        self.results.iter().all(Result::is_ok)
    }

    /// `(index, trajectory)` for every member that succeeded.
    pub fn succeeded(&self) -> impl Iterator<Item = (usize, &Trajectory)> {
        self.results
            .iter()
            .enumerate()
            .filter_map(|(i, r)| r.as_ref().ok().map(|traj| (i, traj)))
    }

    /// `(index, error)` for every member that failed or was skipped.
    pub fn failures(&self) -> impl Iterator<Item = (usize, &BatchMemberError)> {
        self.results
            .iter()
            .enumerate()
            .filter_map(|(i, r)| r.as_ref().err().map(|err| (i, err)))
    }
}

/// Integrates every member independently and collects the outcomes.
pub fn integrate_batch(
    model: &ModelDefinition,
    members: &[BatchMember],
    t0: f64,
    output_times: &[f64],
    covariates: Option<&CovariateTable>,
    settings: &IntegratorSettings,
    batch: &BatchSettings,
) -> BatchResult {
    let run = |member: &BatchMember| {
        integrate_from(
            model,
            &member.params,
            member.initial_state.as_deref(),
            t0,
            output_times,
            covariates,
            settings,
        )
    };

    let threads = match batch.threads {
        0 => thread::available_parallelism().map_or(1, |n| n.get()),
        n => n,
    }
    .min(members.len())
    .max(1);

    let next = AtomicUsize::new(0);
    let abort = AtomicBool::new(false);

    let worker = || {
        let mut done = Vec::new();
        loop {
            if batch.mode == BatchMode::FailFast && abort.load(Ordering::Acquire) {
                break;
            }
            let idx = next.fetch_add(1, Ordering::AcqRel);
            let Some(member) = members.get(idx) else {
                break;
            };
            let result = run(member);
            if let Err(err) = &result {
                warn!("Batch member {idx} of '{}' failed: {err}", model.name());
                abort.store(true, Ordering::Release);
            }
            done.push((idx, result));
        }
        done
    };

    let finished: Vec<(usize, Result<Trajectory, TrajectoryError>)> = if threads == 1 {
        worker()
    } else {
        thread::scope(|scope| {
            let handles: Vec<_> = (0..threads).map(|_| scope.spawn(&worker)).collect();
            handles
                .into_iter()
                .flat_map(|handle| match handle.join() {
                    Ok(done) => done,
                    Err(payload) => std::panic::resume_unwind(payload),
                })
                .collect()
        })
    };

    let mut results: Vec<Result<Trajectory, BatchMemberError>> =
        (0..members.len()).map(|_| Err(BatchMemberError::Skipped)).collect();
    for (idx, result) in finished {
        results[idx] = result.map_err(BatchMemberError::from);
    }

    debug!(
        "Batch of {} members for '{}' on {} thread(s): {} failed or skipped.",
        members.len(),
        model.name(),
        threads,
        results.iter().filter(|r| r.is_err()).count()
    );

    BatchResult { results }
}
