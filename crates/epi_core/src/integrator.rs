//! Deterministic trajectory integration.
//!
//! Every call is a pure function of its inputs: the model, the parameter
//! vector, the covariates and the settings are passed in explicitly and
//! nothing survives between calls.

use crate::covariate::{BoundCovariates, CovariateTable};
use crate::error::{InputError, IntegrationError, TrajectoryError};
use crate::model::{ModelDefinition, ParameterVector};
use crate::solvers::{DormandPrince45, Tsit5, RK4};
use crate::traits::{Rhs, Steppable};
use crate::trajectory::{IntegrationStats, Trajectory};
use log::{debug, trace};
use serde::{Deserialize, Serialize};

/// Integration scheme.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Method {
    /// Adaptive Dormand-Prince 5(4) with dense output.
    DormandPrince45,
    /// Classic RK4 at a fixed step, shortened to land on output times.
    Rk4 { dt: f64 },
    /// Tsitouras 5th order at a fixed step, shortened to land on output times.
    Tsit5 { dt: f64 },
}

/// Settings controlling step selection and work limits.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegratorSettings {
    pub method: Method,
    pub rtol: f64,
    pub atol: f64,
    /// First trial step; `0.0` picks one from the initial derivative.
    pub initial_step: f64,
    pub min_step: f64,
    /// Upper bound on the step; `None` leaves it bounded by the time span.
    pub max_step: Option<f64>,
    /// Maximum number of attempted steps per trajectory.
    pub max_steps: usize,
    pub safety: f64,
    pub min_factor: f64,
    pub max_factor: f64,
}

impl Default for IntegratorSettings {
    fn default() -> Self {
        Self {
            method: Method::DormandPrince45,
            rtol: 1e-6,
            atol: 1e-9,
            initial_step: 0.0,
            min_step: 1e-12,
            max_step: None,
            max_steps: 100_000,
            safety: 0.9,
            min_factor: 0.2,
            max_factor: 5.0,
        }
    }
}

impl IntegratorSettings {
    pub fn validate(&self) -> Result<(), InputError> {
        let positive = |v: f64| v.is_finite() && v > 0.0;
        if !positive(self.rtol) {
            return Err(InputError::InvalidSetting("rtol must be finite and positive"));
        }
        if !positive(self.atol) {
            return Err(InputError::InvalidSetting("atol must be finite and positive"));
        }
        if !self.initial_step.is_finite() || self.initial_step < 0.0 {
            return Err(InputError::InvalidSetting("initial_step must be finite and non-negative"));
        }
        if !positive(self.min_step) {
            return Err(InputError::InvalidSetting("min_step must be finite and positive"));
        }
        if let Some(max_step) = self.max_step {
            if !(max_step >= self.min_step) {
                return Err(InputError::InvalidSetting("max_step must be at least min_step"));
            }
        }
        if self.max_steps == 0 {
            return Err(InputError::InvalidSetting("max_steps must be greater than zero"));
        }
        if !(self.safety > 0.0 && self.safety <= 1.0) {
            return Err(InputError::InvalidSetting("safety must lie in (0, 1]"));
        }
        if !(self.min_factor > 0.0 && self.min_factor < 1.0) {
            return Err(InputError::InvalidSetting("min_factor must lie in (0, 1)"));
        }
        if !(self.max_factor > 1.0 && self.max_factor.is_finite()) {
            return Err(InputError::InvalidSetting("max_factor must be finite and greater than 1"));
        }
        match self.method {
            Method::Rk4 { dt } | Method::Tsit5 { dt } if !positive(dt) => {
                Err(InputError::InvalidSetting("fixed step dt must be finite and positive"))
            }
            _ => Ok(()),
        }
    }

    fn max_step(&self) -> f64 {
        self.max_step.unwrap_or(f64::INFINITY)
    }
}

/// Model, parameters and covariates bound into `dx/dt = f(t, x)`.
struct BoundSystem<'a> {
    model: &'a ModelDefinition,
    params: &'a [f64],
    covariates: BoundCovariates<'a>,
    covariate_values: Vec<f64>,
    evaluations: usize,
}

impl Rhs for BoundSystem<'_> {
    fn dimension(&self) -> usize {
        self.model.dimension()
    }

    fn eval(&mut self, t: f64, x: &[f64], out: &mut [f64]) -> Result<(), IntegrationError> {
        self.evaluations += 1;
        self.covariates.values_at(t, &mut self.covariate_values);
        self.model
            .vector_field()
            .apply(t, x, self.params, &self.covariate_values, out);
        if let Some(index) = out.iter().position(|v| !v.is_finite()) {
            return Err(IntegrationError::NonFiniteDerivative {
                t,
                index,
                state: x.to_vec(),
            });
        }
        Ok(())
    }
}

/// Integrates `model` from its initializer's state at `t0`, reporting the
/// solution at each of `output_times`.
pub fn integrate(
    model: &ModelDefinition,
    params: &ParameterVector,
    t0: f64,
    output_times: &[f64],
    covariates: Option<&CovariateTable>,
    settings: &IntegratorSettings,
) -> Result<Trajectory, TrajectoryError> {
    integrate_from(model, params, None, t0, output_times, covariates, settings)
}

/// Like [`integrate`], with an optional explicit initial state overriding the
/// model's initializer.
pub fn integrate_from(
    model: &ModelDefinition,
    params: &ParameterVector,
    initial_state: Option<&[f64]>,
    t0: f64,
    output_times: &[f64],
    covariates: Option<&CovariateTable>,
    settings: &IntegratorSettings,
) -> Result<Trajectory, TrajectoryError> {
    settings.validate()?;
    validate_times(t0, output_times)?;
    let params = params.resolve(model)?;

    let empty = CovariateTable::new();
    let covariates = covariates.unwrap_or(&empty).for_model(model.covariate_names())?;

    let dim = model.dimension();
    let x0 = match initial_state {
        Some(state) => state.to_vec(),
        None => model.initial_state(&params),
    };
    if x0.len() != dim {
        return Err(InputError::InitialStateMismatch {
            expected: dim,
            actual: x0.len(),
        }
        .into());
    }
    if let Some(idx) = x0.iter().position(|v| !v.is_finite()) {
        return Err(InputError::NonFiniteInitialState(idx).into());
    }

    let mut system = BoundSystem {
        model,
        params: &params,
        covariate_values: vec![0.0; covariates.len()],
        covariates,
        evaluations: 0,
    };

    let (states, mut stats) = match settings.method {
        Method::DormandPrince45 => run_adaptive(&mut system, x0, t0, output_times, settings)?,
        Method::Rk4 { dt } => run_fixed(&mut system, RK4::new(dim), x0, t0, output_times, dt, settings)?,
        Method::Tsit5 { dt } => {
            run_fixed(&mut system, Tsit5::new(dim), x0, t0, output_times, dt, settings)?
        }
    };
    stats.evaluations = system.evaluations;

    debug!(
        "Integrated '{}' over [{}, {}]: {} accepted, {} rejected, {} evaluations.",
        model.name(),
        t0,
        output_times[output_times.len() - 1],
        stats.accepted_steps,
        stats.rejected_steps,
        stats.evaluations
    );

    Ok(Trajectory::new(
        model.state_names().to_vec(),
        output_times.to_vec(),
        states,
        stats,
    ))
}

fn validate_times(t0: f64, output_times: &[f64]) -> Result<(), InputError> {
    if !t0.is_finite() {
        return Err(InputError::InvalidSetting("t0 must be finite"));
    }
    if output_times.is_empty() {
        return Err(InputError::NoOutputTimes);
    }
    for (index, &value) in output_times.iter().enumerate() {
        if !value.is_finite() {
            return Err(InputError::NonFiniteTime { index, value });
        }
        if index > 0 && value <= output_times[index - 1] {
            return Err(InputError::TimesNotIncreasing {
                index,
                previous: output_times[index - 1],
                value,
            });
        }
    }
    if output_times[0] < t0 {
        return Err(InputError::TimeBeforeStart {
            value: output_times[0],
            t0,
        });
    }
    Ok(())
}

fn run_adaptive(
    system: &mut BoundSystem<'_>,
    mut y: Vec<f64>,
    t0: f64,
    output_times: &[f64],
    settings: &IntegratorSettings,
) -> Result<(Vec<Vec<f64>>, IntegrationStats), IntegrationError> {
    let mut stats = IntegrationStats::default();
    let mut rows = Vec::with_capacity(output_times.len());
    let mut next = 0;
    if output_times[0] == t0 {
        rows.push(y.clone());
        next = 1;
    }
    if next == output_times.len() {
        return Ok((rows, stats));
    }

    let t_end = output_times[output_times.len() - 1];
    let max_step = settings.max_step();
    let mut solver = DormandPrince45::new(y.len());
    solver.prime(system, t0, &y)?;

    let mut t = t0;
    let mut h = if settings.initial_step > 0.0 {
        settings.initial_step
    } else {
        initial_step(&y, solver.derivative(), settings)
    };
    h = h.min(max_step).min(t_end - t0).max(settings.min_step);

    let mut out = vec![0.0; y.len()];
    let mut attempts = 0usize;
    let mut rejected_last = false;

    loop {
        if attempts >= settings.max_steps {
            return Err(IntegrationError::StepBudgetExceeded {
                t,
                max_steps: settings.max_steps,
                state: y,
            });
        }
        attempts += 1;

        let remaining = t_end - t;
        let step = h.min(remaining);
        let attempt = solver.attempt(system, t, &y, step, settings.atol, settings.rtol)?;
        let err = attempt.error_norm;

        if err <= 1.0 {
            solver.accept(t, &mut y, step);
            let t_new = if step == remaining { t_end } else { t + step };
            while next < output_times.len() && output_times[next] <= t_new {
                if output_times[next] == t_new {
                    rows.push(y.clone());
                } else {
                    solver.interpolate(output_times[next], &mut out);
                    rows.push(out.clone());
                }
                next += 1;
            }
            t = t_new;
            stats.accepted_steps += 1;
            if next == output_times.len() {
                break;
            }

            let mut factor = if err == 0.0 {
                settings.max_factor
            } else {
                (settings.safety * err.powf(-0.2)).clamp(settings.min_factor, settings.max_factor)
            };
            if rejected_last {
                factor = factor.min(1.0);
            }
            rejected_last = false;
            h = (step * factor).min(max_step).max(settings.min_step);
        } else {
            stats.rejected_steps += 1;
            rejected_last = true;
            let factor = if err.is_finite() {
                (settings.safety * err.powf(-0.2)).clamp(settings.min_factor, 1.0)
            } else {
                settings.min_factor
            };
            let shrunk = step * factor;
            trace!("Rejected step {step:e} at t = {t} (error {err:e}); retrying with {shrunk:e}.");
            if shrunk < settings.min_step {
                return Err(IntegrationError::StepSizeUnderflow {
                    t,
                    step: shrunk,
                    min_step: settings.min_step,
                    state: y,
                });
            }
            h = shrunk;
        }
    }

    Ok((rows, stats))
}

/// Starting step from the size of the state and its derivative.
fn initial_step(y: &[f64], f: &[f64], settings: &IntegratorSettings) -> f64 {
    let n = y.len().max(1) as f64;
    let mut d0 = 0.0;
    let mut d1 = 0.0;
    for (yi, fi) in y.iter().zip(f) {
        let scale = settings.atol + settings.rtol * yi.abs();
        d0 += (yi / scale).powi(2);
        d1 += (fi / scale).powi(2);
    }
    let d0 = (d0 / n).sqrt();
    let d1 = (d1 / n).sqrt();
    if d0 < 1e-5 || d1 < 1e-5 {
        1e-6
    } else {
        0.01 * d0 / d1
    }
}

fn run_fixed(
    system: &mut BoundSystem<'_>,
    mut solver: impl Steppable,
    mut y: Vec<f64>,
    t0: f64,
    output_times: &[f64],
    dt: f64,
    settings: &IntegratorSettings,
) -> Result<(Vec<Vec<f64>>, IntegrationStats), IntegrationError> {
    let mut stats = IntegrationStats::default();
    let mut rows = Vec::with_capacity(output_times.len());
    let mut t = t0;

    for &target in output_times {
        while t < target {
            if stats.accepted_steps >= settings.max_steps {
                return Err(IntegrationError::StepBudgetExceeded {
                    t,
                    max_steps: settings.max_steps,
                    state: y,
                });
            }
            let remaining = target - t;
            let step = dt.min(remaining);
            solver.step(system, &mut t, &mut y, step)?;
            if step == remaining {
                t = target;
            }
            stats.accepted_steps += 1;
        }
        rows.push(y.clone());
    }

    Ok((rows, stats))
}
