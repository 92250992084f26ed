use crate::model::{ModelDefinition, ParameterVector};
use anyhow::{anyhow, bail, Context, Result};
use nalgebra::{Complex, DMatrix, DVector};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct NewtonSettings {
    pub max_steps: usize,
    pub damping: f64,
    pub tolerance: f64,
}

impl Default for NewtonSettings {
    fn default() -> Self {
        Self {
            max_steps: 25,
            damping: 1.0,
            tolerance: 1e-9,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplexNumber {
    pub re: f64,
    pub im: f64,
}

impl From<Complex<f64>> for ComplexNumber {
    fn from(value: Complex<f64>) -> Self {
        Self {
            re: value.re,
            im: value.im,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EquilibriumResult {
    pub state: Vec<f64>,
    pub residual_norm: f64,
    pub iterations: usize,
    /// Row-major Jacobian of the vector field at `state`.
    pub jacobian: Vec<f64>,
    pub eigenvalues: Vec<ComplexNumber>,
}

impl EquilibriumResult {
    /// Locally asymptotically stable when every eigenvalue has negative real part.
    pub fn is_stable(&self) -> bool {
        self.eigenvalues.iter().all(|ev| ev.re < 0.0)
    }
}

/// Finds a steady state of `model` near `initial_guess` with damped Newton
/// iterations. Covariates are frozen at `covariates` and time at zero.
pub fn solve_equilibrium(
    model: &ModelDefinition,
    params: &ParameterVector,
    covariates: &[f64],
    initial_guess: &[f64],
    settings: NewtonSettings,
) -> Result<EquilibriumResult> {
    let dim = model.dimension();
    if initial_guess.len() != dim {
        bail!(
            "Initial guess dimension mismatch. Expected {}, got {}.",
            dim,
            initial_guess.len()
        );
    }
    if covariates.len() != model.covariate_names().len() {
        bail!(
            "Expected {} covariate values, got {}.",
            model.covariate_names().len(),
            covariates.len()
        );
    }
    if settings.max_steps == 0 {
        bail!("max_steps must be greater than zero.");
    }
    if settings.damping <= 0.0 {
        bail!("damping must be positive.");
    }
    if settings.tolerance <= 0.0 {
        bail!("tolerance must be positive.");
    }
    let params = params
        .resolve(model)
        .context("Parameter vector does not match the model.")?;

    let residual_at = |state: &[f64]| model.derivative(0.0, state, &params, covariates);

    let mut state = initial_guess.to_vec();
    let mut residual = residual_at(&state);
    let mut residual_norm = l2_norm(&residual);
    let mut iterations = 0usize;

    loop {
        if !residual_norm.is_finite() {
            bail!("Vector field is not finite at the current Newton iterate.");
        }
        if residual_norm <= settings.tolerance {
            break;
        }

        if iterations >= settings.max_steps {
            bail!(
                "Newton solver failed to converge in {} steps (‖f(x)‖ = {}).",
                settings.max_steps,
                residual_norm
            );
        }

        let jacobian = compute_jacobian(&residual_at, &state);
        let delta = solve_linear_system(dim, &jacobian, &residual)
            .context("Failed to solve linear system during Newton iteration.")?;

        for i in 0..dim {
            state[i] -= settings.damping * delta[i];
        }

        iterations += 1;
        residual = residual_at(&state);
        residual_norm = l2_norm(&residual);
    }

    let jacobian = compute_jacobian(&residual_at, &state);
    let eigenvalues = DMatrix::from_row_slice(dim, dim, &jacobian)
        .complex_eigenvalues()
        .iter()
        .map(|&ev| ComplexNumber::from(ev))
        .collect();

    Ok(EquilibriumResult {
        state,
        residual_norm,
        iterations,
        jacobian,
        eigenvalues,
    })
}

/// Central-difference Jacobian, row-major.
fn compute_jacobian(f: &impl Fn(&[f64]) -> Vec<f64>, state: &[f64]) -> Vec<f64> {
    let dim = state.len();
    let mut jacobian = vec![0.0; dim * dim];
    let mut probe = state.to_vec();

    for j in 0..dim {
        let h = 1e-6 * (1.0 + state[j].abs());
        probe[j] = state[j] + h;
        let forward = f(&probe);
        probe[j] = state[j] - h;
        let backward = f(&probe);
        probe[j] = state[j];
        for i in 0..dim {
            jacobian[i * dim + j] = (forward[i] - backward[i]) / (2.0 * h);
        }
    }

    jacobian
}

fn solve_linear_system(dim: usize, jacobian: &[f64], residual: &[f64]) -> Result<Vec<f64>> {
    let j_matrix = DMatrix::from_row_slice(dim, dim, jacobian);
    let rhs = DVector::from_column_slice(residual);
    j_matrix
        .lu()
        .solve(&rhs)
        .map(|v| v.iter().cloned().collect())
        .ok_or_else(|| anyhow!("Jacobian is singular."))
}

fn l2_norm(values: &[f64]) -> f64 {
    values.iter().map(|v| v * v).sum::<f64>().sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{closed_sir, sir_with_demography};

    fn assert_err_contains<T: std::fmt::Debug>(result: Result<T>, needle: &str) {
        let err = result.expect_err("expected error");
        let message = format!("{err:#}");
        assert!(
            message.contains(needle),
            "expected error to contain \"{needle}\", got \"{message}\""
        );
    }

    fn demography_params() -> ParameterVector {
        ParameterVector::new()
            .with("Beta", 2.0)
            .with("gamma", 0.5)
            .with("mu", 0.5)
            .with("N", 100.0)
            .with("S_0", 99.0)
            .with("I_0", 1.0)
            .with("R_0", 0.0)
    }

    #[test]
    fn finds_stable_endemic_equilibrium() {
        let model = sir_with_demography().unwrap();
        let result = solve_equilibrium(
            &model,
            &demography_params(),
            &[],
            &[60.0, 20.0, 20.0],
            NewtonSettings::default(),
        )
        .expect("equilibrium should converge");

        // S* = N / R0, I* = mu (N - S*) / (gamma + mu), R* = gamma I* / mu.
        assert!((result.state[0] - 50.0).abs() < 1e-6);
        assert!((result.state[1] - 25.0).abs() < 1e-6);
        assert!((result.state[2] - 25.0).abs() < 1e-6);
        assert!(result.residual_norm <= 1e-9);
        assert_eq!(result.eigenvalues.len(), 3);
        assert!(result.is_stable());
    }

    #[test]
    fn disease_free_equilibrium_is_unstable_above_threshold() {
        let model = sir_with_demography().unwrap();
        let result = solve_equilibrium(
            &model,
            &demography_params(),
            &[],
            &[100.0, 0.0, 0.0],
            NewtonSettings::default(),
        )
        .expect("disease-free state is already an equilibrium");
        assert_eq!(result.iterations, 0);
        assert!(!result.is_stable());
    }

    #[test]
    fn rejects_invalid_inputs() {
        let model = sir_with_demography().unwrap();
        let params = demography_params();
        assert_err_contains(
            solve_equilibrium(&model, &params, &[], &[1.0], NewtonSettings::default()),
            "dimension mismatch",
        );
        assert_err_contains(
            solve_equilibrium(
                &model,
                &params,
                &[],
                &[1.0, 1.0, 1.0],
                NewtonSettings {
                    max_steps: 0,
                    ..NewtonSettings::default()
                },
            ),
            "max_steps",
        );
        assert_err_contains(
            solve_equilibrium(
                &model,
                &ParameterVector::new(),
                &[],
                &[1.0, 1.0, 1.0],
                NewtonSettings::default(),
            ),
            "Missing parameter",
        );
    }

    #[test]
    fn singular_jacobian_is_reported() {
        // Closed SIR has a line of disease-free equilibria, so its Jacobian is singular there.
        let model = closed_sir().unwrap();
        let params = ParameterVector::new()
            .with("Beta", 1.0)
            .with("gamma", 1.0)
            .with("N", 10.0)
            .with("S_0", 9.0)
            .with("I_0", 1.0)
            .with("R_0", 0.0);
        assert_err_contains(
            solve_equilibrium(&model, &params, &[], &[9.0, 1.0, 0.0], NewtonSettings::default()),
            "singular",
        );
    }
}
