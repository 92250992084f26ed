//! Ready-made compartmental models and closed-form SIR relations.
//!
//! Parameter naming follows the usual lesson notation: `Beta` is the
//! transmission rate, `gamma` the recovery rate, `mu` the per-capita birth and
//! death rate, `sigma` the rate of leaving the latent class, `omega` the rate
//! of waning immunity and `N` the population size. Initial conditions are
//! parameters too (`S_0`, `I_0`, `R_0`, ...).

use crate::error::ModelDefinitionError;
use crate::model::{ModelDefinition, ParameterVector};

/// Closed SIR without births or deaths. `N` is the conserved total.
pub fn closed_sir() -> Result<ModelDefinition, ModelDefinitionError> {
    ModelDefinition::builder("closed_sir")
        .states(["S", "I", "R"])
        .params(["Beta", "gamma", "N", "S_0", "I_0", "R_0"])
        .equations([
            "-Beta * S * I / N",
            "Beta * S * I / N - gamma * I",
            "gamma * I",
        ])
        .initial_equations(["S_0", "I_0", "R_0"])
        .build()
}

/// SIR with equal per-capita birth and death rate `mu`, keeping `N` constant.
pub fn sir_with_demography() -> Result<ModelDefinition, ModelDefinitionError> {
    ModelDefinition::builder("sir_demography")
        .states(["S", "I", "R"])
        .params(["Beta", "gamma", "mu", "N", "S_0", "I_0", "R_0"])
        .equations([
            "mu * N - Beta * S * I / N - mu * S",
            "Beta * S * I / N - gamma * I - mu * I",
            "gamma * I - mu * R",
        ])
        .initial_equations(["S_0", "I_0", "R_0"])
        .build()
}

/// SEIR: infected individuals pass through a latent class `E` at rate `sigma`.
pub fn seir() -> Result<ModelDefinition, ModelDefinitionError> {
    ModelDefinition::builder("seir")
        .states(["S", "E", "I", "R"])
        .params(["Beta", "sigma", "gamma", "N", "S_0", "E_0", "I_0", "R_0"])
        .equations([
            "-Beta * S * I / N",
            "Beta * S * I / N - sigma * E",
            "sigma * E - gamma * I",
            "gamma * I",
        ])
        .initial_equations(["S_0", "E_0", "I_0", "R_0"])
        .build()
}

/// SIRS: recovered individuals lose immunity at rate `omega`.
pub fn sirs() -> Result<ModelDefinition, ModelDefinitionError> {
    ModelDefinition::builder("sirs")
        .states(["S", "I", "R"])
        .params(["Beta", "gamma", "omega", "N", "S_0", "I_0", "R_0"])
        .equations([
            "-Beta * S * I / N + omega * R",
            "Beta * S * I / N - gamma * I",
            "gamma * I - omega * R",
        ])
        .initial_equations(["S_0", "I_0", "R_0"])
        .build()
}

/// SIR whose transmission rate scales with a `rainfall` covariate:
/// `Beta(t) = Beta * (1 + alpha * rainfall(t))`.
pub fn rainfall_forced_sir() -> Result<ModelDefinition, ModelDefinitionError> {
    ModelDefinition::builder("rainfall_sir")
        .states(["S", "I", "R"])
        .params(["Beta", "alpha", "gamma", "mu", "N", "S_0", "I_0", "R_0"])
        .covariates(["rainfall"])
        .equations([
            "mu * N - Beta * (1 + alpha * rainfall) * S * I / N - mu * S",
            "Beta * (1 + alpha * rainfall) * S * I / N - gamma * I - mu * I",
            "gamma * I - mu * R",
        ])
        .initial_equations(["S_0", "I_0", "R_0"])
        .build()
}

/// Parameters for the classic boarding-school influenza outbreak:
/// `Beta = 1`, `gamma = 1/13`, `N = 763`, one initial case.
pub fn boarding_school_params() -> ParameterVector {
    ParameterVector::new()
        .with("Beta", 1.0)
        .with("gamma", 1.0 / 13.0)
        .with("N", 763.0)
        .with("S_0", 762.0)
        .with("I_0", 1.0)
        .with("R_0", 0.0)
}

/// `R0 = Beta / (gamma + mu)`; pass `mu = 0` for a closed population.
pub fn basic_reproduction_number(beta: f64, gamma: f64, mu: f64) -> f64 {
    beta / (gamma + mu)
}

/// R0 implied by a final epidemic size fraction `f` in (0, 1):
/// `R0 = -ln(1 - f) / f`.
pub fn r0_from_final_size(f: f64) -> Option<f64> {
    if !(f > 0.0 && f < 1.0) {
        return None;
    }
    Some(-(1.0 - f).ln() / f)
}

/// Final size fraction `f` solving `1 - f = exp(-R0 f)`.
///
/// Returns `0` when `R0 <= 1` (no major outbreak).
pub fn final_size(r0: f64) -> Option<f64> {
    if !r0.is_finite() || r0 < 0.0 {
        return None;
    }
    if r0 <= 1.0 {
        return Some(0.0);
    }

    // g(f) = 1 - f - exp(-R0 f) is concave with g(0) = 0, so Newton from 1
    // converges monotonically to the positive root.
    let mut f = 1.0;
    for _ in 0..100 {
        let e = (-r0 * f).exp();
        let g = 1.0 - f - e;
        let dg = -1.0 + r0 * e;
        let next = f - g / dg;
        if (next - f).abs() < 1e-15 {
            return Some(next);
        }
        f = next;
    }
    Some(f)
}
