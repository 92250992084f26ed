use crate::error::IntegrationError;

/// The right-hand side of a compartmental ODE model.
pub trait VectorField: Send + Sync {
    /// Returns the dimension of the state space.
    fn dimension(&self) -> usize;

    /// Evaluates the vector field.
    /// t: current time
    /// x: current state
    /// params: parameter values, ordered as the model declares them
    /// covariates: interpolated covariate values at `t`
    /// out: buffer to write dx/dt
    fn apply(&self, t: f64, x: &[f64], params: &[f64], covariates: &[f64], out: &mut [f64]);
}

/// A vector field with its parameters and covariates already bound,
/// leaving only `dx/dt = f(t, x)`.
pub trait Rhs {
    fn dimension(&self) -> usize;

    /// Evaluates `f(t, x)` into `out`, failing on non-finite output.
    fn eval(&mut self, t: f64, x: &[f64], out: &mut [f64]) -> Result<(), IntegrationError>;
}

/// A trait for fixed-step solvers that can step a system forward.
pub trait Steppable {
    /// Performs one step of size dt.
    /// t: current time (updated after step)
    /// state: current state (updated after step)
    /// dt: step size
    fn step(
        &mut self,
        system: &mut impl Rhs,
        t: &mut f64,
        state: &mut [f64],
        dt: f64,
    ) -> Result<(), IntegrationError>;
}
