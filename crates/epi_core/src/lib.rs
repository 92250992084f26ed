//! The `epi_core` crate computes deterministic trajectories of compartmental
//! epidemic models (SIR and its variants).
//!
//! Key components:
//! - **Model**: `ModelDefinition`, validated at construction, built from closures,
//!   a `VectorField` implementation, or equation text compiled by the equation engine.
//! - **Covariates**: `CovariateSeries`/`CovariateTable` interpolating exogenous drivers.
//! - **Integrator**: adaptive Dormand-Prince 5(4) with dense output, fixed-step
//!   RK4 and Tsit5, and batch integration across parameter sets.
//! - **Analysis**: endemic equilibria and final-size relations.
pub mod batch;
pub mod covariate;
pub mod equation_engine;
pub mod equilibrium;
pub mod error;
pub mod integrator;
pub mod model;
pub mod models;
pub mod solvers;
pub mod traits;
pub mod trajectory;

pub use batch::{integrate_batch, sweep, BatchMember, BatchMode, BatchResult, BatchSettings};
pub use covariate::{CovariateSeries, CovariateTable, Interpolation};
pub use error::{InputError, IntegrationError, ModelDefinitionError, TrajectoryError};
pub use integrator::{integrate, integrate_from, IntegratorSettings, Method};
pub use model::{ModelDefinition, ParameterVector};
pub use trajectory::{IntegrationStats, Trajectory};
