use thiserror::Error;

/// Raised while building a [`ModelDefinition`](crate::model::ModelDefinition).
///
/// Construction aborts on the first violation; nothing is deferred to the
/// first integration call.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ModelDefinitionError {
    #[error("Model must declare at least one state variable.")]
    NoStates,
    #[error("Model must declare at least one parameter.")]
    NoParameters,
    #[error("Name '{0}' is declared more than once.")]
    DuplicateName(String),
    #[error("Name '{0}' is reserved for the time variable.")]
    ReservedName(String),
    #[error("{what} returned {actual} values, expected {expected} (one per state variable).")]
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("Model is missing its {0}.")]
    MissingComponent(&'static str),
    #[error("Unknown variable or parameter '{0}'.")]
    UnknownSymbol(String),
    #[error("Unknown function '{0}'.")]
    UnknownFunction(String),
    #[error("Failed to parse equation: {0}")]
    Parse(String),
}

/// Malformed caller input, detected before any integration work.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InputError {
    #[error("At least one output time is required.")]
    NoOutputTimes,
    #[error("Output time at index {index} ({value}) is not finite.")]
    NonFiniteTime { index: usize, value: f64 },
    #[error("Output times must be strictly increasing (index {index}: {previous} then {value}).")]
    TimesNotIncreasing {
        index: usize,
        previous: f64,
        value: f64,
    },
    #[error("Output time {value} precedes the start time {t0}.")]
    TimeBeforeStart { value: f64, t0: f64 },
    #[error("Missing parameter '{0}'.")]
    MissingParameter(String),
    #[error("Unknown parameter '{0}'.")]
    UnknownParameter(String),
    #[error("Parameter '{name}' is not finite ({value}).")]
    NonFiniteParameter { name: String, value: f64 },
    #[error("Initial state has {actual} values, expected {expected}.")]
    InitialStateMismatch { expected: usize, actual: usize },
    #[error("Initial state value at index {0} is not finite.")]
    NonFiniteInitialState(usize),
    #[error("Missing covariate '{0}'.")]
    MissingCovariate(String),
    #[error("Covariate series needs at least two samples, got {0}.")]
    TooFewSamples(usize),
    #[error("Covariate times and values differ in length ({times} vs {values}).")]
    SeriesLengthMismatch { times: usize, values: usize },
    #[error("Covariate sample {0} is not finite.")]
    NonFiniteSample(usize),
    #[error("Covariate times must be strictly increasing (index {0}).")]
    SamplesNotIncreasing(usize),
    #[error("Invalid integrator setting: {0}")]
    InvalidSetting(&'static str),
}

/// Numerical failure inside a single trajectory.
///
/// Every variant records where the failure happened so callers can decide how
/// to reformulate the system.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum IntegrationError {
    #[error("Step size {step:e} fell below the minimum {min_step:e} at t = {t} without meeting tolerance.")]
    StepSizeUnderflow {
        t: f64,
        step: f64,
        min_step: f64,
        state: Vec<f64>,
    },
    #[error("Vector field returned a non-finite derivative for state index {index} at t = {t}.")]
    NonFiniteDerivative { t: f64, index: usize, state: Vec<f64> },
    #[error("Exceeded the budget of {max_steps} steps at t = {t}.")]
    StepBudgetExceeded {
        t: f64,
        max_steps: usize,
        state: Vec<f64>,
    },
}

impl IntegrationError {
    pub fn time(&self) -> f64 {
        match self {
            IntegrationError::StepSizeUnderflow { t, .. }
            | IntegrationError::NonFiniteDerivative { t, .. }
            | IntegrationError::StepBudgetExceeded { t, .. } => *t,
        }
    }

    pub fn state(&self) -> &[f64] {
        match self {
            IntegrationError::StepSizeUnderflow { state, .. }
            | IntegrationError::NonFiniteDerivative { state, .. }
            | IntegrationError::StepBudgetExceeded { state, .. } => state,
        }
    }
}

/// Error returned by a single trajectory computation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TrajectoryError {
    #[error(transparent)]
    Input(#[from] InputError),
    #[error(transparent)]
    Integration(#[from] IntegrationError),
}
