//! Model definitions: a vector field, an initializer, and the names of the
//! state variables, parameters and covariates they read.
//!
//! A [`ModelDefinition`] is validated once when it is built and is immutable
//! afterwards. Cloning is cheap and the definition can be shared across
//! threads, so one model serves any number of integrations.

use crate::equation_engine::{
    deepest_stack, parse, Compiler, EquationSystem, Frame, TIME_SYMBOL, VM,
};
use crate::error::{InputError, ModelDefinitionError};
use crate::traits::VectorField;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

type FieldFn = dyn Fn(f64, &[f64], &[f64], &[f64]) -> Vec<f64> + Send + Sync;
type InitFn = dyn Fn(&[f64]) -> Vec<f64> + Send + Sync;

/// Adapts a closure returning the derivative vector to [`VectorField`].
struct FnVectorField {
    dimension: usize,
    f: Box<FieldFn>,
}

impl VectorField for FnVectorField {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn apply(&self, t: f64, x: &[f64], params: &[f64], covariates: &[f64], out: &mut [f64]) {
        let derivative = (self.f)(t, x, params, covariates);
        if derivative.len() == out.len() {
            out.copy_from_slice(&derivative);
        } else {
            // Length changed after construction; surface it as a non-finite derivative.
            out.fill(f64::NAN);
        }
    }
}

enum FieldSource {
    Closure(Box<FieldFn>),
    Field(Box<dyn VectorField>),
    Equations(Vec<String>),
}

enum InitSource {
    Closure(Box<InitFn>),
    Equations(Vec<String>),
}

struct ModelInner {
    name: String,
    state_names: Vec<String>,
    param_names: Vec<String>,
    covariate_names: Vec<String>,
    vector_field: Box<dyn VectorField>,
    initializer: Box<InitFn>,
}

/// An immutable, validated ODE model.
#[derive(Clone)]
pub struct ModelDefinition {
    inner: Arc<ModelInner>,
}

impl fmt::Debug for ModelDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelDefinition")
            .field("name", &self.inner.name)
            .field("state_names", &self.inner.state_names)
            .field("param_names", &self.inner.param_names)
            .field("covariate_names", &self.inner.covariate_names)
            .finish_non_exhaustive()
    }
}

impl ModelDefinition {
    pub fn builder(name: impl Into<String>) -> ModelBuilder {
        ModelBuilder {
            name: name.into(),
            state_names: Vec::new(),
            param_names: Vec::new(),
            covariate_names: Vec::new(),
            field: None,
            init: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn state_names(&self) -> &[String] {
        &self.inner.state_names
    }

    pub fn param_names(&self) -> &[String] {
        &self.inner.param_names
    }

    pub fn covariate_names(&self) -> &[String] {
        &self.inner.covariate_names
    }

    pub fn dimension(&self) -> usize {
        self.inner.state_names.len()
    }

    pub fn state_index(&self, name: &str) -> Option<usize> {
        self.inner.state_names.iter().position(|n| n == name)
    }

    pub fn param_index(&self, name: &str) -> Option<usize> {
        self.inner.param_names.iter().position(|n| n == name)
    }

    pub fn vector_field(&self) -> &dyn VectorField {
        self.inner.vector_field.as_ref()
    }

    /// Initial state for an ordered parameter slice (see [`ParameterVector::resolve`]).
    pub fn initial_state(&self, params: &[f64]) -> Vec<f64> {
        (self.inner.initializer)(params)
    }

    /// Evaluates the vector field once, mostly useful for diagnostics.
    pub fn derivative(&self, t: f64, state: &[f64], params: &[f64], covariates: &[f64]) -> Vec<f64> {
        let mut out = vec![0.0; self.dimension()];
        self.inner
            .vector_field
            .apply(t, state, params, covariates, &mut out);
        out
    }
}

/// Collects the pieces of a [`ModelDefinition`] and validates them on `build`.
pub struct ModelBuilder {
    name: String,
    state_names: Vec<String>,
    param_names: Vec<String>,
    covariate_names: Vec<String>,
    field: Option<FieldSource>,
    init: Option<InitSource>,
}

impl ModelBuilder {
    pub fn states<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.state_names = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn params<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.param_names = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn covariates<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.covariate_names = names.into_iter().map(Into::into).collect();
        self
    }

    /// Vector field as a closure `(t, state, params, covariates) -> dx/dt`.
    pub fn vector_field_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(f64, &[f64], &[f64], &[f64]) -> Vec<f64> + Send + Sync + 'static,
    {
        self.field = Some(FieldSource::Closure(Box::new(f)));
        self
    }

    /// Vector field as any [`VectorField`] implementation.
    pub fn vector_field(mut self, field: impl VectorField + 'static) -> Self {
        self.field = Some(FieldSource::Field(Box::new(field)));
        self
    }

    /// Vector field as one equation per state variable, e.g. `"-Beta*S*I/N"`.
    pub fn equations<I, S>(mut self, equations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.field = Some(FieldSource::Equations(
            equations.into_iter().map(Into::into).collect(),
        ));
        self
    }

    /// Initializer as a closure from ordered parameters to the initial state.
    pub fn initializer<F>(mut self, f: F) -> Self
    where
        F: Fn(&[f64]) -> Vec<f64> + Send + Sync + 'static,
    {
        self.init = Some(InitSource::Closure(Box::new(f)));
        self
    }

    /// Initializer as one expression per state variable over the parameters.
    pub fn initial_equations<I, S>(mut self, equations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.init = Some(InitSource::Equations(
            equations.into_iter().map(Into::into).collect(),
        ));
        self
    }

    pub fn build(self) -> Result<ModelDefinition, ModelDefinitionError> {
        validate_names(&self.state_names, &self.param_names, &self.covariate_names)?;

        let dim = self.state_names.len();
        let field = self
            .field
            .ok_or(ModelDefinitionError::MissingComponent("vector field"))?;
        let init = self
            .init
            .ok_or(ModelDefinitionError::MissingComponent("initializer"))?;

        let initializer: Box<InitFn> = match init {
            InitSource::Closure(f) => f,
            InitSource::Equations(equations) => {
                check_count("initializer", dim, equations.len())?;
                let compiler = Compiler::new(&[], &self.param_names, &[]);
                let bytecodes = equations
                    .iter()
                    .map(|text| parse(text).and_then(|expr| compiler.compile(&expr)))
                    .collect::<Result<Vec<_>, _>>()?;
                let stack_depth = deepest_stack(&bytecodes);
                Box::new(move |params: &[f64]| -> Vec<f64> {
                    let frame = Frame {
                        t: 0.0,
                        vars: &[],
                        params,
                        covariates: &[],
                    };
                    let mut stack = Vec::with_capacity(stack_depth);
                    bytecodes
                        .iter()
                        .map(|code| VM::execute(code, &frame, &mut stack))
                        .collect()
                })
            }
        };

        // Probe once with placeholder inputs so dimension errors surface here.
        let probe_params = vec![1.0; self.param_names.len()];
        let probe_covariates = vec![0.0; self.covariate_names.len()];
        let probe_state = initializer(&probe_params);
        check_count("initializer", dim, probe_state.len())?;

        let vector_field: Box<dyn VectorField> = match field {
            FieldSource::Closure(f) => {
                let derivative = f(0.0, &probe_state, &probe_params, &probe_covariates);
                check_count("vector field", dim, derivative.len())?;
                Box::new(FnVectorField { dimension: dim, f })
            }
            FieldSource::Field(field) => {
                check_count("vector field", dim, field.dimension())?;
                field
            }
            FieldSource::Equations(equations) => {
                check_count("vector field", dim, equations.len())?;
                let refs: Vec<&str> = equations.iter().map(String::as_str).collect();
                Box::new(EquationSystem::compile(
                    &refs,
                    &self.state_names,
                    &self.param_names,
                    &self.covariate_names,
                )?)
            }
        };

        Ok(ModelDefinition {
            inner: Arc::new(ModelInner {
                name: self.name,
                state_names: self.state_names,
                param_names: self.param_names,
                covariate_names: self.covariate_names,
                vector_field,
                initializer,
            }),
        })
    }
}

fn check_count(what: &'static str, expected: usize, actual: usize) -> Result<(), ModelDefinitionError> {
    if expected != actual {
        return Err(ModelDefinitionError::DimensionMismatch {
            what,
            expected,
            actual,
        });
    }
    Ok(())
}

fn validate_names(
    states: &[String],
    params: &[String],
    covariates: &[String],
) -> Result<(), ModelDefinitionError> {
    if states.is_empty() {
        return Err(ModelDefinitionError::NoStates);
    }
    if params.is_empty() {
        return Err(ModelDefinitionError::NoParameters);
    }

    let mut seen = HashSet::new();
    for name in states.iter().chain(params).chain(covariates) {
        if name == TIME_SYMBOL {
            return Err(ModelDefinitionError::ReservedName(name.clone()));
        }
        if !seen.insert(name.as_str()) {
            return Err(ModelDefinitionError::DuplicateName(name.clone()));
        }
    }
    Ok(())
}

/// Named parameter values for one integration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterVector {
    values: BTreeMap<String, f64>,
}

impl ParameterVector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: impl Into<String>, value: f64) -> Option<f64> {
        self.values.insert(name.into(), value)
    }

    pub fn with(mut self, name: impl Into<String>, value: f64) -> Self {
        self.set(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.values.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Orders the values as `model` declares its parameters.
    ///
    /// The vector must name exactly the model's parameters, each finite.
    pub fn resolve(&self, model: &ModelDefinition) -> Result<Vec<f64>, InputError> {
        if let Some(name) = self.values.keys().find(|k| model.param_index(k).is_none()) {
            return Err(InputError::UnknownParameter(name.clone()));
        }
        model
            .param_names()
            .iter()
            .map(|name| match self.values.get(name) {
                None => Err(InputError::MissingParameter(name.clone())),
                Some(&value) if !value.is_finite() => Err(InputError::NonFiniteParameter {
                    name: name.clone(),
                    value,
                }),
                Some(&value) => Ok(value),
            })
            .collect()
    }
}

impl<S: Into<String>> FromIterator<(S, f64)> for ParameterVector {
    fn from_iter<I: IntoIterator<Item = (S, f64)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn decay_builder() -> ModelBuilder {
        ModelDefinition::builder("decay")
            .states(["X"])
            .params(["k", "X_0"])
            .vector_field_fn(|_t, x, p, _c| vec![-p[0] * x[0]])
            .initializer(|p| vec![p[1]])
    }

    #[test]
    fn builds_closure_model() {
        let model = decay_builder().build().expect("model should build");
        assert_eq!(model.dimension(), 1);
        assert_eq!(model.state_index("X"), Some(0));
        assert_eq!(model.param_index("X_0"), Some(1));
        assert_eq!(model.initial_state(&[0.5, 3.0]), vec![3.0]);
        assert_eq!(model.derivative(0.0, &[2.0], &[0.5, 3.0], &[]), vec![-1.0]);
    }

    #[test]
    fn rejects_vector_field_of_wrong_length() {
        let err = ModelDefinition::builder("broken")
            .states(["S", "I", "R"])
            .params(["Beta"])
            .vector_field_fn(|_t, x, p, _c| vec![-p[0] * x[0], p[0] * x[0]])
            .initializer(|_p| vec![1.0, 0.0, 0.0])
            .build()
            .unwrap_err();
        assert_eq!(
            err,
            ModelDefinitionError::DimensionMismatch {
                what: "vector field",
                expected: 3,
                actual: 2
            }
        );
    }

    struct CountingDecay {
        dimension: usize,
        calls: Arc<AtomicUsize>,
    }

    impl VectorField for CountingDecay {
        fn dimension(&self) -> usize {
            self.dimension
        }

        fn apply(&self, _t: f64, x: &[f64], params: &[f64], _c: &[f64], out: &mut [f64]) {
            self.calls.fetch_add(1, Ordering::Relaxed);
            for (slot, xi) in out.iter_mut().zip(x) {
                *slot = -params[0] * xi;
            }
        }
    }

    #[test]
    fn trait_vector_field_is_checked_by_dimension_only() {
        let calls = Arc::new(AtomicUsize::new(0));
        let model = decay_builder()
            .vector_field(CountingDecay {
                dimension: 1,
                calls: Arc::clone(&calls),
            })
            .build()
            .expect("model should build");
        assert_eq!(calls.load(Ordering::Relaxed), 0);
        assert_eq!(model.derivative(0.0, &[2.0], &[0.5, 3.0], &[]), vec![-1.0]);
        assert_eq!(calls.load(Ordering::Relaxed), 1);

        let err = decay_builder()
            .vector_field(CountingDecay {
                dimension: 2,
                calls: Arc::new(AtomicUsize::new(0)),
            })
            .build()
            .unwrap_err();
        assert_eq!(
            err,
            ModelDefinitionError::DimensionMismatch {
                what: "vector field",
                expected: 1,
                actual: 2
            }
        );
    }

    #[test]
    fn rejects_initializer_of_wrong_length() {
        let err = decay_builder()
            .initializer(|p| vec![p[1], 0.0])
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            ModelDefinitionError::DimensionMismatch {
                what: "initializer",
                ..
            }
        ));
    }

    #[test]
    fn rejects_bad_name_sets() {
        let err = decay_builder().states(Vec::<String>::new()).build().unwrap_err();
        assert_eq!(err, ModelDefinitionError::NoStates);

        let err = decay_builder().params(Vec::<String>::new()).build().unwrap_err();
        assert_eq!(err, ModelDefinitionError::NoParameters);

        let err = decay_builder().params(["k", "X"]).build().unwrap_err();
        assert_eq!(err, ModelDefinitionError::DuplicateName("X".to_string()));

        let err = decay_builder().covariates(["t"]).build().unwrap_err();
        assert_eq!(err, ModelDefinitionError::ReservedName("t".to_string()));
    }

    #[test]
    fn requires_vector_field_and_initializer() {
        let err = ModelDefinition::builder("empty")
            .states(["X"])
            .params(["k"])
            .initializer(|_p| vec![1.0])
            .build()
            .unwrap_err();
        assert_eq!(err, ModelDefinitionError::MissingComponent("vector field"));
    }

    #[test]
    fn builds_equation_model_and_checks_symbols() {
        let model = ModelDefinition::builder("sir")
            .states(["S", "I", "R"])
            .params(["Beta", "gamma", "N", "I_0"])
            .equations([
                "-Beta * S * I / N",
                "Beta * S * I / N - gamma * I",
                "gamma * I",
            ])
            .initial_equations(["N - I_0", "I_0", "0"])
            .build()
            .expect("equations should compile");
        let params = [1.0, 0.5, 10.0, 2.0];
        let x0 = model.initial_state(&params);
        assert_eq!(x0, vec![8.0, 2.0, 0.0]);
        let dx = model.derivative(0.0, &x0, &params, &[]);
        assert!((dx[0] + 1.6).abs() < 1e-12);
        assert!((dx[1] - 0.6).abs() < 1e-12);
        assert!((dx[2] - 1.0).abs() < 1e-12);

        let err = ModelDefinition::builder("typo")
            .states(["S"])
            .params(["Beta"])
            .equations(["-beta * S"])
            .initial_equations(["1"])
            .build()
            .unwrap_err();
        assert_eq!(err, ModelDefinitionError::UnknownSymbol("beta".to_string()));
    }

    #[test]
    fn parameter_vector_resolves_in_model_order() {
        let model = decay_builder().build().unwrap();
        let params: ParameterVector = [("X_0", 4.0), ("k", 0.25)].into_iter().collect();
        assert_eq!(params.resolve(&model), Ok(vec![0.25, 4.0]));

        let missing = ParameterVector::new().with("k", 1.0);
        assert_eq!(
            missing.resolve(&model),
            Err(InputError::MissingParameter("X_0".to_string()))
        );

        let extra = params.clone().with("gamma", 1.0);
        assert_eq!(
            extra.resolve(&model),
            Err(InputError::UnknownParameter("gamma".to_string()))
        );

        let nan = params.with("k", f64::NAN);
        assert!(matches!(
            nan.resolve(&model),
            Err(InputError::NonFiniteParameter { .. })
        ));
    }

    #[test]
    fn model_is_shareable_across_threads() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ModelDefinition>();
    }
}
