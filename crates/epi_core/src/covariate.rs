//! Interpolation of exogenous drivers (rainfall, seasonality, ...) sampled at
//! sparse times.
//!
//! Series are immutable once built, so a [`CovariateTable`] can be shared by
//! reference across concurrent integrations.

use crate::error::InputError;
use serde::{Deserialize, Serialize};

/// How values between samples are reconstructed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Interpolation {
    /// Piecewise-linear between bracketing samples.
    #[default]
    Linear,
    /// Holds the most recent sample until the next one.
    Constant,
}

/// A strictly time-ordered series of `(time, value)` samples.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CovariateSeries {
    times: Vec<f64>,
    values: Vec<f64>,
    interpolation: Interpolation,
}

impl CovariateSeries {
    pub fn new(times: Vec<f64>, values: Vec<f64>) -> Result<Self, InputError> {
        Self::with_interpolation(times, values, Interpolation::Linear)
    }

    pub fn with_interpolation(
        times: Vec<f64>,
        values: Vec<f64>,
        interpolation: Interpolation,
    ) -> Result<Self, InputError> {
        if times.len() != values.len() {
            return Err(InputError::SeriesLengthMismatch {
                times: times.len(),
                values: values.len(),
            });
        }
        if times.len() < 2 {
            return Err(InputError::TooFewSamples(times.len()));
        }
        for (i, (t, v)) in times.iter().zip(&values).enumerate() {
            if !t.is_finite() || !v.is_finite() {
                return Err(InputError::NonFiniteSample(i));
            }
        }
        if let Some(i) = times.windows(2).position(|w| w[1] <= w[0]) {
            return Err(InputError::SamplesNotIncreasing(i + 1));
        }

        Ok(Self {
            times,
            values,
            interpolation,
        })
    }

    /// Builds a series from `(time, value)` pairs.
    pub fn from_pairs(pairs: &[(f64, f64)]) -> Result<Self, InputError> {
        let (times, values) = pairs.iter().copied().unzip();
        Self::new(times, values)
    }

    pub fn times(&self) -> &[f64] {
        &self.times
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn interpolation(&self) -> Interpolation {
        self.interpolation
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    /// Estimates the covariate at `t`.
    ///
    /// Queries outside the sampled range clamp to the nearest boundary value,
    /// since adaptive steps may probe slightly beyond the integration window.
    /// A NaN query yields NaN.
    pub fn value(&self, t: f64) -> f64 {
        if t.is_nan() {
            return f64::NAN;
        }
        let last = self.times.len() - 1;
        if t <= self.times[0] {
            return self.values[0];
        }
        if t >= self.times[last] {
            return self.values[last];
        }

        // First index with times[idx] > t; 1 <= idx <= last here.
        let idx = self.times.partition_point(|&sample| sample <= t);
        let (t0, t1) = (self.times[idx - 1], self.times[idx]);
        let (v0, v1) = (self.values[idx - 1], self.values[idx]);

        match self.interpolation {
            Interpolation::Constant => v0,
            Interpolation::Linear => v0 + (v1 - v0) * (t - t0) / (t1 - t0),
        }
    }
}

/// A set of named covariate series.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CovariateTable {
    names: Vec<String>,
    series: Vec<CovariateSeries>,
}

impl CovariateTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces the series stored under `name`.
    pub fn insert(&mut self, name: impl Into<String>, series: CovariateSeries) {
        let name = name.into();
        match self.names.iter().position(|n| *n == name) {
            Some(i) => self.series[i] = series,
            None => {
                self.names.push(name);
                self.series.push(series);
            }
        }
    }

    pub fn with(mut self, name: impl Into<String>, series: CovariateSeries) -> Self {
        self.insert(name, series);
        self
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn get(&self, name: &str) -> Option<&CovariateSeries> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|i| &self.series[i])
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Selects the series a model needs, in the model's covariate order.
    pub fn for_model<'a>(&'a self, names: &[String]) -> Result<BoundCovariates<'a>, InputError> {
        let series = names
            .iter()
            .map(|name| {
                self.get(name)
                    .ok_or_else(|| InputError::MissingCovariate(name.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(BoundCovariates { series })
    }
}

/// Covariate series resolved against a model's covariate slots.
#[derive(Debug, Clone, Default)]
pub struct BoundCovariates<'a> {
    series: Vec<&'a CovariateSeries>,
}

impl BoundCovariates<'_> {
    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    /// Writes every covariate's value at `t` into `out`.
    pub fn values_at(&self, t: f64, out: &mut [f64]) {
        for (slot, series) in out.iter_mut().zip(&self.series) {
            *slot = series.value(t);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rainfall() -> CovariateSeries {
        CovariateSeries::from_pairs(&[(0.0, 2.0), (1.0, 4.0), (3.0, 0.0), (4.0, 1.0)])
            .expect("valid series")
    }

    #[test]
    fn returns_samples_exactly_at_sample_times() {
        let series = rainfall();
        for (t, v) in series.times().iter().zip(series.values()) {
            assert_eq!(series.value(*t), *v);
        }
    }

    #[test]
    fn interpolates_linearly_between_samples() {
        let series = rainfall();
        assert!((series.value(0.5) - 3.0).abs() < 1e-12);
        assert!((series.value(2.0) - 2.0).abs() < 1e-12);
        assert!((series.value(3.25) - 0.25).abs() < 1e-12);
    }

    #[test]
    fn clamps_outside_sampled_range() {
        let series = rainfall();
        assert_eq!(series.value(-10.0), 2.0);
        assert_eq!(series.value(-1e-9), 2.0);
        assert_eq!(series.value(4.0 + 1e-9), 1.0);
        assert_eq!(series.value(1e6), 1.0);
    }

    #[test]
    fn nan_query_yields_nan() {
        assert!(rainfall().value(f64::NAN).is_nan());
        let step = CovariateSeries::with_interpolation(
            vec![0.0, 1.0],
            vec![5.0, 7.0],
            Interpolation::Constant,
        )
        .unwrap();
        assert!(step.value(f64::NAN).is_nan());
    }

    #[test]
    fn constant_interpolation_holds_previous_sample() {
        let series = CovariateSeries::with_interpolation(
            vec![0.0, 1.0, 2.0],
            vec![5.0, 7.0, 9.0],
            Interpolation::Constant,
        )
        .unwrap();
        assert_eq!(series.value(0.99), 5.0);
        assert_eq!(series.value(1.0), 7.0);
        assert_eq!(series.value(1.5), 7.0);
        assert_eq!(series.value(3.0), 9.0);
    }

    #[test]
    fn rejects_malformed_series() {
        assert_eq!(
            CovariateSeries::new(vec![0.0], vec![1.0]),
            Err(InputError::TooFewSamples(1))
        );
        assert_eq!(
            CovariateSeries::new(vec![0.0, 1.0], vec![1.0]),
            Err(InputError::SeriesLengthMismatch {
                times: 2,
                values: 1
            })
        );
        assert_eq!(
            CovariateSeries::new(vec![0.0, 1.0, 1.0], vec![1.0, 2.0, 3.0]),
            Err(InputError::SamplesNotIncreasing(2))
        );
        assert_eq!(
            CovariateSeries::new(vec![0.0, f64::NAN], vec![1.0, 2.0]),
            Err(InputError::NonFiniteSample(1))
        );
    }

    #[test]
    fn table_binds_in_model_order() {
        let table = CovariateTable::new()
            .with("temperature", CovariateSeries::new(vec![0.0, 1.0], vec![10.0, 20.0]).unwrap())
            .with("rainfall", rainfall());
        let bound = table
            .for_model(&["rainfall".to_string(), "temperature".to_string()])
            .expect("both covariates present");
        let mut out = [0.0; 2];
        bound.values_at(0.5, &mut out);
        assert_eq!(out, [3.0, 15.0]);

        let err = table.for_model(&["humidity".to_string()]).unwrap_err();
        assert_eq!(err, InputError::MissingCovariate("humidity".to_string()));
    }

    #[test]
    fn insert_replaces_existing_series() {
        let mut table = CovariateTable::new();
        table.insert("rainfall", rainfall());
        table.insert("rainfall", CovariateSeries::new(vec![0.0, 1.0], vec![0.0, 0.0]).unwrap());
        assert_eq!(table.names().len(), 1);
        assert_eq!(table.get("rainfall").unwrap().value(0.5), 0.0);
    }
}
