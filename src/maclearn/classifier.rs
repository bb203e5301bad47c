//! Trainable model seam and the Gaussian naive Bayes baseline.

use std::fmt::Debug;

use ndarray::{Array2, ArrayView2};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::core::errors::{LogisError, Result};

pub trait Classifier: Debug + Send + Sync {
    /// Learn from `features` (rows x columns) and one class per row
    fn fit(&mut self, features: ArrayView2<'_, f32>, targets: &[i64]) -> Result<()>;

    /// Class probabilities, one column per entry of [`Classifier::classes`]
    fn predict_proba(&self, features: ArrayView2<'_, f32>) -> Result<Array2<f32>>;

    fn classes(&self) -> &[i64];

    /// Probability of `class` for every row; zero when the class was never seen
    fn class_probability(&self, features: ArrayView2<'_, f32>, class: i64) -> Result<Vec<f32>> {
        let Some(column) = self.classes().iter().position(|c| *c == class) else {
            return Ok(vec![0.0; features.nrows()]);
        };
        let proba = self.predict_proba(features)?;
        Ok(proba.column(column).to_vec())
    }
}

/// Creates untrained models
pub trait ModelFactory: Send + Sync {
    type Model: Classifier + Serialize + DeserializeOwned + Clone + 'static;

    /// `n_jobs` is a worker-count hint the model may ignore
    fn create(&self, n_jobs: usize) -> Self::Model;
}

/// Distinct classes in ascending order
pub fn distinct_classes(targets: &[i64]) -> Vec<i64> {
    let mut classes = targets.to_vec();
    classes.sort_unstable();
    classes.dedup();
    classes
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GaussianNb {
    var_smoothing: f64,
    classes: Vec<i64>,
    priors: Vec<f64>,
    means: Vec<Vec<f64>>,
    variances: Vec<Vec<f64>>,
}

impl Default for GaussianNb {
    fn default() -> Self {
        Self {
            var_smoothing: 1e-9,
            classes: Vec::new(),
            priors: Vec::new(),
            means: Vec::new(),
            variances: Vec::new(),
        }
    }
}

impl GaussianNb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_fitted(&self) -> bool {
        !self.classes.is_empty()
    }

    fn check_columns(&self, features: &ArrayView2<'_, f32>) -> Result<()> {
        let expected = self.means.first().map_or(0, Vec::len);
        if features.ncols() != expected {
            return Err(LogisError::alignment(
                "feature columns differ from the trained model",
                expected,
                features.ncols(),
            ));
        }
        Ok(())
    }
}

impl Classifier for GaussianNb {
    fn fit(&mut self, features: ArrayView2<'_, f32>, targets: &[i64]) -> Result<()> {
        if features.nrows() != targets.len() {
            return Err(LogisError::alignment(
                "targets do not match the feature rows",
                features.nrows(),
                targets.len(),
            ));
        }
        let classes = distinct_classes(targets);
        let columns = features.ncols();
        let mut counts = vec![0usize; classes.len()];
        let mut sums = vec![vec![0.0f64; columns]; classes.len()];
        let mut squares = vec![vec![0.0f64; columns]; classes.len()];

        for (row, target) in features.outer_iter().zip(targets) {
            let Ok(class) = classes.binary_search(target) else {
                continue;
            };
            counts[class] += 1;
            for (column, value) in row.iter().enumerate() {
                let value = *value as f64;
                sums[class][column] += value;
                squares[class][column] += value * value;
            }
        }

        // Variance floor relative to the widest feature
        let mut widest = 0.0f64;
        for column in 0..columns {
            let values = features.column(column);
            let n = values.len().max(1) as f64;
            let mean = values.iter().map(|v| *v as f64).sum::<f64>() / n;
            let var = values.iter().map(|v| (*v as f64 - mean).powi(2)).sum::<f64>() / n;
            widest = widest.max(var);
        }
        let epsilon = (self.var_smoothing * widest).max(f64::MIN_POSITIVE);

        let total = targets.len().max(1) as f64;
        self.priors = counts.iter().map(|c| *c as f64 / total).collect();
        self.means = Vec::with_capacity(classes.len());
        self.variances = Vec::with_capacity(classes.len());
        for class in 0..classes.len() {
            let n = counts[class].max(1) as f64;
            let means: Vec<f64> = sums[class].iter().map(|s| s / n).collect();
            let variances = squares[class]
                .iter()
                .zip(&means)
                .map(|(sq, mean)| (sq / n - mean * mean).max(0.0) + epsilon)
                .collect();
            self.means.push(means);
            self.variances.push(variances);
        }
        self.classes = classes;
        Ok(())
    }

    fn predict_proba(&self, features: ArrayView2<'_, f32>) -> Result<Array2<f32>> {
        if !self.is_fitted() {
            return Err(LogisError::configuration("classifier has not been fitted"));
        }
        self.check_columns(&features)?;

        let mut out = Array2::<f32>::zeros((features.nrows(), self.classes.len()));
        let mut log_likelihood = vec![0.0f64; self.classes.len()];
        for (row, mut probabilities) in features.outer_iter().zip(out.outer_iter_mut()) {
            for (class, score) in log_likelihood.iter_mut().enumerate() {
                let mut acc = self.priors[class].ln();
                for ((value, mean), var) in row
                    .iter()
                    .zip(&self.means[class])
                    .zip(&self.variances[class])
                {
                    let diff = *value as f64 - mean;
                    acc -= 0.5 * ((2.0 * std::f64::consts::PI * var).ln() + diff * diff / var);
                }
                *score = acc;
            }
            let max = log_likelihood
                .iter()
                .copied()
                .fold(f64::NEG_INFINITY, f64::max);
            let norm: f64 = log_likelihood.iter().map(|s| (s - max).exp()).sum();
            for (p, score) in probabilities.iter_mut().zip(&log_likelihood) {
                *p = ((score - max).exp() / norm) as f32;
            }
        }
        Ok(out)
    }

    fn classes(&self) -> &[i64] {
        &self.classes
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GaussianNbFactory;

impl ModelFactory for GaussianNbFactory {
    type Model = GaussianNb;

    fn create(&self, _n_jobs: usize) -> GaussianNb {
        GaussianNb::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_separates_two_clusters() {
        let features = array![[0.0f32, 0.1], [0.2, 0.0], [0.1, 0.2], [5.0, 5.1], [5.2, 4.9], [4.8, 5.0]];
        let targets = [0, 0, 0, 1, 1, 1];
        let mut model = GaussianNb::new();
        model.fit(features.view(), &targets).unwrap();
        assert_eq!(model.classes(), &[0i64, 1]);

        let query = array![[0.1f32, 0.1], [5.0, 5.0]];
        let proba = model.predict_proba(query.view()).unwrap();
        assert!(proba[[0, 0]] > 0.99);
        assert!(proba[[1, 1]] > 0.99);
        let edge = model.class_probability(query.view(), 1).unwrap();
        assert!(edge[0] < 0.01 && edge[1] > 0.99);
        assert_eq!(model.class_probability(query.view(), 7).unwrap(), vec![0.0f32, 0.0]);
    }

    #[test]
    fn test_rows_sum_to_one() {
        let features = array![[1.0f32], [2.0], [3.0], [4.0]];
        let mut model = GaussianNb::new();
        model.fit(features.view(), &[0, 1, 0, 1]).unwrap();
        let proba = model.predict_proba(features.view()).unwrap();
        for row in proba.outer_iter() {
            assert!((row.sum() - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_predict_checks_columns() {
        let mut model = GaussianNb::new();
        assert!(model.predict_proba(array![[1.0f32]].view()).is_err());
        model.fit(array![[1.0f32, 2.0], [2.0, 1.0]].view(), &[0, 1]).unwrap();
        let err = model.predict_proba(array![[1.0f32]].view()).unwrap_err();
        assert_eq!(err.category(), "data_alignment");
    }
}
