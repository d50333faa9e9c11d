//! Fitted outlier models.
//!
//! Each model turns preprocessed rows into a decision value; the sign gives
//! the label (`1` normal, `-1` anomaly).

use ndarray::{Array1, Array2, ArrayView1, Axis};
use serde::{Deserialize, Serialize};

use super::scaler::{check_width, to_matrix};
use crate::error::{IdsError, Result};

/// Guards the local reachability density against zero distances
const LRD_EPSILON: f64 = 1e-10;

/// A fitted novelty detector
pub trait OutlierModel: Send + Sync {
    /// Algorithm name for logs and metrics
    fn algorithm(&self) -> &'static str;

    /// Width of the rows the model was fit on
    fn n_features(&self) -> usize;

    /// Signed decision value per row: negative means anomaly
    fn decision_function(&self, x: &Array2<f64>) -> Result<Array1<f64>>;

    /// Labels per row (-1 = anomaly, 1 = normal)
    fn predict(&self, x: &Array2<f64>) -> Result<Array1<i32>> {
        Ok(self
            .decision_function(x)?
            .mapv(|d| if d < 0.0 { -1 } else { 1 }))
    }
}

/// Serialized model parameters, tagged by `algorithm`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "algorithm", rename_all = "snake_case")]
pub enum ModelParams {
    LocalOutlierFactor {
        n_neighbors: usize,
        /// Rows the model was fit on (after preprocessing)
        training: Vec<Vec<f64>>,
        offset: f64,
    },
    OneClassSvm {
        support_vectors: Vec<Vec<f64>>,
        dual_coef: Vec<f64>,
        intercept: f64,
        gamma: f64,
    },
    EllipticEnvelope {
        location: Vec<f64>,
        precision: Vec<Vec<f64>>,
        offset: f64,
    },
}

impl ModelParams {
    /// Build the model described by these parameters
    pub fn build(&self) -> Result<Box<dyn OutlierModel>> {
        let model: Box<dyn OutlierModel> = match self {
            ModelParams::LocalOutlierFactor {
                n_neighbors,
                training,
                offset,
            } => Box::new(LocalOutlierFactor::fit(training, *n_neighbors, *offset)?),
            ModelParams::OneClassSvm {
                support_vectors,
                dual_coef,
                intercept,
                gamma,
            } => Box::new(OneClassSvm::new(support_vectors, dual_coef, *intercept, *gamma)?),
            ModelParams::EllipticEnvelope {
                location,
                precision,
                offset,
            } => Box::new(EllipticEnvelope::new(location, precision, *offset)?),
        };
        Ok(model)
    }
}

fn squared_distance(a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y).powi(2)).sum()
}

/// Local Outlier Factor in novelty mode
#[derive(Debug, Clone)]
pub struct LocalOutlierFactor {
    training: Array2<f64>,
    k: usize,
    k_distances: Array1<f64>,
    lrd: Array1<f64>,
    offset: f64,
}

impl LocalOutlierFactor {
    /// Precompute k-distances and local reachability densities
    pub fn fit(training: &[Vec<f64>], n_neighbors: usize, offset: f64) -> Result<Self> {
        if training.len() < 2 || n_neighbors == 0 {
            return Err(IdsError::InvalidArtifact {
                name: "local_outlier_factor".to_string(),
                reason: format!(
                    "need at least 2 rows and 1 neighbor, got {} rows and {} neighbors",
                    training.len(),
                    n_neighbors
                ),
            });
        }

        let width = training[0].len();
        let training = to_matrix("local_outlier_factor training", training, width)?;
        let k = n_neighbors.min(training.nrows() - 1);

        // Neighbors of each training row, excluding itself
        let neighbors: Vec<Vec<(usize, f64)>> = (0..training.nrows())
            .map(|i| {
                let mut dists: Vec<(usize, f64)> = (0..training.nrows())
                    .filter(|&j| j != i)
                    .map(|j| (j, squared_distance(training.row(i), training.row(j)).sqrt()))
                    .collect();
                dists.sort_by(|a, b| a.1.total_cmp(&b.1));
                dists.truncate(k);
                dists
            })
            .collect();

        let k_distances: Array1<f64> = neighbors.iter().map(|n| n[k - 1].1).collect();
        let lrd: Array1<f64> = neighbors
            .iter()
            .map(|n| reach_density(n, &k_distances))
            .collect();

        Ok(Self {
            training,
            k,
            k_distances,
            lrd,
            offset,
        })
    }

    fn nearest(&self, x: ArrayView1<f64>) -> Vec<(usize, f64)> {
        let mut dists: Vec<(usize, f64)> = self
            .training
            .outer_iter()
            .enumerate()
            .map(|(j, row)| (j, squared_distance(x, row).sqrt()))
            .collect();
        dists.sort_by(|a, b| a.1.total_cmp(&b.1));
        dists.truncate(self.k);
        dists
    }

    /// Negative local outlier factor (higher is more normal)
    pub fn score_samples(&self, x: &Array2<f64>) -> Result<Array1<f64>> {
        check_width("local_outlier_factor", self.n_features(), x.ncols())?;

        Ok(x.outer_iter()
            .map(|row| {
                let neighbors = self.nearest(row);
                let lrd = reach_density(&neighbors, &self.k_distances);
                let ratio: f64 = neighbors.iter().map(|(j, _)| self.lrd[*j] / lrd).sum();
                -ratio / neighbors.len() as f64
            })
            .collect())
    }
}

fn reach_density(neighbors: &[(usize, f64)], k_distances: &Array1<f64>) -> f64 {
    let reach: f64 = neighbors
        .iter()
        .map(|(j, d)| d.max(k_distances[*j]))
        .sum();
    1.0 / (reach / neighbors.len() as f64 + LRD_EPSILON)
}

impl OutlierModel for LocalOutlierFactor {
    fn algorithm(&self) -> &'static str {
        "local_outlier_factor"
    }

    fn n_features(&self) -> usize {
        self.training.ncols()
    }

    fn decision_function(&self, x: &Array2<f64>) -> Result<Array1<f64>> {
        Ok(self.score_samples(x)? - self.offset)
    }
}

/// One-class SVM with an RBF kernel
#[derive(Debug, Clone)]
pub struct OneClassSvm {
    support_vectors: Array2<f64>,
    dual_coef: Array1<f64>,
    intercept: f64,
    gamma: f64,
}

impl OneClassSvm {
    pub fn new(
        support_vectors: &[Vec<f64>],
        dual_coef: &[f64],
        intercept: f64,
        gamma: f64,
    ) -> Result<Self> {
        let width = support_vectors.first().map(Vec::len).unwrap_or(0);
        let support_vectors = to_matrix("one_class_svm support vectors", support_vectors, width)?;
        check_width(
            "one_class_svm dual coefficients",
            support_vectors.nrows(),
            dual_coef.len(),
        )?;

        Ok(Self {
            support_vectors,
            dual_coef: Array1::from(dual_coef.to_vec()),
            intercept,
            gamma,
        })
    }
}

impl OutlierModel for OneClassSvm {
    fn algorithm(&self) -> &'static str {
        "one_class_svm"
    }

    fn n_features(&self) -> usize {
        self.support_vectors.ncols()
    }

    fn decision_function(&self, x: &Array2<f64>) -> Result<Array1<f64>> {
        check_width("one_class_svm", self.n_features(), x.ncols())?;

        Ok(x.outer_iter()
            .map(|row| {
                let kernel: f64 = self
                    .support_vectors
                    .outer_iter()
                    .zip(self.dual_coef.iter())
                    .map(|(sv, coef)| coef * (-self.gamma * squared_distance(row, sv)).exp())
                    .sum();
                kernel + self.intercept
            })
            .collect())
    }

    /// Points on the boundary count as anomalies
    fn predict(&self, x: &Array2<f64>) -> Result<Array1<i32>> {
        Ok(self
            .decision_function(x)?
            .mapv(|d| if d > 0.0 { 1 } else { -1 }))
    }
}

/// Robust-covariance envelope: Mahalanobis distance to a fitted center
#[derive(Debug, Clone)]
pub struct EllipticEnvelope {
    location: Array1<f64>,
    precision: Array2<f64>,
    offset: f64,
}

impl EllipticEnvelope {
    pub fn new(location: &[f64], precision: &[Vec<f64>], offset: f64) -> Result<Self> {
        let precision = to_matrix("elliptic_envelope precision", precision, location.len())?;
        check_width(
            "elliptic_envelope precision rows",
            location.len(),
            precision.nrows(),
        )?;

        Ok(Self {
            location: Array1::from(location.to_vec()),
            precision,
            offset,
        })
    }

    /// Squared Mahalanobis distance per row
    pub fn mahalanobis(&self, x: &Array2<f64>) -> Result<Array1<f64>> {
        check_width("elliptic_envelope", self.n_features(), x.ncols())?;

        let centered = x - &self.location;
        let weighted = centered.dot(&self.precision);
        Ok((&weighted * &centered).sum_axis(Axis(1)))
    }
}

impl OutlierModel for EllipticEnvelope {
    fn algorithm(&self) -> &'static str {
        "elliptic_envelope"
    }

    fn n_features(&self) -> usize {
        self.location.len()
    }

    fn decision_function(&self, x: &Array2<f64>) -> Result<Array1<f64>> {
        Ok(-self.mahalanobis(x)? - self.offset)
    }
}
