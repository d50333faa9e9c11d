//! Preprocessing applied before a model sees a vector.

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

use crate::error::{IdsError, Result};

/// Scales below this are zero-variance columns, which are only centered
const MIN_SCALE: f64 = 1e-8;

/// Serialized scaler parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalerParams {
    pub mean: Vec<f64>,
    pub scale: Vec<f64>,
}

/// Serialized linear projection (principal components)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectionParams {
    pub mean: Vec<f64>,
    /// `n_components x n_features`
    pub components: Vec<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explained_variance: Option<Vec<f64>>,
    #[serde(default)]
    pub whiten: bool,
}

/// Per-column standardization: `(x - mean) / scale`
#[derive(Debug, Clone)]
pub struct StandardScaler {
    mean: Array1<f64>,
    scale: Array1<f64>,
}

impl StandardScaler {
    pub fn from_params(params: &ScalerParams) -> Result<Self> {
        if params.mean.len() != params.scale.len() {
            return Err(IdsError::DimensionMismatch {
                context: "scaler scale".to_string(),
                expected: params.mean.len(),
                got: params.scale.len(),
            });
        }
        Ok(Self {
            mean: Array1::from(params.mean.clone()),
            scale: params
                .scale
                .iter()
                .map(|&s| if s.abs() < MIN_SCALE { 1.0 } else { s })
                .collect(),
        })
    }

    pub fn n_features(&self) -> usize {
        self.mean.len()
    }

    /// Standardize each row
    pub fn transform(&self, x: &Array2<f64>) -> Result<Array2<f64>> {
        check_width("scaler", self.n_features(), x.ncols())?;
        Ok((x - &self.mean) / &self.scale)
    }
}

/// Centered projection onto fitted components
#[derive(Debug, Clone)]
pub struct Projection {
    mean: Array1<f64>,
    components: Array2<f64>,
    whiten_scale: Option<Array1<f64>>,
}

impl Projection {
    pub fn from_params(params: &ProjectionParams) -> Result<Self> {
        let n_features = params.mean.len();
        let n_components = params.components.len();
        let components = to_matrix("projection components", &params.components, n_features)?;

        let whiten_scale = match (&params.explained_variance, params.whiten) {
            (Some(variance), true) => {
                check_width("projection variance", n_components, variance.len())?;
                Some(variance.iter().map(|v| v.sqrt()).collect())
            }
            (None, true) => {
                return Err(IdsError::InvalidArtifact {
                    name: "projection".to_string(),
                    reason: "whitening requires explained_variance".to_string(),
                })
            }
            (_, false) => None,
        };

        Ok(Self {
            mean: Array1::from(params.mean.clone()),
            components,
            whiten_scale,
        })
    }

    pub fn n_features(&self) -> usize {
        self.mean.len()
    }

    pub fn n_components(&self) -> usize {
        self.components.nrows()
    }

    /// `(x - mean) . components^T`, divided by sqrt(variance) when whitened
    pub fn transform(&self, x: &Array2<f64>) -> Result<Array2<f64>> {
        check_width("projection", self.n_features(), x.ncols())?;

        let centered = x - &self.mean;
        let mut projected = centered.dot(&self.components.t());
        if let Some(scale) = &self.whiten_scale {
            for (mut column, &s) in projected.columns_mut().into_iter().zip(scale.iter()) {
                if s > MIN_SCALE {
                    column.mapv_inplace(|v| v / s);
                }
            }
        }
        Ok(projected)
    }
}

pub(crate) fn check_width(context: &str, expected: usize, got: usize) -> Result<()> {
    if expected != got {
        return Err(IdsError::DimensionMismatch {
            context: context.to_string(),
            expected,
            got,
        });
    }
    Ok(())
}

/// Rows of equal width into a matrix
pub(crate) fn to_matrix(context: &str, rows: &[Vec<f64>], width: usize) -> Result<Array2<f64>> {
    for row in rows {
        check_width(context, width, row.len())?;
    }
    let flat: Vec<f64> = rows.iter().flatten().copied().collect();
    Array2::from_shape_vec((rows.len(), width), flat).map_err(|e| IdsError::InvalidArtifact {
        name: context.to_string(),
        reason: e.to_string(),
    })
}
