//! Baseline artifact: the vocabulary and training matrices from a clean
//! capture.

use std::fmt;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use ndarray::{Array2, Axis};
use serde::{Deserialize, Serialize};

use super::{feature_names, featurize, featurize_flows, flow_feature_names, KnownVocabulary};
use crate::bucket::Bucket;
use crate::config::HostInventory;
use crate::error::{IdsError, Result};

/// Deviation threshold in standard deviations
const DRIFT_SIGMAS: f64 = 2.0;

/// Absolute deviation threshold for zero-variance features
const DRIFT_FLAT: f64 = 1.0;

/// Everything the live engines need from training time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Baseline {
    pub interval: f64,
    pub known: KnownVocabulary,
    pub feature_names: Vec<String>,
    pub feature_matrix: Vec<Vec<f64>>,
    pub flow_feature_names: Vec<String>,
    pub flow_feature_matrix: Vec<Vec<f64>>,
}

impl Baseline {
    /// Derive the vocabulary from `buckets` and featurize each of them
    pub fn build(buckets: &[Bucket], interval: f64, inventory: &HostInventory) -> Result<Self> {
        let known = KnownVocabulary::from_baseline(buckets, inventory)?;

        let mut feature_matrix = Vec::with_capacity(buckets.len());
        let mut flow_feature_matrix = Vec::with_capacity(buckets.len());
        for bucket in buckets {
            feature_matrix.push(featurize(&known, bucket)?.values);
            flow_feature_matrix.push(featurize_flows(&known, bucket));
        }

        Ok(Self {
            interval,
            feature_names: feature_names(&known)?,
            flow_feature_names: flow_feature_names(),
            known,
            feature_matrix,
            flow_feature_matrix,
        })
    }

    /// Load and check that the stored layout matches the vocabulary
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let reader = BufReader::new(File::open(path)?);
        let baseline: Self = serde_json::from_reader(reader)?;
        baseline.validate()?;

        tracing::info!(
            path = %path.display(),
            interval = baseline.interval,
            features = baseline.feature_names.len(),
            rows = baseline.feature_matrix.len(),
            "Baseline loaded"
        );
        Ok(baseline)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer(writer, self)?;
        Ok(())
    }

    /// Stored names must equal the names recomputed from `known`, and every
    /// matrix row must match its name list.
    pub fn validate(&self) -> Result<()> {
        if !(self.interval > 0.0) {
            return Err(IdsError::InvalidArtifact {
                name: "baseline".to_string(),
                reason: format!("interval must be positive, got {}", self.interval),
            });
        }

        compare_layout(&self.feature_names, &feature_names(&self.known)?)?;
        compare_layout(&self.flow_feature_names, &flow_feature_names())?;

        check_rows("feature matrix", &self.feature_matrix, self.feature_names.len())?;
        check_rows(
            "flow feature matrix",
            &self.flow_feature_matrix,
            self.flow_feature_names.len(),
        )?;
        if self.feature_matrix.len() != self.flow_feature_matrix.len() {
            return Err(IdsError::DimensionMismatch {
                context: "baseline flow rows".to_string(),
                expected: self.feature_matrix.len(),
                got: self.flow_feature_matrix.len(),
            });
        }
        Ok(())
    }

    /// Column mean and population standard deviation over the feature and
    /// flow matrices side by side
    pub fn feature_stats(&self) -> Result<FeatureStats> {
        let rows = self.feature_matrix.len();
        if rows == 0 {
            return Err(IdsError::EmptyInput("baseline has no rows".to_string()));
        }

        let names: Vec<String> = self
            .feature_names
            .iter()
            .chain(&self.flow_feature_names)
            .cloned()
            .collect();
        let cols = names.len();

        let flat: Vec<f64> = self
            .feature_matrix
            .iter()
            .zip(&self.flow_feature_matrix)
            .flat_map(|(f, w)| f.iter().chain(w.iter()).copied())
            .collect();
        let matrix = Array2::from_shape_vec((rows, cols), flat).map_err(|e| {
            IdsError::InvalidArtifact {
                name: "baseline".to_string(),
                reason: e.to_string(),
            }
        })?;

        let mean = matrix
            .mean_axis(Axis(0))
            .ok_or_else(|| IdsError::EmptyInput("baseline has no rows".to_string()))?;
        let std = matrix.std_axis(Axis(0), 0.0);

        Ok(FeatureStats {
            names,
            mean: mean.to_vec(),
            std: std.to_vec(),
        })
    }
}

fn compare_layout(stored: &[String], computed: &[String]) -> Result<()> {
    let len = stored.len().max(computed.len());
    for position in 0..len {
        let s = stored.get(position);
        let c = computed.get(position);
        if s != c {
            return Err(IdsError::LayoutMismatch {
                position,
                stored: s.cloned(),
                computed: c.cloned(),
            });
        }
    }
    Ok(())
}

fn check_rows(context: &str, matrix: &[Vec<f64>], width: usize) -> Result<()> {
    match matrix.iter().find(|row| row.len() != width) {
        Some(row) => Err(IdsError::DimensionMismatch {
            context: context.to_string(),
            expected: width,
            got: row.len(),
        }),
        None => Ok(()),
    }
}

/// Per-feature training statistics used for drift reports
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureStats {
    pub names: Vec<String>,
    pub mean: Vec<f64>,
    pub std: Vec<f64>,
}

impl FeatureStats {
    /// Features of a window (features then flows) that stray from training
    pub fn deviations(&self, features: &[f64], flows: &[f64]) -> Vec<Deviation> {
        features
            .iter()
            .chain(flows)
            .zip(self.names.iter().zip(self.mean.iter().zip(&self.std)))
            .filter_map(|(&value, (name, (&mean, &std)))| {
                let delta = value - mean;
                let z = (std > 0.0).then(|| delta / std);
                let drifted = match z {
                    Some(z) => z.abs() > DRIFT_SIGMAS,
                    None => delta.abs() > DRIFT_FLAT,
                };
                drifted.then(|| Deviation {
                    name: name.clone(),
                    value,
                    mean,
                    delta,
                    z,
                })
            })
            .collect()
    }
}

/// One feature outside its training range
#[derive(Debug, Clone, PartialEq)]
pub struct Deviation {
    pub name: String,
    pub value: f64,
    pub mean: f64,
    pub delta: f64,
    /// `None` when the training column was constant
    pub z: Option<f64>,
}

impl fmt::Display for Deviation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "  {:30} - cur {:5}, avg {:5.0} ({:+.0})",
            self.name, self.value as i64, self.mean, self.delta
        )?;
        if let Some(z) = self.z {
            write!(f, " ({z:+.2} stds)")?;
        }
        Ok(())
    }
}
