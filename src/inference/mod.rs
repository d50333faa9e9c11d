//! Pre-trained model scoring.
//!
//! A [`Predictor`] is one fitted model with its preprocessing:
//! - optional append of the flow block to the feature vector
//! - optional standardization
//! - optional projection
//! - the outlier model itself
//!
//! An [`Ensemble`] runs several predictors on the same window and combines
//! their votes.

pub mod models;
pub mod scaler;

use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::time::Instant;

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::error::{IdsError, Result};
use crate::metrics;

pub use models::{EllipticEnvelope, LocalOutlierFactor, ModelParams, OneClassSvm, OutlierModel};
pub use scaler::{Projection, ProjectionParams, ScalerParams, StandardScaler};

/// Model verdict for one window or packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Normal,
    Abnormal,
}

impl Verdict {
    /// From an outlier label (-1 = anomaly)
    pub fn from_label(label: i32) -> Self {
        if label == -1 {
            Verdict::Abnormal
        } else {
            Verdict::Normal
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Normal => "normal",
            Verdict::Abnormal => "abnormal",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// On-disk model bundle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub name: String,
    #[serde(default)]
    pub uses_flows: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scaler: Option<ScalerParams>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub projection: Option<ProjectionParams>,
    #[serde(flatten)]
    pub model: ModelParams,
}

/// A fitted model plus everything needed to feed it
pub struct Predictor {
    name: String,
    uses_flows: bool,
    scaler: Option<StandardScaler>,
    projection: Option<Projection>,
    model: Box<dyn OutlierModel>,
}

impl fmt::Debug for Predictor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Predictor")
            .field("name", &self.name)
            .field("algorithm", &self.model.algorithm())
            .field("uses_flows", &self.uses_flows)
            .field("scaled", &self.scaler.is_some())
            .field("projected", &self.projection.is_some())
            .finish()
    }
}

impl Predictor {
    pub fn new(name: impl Into<String>, model: Box<dyn OutlierModel>) -> Self {
        Self {
            name: name.into(),
            uses_flows: false,
            scaler: None,
            projection: None,
            model,
        }
    }

    pub fn with_flows(mut self, uses_flows: bool) -> Self {
        self.uses_flows = uses_flows;
        self
    }

    pub fn with_scaler(mut self, scaler: StandardScaler) -> Self {
        self.scaler = Some(scaler);
        self
    }

    pub fn with_projection(mut self, projection: Projection) -> Self {
        self.projection = Some(projection);
        self
    }

    /// Build from a parsed artifact, checking that stage widths chain up
    pub fn from_artifact(artifact: &ModelArtifact) -> Result<Self> {
        let mut predictor = Self::new(&artifact.name, artifact.model.build()?)
            .with_flows(artifact.uses_flows);

        if let Some(params) = &artifact.scaler {
            predictor = predictor.with_scaler(StandardScaler::from_params(params)?);
        }
        if let Some(params) = &artifact.projection {
            predictor = predictor.with_projection(Projection::from_params(params)?);
        }

        predictor.check_stages()?;
        Ok(predictor)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let reader = BufReader::new(File::open(path)?);
        let artifact: ModelArtifact = serde_json::from_reader(reader)?;
        let predictor = Self::from_artifact(&artifact)?;

        tracing::info!(
            path = %path.display(),
            name = %predictor.name,
            algorithm = predictor.model.algorithm(),
            uses_flows = predictor.uses_flows,
            input = predictor.input_width(),
            "Model loaded"
        );
        Ok(predictor)
    }

    fn check_stages(&self) -> Result<()> {
        let mut width = self.input_width();
        if let Some(projection) = &self.projection {
            if projection.n_features() != width {
                return Err(self.invalid(format!(
                    "projection expects {} features, preceding stage yields {}",
                    projection.n_features(),
                    width
                )));
            }
            width = projection.n_components();
        }
        if self.model.n_features() != width {
            return Err(self.invalid(format!(
                "model expects {} features, preceding stage yields {}",
                self.model.n_features(),
                width
            )));
        }
        Ok(())
    }

    fn invalid(&self, reason: String) -> IdsError {
        IdsError::InvalidArtifact {
            name: self.name.clone(),
            reason,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn uses_flows(&self) -> bool {
        self.uses_flows
    }

    /// Width of the raw row this predictor accepts
    pub fn input_width(&self) -> usize {
        match (&self.scaler, &self.projection) {
            (Some(scaler), _) => scaler.n_features(),
            (None, Some(projection)) => projection.n_features(),
            (None, None) => self.model.n_features(),
        }
    }

    /// Score one window vector (flows appended when the model uses them)
    pub fn predict(&self, features: &[f64], flows: &[f64]) -> Result<Verdict> {
        let mut row = features.to_vec();
        if self.uses_flows {
            row.extend_from_slice(flows);
        }
        let width = row.len();
        let x = Array2::from_shape_vec((1, width), row).map_err(|e| self.invalid(e.to_string()))?;

        let verdicts = self.predict_rows(&x)?;
        Ok(verdicts.first().copied().unwrap_or(Verdict::Normal))
    }

    /// Score many rows in one call
    pub fn predict_rows(&self, x: &Array2<f64>) -> Result<Vec<Verdict>> {
        let start = Instant::now();

        let scaled;
        let mut input = x;
        if let Some(scaler) = &self.scaler {
            scaled = scaler.transform(input)?;
            input = &scaled;
        }
        let projected;
        if let Some(projection) = &self.projection {
            projected = projection.transform(input)?;
            input = &projected;
        }
        let labels = self.model.predict(input)?;

        metrics::INFERENCE_LATENCY
            .with_label_values(&[&self.name])
            .observe(start.elapsed().as_secs_f64());

        Ok(labels.iter().map(|l| Verdict::from_label(*l)).collect())
    }
}

/// Combined result of every predictor for one window
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnsembleVerdict {
    pub verdict: Verdict,
    /// Names of predictors that voted abnormal
    pub abnormal: Vec<String>,
    pub voters: usize,
}

/// Predictors voted by strict majority
#[derive(Debug, Default)]
pub struct Ensemble {
    predictors: Vec<Predictor>,
}

impl Ensemble {
    pub fn new(predictors: Vec<Predictor>) -> Self {
        Self { predictors }
    }

    pub fn load<P: AsRef<Path>>(paths: &[P]) -> Result<Self> {
        let predictors = paths
            .iter()
            .map(Predictor::load)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(predictors))
    }

    pub fn len(&self) -> usize {
        self.predictors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.predictors.is_empty()
    }

    pub fn predictors(&self) -> &[Predictor] {
        &self.predictors
    }

    /// Abnormal only when more than half the predictors say so.
    ///
    /// Any predictor failure fails the whole vote.
    pub fn vote(&self, features: &[f64], flows: &[f64]) -> Result<EnsembleVerdict> {
        let mut abnormal = Vec::new();
        for predictor in &self.predictors {
            if predictor.predict(features, flows)? == Verdict::Abnormal {
                abnormal.push(predictor.name().to_string());
            }
        }

        let voters = self.predictors.len();
        let verdict = if abnormal.len() > voters / 2 {
            Verdict::Abnormal
        } else {
            Verdict::Normal
        };

        Ok(EnsembleVerdict {
            verdict,
            abnormal,
            voters,
        })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use ndarray::Array1;

    /// Model that returns a fixed label for every row
    pub struct FixedModel {
        pub label: i32,
        pub width: usize,
    }

    impl OutlierModel for FixedModel {
        fn algorithm(&self) -> &'static str {
            "fixed"
        }

        fn n_features(&self) -> usize {
            self.width
        }

        fn decision_function(&self, x: &Array2<f64>) -> Result<Array1<f64>> {
            scaler::check_width("fixed", self.width, x.ncols())?;
            Ok(Array1::from_elem(x.nrows(), self.label as f64))
        }
    }

    /// Flags rows whose first column falls below `floor`
    pub struct ThresholdModel {
        pub floor: f64,
        pub width: usize,
    }

    impl OutlierModel for ThresholdModel {
        fn algorithm(&self) -> &'static str {
            "threshold"
        }

        fn n_features(&self) -> usize {
            self.width
        }

        fn decision_function(&self, x: &Array2<f64>) -> Result<Array1<f64>> {
            scaler::check_width("threshold", self.width, x.ncols())?;
            Ok(x.column(0).mapv(|v| v - self.floor))
        }
    }

    pub fn fixed(name: &str, abnormal: bool, width: usize) -> Predictor {
        let label = if abnormal { -1 } else { 1 };
        Predictor::new(name, Box::new(FixedModel { label, width }))
    }
}

#[cfg(test)]
mod tests {
    use super::testing::fixed;
    use super::*;

    fn ensemble(votes: &[bool]) -> Ensemble {
        Ensemble::new(
            votes
                .iter()
                .enumerate()
                .map(|(i, abnormal)| fixed(&format!("model-{i}"), *abnormal, 2))
                .collect(),
        )
    }

    #[test]
    fn test_majority_two_of_three() {
        let result = ensemble(&[true, true, false]).vote(&[1.0, 2.0], &[]).unwrap();
        assert_eq!(result.verdict, Verdict::Abnormal);
        assert_eq!(result.abnormal, vec!["model-0", "model-1"]);
    }

    #[test]
    fn test_majority_one_of_three() {
        let result = ensemble(&[false, true, false]).vote(&[1.0, 2.0], &[]).unwrap();
        assert_eq!(result.verdict, Verdict::Normal);
        assert_eq!(result.abnormal, vec!["model-1"]);
    }

    #[test]
    fn test_exact_half_is_normal() {
        let result = ensemble(&[true, true, false, false]).vote(&[1.0, 2.0], &[]).unwrap();
        assert_eq!(result.verdict, Verdict::Normal);
        assert_eq!(result.voters, 4);
    }

    #[test]
    fn test_flows_appended_only_when_used() {
        let with_flows = fixed("flows", false, 4).with_flows(true);
        assert!(with_flows.predict(&[1.0, 2.0], &[3.0, 4.0]).is_ok());

        let without = fixed("plain", false, 2);
        assert!(without.predict(&[1.0, 2.0], &[3.0, 4.0]).is_ok());
        assert!(matches!(
            without.predict(&[1.0, 2.0, 3.0], &[]),
            Err(IdsError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_failure_fails_vote() {
        let ensemble = Ensemble::new(vec![fixed("a", true, 2), fixed("b", true, 3)]);
        assert!(ensemble.vote(&[1.0, 2.0], &[]).is_err());
    }

    #[test]
    fn test_artifact_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");

        let artifact = ModelArtifact {
            name: "cov".to_string(),
            uses_flows: true,
            scaler: Some(ScalerParams {
                mean: vec![0.0; 3],
                scale: vec![1.0; 3],
            }),
            projection: Some(ProjectionParams {
                mean: vec![0.0; 3],
                components: vec![vec![1.0, 0.0, 0.0], vec![0.0, 1.0, 1.0]],
                explained_variance: None,
                whiten: false,
            }),
            model: ModelParams::EllipticEnvelope {
                location: vec![0.0, 0.0],
                precision: vec![vec![1.0, 0.0], vec![0.0, 1.0]],
                offset: -4.0,
            },
        };
        std::fs::write(&path, serde_json::to_string(&artifact).unwrap()).unwrap();

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["algorithm"], "elliptic_envelope");

        let predictor = Predictor::load(&path).unwrap();
        assert_eq!(predictor.input_width(), 3);
        assert_eq!(predictor.predict(&[1.0, 1.0], &[0.0]).unwrap(), Verdict::Normal);
        assert_eq!(predictor.predict(&[1.0], &[5.0, 5.0]).unwrap(), Verdict::Abnormal);
    }

    #[test]
    fn test_artifact_stage_mismatch() {
        let artifact = ModelArtifact {
            name: "broken".to_string(),
            uses_flows: false,
            scaler: Some(ScalerParams {
                mean: vec![0.0; 4],
                scale: vec![1.0; 4],
            }),
            projection: None,
            model: ModelParams::EllipticEnvelope {
                location: vec![0.0, 0.0],
                precision: vec![vec![1.0, 0.0], vec![0.0, 1.0]],
                offset: 0.0,
            },
        };
        assert!(matches!(
            Predictor::from_artifact(&artifact),
            Err(IdsError::InvalidArtifact { .. })
        ));
    }
}
