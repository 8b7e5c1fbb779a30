//! Surrogate models trained on completed runs.

use std::convert::TryFrom;
use std::path::Path;

use chrono::{DateTime, Utc};
use rayon::prelude::*;

use crate::config::{IdwConfig, SurrogateConfig};
use crate::error::{Error, Result};
use crate::util;
use crate::Float;

/// Row-major matrix, one inner vector per sample.
pub type Matrix = Vec<Vec<Float>>;

/// Predictive model of the outputs as a function of the inputs.
pub trait Surrogate: Send {
    fn label(&self) -> &'static str;

    /// Fits the model to the given samples, replacing any previous fit.
    fn train(&mut self, x: &[Vec<Float>], y: &[Vec<Float>]) -> Result<()>;

    /// Predicted mean and variance per output column for every point.
    fn predict(&self, x: &[Vec<Float>]) -> Result<(Matrix, Matrix)>;

    fn is_trained(&self) -> bool;

    fn save(&self, path: &Path) -> Result<()>;
}

pub fn from_config(config: &SurrogateConfig) -> Result<Box<dyn Surrogate>> {
    match config {
        SurrogateConfig::Idw(c) => Ok(Box::new(Idw::new(c.clone())?)),
    }
}

/// Loads a surrogate saved with [`Surrogate::save`].
///
/// [`Surrogate::save`]: trait.Surrogate.html#tymethod.save
pub fn load(path: &Path) -> Result<Box<dyn Surrogate>> {
    let bytes = std::fs::read(path)?;
    let snapshot = SurrogateSnapshot::try_from(&bytes)?;
    info!(
        "loaded {} surrogate created {}",
        snapshot.model.label(),
        snapshot.metadata.created
    );
    match snapshot.model {
        SnapshotModel::Idw(idw) => Ok(Box::new(idw)),
    }
}

/// Serialized surrogate together with its metadata.
#[derive(Serialize, Deserialize)]
pub struct SurrogateSnapshot {
    pub metadata: SnapshotMetadata,
    pub model: SnapshotModel,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub created: DateTime<Utc>,
}

#[derive(Serialize, Deserialize)]
pub enum SnapshotModel {
    Idw(Idw),
}

impl SnapshotModel {
    fn label(&self) -> &'static str {
        match self {
            SnapshotModel::Idw(_) => "idw",
        }
    }
}

impl TryFrom<&Vec<u8>> for SurrogateSnapshot {
    type Error = Error;
    fn try_from(bytes: &Vec<u8>) -> Result<Self> {
        let snapshot: SurrogateSnapshot = bincode::deserialize(bytes)?;
        Ok(snapshot)
    }
}

impl SurrogateSnapshot {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }
}

/// Inverse distance weighting interpolator.
///
/// Inputs are scaled to the unit cube spanned by the training points. The
/// mean at a point is the average of the training outputs weighted by
/// `1 / d^power`, exact at the training points. The variance grows from
/// zero at the nearest training point to the output variance as
/// `1 - exp(-(d / length_scale)^2)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Idw {
    config: IdwConfig,
    x: Matrix,
    y: Matrix,
    lower: Vec<Float>,
    span: Vec<Float>,
    variance: Vec<Float>,
}

impl Idw {
    pub fn new(config: IdwConfig) -> Result<Self> {
        if config.power <= 0. || config.length_scale <= 0. {
            return Err(Error::InvalidConfiguration(
                "idw power and length_scale must be positive".to_string(),
            ));
        }
        Ok(Idw {
            config,
            x: Vec::new(),
            y: Vec::new(),
            lower: Vec::new(),
            span: Vec::new(),
            variance: Vec::new(),
        })
    }

    fn scale(&self, point: &[Float]) -> Vec<Float> {
        point
            .iter()
            .zip(self.lower.iter().zip(&self.span))
            .map(|(v, (lower, span))| (v - lower) / span)
            .collect()
    }

    fn predict_point(&self, point: &[Float]) -> (Vec<Float>, Vec<Float>) {
        let point = self.scale(point);
        let outputs = self.variance.len();
        let mut nearest = Float::INFINITY;
        let mut weights = Vec::with_capacity(self.x.len());
        for x in &self.x {
            let d = util::distance(&self.scale(x), &point);
            nearest = nearest.min(d);
            weights.push(d);
        }
        if nearest < 1e-12 {
            let mut mean = vec![0.; outputs];
            let mut count = 0.;
            for (y, d) in self.y.iter().zip(&weights) {
                if *d < 1e-12 {
                    for (m, v) in mean.iter_mut().zip(y) {
                        *m += v;
                    }
                    count += 1.;
                }
            }
            return (mean.iter().map(|m| m / count).collect(), vec![0.; outputs]);
        }
        let mut mean = vec![0.; outputs];
        let mut total = 0.;
        for (y, d) in self.y.iter().zip(&weights) {
            let w = d.powf(-self.config.power);
            total += w;
            for (m, v) in mean.iter_mut().zip(y) {
                *m += w * v;
            }
        }
        let growth = 1. - (-(nearest / self.config.length_scale).powi(2)).exp();
        (
            mean.iter().map(|m| m / total).collect(),
            self.variance.iter().map(|v| v * growth).collect(),
        )
    }
}

impl Surrogate for Idw {
    fn label(&self) -> &'static str {
        "idw"
    }

    fn train(&mut self, x: &[Vec<Float>], y: &[Vec<Float>]) -> Result<()> {
        if x.is_empty() || x.len() != y.len() {
            return Err(Error::Surrogate(format!(
                "need matching non-empty samples, got {} inputs and {} outputs",
                x.len(),
                y.len()
            )));
        }
        let dims = x[0].len();
        let outputs = y[0].len();
        if x.iter().any(|r| r.len() != dims) || y.iter().any(|r| r.len() != outputs) {
            return Err(Error::Surrogate("ragged training data".to_string()));
        }
        let mut lower = vec![Float::INFINITY; dims];
        let mut upper = vec![Float::NEG_INFINITY; dims];
        for row in x {
            for (n, v) in row.iter().enumerate() {
                lower[n] = lower[n].min(*v);
                upper[n] = upper[n].max(*v);
            }
        }
        let span = lower
            .iter()
            .zip(&upper)
            .map(|(l, u)| if u - l > 0. { u - l } else { 1. })
            .collect();

        let n = y.len() as Float;
        let variance = (0..outputs)
            .map(|col| {
                let mean = y.iter().map(|r| r[col]).sum::<Float>() / n;
                let var = y.iter().map(|r| (r[col] - mean).powi(2)).sum::<Float>() / n;
                // unit prior when the outputs carry no spread yet
                if var > 0. {
                    var
                } else {
                    1.
                }
            })
            .collect();

        self.x = x.to_vec();
        self.y = y.to_vec();
        self.lower = lower;
        self.span = span;
        self.variance = variance;
        debug!("trained idw surrogate on {} samples", self.x.len());
        Ok(())
    }

    fn predict(&self, x: &[Vec<Float>]) -> Result<(Matrix, Matrix)> {
        if !self.is_trained() {
            return Err(Error::Surrogate("surrogate is not trained".to_string()));
        }
        if let Some(row) = x.iter().find(|r| r.len() != self.lower.len()) {
            return Err(Error::Surrogate(format!(
                "expected {} input dimensions, got {}",
                self.lower.len(),
                row.len()
            )));
        }
        let predictions: Vec<(Vec<Float>, Vec<Float>)> =
            x.par_iter().map(|p| self.predict_point(p)).collect();
        Ok(predictions.into_iter().unzip())
    }

    fn is_trained(&self) -> bool {
        !self.x.is_empty()
    }

    fn save(&self, path: &Path) -> Result<()> {
        let snapshot = SurrogateSnapshot {
            metadata: SnapshotMetadata {
                created: Utc::now(),
            },
            model: SnapshotModel::Idw(self.clone()),
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, snapshot.to_bytes()?)?;
        info!("saved surrogate to {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trained() -> Idw {
        let mut idw = Idw::new(IdwConfig::default()).unwrap();
        let x = vec![vec![0.], vec![0.5], vec![1.]];
        let y = vec![vec![0.], vec![1.], vec![4.]];
        idw.train(&x, &y).unwrap();
        idw
    }

    #[test]
    fn exact_at_training_points() {
        let idw = trained();
        let (mean, var) = idw.predict(&[vec![0.5], vec![1.]]).unwrap();
        assert_eq!(mean, vec![vec![1.], vec![4.]]);
        assert_eq!(var, vec![vec![0.], vec![0.]]);
    }

    #[test]
    fn variance_grows_with_distance() {
        let idw = trained();
        let (mean, var) = idw.predict(&[vec![0.55], vec![0.75], vec![3.]]).unwrap();
        assert!(mean[0][0] > 0. && mean[0][0] < 4.);
        assert!(var[0][0] < var[1][0]);
        assert!(var[1][0] < var[2][0]);
        let total = 26. / 9.;
        assert!((var[2][0] - total).abs() < 1e-6);
    }

    #[test]
    fn untrained_and_mismatched_inputs_fail() {
        let idw = Idw::new(IdwConfig::default()).unwrap();
        assert!(idw.predict(&[vec![0.]]).is_err());
        assert!(trained().predict(&[vec![0., 1.]]).is_err());
    }

    #[test]
    fn saved_snapshot_loads_again() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.bin");
        let idw = trained();
        idw.save(&path).unwrap();
        let loaded = load(&path).unwrap();
        assert!(loaded.is_trained());
        assert_eq!(
            loaded.predict(&[vec![0.3]]).unwrap(),
            idw.predict(&[vec![0.3]]).unwrap()
        );
    }
}
