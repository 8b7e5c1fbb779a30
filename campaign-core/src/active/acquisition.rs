//! Acquisition strategies scoring candidate points from surrogate
//! predictions. The candidate with the highest score is picked next.
//!
//! Improvement based strategies minimize the first output column.

use crate::config::AcquisitionConfig;
use crate::error::Result;
use crate::util::{distance, norm_cdf, norm_pdf};
use crate::Float;

/// Class names of all built-in strategies.
pub const NAMES: &[&str] = &[
    "simple_exploration",
    "exploration_with_distance_penalty",
    "weighted_exploration",
    "probability_of_improvement",
    "expected_improvement",
    "expected_improvement_2",
    "alternating_exploration",
];

/// Everything a strategy may look at when scoring candidates.
pub struct Candidates<'a> {
    /// Candidate points in the active learning dimensions.
    pub points: &'a [Vec<Float>],
    /// Predicted mean per candidate and output column.
    pub mean: &'a [Vec<Float>],
    /// Predicted variance per candidate and output column.
    pub variance: &'a [Vec<Float>],
    /// Points already sampled.
    pub sampled: &'a [Vec<Float>],
    /// Outputs of the sampled points.
    pub outputs: &'a [Vec<Float>],
    pub iteration: usize,
}

impl<'a> Candidates<'a> {
    fn best(&self) -> Float {
        self.outputs
            .iter()
            .filter_map(|y| y.first().copied())
            .filter(|y| y.is_finite())
            .fold(Float::INFINITY, Float::min)
    }

    /// Distance of a candidate to the closest sampled point, in units of
    /// the candidate domain's diagonal.
    fn nearest(&self, n: usize) -> Float {
        let diagonal = self.diagonal();
        self.sampled
            .iter()
            .map(|s| distance(s, &self.points[n]) / diagonal)
            .fold(Float::INFINITY, Float::min)
    }

    fn diagonal(&self) -> Float {
        let dims = self.points.first().map(|p| p.len()).unwrap_or(0);
        let mut sum = 0.;
        for d in 0..dims {
            let (lo, hi) = self
                .points
                .iter()
                .map(|p| p[d])
                .fold((Float::INFINITY, Float::NEG_INFINITY), |(lo, hi), v| {
                    (lo.min(v), hi.max(v))
                });
            sum += (hi - lo).powi(2);
        }
        if sum > 0. {
            sum.sqrt()
        } else {
            1.
        }
    }
}

pub trait Acquisition: Send {
    fn label(&self) -> &'static str;

    /// Scores every candidate.
    fn score(&self, candidates: &Candidates) -> Vec<Float>;
}

/// Index of the highest score, the first one on ties. NaN scores never
/// win.
pub fn select(scores: &[Float]) -> Option<usize> {
    let mut best: Option<(usize, Float)> = None;
    for (n, s) in scores.iter().enumerate() {
        if s.is_nan() {
            continue;
        }
        match best {
            Some((_, b)) if *s <= b => (),
            _ => best = Some((n, *s)),
        }
    }
    best.map(|(n, _)| n).or_else(|| if scores.is_empty() { None } else { Some(0) })
}

fn mean_variance(candidates: &Candidates) -> Vec<Float> {
    candidates
        .variance
        .iter()
        .map(|v| {
            if v.is_empty() {
                0.
            } else {
                v.iter().sum::<Float>() / v.len() as Float
            }
        })
        .collect()
}

fn first_column(rows: &[Vec<Float>]) -> Vec<Float> {
    rows.iter().map(|r| r.first().copied().unwrap_or(0.)).collect()
}

/// Rescales to `[0, 1]`, constant input maps to zeros.
fn normalize(values: &[Float]) -> Vec<Float> {
    let lo = values.iter().copied().fold(Float::INFINITY, Float::min);
    let hi = values.iter().copied().fold(Float::NEG_INFINITY, Float::max);
    if hi - lo > 0. {
        values.iter().map(|v| (v - lo) / (hi - lo)).collect()
    } else {
        vec![0.; values.len()]
    }
}

fn expected_improvement(candidates: &Candidates, xi: Float) -> Vec<Float> {
    let best = candidates.best();
    let mean = first_column(candidates.mean);
    let variance = first_column(candidates.variance);
    mean.iter()
        .zip(&variance)
        .map(|(m, v)| {
            let improvement = best - m - xi;
            let sigma = v.max(0.).sqrt();
            if sigma <= 0. {
                improvement.max(0.)
            } else {
                let z = improvement / sigma;
                improvement * norm_cdf(z) + sigma * norm_pdf(z)
            }
        })
        .collect()
}

/// Picks the point of largest predicted variance.
pub struct SimpleExploration;

impl Acquisition for SimpleExploration {
    fn label(&self) -> &'static str {
        "simple_exploration"
    }

    fn score(&self, candidates: &Candidates) -> Vec<Float> {
        mean_variance(candidates)
    }
}

/// Variance damped close to already sampled points.
pub struct ExplorationWithDistancePenalty {
    pub c: Float,
}

impl Acquisition for ExplorationWithDistancePenalty {
    fn label(&self) -> &'static str {
        "exploration_with_distance_penalty"
    }

    fn score(&self, candidates: &Candidates) -> Vec<Float> {
        mean_variance(candidates)
            .iter()
            .enumerate()
            .map(|(n, v)| {
                let d = candidates.nearest(n);
                let penalty = if d.is_finite() {
                    1. - (-self.c * d).exp()
                } else {
                    1.
                };
                v * penalty
            })
            .collect()
    }
}

/// Blend of normalized variance and normalized predicted improvement.
pub struct WeightedExploration {
    pub weight: Float,
}

impl Acquisition for WeightedExploration {
    fn label(&self) -> &'static str {
        "weighted_exploration"
    }

    fn score(&self, candidates: &Candidates) -> Vec<Float> {
        let variance = normalize(&mean_variance(candidates));
        let mean = normalize(&first_column(candidates.mean));
        variance
            .iter()
            .zip(mean)
            .map(|(v, m)| self.weight * v + (1. - self.weight) * (1. - m))
            .collect()
    }
}

pub struct ProbabilityOfImprovement {
    pub xi: Float,
}

impl Acquisition for ProbabilityOfImprovement {
    fn label(&self) -> &'static str {
        "probability_of_improvement"
    }

    fn score(&self, candidates: &Candidates) -> Vec<Float> {
        let best = candidates.best();
        let mean = first_column(candidates.mean);
        let variance = first_column(candidates.variance);
        mean.iter()
            .zip(&variance)
            .map(|(m, v)| {
                let sigma = v.max(0.).sqrt();
                let improvement = best - m - self.xi;
                if sigma <= 0. {
                    if improvement > 0. {
                        1.
                    } else {
                        0.
                    }
                } else {
                    norm_cdf(improvement / sigma)
                }
            })
            .collect()
    }
}

pub struct ExpectedImprovement {
    pub xi: Float,
}

impl Acquisition for ExpectedImprovement {
    fn label(&self) -> &'static str {
        "expected_improvement"
    }

    fn score(&self, candidates: &Candidates) -> Vec<Float> {
        expected_improvement(candidates, self.xi)
    }
}

/// Expected improvement mixed with exploration, both normalized.
pub struct ExpectedImprovement2 {
    pub xi: Float,
    pub exploration_factor: Float,
}

impl Acquisition for ExpectedImprovement2 {
    fn label(&self) -> &'static str {
        "expected_improvement_2"
    }

    fn score(&self, candidates: &Candidates) -> Vec<Float> {
        let ei = normalize(&expected_improvement(candidates, self.xi));
        let variance = normalize(&mean_variance(candidates));
        let f = self.exploration_factor;
        ei.iter()
            .zip(variance)
            .map(|(e, v)| (1. - f) * e + f * v)
            .collect()
    }
}

/// Switches between exploration and expected improvement every `period`
/// iterations, starting with exploration.
pub struct AlternatingExploration {
    pub period: usize,
}

impl Acquisition for AlternatingExploration {
    fn label(&self) -> &'static str {
        "alternating_exploration"
    }

    fn score(&self, candidates: &Candidates) -> Vec<Float> {
        let period = self.period.max(1);
        if (candidates.iteration / period) % 2 == 0 {
            SimpleExploration.score(candidates)
        } else {
            expected_improvement(candidates, 0.01)
        }
    }
}

pub fn from_config(config: &AcquisitionConfig) -> Result<Box<dyn Acquisition>> {
    let acquisition: Box<dyn Acquisition> = match config {
        AcquisitionConfig::SimpleExploration => Box::new(SimpleExploration),
        AcquisitionConfig::ExplorationWithDistancePenalty { c } => {
            Box::new(ExplorationWithDistancePenalty { c: *c })
        }
        AcquisitionConfig::WeightedExploration { weight } => {
            Box::new(WeightedExploration { weight: *weight })
        }
        AcquisitionConfig::ProbabilityOfImprovement { xi } => {
            Box::new(ProbabilityOfImprovement { xi: *xi })
        }
        AcquisitionConfig::ExpectedImprovement { xi } => Box::new(ExpectedImprovement { xi: *xi }),
        AcquisitionConfig::ExpectedImprovement2 {
            xi,
            exploration_factor,
        } => Box::new(ExpectedImprovement2 {
            xi: *xi,
            exploration_factor: *exploration_factor,
        }),
        AcquisitionConfig::AlternatingExploration { period } => {
            Box::new(AlternatingExploration { period: *period })
        }
    };
    Ok(acquisition)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidates<'a>(
        points: &'a [Vec<Float>],
        mean: &'a [Vec<Float>],
        variance: &'a [Vec<Float>],
        sampled: &'a [Vec<Float>],
        outputs: &'a [Vec<Float>],
        iteration: usize,
    ) -> Candidates<'a> {
        Candidates {
            points,
            mean,
            variance,
            sampled,
            outputs,
            iteration,
        }
    }

    #[test]
    fn select_prefers_first_maximum_and_skips_nan() {
        assert_eq!(select(&[1., 3., 3., Float::NAN]), Some(1));
        assert_eq!(select(&[Float::NAN, 0.]), Some(1));
        assert_eq!(select(&[]), None);
    }

    #[test]
    fn exploration_and_improvement_disagree() {
        let points = vec![vec![0.], vec![0.5], vec![1.]];
        // low mean, no uncertainty vs. high mean, high uncertainty
        let mean = vec![vec![-1.], vec![5.], vec![5.]];
        let variance = vec![vec![0.], vec![0.1], vec![4.]];
        let sampled = vec![vec![0.25]];
        let outputs = vec![vec![0.]];
        let c = candidates(&points, &mean, &variance, &sampled, &outputs, 0);
        assert_eq!(select(&SimpleExploration.score(&c)), Some(2));
        assert_eq!(select(&ExpectedImprovement { xi: 0.01 }.score(&c)), Some(0));
        assert_eq!(select(&ProbabilityOfImprovement { xi: 0.01 }.score(&c)), Some(0));

        let alternating = AlternatingExploration { period: 2 };
        assert_eq!(select(&alternating.score(&c)), Some(2));
        let later = candidates(&points, &mean, &variance, &sampled, &outputs, 2);
        assert_eq!(select(&alternating.score(&later)), Some(0));
    }

    #[test]
    fn distance_penalty_avoids_sampled_points() {
        let points = vec![vec![0.], vec![1.]];
        let mean = vec![vec![0.], vec![0.]];
        let variance = vec![vec![1.], vec![1.]];
        let sampled = vec![vec![0.]];
        let outputs = vec![vec![0.]];
        let c = candidates(&points, &mean, &variance, &sampled, &outputs, 0);
        let scores = ExplorationWithDistancePenalty { c: 1. }.score(&c);
        assert_eq!(scores[0], 0.);
        assert_eq!(select(&scores), Some(1));
    }

    #[test]
    fn every_name_has_a_config() {
        for name in NAMES {
            let config: AcquisitionConfig =
                serde_json::from_value(serde_json::json!({ "class": name })).unwrap();
            assert_eq!(from_config(&config).unwrap().label(), *name);
        }
    }
}
