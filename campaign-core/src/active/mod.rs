//! Active learning loop extending the run set with points picked from a
//! fitted surrogate.
//!
//! The loop goes through `Seed`, where the initial batch is run, then
//! `Iterate` for a fixed number of iterations and finally `Done`. Each
//! iteration fits the surrogate to every completed run, scores a grid of
//! candidates spanning the active learning dimensions and runs the best
//! ones. Crashed or cancelled runs are lost samples: they're logged and
//! the loop carries on with what completed.

pub mod acquisition;

use std::path::PathBuf;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::{ActiveLearningConfig, ResolvedConfig};
use crate::error::{Error, Result};
use crate::plugins::Plugins;
use crate::registry::{Registry, RunStatus};
use crate::row::Row;
use crate::runner::Runner;
use crate::surrogate::Surrogate;
use crate::util;
use crate::var::Var;
use crate::variable::Variables;
use crate::{Float, RunId, VarName};

use self::acquisition::{select, Acquisition, Candidates};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Seed,
    Iterate(usize),
    Done,
}

/// Record of a single iteration.
#[derive(Debug, Clone, PartialEq)]
pub struct Iteration {
    pub index: usize,
    /// Points picked, in the active learning dimensions.
    pub points: Vec<Vec<Float>>,
    pub runs: Vec<RunId>,
    /// Runs that ended without output.
    pub lost: Vec<RunId>,
}

pub struct ActiveLearning {
    config: ActiveLearningConfig,
    variables: Variables,
    /// Names of the active learning inputs.
    active: Vec<VarName>,
    grid: Vec<Vec<Float>>,
    surrogate: Box<dyn Surrogate>,
    acquisition: Box<dyn Acquisition>,
    rng: StdRng,
    save: Option<PathBuf>,
    state: State,
    history: Vec<Iteration>,
}

impl ActiveLearning {
    pub fn new(
        config: ActiveLearningConfig,
        variables: Variables,
        surrogate: Box<dyn Surrogate>,
        acquisition: Box<dyn Acquisition>,
        seed: Option<u64>,
    ) -> Result<Self> {
        let mut active = Vec::new();
        let mut axes = Vec::new();
        for var in variables.inputs().filter(|v| v.is_active()) {
            let (a, b) = var.bounds().ok_or_else(|| {
                Error::InvalidConfiguration(format!("{} has no bounds", var.name))
            })?;
            active.push(var.name.clone());
            axes.push(util::linspace(a, b, config.resolution));
        }
        if active.is_empty() {
            return Err(Error::InvalidConfiguration(
                "active learning needs at least one ActiveLearning variable".to_string(),
            ));
        }
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        Ok(ActiveLearning {
            grid: grid(&axes),
            config,
            variables,
            active,
            surrogate,
            acquisition,
            rng,
            save: None,
            state: State::Seed,
            history: Vec::new(),
        })
    }

    /// Creates the loop from a resolved configuration with active learning
    /// enabled.
    pub fn from_config(config: &ResolvedConfig, plugins: &Plugins) -> Result<Self> {
        let al = config.active_learning.clone().ok_or_else(|| {
            Error::InvalidConfiguration("active learning is not enabled".to_string())
        })?;
        let save = if al.save { config.fit.save.clone() } else { None };
        let surrogate = plugins.surrogate(&config.fit.surrogate)?;
        let acquisition = plugins.acquisition(&al.acquisition)?;
        let mut active_learning = ActiveLearning::new(
            al,
            config.variables.clone(),
            surrogate,
            acquisition,
            // shifted so candidate inputs don't repeat the seed batch
            config.seed.map(|s| s.wrapping_add(1)),
        )?;
        active_learning.save = save;
        Ok(active_learning)
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn history(&self) -> &[Iteration] {
        &self.history
    }

    pub fn surrogate(&self) -> &dyn Surrogate {
        self.surrogate.as_ref()
    }

    /// Runs the whole loop: the seed batch of `inputs` followed by every
    /// iteration.
    pub fn run(&mut self, runner: &mut dyn Runner, inputs: Vec<Row>) -> Result<()> {
        self.seed(runner, inputs)?;
        while self.state != State::Done {
            self.step(runner)?;
        }
        self.complete(runner.registry())
    }

    /// Runs the seed batch and moves on to iterating.
    pub fn seed(&mut self, runner: &mut dyn Runner, inputs: Vec<Row>) -> Result<()> {
        if self.state != State::Seed {
            return Err(Error::Other("seed batch already run".to_string()));
        }
        info!("active learning: running {} seed runs", inputs.len());
        let ids = runner.spawn_array(inputs, true)?;
        let lost = lost_runs(runner.registry(), &ids);
        if !lost.is_empty() {
            warn!("active learning: lost {} of {} seed samples", lost.len(), ids.len());
        }
        self.state = if self.config.iterations == 0 {
            State::Done
        } else {
            State::Iterate(0)
        };
        Ok(())
    }

    /// Performs a single iteration.
    pub fn step(&mut self, runner: &mut dyn Runner) -> Result<()> {
        let index = match self.state {
            State::Iterate(n) => n,
            State::Seed => return Err(Error::Other("seed batch not run yet".to_string())),
            State::Done => return Ok(()),
        };
        let points = self.pick(runner.registry(), index)?;
        let inputs = self.inputs(&points)?;
        let runs = runner.spawn_array(inputs, true)?;
        let lost = lost_runs(runner.registry(), &runs);
        if !lost.is_empty() {
            warn!(
                "active learning iteration {}: lost samples of runs {:?}",
                index, lost
            );
        }
        debug!("active learning iteration {}: picked {:?}", index, points);
        self.history.push(Iteration {
            index,
            points,
            runs,
            lost,
        });
        self.state = if index + 1 >= self.config.iterations {
            State::Done
        } else {
            State::Iterate(index + 1)
        };
        Ok(())
    }

    /// Fits the surrogate to everything completed so far.
    pub fn train(&mut self, registry: &Registry) -> Result<bool> {
        let (x, y) = self.training_data(registry)?;
        if x.is_empty() {
            return Ok(false);
        }
        self.surrogate.train(&x, &y)?;
        Ok(true)
    }

    /// Saves the surrogate if configured.
    fn finish(&mut self) -> Result<()> {
        info!(
            "active learning done after {} iterations",
            self.history.len()
        );
        if let Some(path) = self.save.clone() {
            if self.surrogate.is_trained() {
                self.surrogate.save(&path)?;
            }
        }
        Ok(())
    }

    /// Trains on the final registry content and saves, for callers driving
    /// the loop step by step.
    pub fn complete(&mut self, registry: &Registry) -> Result<()> {
        self.train(registry)?;
        self.finish()
    }

    fn training_data(&self, registry: &Registry) -> Result<(Vec<Vec<Float>>, Vec<Vec<Float>>)> {
        let mut x = Vec::new();
        let mut y = Vec::new();
        for (_, input, output) in registry.completed() {
            let outputs = output.to_floats();
            if outputs.is_empty() || outputs.iter().any(|v| !v.is_finite()) {
                continue;
            }
            x.push(self.active_point(&input)?);
            y.push(outputs);
        }
        Ok((x, y))
    }

    fn active_point(&self, input: &Row) -> Result<Vec<Float>> {
        self.active.iter().map(|n| input.get_float(n)).collect()
    }

    /// Picks the points of one batch, retraining with the predicted mean
    /// of every picked point before picking the next one.
    fn pick(&mut self, registry: &Registry, iteration: usize) -> Result<Vec<Vec<Float>>> {
        let (mut x, mut y) = self.training_data(registry)?;
        let mut points = Vec::with_capacity(self.config.batch_size);
        for _ in 0..self.config.batch_size {
            if x.is_empty() {
                warn!("active learning: no completed samples, picking at random");
                let n = self.rng.gen_range(0..self.grid.len());
                points.push(self.grid[n].clone());
                continue;
            }
            self.surrogate.train(&x, &y)?;
            let (mean, variance) = self.surrogate.predict(&self.grid)?;
            let scores = self.acquisition.score(&Candidates {
                points: &self.grid,
                mean: &mean,
                variance: &variance,
                sampled: &x,
                outputs: &y,
                iteration,
            });
            let n = select(&scores).ok_or_else(|| {
                Error::Surrogate("no candidate could be scored".to_string())
            })?;
            points.push(self.grid[n].clone());
            x.push(self.grid[n].clone());
            y.push(mean[n].clone());
        }
        Ok(points)
    }

    /// Input rows for the picked points, other inputs drawn from their
    /// distributions.
    fn inputs(&mut self, points: &[Vec<Float>]) -> Result<Vec<Row>> {
        let mut rows = self.variables.sample_inputs_with(points.len(), &mut self.rng)?;
        for (row, point) in rows.iter_mut().zip(points) {
            for (name, value) in self.active.iter().zip(point) {
                row.set(name, Var::Float(*value))?;
            }
        }
        Ok(rows)
    }
}

/// Cartesian product of the axes.
fn grid(axes: &[Vec<Float>]) -> Vec<Vec<Float>> {
    let mut points: Vec<Vec<Float>> = vec![Vec::new()];
    for axis in axes {
        let mut next = Vec::with_capacity(points.len() * axis.len());
        for point in &points {
            for v in axis {
                let mut p = point.clone();
                p.push(*v);
                next.push(p);
            }
        }
        points = next;
    }
    points
}

fn lost_runs(registry: &Registry, ids: &[RunId]) -> Vec<RunId> {
    ids.iter()
        .copied()
        .filter(|id| registry.get_status(*id).ok() != Some(RunStatus::Done))
        .collect()
}

#[test]
fn grid_spans_every_combination() {
    let points = grid(&[vec![0., 1.], vec![5., 6., 7.]]);
    assert_eq!(points.len(), 6);
    assert_eq!(points[0], vec![0., 5.]);
    assert_eq!(points[5], vec![1., 7.]);
}
