use std::path::Path;

use proptest::prelude::*;

use campaign_core::active::acquisition::{Acquisition, Candidates};
use campaign_core::active::State;
use campaign_core::config::{Config, IdwConfig};
use campaign_core::surrogate::Idw;
use campaign_core::{mock, ActiveLearning, Plugins, ResolvedConfig, RunStatus, RunnerContext};

/// Always favors the first candidate.
struct FirstCandidate;

impl Acquisition for FirstCandidate {
    fn label(&self) -> &'static str {
        "first_candidate"
    }

    fn score(&self, candidates: &Candidates) -> Vec<f64> {
        vec![1.; candidates.points.len()]
    }
}

fn study(dir: &Path, iterations: usize, batch_size: usize) -> ResolvedConfig {
    let toml = format!(
        r#"
        ntrain = 4
        seed = 5

        [variables]
        x = "ActiveLearning(0, 1)"
        y = "Uniform(-1, 1)"
        f = "Output"

        [run]
        runner = "internal"
        pre = "none"
        post = "none"

        [active_learning]
        iterations = {}
        batch_size = {}
        resolution = 5
        "#,
        iterations, batch_size
    );
    let mut config = Config::from_str_toml(&toml).unwrap();
    config.base_dir = Some(dir.to_path_buf());
    config.resolve(&Plugins::default()).unwrap()
}

#[test]
fn loop_extends_the_run_set_and_saves() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = study(dir.path(), 3, 2);
    let model = dir.path().join("model.bin");
    config.fit.save = Some(model.clone());
    if let Some(al) = config.active_learning.as_mut() {
        al.save = true;
    }
    let plugins = Plugins::default();
    let mut runner = plugins
        .runner(&config, RunnerContext::with_execution(mock::sum()))
        .unwrap();
    let mut al = ActiveLearning::from_config(&config, &plugins).unwrap();
    let inputs = config.variables.sample_inputs(config.ntrain, config.seed).unwrap();
    al.run(runner.as_mut(), inputs).unwrap();

    assert_eq!(al.state(), State::Done);
    assert_eq!(al.history().len(), 3);
    let registry = runner.registry();
    assert_eq!(registry.len(), 4 + 3 * 2);
    assert_eq!(registry.with_status(RunStatus::Done).len(), 10);
    for iteration in al.history() {
        assert_eq!(iteration.points.len(), 2);
        assert!(iteration.lost.is_empty());
        for point in &iteration.points {
            assert!(point[0] >= 0. && point[0] <= 1.);
        }
    }
    assert!(al.surrogate().is_trained());
    assert!(campaign_core::surrogate::load(&model).unwrap().is_trained());
}

#[test]
fn lost_samples_do_not_stop_the_loop() {
    let dir = tempfile::tempdir().unwrap();
    let config = study(dir.path(), 2, 1);
    let plugins = Plugins::default();
    let execution = campaign_core::worker::Execution::function(|_, _| {
        Err(campaign_core::Error::ExecutionFailed("always".to_string()))
    });
    let mut runner = plugins
        .runner(&config, RunnerContext::with_execution(execution))
        .unwrap();
    let mut al = ActiveLearning::from_config(&config, &plugins).unwrap();
    let inputs = config.variables.sample_inputs(config.ntrain, config.seed).unwrap();
    al.run(runner.as_mut(), inputs).unwrap();

    assert_eq!(al.state(), State::Done);
    assert_eq!(al.history().len(), 2);
    for iteration in al.history() {
        assert_eq!(iteration.lost, iteration.runs);
    }
    assert!(!al.surrogate().is_trained());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    #[test]
    fn degenerate_acquisition_still_terminates(
        iterations in 0usize..5,
        batch_size in 1usize..4,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let config = study(dir.path(), iterations, batch_size);
        let plugins = Plugins::default();
        let mut runner = plugins
            .runner(&config, RunnerContext::with_execution(mock::rosenbrock()))
            .unwrap();
        let al_config = config.active_learning.clone().unwrap();
        let mut al = ActiveLearning::new(
            al_config,
            config.variables.clone(),
            Box::new(Idw::new(IdwConfig::default()).unwrap()),
            Box::new(FirstCandidate),
            Some(1),
        )
        .unwrap();
        let inputs = config.variables.sample_inputs(config.ntrain, config.seed).unwrap();
        al.seed(runner.as_mut(), inputs).unwrap();
        let mut steps = 0;
        while al.state() != State::Done {
            al.step(runner.as_mut()).unwrap();
            steps += 1;
            prop_assert!(steps <= iterations);
        }
        prop_assert_eq!(steps, iterations);
        prop_assert_eq!(runner.registry().len(), 4 + iterations * batch_size);
        for iteration in al.history() {
            for point in &iteration.points {
                prop_assert_eq!(point, &vec![0.]);
            }
        }
    }
}
