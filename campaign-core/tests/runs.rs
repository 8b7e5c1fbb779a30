use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use proptest::prelude::*;

use campaign_core::config::Config;
use campaign_core::runner::internal::InternalRunner;
use campaign_core::row::{Field, Schema};
use campaign_core::worker::{post, pre, Execution, WorkerSettings};
use campaign_core::{
    mock, Error, Plugins, Registry, Row, RunStatus, Runner, RunnerContext, Var, VarType,
};

fn schema(names: &[&str]) -> Arc<Schema> {
    Arc::new(Schema::new(
        names
            .iter()
            .map(|n| Field {
                name: n.to_string(),
                vtype: VarType::Float,
                len: None,
            })
            .collect(),
    ))
}

fn settings(dir: &Path) -> WorkerSettings {
    WorkerSettings {
        base_dir: dir.to_path_buf(),
        run_dir: dir.to_path_buf(),
        stdout: "stdout".to_string(),
        stderr: None,
    }
}

fn runner(
    dir: &Path,
    registry: Arc<Registry>,
    execution: Execution,
    parallel: Option<usize>,
) -> InternalRunner {
    InternalRunner::new(
        registry,
        execution,
        Arc::new(pre::NoPreprocessor),
        Arc::new(post::NoPostprocessor),
        settings(dir),
        parallel,
        RunnerContext::default(),
    )
    .unwrap()
}

fn rows(registry: &Registry, pairs: &[(f64, f64)]) -> Vec<Row> {
    pairs
        .iter()
        .map(|(u, v)| {
            let mut row = registry.input_schema().default_row();
            row.set("u", Var::Float(*u)).unwrap();
            row.set("v", Var::Float(*v)).unwrap();
            row
        })
        .collect()
}

fn study(dir: &Path, toml: &str) -> campaign_core::ResolvedConfig {
    let mut config = Config::from_str_toml(toml).unwrap();
    config.base_dir = Some(dir.to_path_buf());
    config.resolve(&Plugins::default()).unwrap()
}

const SUM_STUDY: &str = r#"
    ntrain = 5
    seed = 11

    [variables]
    u = "Uniform(0, 1)"
    v = "Uniform(10, 20)"
    f = "Output"

    [run]
    runner = "internal"
    pre = "none"
    post = "none"
"#;

#[test]
fn batch_without_active_learning_runs_ntrain() {
    let dir = tempfile::tempdir().unwrap();
    let config = study(dir.path(), SUM_STUDY);
    assert!(config.active_learning.is_none());
    let plugins = Plugins::default();
    let mut runner = plugins
        .runner(&config, RunnerContext::with_execution(mock::sum()))
        .unwrap();
    let inputs = config.variables.sample_inputs(config.ntrain, config.seed).unwrap();
    let ids = runner.spawn_array(inputs, true).unwrap();
    assert_eq!(ids, vec![0, 1, 2, 3, 4]);
    let registry = runner.registry().clone();
    assert_eq!(registry.len(), 5);
    assert_eq!(registry.with_status(RunStatus::Done).len(), 5);
    for (_, input, output) in registry.completed() {
        let expected = input.get_float("u").unwrap() + input.get_float("v").unwrap();
        assert_eq!(output.get_float("f").unwrap(), expected);
    }
}

#[test]
fn sums_follow_run_ids() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(Registry::new(schema(&["u", "v"]), schema(&["f"]), 3));
    let mut runner = runner(dir.path(), registry.clone(), mock::sum(), Some(2));
    let ids = runner
        .spawn_array(rows(&registry, &[(1., 2.), (3., 4.), (5., 6.)]), true)
        .unwrap();
    let sums: Vec<f64> = ids
        .iter()
        .map(|id| {
            registry
                .read_output(*id)
                .unwrap()
                .unwrap()
                .get_float("f")
                .unwrap()
        })
        .collect();
    assert_eq!(sums, vec![3., 7., 11.]);
}

#[test]
fn interrupt_stops_waiting() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(Registry::new(schema(&["u", "v"]), schema(&["f"]), 2));
    let context = RunnerContext::default();
    context.interrupt.store(true, Ordering::Relaxed);
    let mut runner = InternalRunner::new(
        registry.clone(),
        mock::sum(),
        Arc::new(pre::NoPreprocessor),
        Arc::new(post::NoPostprocessor),
        settings(dir.path()),
        Some(1),
        context,
    )
    .unwrap();
    match runner.spawn_array(rows(&registry, &[(1., 2.), (3., 4.)]), true) {
        Err(Error::Interrupted) => (),
        other => panic!("unexpected: {:?}", other),
    }
    runner.cancel_all().unwrap();
    assert!(registry.with_status(RunStatus::Running).is_empty());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn batches_respect_parallelism_and_isolate_outputs(
        pairs in prop::collection::vec((-100f64..100., -100f64..100.), 1..16),
        parallel in 1usize..5,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(Registry::new(schema(&["u", "v"]), schema(&["f"]), pairs.len()));
        let peak = Arc::new(AtomicUsize::new(0));
        let execution = {
            let registry = registry.clone();
            let peak = peak.clone();
            Execution::function(move |input, output| {
                let running = registry.with_status(RunStatus::Running).len();
                peak.fetch_max(running, Ordering::SeqCst);
                let f = input.get_float("u")? + input.get_float("v")?;
                output.set("f", Var::Float(f))
            })
        };
        let mut runner = runner(dir.path(), registry.clone(), execution, Some(parallel));
        let ids = runner.spawn_array(rows(&registry, &pairs), true).unwrap();

        let expected: Vec<u32> = (0..pairs.len() as u32).collect();
        prop_assert_eq!(&ids, &expected);
        prop_assert!(peak.load(Ordering::SeqCst) >= 1);
        prop_assert!(peak.load(Ordering::SeqCst) <= parallel);
        for (id, (u, v)) in ids.iter().zip(&pairs) {
            prop_assert_eq!(registry.get_status(*id).unwrap(), RunStatus::Done);
            let output = registry.read_output(*id).unwrap().unwrap();
            prop_assert_eq!(output.get_float("f").unwrap(), u + v);
        }
    }

    #[test]
    fn crashes_are_reported_exactly_once(
        us in prop::collection::vec(-10f64..10., 1..12),
    ) {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(Registry::new(schema(&["u", "v"]), schema(&["f"]), us.len()));
        let execution = Execution::function(|input, output| {
            let u = input.get_float("u")?;
            if u < 0. {
                return Err(Error::ExecutionFailed(format!("negative input {}", u)));
            }
            output.set("f", Var::Float(u))
        });
        let mut runner = runner(dir.path(), registry.clone(), execution, Some(3));
        let pairs: Vec<(f64, f64)> = us.iter().map(|u| (*u, 0.)).collect();
        let ids = runner.spawn_array(rows(&registry, &pairs), false).unwrap();
        runner.wait_all().unwrap();

        for (id, u) in ids.iter().zip(&us) {
            let status = registry.get_status(*id).unwrap();
            prop_assert!(status.is_terminal());
            if *u < 0. {
                prop_assert_eq!(status, RunStatus::Crashed);
                prop_assert!(registry.read_output(*id).unwrap().is_none());
            } else {
                prop_assert_eq!(status, RunStatus::Done);
            }
        }
        // everything was reported while waiting
        prop_assert!(runner.check_runs().unwrap().is_empty());
        prop_assert!(runner.check_runs().unwrap().is_empty());
    }

    #[test]
    fn cancel_all_leaves_nothing_running(
        n in 1usize..20,
        parallel in 1usize..4,
        polls in 0usize..4,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(Registry::new(schema(&["u", "v"]), schema(&["f"]), n));
        let mut runner = runner(dir.path(), registry.clone(), mock::sum(), Some(parallel));
        let ids = runner.spawn_array(rows(&registry, &vec![(1., 1.); n]), false).unwrap();
        for _ in 0..polls {
            runner.poll().unwrap();
        }
        let report = runner.cancel_all().unwrap();
        prop_assert!(registry.with_status(RunStatus::Running).is_empty());
        for id in &ids {
            let status = registry.get_status(*id).unwrap();
            prop_assert!(status == RunStatus::Done || status == RunStatus::Cancelled);
        }
        prop_assert_eq!(report.effective(), registry.with_status(RunStatus::Cancelled));
        prop_assert!(report.unsupported().is_empty());
    }
}
