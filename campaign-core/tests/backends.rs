use std::fs;
use std::path::Path;
use std::thread;
use std::time::Duration;

use campaign_core::config::Config;
use campaign_core::{Plugins, RunFailure, RunId, RunStatus, Runner, RunnerContext};

fn study(dir: &Path, runner: &str) -> campaign_core::ResolvedConfig {
    let toml = format!(
        r#"
        ntrain = 4
        seed = 5

        [variables]
        u = "Uniform(0, 1)"
        f = "Output"

        [run]
        command = "sim"
        pre = "none"
        post = "none"

        [run.runner]
        {}
        "#,
        runner
    );
    let mut config = Config::from_str_toml(&toml).unwrap();
    config.base_dir = Some(dir.to_path_buf());
    config.resolve(&Plugins::default()).unwrap()
}

fn start(config: &campaign_core::ResolvedConfig) -> Box<dyn Runner> {
    Plugins::default()
        .runner(config, RunnerContext::default())
        .unwrap()
}

fn poll_until_terminal(
    runner: &mut Box<dyn Runner>,
    ids: &[RunId],
    mut each: impl FnMut(&dyn Runner),
) {
    for _ in 0..500 {
        runner.poll().unwrap();
        each(&**runner);
        let terminal = ids
            .iter()
            .all(|id| runner.registry().get_status(*id).unwrap().is_terminal());
        if terminal {
            return;
        }
        thread::sleep(Duration::from_millis(20));
    }
    panic!("runs didn't finish");
}

#[test]
fn worker_exiting_without_output_crashes_once() {
    let dir = tempfile::tempdir().unwrap();
    let config = study(
        dir.path(),
        r#"class = "local"
        parallel = 2
        worker_command = "true""#,
    );
    let mut runner = start(&config);
    let inputs = config.variables.sample_inputs(3, config.seed).unwrap();
    let ids = runner.spawn_array(inputs, false).unwrap();
    poll_until_terminal(&mut runner, &ids, |_| ());

    let registry = runner.registry().clone();
    for id in &ids {
        assert_eq!(registry.get_status(*id).unwrap(), RunStatus::Crashed);
        assert_eq!(
            registry.failure(*id).unwrap(),
            Some(RunFailure::NoSignal(Some(0)))
        );
    }
    assert_eq!(runner.check_runs().unwrap(), ids);
    assert!(runner.check_runs().unwrap().is_empty());
}

#[test]
fn local_workers_respect_parallelism() {
    let dir = tempfile::tempdir().unwrap();
    let config = study(
        dir.path(),
        r#"class = "local"
        parallel = 2
        sleep = 0.01
        worker_command = "sleep 0.2""#,
    );
    let mut runner = start(&config);
    let inputs = config.variables.sample_inputs(5, config.seed).unwrap();
    let ids = runner.spawn_array(inputs, false).unwrap();
    let mut peak = 0;
    poll_until_terminal(&mut runner, &ids, |runner| {
        let running = runner.registry().with_status(RunStatus::Running).len();
        assert!(running <= 2, "{} runs running at once", running);
        peak = peak.max(running);
    });
    assert!(peak >= 1);
    assert_eq!(runner.registry().with_status(RunStatus::Crashed), ids);
}

#[test]
fn missing_log_directory_crashes_run_instead_of_leaving_it_running() {
    let dir = tempfile::tempdir().unwrap();
    let config = study(
        dir.path(),
        r#"class = "local"
        parallel = 1
        worker_command = "true""#,
    );
    let mut runner = start(&config);
    fs::remove_dir_all(&config.run.log_path).unwrap();
    let inputs = config.variables.sample_inputs(2, config.seed).unwrap();
    let ids = runner.spawn_array(inputs, false).unwrap();
    poll_until_terminal(&mut runner, &ids, |_| ());

    let registry = runner.registry().clone();
    assert!(registry.with_status(RunStatus::Running).is_empty());
    for id in &ids {
        assert_eq!(registry.get_status(*id).unwrap(), RunStatus::Crashed);
        match registry.failure(*id).unwrap() {
            Some(RunFailure::Interface(m)) => assert!(m.contains("log"), "{}", m),
            other => panic!("unexpected failure {:?}", other),
        }
    }
}

#[test]
fn unparsable_sbatch_output_crashes_runs() {
    let dir = tempfile::tempdir().unwrap();
    let config = study(
        dir.path(),
        r#"class = "slurm"
        sbatch = "echo"
        worker_command = "campaign worker""#,
    );
    let mut runner = start(&config);
    let inputs = config.variables.sample_inputs(2, config.seed).unwrap();
    let ids = runner.spawn_array(inputs, false).unwrap();

    let registry = runner.registry().clone();
    assert!(registry.with_status(RunStatus::Queued).is_empty());
    assert_eq!(registry.with_status(RunStatus::Crashed), ids);
}

#[test]
fn missing_sbatch_crashes_runs() {
    let dir = tempfile::tempdir().unwrap();
    let config = study(
        dir.path(),
        r#"class = "slurm"
        sbatch = "/nonexistent/sbatch"
        worker_command = "campaign worker""#,
    );
    let mut runner = start(&config);
    let inputs = config.variables.sample_inputs(2, config.seed).unwrap();
    let ids = runner.spawn_array(inputs, false).unwrap();
    assert_eq!(runner.registry().with_status(RunStatus::Crashed), ids);
}

#[cfg(unix)]
#[test]
fn unreachable_squeue_skips_the_poll() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().unwrap();
    let sbatch = dir.path().join("fake-sbatch");
    fs::write(&sbatch, "#!/bin/sh\necho 4242\n").unwrap();
    fs::set_permissions(&sbatch, fs::Permissions::from_mode(0o755)).unwrap();
    let config = study(
        dir.path(),
        &format!(
            r#"class = "slurm"
            poll = 0.0
            sbatch = "{}"
            squeue = "/nonexistent/squeue"
            scancel = "true"
            worker_command = "campaign worker""#,
            sbatch.display()
        ),
    );
    let mut runner = start(&config);
    let inputs = config.variables.sample_inputs(1, config.seed).unwrap();
    let ids = runner.spawn_array(inputs, false).unwrap();
    assert_eq!(runner.registry().with_status(RunStatus::Running), ids);
    runner.poll().unwrap();
    runner.poll().unwrap();
    assert_eq!(runner.registry().with_status(RunStatus::Running), ids);
    runner.cancel_all().unwrap();
    assert_eq!(runner.registry().with_status(RunStatus::Cancelled), ids);
}
