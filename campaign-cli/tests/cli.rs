use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use campaign_core::{table, Plugins, ResolvedConfig, Var};

const BIN: &str = env!("CARGO_BIN_EXE_campaign");

/// Prints the run id as the value of `f`.
const SIM: &str = r#"echo "{\"f\": $CAMPAIGN_RUN_ID}""#;

fn study(dir: &Path) {
    fs::write(dir.join("sim.sh"), SIM).unwrap();
    let config = format!(
        r#"
        ntrain = 4
        seed = 3

        [variables]
        u = "Uniform(0, 1)"
        f = "Output"

        [files]
        input = "input.json"
        output = "output.json"

        [run]
        command = "sh {sim}"
        pre = "none"
        post = "json"
        clean = false

        [run.runner]
        class = "local"
        parallel = 2
        worker_command = "{bin} worker"

        [run.interface]
        class = "tcp"
        "#,
        sim = dir.join("sim.sh").display(),
        bin = BIN,
    );
    fs::write(dir.join("campaign.toml"), config).unwrap();
}

fn campaign(args: &[&str], dir: &Path) -> Output {
    Command::new(BIN)
        .args(&["-v", "warn"])
        .args(args)
        .arg(dir)
        .output()
        .unwrap()
}

fn resolve(dir: &Path) -> ResolvedConfig {
    let mut plugins = Plugins::default();
    campaign_net::register(&mut plugins);
    ResolvedConfig::from_dir(dir, &plugins).unwrap()
}

#[test]
fn run_collects_outputs_of_worker_processes() {
    let dir = tempfile::tempdir().unwrap();
    study(dir.path());
    let out = campaign(&["run"], dir.path());
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));

    let config = resolve(dir.path());
    let inputs = table::load(&config.files.input, config.input_schema()).unwrap();
    let outputs = table::load(&config.files.output, config.output_schema()).unwrap();
    assert_eq!(inputs.len(), 4);
    let values: Vec<Var> = outputs.iter().map(|r| r.values()[0].clone()).collect();
    assert_eq!(
        values,
        vec![Var::Float(0.), Var::Float(1.), Var::Float(2.), Var::Float(3.)]
    );
    for id in 0..4 {
        let log = config.run.log_path.join(format!("run_{:03}.log", id));
        assert!(log.is_file());
    }
}

#[test]
fn fit_trains_on_saved_tables() {
    let dir = tempfile::tempdir().unwrap();
    study(dir.path());
    assert!(campaign(&["run"], dir.path()).status.success());

    let out = campaign(&["fit"], dir.path());
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    let model = dir.path().join("model.bin");
    let surrogate = campaign_core::surrogate::load(&model).unwrap();
    assert!(surrogate.is_trained());
}

#[test]
fn clean_removes_generated_files() {
    let dir = tempfile::tempdir().unwrap();
    study(dir.path());
    assert!(campaign(&["run"], dir.path()).status.success());
    assert!(dir.path().join("run_000").is_dir());
    assert!(dir.path().join(".campaign").is_dir());

    let out = campaign(&["clean", "--yes"], dir.path());
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    for name in &["run_000", "run_003", "input.json", "output.json", "log", ".campaign"] {
        assert!(!dir.path().join(name).exists(), "{} left behind", name);
    }
    assert!(dir.path().join("campaign.toml").is_file());
    assert!(dir.path().join("sim.sh").is_file());
}

#[test]
fn invalid_configuration_exits_with_code_2() {
    let dir = tempfile::tempdir().unwrap();
    study(dir.path());
    let config = fs::read_to_string(dir.path().join("campaign.toml")).unwrap();
    fs::write(
        dir.path().join("campaign.toml"),
        config.replace("Uniform(0, 1)", "Sideways(0, 1)"),
    )
    .unwrap();
    let out = campaign(&["run"], dir.path());
    assert_eq!(out.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&out.stderr).contains("error: "));
}

#[test]
fn worker_without_environment_reports_configuration_error() {
    let out = Command::new(BIN)
        .arg("worker")
        .env_remove("CAMPAIGN_RUN_ID")
        .env_remove("CAMPAIGN_WORKER_CONFIG")
        .output()
        .unwrap();
    assert_eq!(out.status.code(), Some(2));
}
