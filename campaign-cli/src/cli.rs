//! Application definition.

extern crate simplelog;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;

use anyhow::{Error, Result};
use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};

use crate::campaign::runner::Runner;
use crate::campaign::{table, worker, ActiveLearning, Plugins, ResolvedConfig, RunnerContext};
use crate::util;

pub const VERSION: &'static str = env!("CARGO_PKG_VERSION");
pub const AUTHORS: &'static str = env!("CARGO_PKG_AUTHORS");

pub fn app<'a, 'b>() -> App<'a, 'b> {
    App::new("campaign")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .version(VERSION)
        .author(AUTHORS)
        .about("Run simulation campaigns with optional active learning.")
        .arg(Arg::with_name("verbosity")
            .long("verbosity")
            .short("v")
            .takes_value(true)
            .default_value("info")
            .value_name("verb")
            .global(true)
            .help("Set the verbosity of the log output"))

        // run subcommand
        .subcommand(SubCommand::with_name("run")
            .display_order(10)
            .about("Run the study defined in the base directory")
            .arg(Arg::with_name("base-dir")
                .value_name("base-dir")
                .help("Directory holding the configuration file (defaults to current directory)")))

        // worker subcommand
        .subcommand(SubCommand::with_name("worker")
            .display_order(11)
            .about("Execute a single run, started by a runner backend")
            .long_about("Execute a single run. Started by the local and slurm \
                backends, which pass the run id and the worker configuration \
                through the environment."))

        // fit subcommand
        .subcommand(SubCommand::with_name("fit")
            .display_order(12)
            .about("Train the configured surrogate on saved tables")
            .arg(Arg::with_name("base-dir")
                .value_name("base-dir")
                .help("Directory holding the configuration file (defaults to current directory)")))

        // clean subcommand
        .subcommand(SubCommand::with_name("clean")
            .display_order(13)
            .about("Remove run directories, tables, logs and internal state")
            .arg(Arg::with_name("base-dir")
                .value_name("base-dir")
                .help("Directory holding the configuration file (defaults to current directory)"))
            .arg(Arg::with_name("yes")
                .long("yes")
                .short("y")
                .help("Don't ask for confirmation")))
}

pub fn app_matches() -> ArgMatches<'static> {
    app().get_matches()
}

/// Runs the program based on the given matches, returning the exit
/// status of the process.
pub fn start(matches: ArgMatches) -> Result<i32> {
    match matches.subcommand() {
        ("run", Some(m)) => start_run(m),
        ("worker", Some(m)) => start_worker(m),
        ("fit", Some(m)) => start_fit(m),
        ("clean", Some(m)) => start_clean(m),
        _ => Ok(0),
    }
}

/// Registry of every variant available to this program.
pub fn plugins() -> Plugins {
    let mut plugins = Plugins::default();
    campaign_net::register(&mut plugins);
    plugins
}

fn resolve(matches: &ArgMatches, plugins: &Plugins) -> Result<ResolvedConfig> {
    let base_dir = util::base_dir(matches)?;
    let config = ResolvedConfig::from_dir(&base_dir, plugins)?;
    debug!("resolved configuration: {:?}", config);
    Ok(config)
}

pub fn start_run(matches: &ArgMatches) -> Result<i32> {
    setup_log_verbosity(matches);
    let plugins = plugins();
    let config = resolve(matches, &plugins)?;
    info!(
        "running study in {} ({} runner, {} interface)",
        config.base_dir.display(),
        config.run.runner.class(),
        config.run.interface.class()
    );

    let context = RunnerContext::default();
    let interrupt = context.interrupt.clone();
    ctrlc::set_handler(move || {
        interrupt.store(true, Ordering::SeqCst);
    })
    .map_err(|e| Error::msg(format!("failed setting the ctrl-c handler: {}", e)))?;

    let mut runner = plugins.runner(&config, context)?;
    let inputs = config.variables.sample_inputs(config.ntrain, config.seed)?;
    table::save(&config.files.input, &config.variables.input_schema(), &inputs)?;
    debug!(
        "saved {} sampled inputs to {}",
        inputs.len(),
        config.files.input.display()
    );

    let result = match &config.active_learning {
        Some(_) => ActiveLearning::from_config(&config, &plugins)
            .and_then(|mut al| al.run(runner.as_mut(), inputs)),
        None => runner.spawn_array(inputs, true).map(|_| ()),
    };
    if let Err(e) = &result {
        error!("stopping: {}", e);
    }

    finish_run(&config, runner.as_mut())?;
    result?;
    Ok(0)
}

/// Cancels whatever is left, saves the tables and cleans up.
fn finish_run(config: &ResolvedConfig, runner: &mut dyn Runner) -> Result<()> {
    let report = runner.cancel_all()?;
    if !report.runs.is_empty() {
        info!("cancelled {} runs", report.runs.len());
    }
    let unsupported = report.unsupported();
    if !unsupported.is_empty() {
        warn!(
            "runs {:?} couldn't be stopped and may still be executing",
            unsupported
        );
    }

    let registry = runner.registry().clone();
    let completed = table::save_results(&registry, &config.files.input, &config.files.output)?;
    info!("{} of {} runs completed", completed, registry.len());

    if config.run.clean {
        debug!("cleaning up after {} runner", runner.label());
        runner.clean()?;
    }
    Ok(())
}

/// Worker process entry point. Logs go to stderr, which the runner
/// redirects into the run's log file.
pub fn start_worker(matches: &ArgMatches) -> Result<i32> {
    use self::simplelog::{ConfigBuilder, LevelFilter, WriteLogger};
    let logger_conf = ConfigBuilder::new()
        .set_time_level(LevelFilter::Error)
        .set_target_level(LevelFilter::Off)
        .set_time_format_str("%H:%M:%S%.3f")
        .build();
    let _ = WriteLogger::init(level_filter(matches), logger_conf, std::io::stderr());

    Ok(worker::run_worker_process(&plugins()))
}

pub fn start_fit(matches: &ArgMatches) -> Result<i32> {
    setup_log_verbosity(matches);
    let plugins = plugins();
    let config = resolve(matches, &plugins)?;
    let save = config.fit.save.clone().ok_or_else(|| {
        Error::msg("no location to save the surrogate to, set fit.save")
    })?;

    let inputs = table::load(&config.files.input, config.input_schema())?;
    let outputs = table::load(&config.files.output, config.output_schema())?;
    if inputs.len() != outputs.len() {
        return Err(Error::msg(format!(
            "{} has {} rows but {} has {}",
            config.files.input.display(),
            inputs.len(),
            config.files.output.display(),
            outputs.len()
        )));
    }
    let (x, y) = training_data(
        inputs.iter().map(|r| r.to_floats()),
        outputs.iter().map(|r| r.to_floats()),
    );
    if x.is_empty() {
        return Err(Error::msg("no usable samples in the saved tables"));
    }
    info!(
        "training {} surrogate on {} of {} samples",
        config.fit.surrogate.class(),
        x.len(),
        inputs.len()
    );

    let mut surrogate = plugins.surrogate(&config.fit.surrogate)?;
    surrogate.train(&x, &y)?;
    if let Some(previous) = &config.fit.load {
        compare_with_previous(previous, &x, &y);
    }
    if let Some(parent) = save.parent() {
        fs::create_dir_all(parent)?;
    }
    surrogate.save(&save)?;
    info!("saved surrogate to {}", save.display());
    Ok(0)
}

/// Keeps samples whose values are all finite.
fn training_data(
    inputs: impl Iterator<Item = Vec<f64>>,
    outputs: impl Iterator<Item = Vec<f64>>,
) -> (Vec<Vec<f64>>, Vec<Vec<f64>>) {
    inputs
        .zip(outputs)
        .filter(|(x, y)| {
            !x.is_empty()
                && !y.is_empty()
                && x.iter().chain(y.iter()).all(|v| v.is_finite())
        })
        .unzip()
}

/// Reports how well a previously saved surrogate reproduces the samples.
fn compare_with_previous(path: &Path, x: &[Vec<f64>], y: &[Vec<f64>]) {
    let previous = match crate::campaign::surrogate::load(path) {
        Ok(s) => s,
        Err(e) => {
            warn!("can't load previous surrogate {}: {}", path.display(), e);
            return;
        }
    };
    match previous.predict(x) {
        Ok((mean, _)) => info!(
            "previous surrogate {}: mean absolute error {:.6}",
            path.display(),
            mean_absolute_error(&mean, y)
        ),
        Err(e) => warn!("previous surrogate doesn't fit the samples: {}", e),
    }
}

fn mean_absolute_error(predicted: &[Vec<f64>], expected: &[Vec<f64>]) -> f64 {
    let (sum, count) = predicted
        .iter()
        .zip(expected)
        .flat_map(|(p, e)| p.iter().zip(e))
        .fold((0., 0usize), |(sum, count), (p, e)| {
            (sum + (p - e).abs(), count + 1)
        });
    if count == 0 {
        0.
    } else {
        sum / count as f64
    }
}

pub fn start_clean(matches: &ArgMatches) -> Result<i32> {
    setup_log_verbosity(matches);
    let config = resolve(matches, &plugins())?;

    let mut targets: Vec<PathBuf> = util::run_dirs(&config.run.run_dir)?;
    for path in &[
        config.files.input.clone(),
        config.files.output.clone(),
        config.run.log_path.clone(),
        config.state_dir(),
    ] {
        if path.exists() && path != &config.base_dir {
            targets.push(path.clone());
        }
    }
    if targets.is_empty() {
        info!("nothing to clean in {}", config.base_dir.display());
        return Ok(0);
    }

    if !matches.is_present("yes") {
        println!("The following will be removed:");
        for target in &targets {
            println!("  {}", target.display());
        }
        if !util::confirm("Continue?")? {
            info!("aborted");
            return Ok(0);
        }
    }
    for target in &targets {
        debug!("removing {}", target.display());
        if target.is_dir() {
            fs::remove_dir_all(target)?;
        } else {
            fs::remove_file(target)?;
        }
    }
    info!("removed {} entries", targets.len());
    Ok(0)
}

fn level_filter(matches: &ArgMatches) -> simplelog::LevelFilter {
    use self::simplelog::LevelFilter;
    match matches.value_of("verbosity") {
        Some(s) => match s {
            "0" | "none" => LevelFilter::Off,
            "1" | "err" | "error" => LevelFilter::Error,
            "2" | "warn" | "warning" => LevelFilter::Warn,
            "3" | "info" => LevelFilter::Info,
            "4" | "debug" => LevelFilter::Debug,
            "5" | "trace" | "all" => LevelFilter::Trace,
            _ => LevelFilter::Info,
        },
        _ => LevelFilter::Info,
    }
}

fn setup_log_verbosity(matches: &ArgMatches) {
    use self::simplelog::{LevelFilter, SimpleLogger, TermLogger};
    let level_filter = level_filter(matches);
    let mut config_builder = simplelog::ConfigBuilder::new();
    let logger_conf = config_builder
        .set_time_level(LevelFilter::Error)
        .set_target_level(LevelFilter::Debug)
        .set_location_level(LevelFilter::Error)
        .set_time_format_str("%H:%M:%S%.6f")
        .build();
    // no terminal attached, e.g. under test harnesses
    if TermLogger::init(
        level_filter,
        logger_conf.clone(),
        simplelog::TerminalMode::Mixed,
    )
    .is_err()
    {
        let _ = SimpleLogger::init(level_filter, logger_conf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subcommands_parse() {
        let m = app()
            .get_matches_from_safe(vec!["campaign", "-v", "debug", "clean", "study", "--yes"])
            .unwrap();
        let (name, sub) = m.subcommand();
        assert_eq!(name, "clean");
        let sub = sub.unwrap();
        assert_eq!(sub.value_of("base-dir"), Some("study"));
        assert!(sub.is_present("yes"));
        assert_eq!(level_filter(sub), simplelog::LevelFilter::Debug);

        let m = app().get_matches_from_safe(vec!["campaign", "worker"]).unwrap();
        let (name, sub) = m.subcommand();
        assert_eq!(name, "worker");
        assert_eq!(level_filter(sub.unwrap()), simplelog::LevelFilter::Info);

        assert!(app().get_matches_from_safe(vec!["campaign"]).is_err());
    }

    #[test]
    fn unusable_samples_are_skipped() {
        let inputs = vec![vec![0., 1.], vec![1., 1.], vec![2., 1.], vec![]];
        let outputs = vec![vec![1.], vec![f64::NAN], vec![3.], vec![4.]];
        let (x, y) = training_data(inputs.into_iter(), outputs.into_iter());
        assert_eq!(x, vec![vec![0., 1.], vec![2., 1.]]);
        assert_eq!(y, vec![vec![1.], vec![3.]]);
    }

    #[test]
    fn absolute_error_is_averaged_over_cells() {
        let predicted = vec![vec![1., 2.], vec![3., 4.]];
        let expected = vec![vec![1., 1.], vec![1., 4.]];
        assert_eq!(mean_absolute_error(&predicted, &expected), 0.75);
        assert_eq!(mean_absolute_error(&[], &[]), 0.);
    }
}
