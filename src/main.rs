//! Runs one experiment scenario against the hosts listed in a JSON options file, then prints
//! what went wrong, if anything.

use std::sync::atomic::Ordering;

use console::style;

use perfiso_runner::{Experiment, ExperimentConfig, RunnerError, SCENARIOS};

fn run() -> Result<i32, failure::Error> {
    let matches = clap::App::new("runner")
        .about(
            "Runs a performance isolation experiment. The options file is a JSON object naming \
             the hosts, the output directory and any scenario-specific options.",
        )
        .arg(
            clap::Arg::with_name("SCENARIO")
                .required(true)
                .possible_values(SCENARIOS)
                .help("The experiment to run."),
        )
        .arg(
            clap::Arg::with_name("OPTIONS")
                .required(true)
                .help("Path to the JSON options file."),
        )
        .setting(clap::AppSettings::DisableVersion)
        .get_matches();

    // Both are required, so clap has already rejected their absence.
    let name = matches.value_of("SCENARIO").unwrap_or_default();
    let path = matches.value_of("OPTIONS").unwrap_or_default();

    let options: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(path)?)?;

    // Options are checked in full before any host is contacted.
    let mut scenario = perfiso_runner::scenario(name, &options)?;
    scenario.validate(&ExperimentConfig::from_options(&options)?)?;
    let mut exp = Experiment::connect(&options)?;

    let cancel = exp.cancel_flag();
    ctrlc::set_handler(move || {
        cancel.store(true, Ordering::SeqCst);
    })?;

    let report = exp.run(scenario.as_mut());

    let summary = format!("{}: {}", scenario.name(), report);
    if report.is_success() {
        println!("{}", style(summary).green().bold());
    } else {
        println!("{}", style(summary).red().bold());
    }
    println!("Results in {}", exp.config().dir);

    Ok(report.exit_code())
}

fn main() {
    env_logger::init();

    // Always get backtraces. The performance penalty is irrelevant next to the experiment.
    std::env::set_var("RUST_BACKTRACE", "1");

    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            const MESSAGE: &str = r#"== ERROR ==================================================================================
`runner` encountered an error before the experiment could run. If the error pertains to SSH, you
may be able to get useful information by setting the RUST_LOG=debug environment variable.
"#;

            println!("{}", style(MESSAGE).red().bold());

            match err.downcast_ref::<RunnerError>() {
                Some(RunnerError::Connection { host, .. }) => {
                    println!("Could not connect to {}", host);
                }
                Some(RunnerError::Configuration { .. }) => {
                    println!("The options file is not valid");
                }
                _ => {}
            }

            // Errors from SSH commands
            if err.downcast_ref::<spurs::SshError>().is_some() {
                println!("An error occurred while attempting to run a command over SSH");
            }

            println!(
                "`runner` encountered the following error:\n{}\n{}",
                err.as_fail(),
                err.backtrace(),
            );

            std::process::exit(101);
        }
    }
}
