use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use vmharness::cli::{Cli, Command};
use vmharness::config::{HarnessConfig, render_config_human, render_config_json};
use vmharness::scenario::run_scenario;
use vmharness::scenario::script::Scenario;
use vmharness::session::Session;

fn main() -> Result<()> {
    let cli = Cli::parse();
    let is_config_command = matches!(&cli.command, Command::Config { .. });

    let filter = match cli.verbose {
        0 if is_config_command => "vmharness=warn",
        0 => "vmharness=info",
        1 => "vmharness=debug",
        _ => "vmharness=trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let cwd = std::env::current_dir().context("failed to get current directory (was it deleted?)")?;
    let (config, config_path) = HarnessConfig::load(&cwd)?;

    if !is_config_command || cli.verbose > 0 {
        match config_path {
            Some(ref p) => info!("loaded config from {}", p.display()),
            None => info!("no .vmharness/config.toml found, using defaults"),
        }
    }

    match cli.command {
        Command::Run {
            scenario,
            arch,
            name,
        } => {
            let script = Scenario::load(&scenario)?;
            if let Err((step, failure)) = script.validate() {
                anyhow::bail!("{}: step {step}: {failure}", scenario.display());
            }

            let arch = arch
                .or_else(|| script.arch.clone())
                .unwrap_or_else(|| config.launch.arch.clone());
            let name = name.unwrap_or_else(|| script.name.clone());
            let project_root = HarnessConfig::project_root(config_path.as_deref(), &cwd);

            let mut session = Session::launch(&config, &project_root, &arch, &name)
                .with_context(|| format!("failed to start session '{name}' ({arch})"))?;
            let result = run_scenario(&mut session, |s| script.run(s));
            let teardown = session.finish();

            match result {
                Ok(()) => {
                    if let Err(e) = teardown {
                        warn!(error = %e, "emulator did not shut down cleanly");
                    }
                    println!("--- PASSED: {name} ({arch})");
                    println!("artifacts: {}", session.artifacts().path().display());
                }
                Err(failure) => {
                    if let Err(e) = teardown {
                        warn!(error = %e, "emulator did not shut down cleanly");
                    }
                    println!("TEST FAILURE: {failure}");
                    drop(session);
                    std::process::exit(1);
                }
            }
        }
        Command::Check { scenario } => {
            let script = Scenario::load(&scenario)?;
            match script.validate() {
                Ok(()) => println!(
                    "{}: '{}' ok ({} steps)",
                    scenario.display(),
                    script.name,
                    script.steps.len()
                ),
                Err((step, failure)) => {
                    anyhow::bail!("{}: step {step}: {failure}", scenario.display());
                }
            }
        }
        Command::Config { json } => {
            if json {
                println!("{}", render_config_json(&config, config_path.as_deref())?);
            } else {
                print!("{}", render_config_human(&config, config_path.as_deref()));
            }
        }
    }

    Ok(())
}
