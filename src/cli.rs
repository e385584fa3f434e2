use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "vmharness",
    about = "Scripted system tests for emulated machines",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Launch the emulator and run a scenario file against it
    Run {
        /// Path to the scenario (.toml)
        scenario: PathBuf,

        /// Target architecture (overrides the scenario and config)
        #[arg(long)]
        arch: Option<String>,

        /// Run name used for the artifact directory (defaults to the
        /// scenario's name)
        #[arg(long)]
        name: Option<String>,
    },

    /// Parse a scenario file and compile its patterns without launching
    Check {
        /// Path to the scenario (.toml)
        scenario: PathBuf,
    },

    /// Show harness configuration
    Config {
        /// Emit machine-readable JSON
        #[arg(long)]
        json: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_parses_overrides() {
        let cli = Cli::parse_from([
            "vmharness", "-vv", "run", "login.toml", "--arch", "armv7", "--name", "smoke",
        ]);
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Command::Run {
                scenario,
                arch,
                name,
            } => {
                assert_eq!(scenario, PathBuf::from("login.toml"));
                assert_eq!(arch.as_deref(), Some("armv7"));
                assert_eq!(name.as_deref(), Some("smoke"));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn config_json_flag() {
        let cli = Cli::parse_from(["vmharness", "config", "--json"]);
        assert!(matches!(cli.command, Command::Config { json: true }));
    }

    #[test]
    fn check_requires_scenario() {
        assert!(Cli::try_parse_from(["vmharness", "check"]).is_err());
    }
}
