//! Command line argument parsing
//!
//! Subcommands:
//! - `status`: Sample host resources and print the concurrency recommendation
//! - `demo`: Run a synthetic crawl → extract → summarize pipeline
//! - `show-config`: Show configuration discovery information
//! - `init-config`: Write a default configuration file

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "infomine")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(
    about = "Resource-adaptive worker pool and dependency-aware task manager for crawl and extraction pipelines"
)]
#[command(long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Args {
    /// Configuration file path (skips discovery)
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short = 'v', long = "verbose", global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand, PartialEq)]
pub enum Commands {
    /// Sample host resources and print snapshots
    Status {
        /// Number of samples to take, one sampling interval apart
        #[arg(short = 'n', long = "samples", default_value_t = 3)]
        samples: usize,
    },
    /// Run a synthetic crawl → extract → summarize pipeline
    Demo {
        /// Number of crawl tasks feeding the extractor
        #[arg(long = "tasks", default_value_t = 3)]
        tasks: usize,
        /// Probability in [0, 1] that a crawl attempt fails transiently
        #[arg(long = "fail-rate", default_value_t = 0.0, value_parser = parse_fail_rate)]
        fail_rate: f64,
    },
    /// Show configuration discovery information
    ShowConfig,
    /// Write a default configuration file
    InitConfig {
        /// Destination path
        path: PathBuf,
        /// Overwrite an existing file
        #[arg(short = 'f', long = "force")]
        force: bool,
    },
}

impl Args {
    /// Default tracing filter when `RUST_LOG` is not set
    pub fn log_filter(&self) -> &'static str {
        if self.verbose {
            "infomine=debug"
        } else {
            "infomine=info"
        }
    }
}

fn parse_fail_rate(value: &str) -> Result<f64, String> {
    let rate: f64 = value
        .parse()
        .map_err(|_| format!("'{}' is not a number", value))?;
    if !(0.0..=1.0).contains(&rate) {
        return Err(format!("fail rate must be within [0, 1], got {}", rate));
    }
    Ok(rate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_defaults() {
        let args = Args::try_parse_from(["infomine", "status"]).unwrap();
        assert_eq!(args.command, Commands::Status { samples: 3 });
        assert!(!args.verbose);
        assert_eq!(args.log_filter(), "infomine=info");
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let args = Args::try_parse_from([
            "infomine",
            "demo",
            "--tasks",
            "5",
            "--fail-rate",
            "0.25",
            "-v",
            "-c",
            "pipeline.toml",
        ])
        .unwrap();

        assert_eq!(
            args.command,
            Commands::Demo {
                tasks: 5,
                fail_rate: 0.25
            }
        );
        assert!(args.verbose);
        assert_eq!(args.config, Some(PathBuf::from("pipeline.toml")));
        assert_eq!(args.log_filter(), "infomine=debug");
    }

    #[test]
    fn test_fail_rate_out_of_range_rejected() {
        assert!(Args::try_parse_from(["infomine", "demo", "--fail-rate", "1.5"]).is_err());
        assert!(Args::try_parse_from(["infomine", "demo", "--fail-rate", "often"]).is_err());
    }

    #[test]
    fn test_init_config_requires_path() {
        assert!(Args::try_parse_from(["infomine", "init-config"]).is_err());
        let args = Args::try_parse_from(["infomine", "init-config", "out.toml", "--force"]).unwrap();
        assert_eq!(
            args.command,
            Commands::InitConfig {
                path: PathBuf::from("out.toml"),
                force: true
            }
        );
    }
}
