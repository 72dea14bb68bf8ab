//! CLI-specific functionality
//!
//! Argument parsing, configuration discovery and the demo workload.

pub mod args;
pub mod config;
pub mod demo;

pub use args::{Args, Commands};
pub use config::ConfigDiscovery;
pub use demo::DemoPipeline;
