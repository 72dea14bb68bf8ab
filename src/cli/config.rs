//! Configuration discovery and loading
//!
//! This module handles the configuration discovery hierarchy:
//! 1. Current directory: ./infomine.toml or ./.infomine/config.toml
//! 2. User config: ~/.infomine/config.toml
//! 3. System config: /etc/infomine/config.toml
//! 4. Built-in defaults

use crate::env;
use crate::orchestrator::OrchestratorConfig;
use anyhow::{Context, Result, bail};
use std::env as std_env;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Configuration discovery system
pub struct ConfigDiscovery;

impl ConfigDiscovery {
    /// Load `explicit` if given, otherwise the first file found in the
    /// hierarchy, otherwise the defaults. Returns the file that was used.
    pub fn load(explicit: Option<&Path>) -> Result<(OrchestratorConfig, Option<PathBuf>)> {
        if let Some(path) = explicit {
            info!("Loading configuration override from: {:?}", path);
            let config = OrchestratorConfig::from_toml_file(path)?;
            return Ok((config, Some(path.to_path_buf())));
        }
        if let Some(path) = Self::find_config_file() {
            info!("Loading configuration from: {:?}", path);
            let config = OrchestratorConfig::from_toml_file(&path)?;
            return Ok((config, Some(path)));
        }
        info!("No configuration file found, using defaults");
        Ok((OrchestratorConfig::default(), None))
    }

    /// Find configuration file using discovery hierarchy
    pub fn find_config_file() -> Option<PathBuf> {
        for candidate in Self::config_candidates() {
            debug!("Checking for config file: {:?}", candidate);
            if candidate.is_file() {
                debug!("Found config file: {:?}", candidate);
                return Some(candidate);
            }
        }
        debug!("No config file found in discovery hierarchy");
        None
    }

    /// Configuration file candidates in priority order
    pub fn config_candidates() -> Vec<PathBuf> {
        let current_dir = std_env::current_dir().ok();
        let home_dir = Self::home_dir();
        Self::candidates_for(current_dir.as_deref(), home_dir.as_deref())
    }

    fn candidates_for(current_dir: Option<&Path>, home_dir: Option<&Path>) -> Vec<PathBuf> {
        let mut candidates = Vec::new();
        if let Some(current_dir) = current_dir {
            candidates.push(env::local_config_file_path(current_dir));
            candidates.push(env::project_config_file_path(current_dir));
        }
        if let Some(home_dir) = home_dir {
            candidates.push(env::user_config_file_path(home_dir));
        }
        #[cfg(unix)]
        candidates.push(env::system_config_file_path());
        candidates
    }

    fn home_dir() -> Option<PathBuf> {
        std_env::var("HOME")
            .ok()
            .or_else(|| std_env::var("USERPROFILE").ok())
            .map(PathBuf::from)
    }

    /// Write the default configuration to `path`
    pub fn write_default_config(path: &Path, force: bool) -> Result<()> {
        if path.exists() && !force {
            bail!(
                "Configuration file already exists: {} (use --force to overwrite)",
                path.display()
            );
        }
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        OrchestratorConfig::default().to_toml_file(path)?;
        info!("Created default configuration file: {:?}", path);
        Ok(())
    }

    /// Show configuration discovery information for debugging
    pub fn show_discovery_info() {
        println!("Configuration Discovery Hierarchy:");
        println!();

        for (i, candidate) in Self::config_candidates().iter().enumerate() {
            let status = if candidate.is_file() {
                "✓ EXISTS"
            } else if candidate.exists() {
                "✗ NOT A FILE"
            } else {
                "✗ NOT FOUND"
            };
            println!("  {}. {:?} - {}", i + 1, candidate, status);
        }

        println!();
        match Self::find_config_file() {
            Some(found) => println!("Active configuration: {:?}", found),
            None => println!("Active configuration: Built-in defaults"),
        }
    }
}
