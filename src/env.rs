//! Environment constants and path utilities.
//!
//! Every file and directory name the crate reads or writes lives here so the
//! on-disk layout can be changed in one place.

use std::path::{Path, PathBuf};

/// Application directory name (hidden, like .git)
pub const APP_DIR_NAME: &str = ".infomine";

/// Configuration file name inside the application directory
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Configuration file name looked up directly in the working directory
pub const LOCAL_CONFIG_FILE_NAME: &str = "infomine.toml";

/// System-wide configuration directory
pub const SYSTEM_CONFIG_DIR: &str = "/etc/infomine";

/// Execution log and shutdown event file names
pub mod persistence {
    /// Directory under the application directory holding JSON lines logs
    pub const DATA_DIR_NAME: &str = "data";

    /// One JSON-encoded execution per line
    pub const EXECUTIONS_FILE_NAME: &str = "executions.jsonl";

    /// One JSON-encoded shutdown event per line
    pub const EVENTS_FILE_NAME: &str = "shutdown_events.jsonl";
}

/// Build the application directory path from a workspace root
pub fn app_dir_path(workspace_root: &Path) -> PathBuf {
    workspace_root.join(APP_DIR_NAME)
}

/// Build the data directory path from a workspace root
pub fn data_dir_path(workspace_root: &Path) -> PathBuf {
    app_dir_path(workspace_root).join(persistence::DATA_DIR_NAME)
}

pub fn executions_file_path(data_dir: &Path) -> PathBuf {
    data_dir.join(persistence::EXECUTIONS_FILE_NAME)
}

pub fn events_file_path(data_dir: &Path) -> PathBuf {
    data_dir.join(persistence::EVENTS_FILE_NAME)
}

/// Config directory in the user's home directory
pub fn user_config_dir_path(home_dir: &Path) -> PathBuf {
    home_dir.join(APP_DIR_NAME)
}

/// Config file in the user's home directory
pub fn user_config_file_path(home_dir: &Path) -> PathBuf {
    user_config_dir_path(home_dir).join(CONFIG_FILE_NAME)
}

/// `infomine.toml` in the given directory
pub fn local_config_file_path(current_dir: &Path) -> PathBuf {
    current_dir.join(LOCAL_CONFIG_FILE_NAME)
}

/// `.infomine/config.toml` in the given directory
pub fn project_config_file_path(current_dir: &Path) -> PathBuf {
    app_dir_path(current_dir).join(CONFIG_FILE_NAME)
}

pub fn system_config_file_path() -> PathBuf {
    Path::new(SYSTEM_CONFIG_DIR).join(CONFIG_FILE_NAME)
}
