//! Path constants for configuration, database and log files.

use std::path::PathBuf;

/// The name of the configuration directory under ~/.config/
pub const CONFIG_DIR_NAME: &str = "listenlog";

/// The name of the main configuration file
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// The name of the listen history database file
pub const LISTENS_DB_FILE_NAME: &str = "listens.db";

/// The name of the log file written when file logging is enabled
pub const LOG_FILE_NAME: &str = "listenlog.log";

/// Get the configuration directory path (~/.config/listenlog/)
#[must_use]
pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join(CONFIG_DIR_NAME)
}

/// Get the config file path (~/.config/listenlog/config.toml)
#[must_use]
pub fn config_path() -> PathBuf {
    config_dir().join(CONFIG_FILE_NAME)
}

/// Get the default listen history database path (`~/.config/listenlog/listens.db`)
#[must_use]
pub fn listens_db_path() -> PathBuf {
    config_dir().join(LISTENS_DB_FILE_NAME)
}

/// Get the log file path (`~/.config/listenlog/listenlog.log`)
#[must_use]
pub fn log_file_path() -> PathBuf {
    config_dir().join(LOG_FILE_NAME)
}
