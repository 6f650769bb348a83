//! Configuration with defaults and environment overrides.

use std::path::PathBuf;

/// Startup configuration for the Keystone binary.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding the table files; its `-recovery` sibling holds the
    /// checkpoint snapshot.
    pub db_dir: PathBuf,

    /// Path of the write-ahead log.
    pub log_file: PathBuf,

    /// Whether the REPL prints a prompt.
    pub show_prompt: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_dir: PathBuf::from("keystone_data"),
            log_file: PathBuf::from("keystone.log"),
            show_prompt: true,
        }
    }
}

impl Config {
    /// Reads overrides from `KEYSTONE_DB_DIR`, `KEYSTONE_LOG_FILE` and
    /// `KEYSTONE_PROMPT`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(dir) = std::env::var("KEYSTONE_DB_DIR") {
            config.db_dir = PathBuf::from(dir);
        }
        if let Ok(file) = std::env::var("KEYSTONE_LOG_FILE") {
            config.log_file = PathBuf::from(file);
        }
        if let Ok(flag) = std::env::var("KEYSTONE_PROMPT") {
            config.show_prompt = flag != "0";
        }
        config
    }

    pub fn prompt(&self) -> &'static str {
        if self.show_prompt {
            "> "
        } else {
            ""
        }
    }
}
