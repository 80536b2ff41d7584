//! Daemon configuration loaded from environment variables.
//!
//! A `.env` file in the working directory, when present, is applied to the
//! process environment first so containerized and local runs read the same
//! keys.

use std::path::{Path, PathBuf};

use thiserror::Error;

pub const DEFAULT_SYNC_DIR: &str = "./data";
pub const DEFAULT_SOCKET_URL: &str = "wss://socket.filen.io:443";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} environment variable not set")]
    Missing(&'static str),

    #[error("invalid {key}: {source}")]
    InvalidNumber {
        key: &'static str,
        source: std::num::ParseIntError,
    },
}

/// Runtime configuration for the mirror daemon.
#[derive(Debug, Clone)]
pub struct Config {
    /// Account login identity.
    pub email: String,
    /// Account login credential.
    pub password: String,
    /// Base32 shared secret for one-time passwords.
    pub totp_secret: String,
    pub totp_digits: u32,
    /// One-time password period in seconds.
    pub totp_period: u64,
    /// Local root the remote tree is mirrored under.
    pub sync_dir: PathBuf,
    /// Live-event socket endpoint.
    pub socket_url: String,
}

impl Config {
    /// Load configuration from the environment.
    ///
    /// Required keys: `FILEN_EMAIL`, `FILEN_PASSWORD`, `TOTP_SECRET`,
    /// `TOTP_DIGITS`, `TOTP_PERIOD`. `FILEN_SYNC_DIR` and
    /// `FILEN_SOCKET_URL` fall back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        apply_dotenv(Path::new(".env"));

        let totp_digits = required("TOTP_DIGITS")?
            .parse()
            .map_err(|source| ConfigError::InvalidNumber {
                key: "TOTP_DIGITS",
                source,
            })?;
        let totp_period = required("TOTP_PERIOD")?
            .parse()
            .map_err(|source| ConfigError::InvalidNumber {
                key: "TOTP_PERIOD",
                source,
            })?;

        Ok(Self {
            email: required("FILEN_EMAIL")?,
            password: required("FILEN_PASSWORD")?,
            totp_secret: required("TOTP_SECRET")?,
            totp_digits,
            totp_period,
            sync_dir: PathBuf::from(env_or("FILEN_SYNC_DIR", DEFAULT_SYNC_DIR)),
            socket_url: env_or("FILEN_SOCKET_URL", DEFAULT_SOCKET_URL),
        })
    }
}

fn required(key: &'static str) -> Result<String, ConfigError> {
    match std::env::var(key) {
        Ok(value) if !value.is_empty() => Ok(value),
        _ => Err(ConfigError::Missing(key)),
    }
}

fn env_or(key: &str, default: &str) -> String {
    match std::env::var(key) {
        Ok(value) if !value.is_empty() => value,
        _ => default.to_string(),
    }
}

/// Apply `KEY=VALUE` lines from a dotenv file to the process environment.
/// Missing files and malformed lines are ignored.
fn apply_dotenv(path: &Path) {
    let Ok(contents) = std::fs::read_to_string(path) else {
        return;
    };
    for line in contents.lines() {
        if let Some((key, value)) = line.split_once('=') {
            std::env::set_var(key.trim(), value.trim());
        }
    }
}
