//! Dev-bridge configuration.
//!
//! Loaded with figment: compiled-in defaults overlaid with `SST_*`
//! environment variables, the same variables the remote shims consume.

use std::path::PathBuf;

use figment::{
    Figment,
    providers::{Env, Serialized},
};
use serde::{Deserialize, Serialize};

const ENV_PREFIX: &str = "SST_";

/// Configuration of one dev session's bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Application name; first channel namespace token.
    pub app: String,
    /// Stage name; second channel namespace token.
    pub stage: String,
    /// AppSync Events HTTP endpoint (`SST_APPSYNC_HTTP`).
    pub appsync_http: String,
    /// AppSync Events realtime endpoint (`SST_APPSYNC_REALTIME`).
    pub appsync_realtime: String,
    /// Address the local Runtime API adapter binds to. Port 0 picks a free
    /// port.
    pub bind: String,
    /// Directory per-request log files are written under.
    pub log_directory: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            app: String::new(),
            stage: String::new(),
            appsync_http: String::new(),
            appsync_realtime: String::new(),
            bind: "127.0.0.1:0".to_string(),
            log_directory: PathBuf::from(".sst/log"),
        }
    }
}

impl Config {
    /// Loads defaults overlaid with `SST_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns a figment error if an override fails to parse.
    pub fn load() -> Result<Self, Box<figment::Error>> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Env::prefixed(ENV_PREFIX))
            .extract()
            .map_err(Box::new)?;
        Ok(config)
    }
}
