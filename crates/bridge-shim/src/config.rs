//! Shim configuration from `SST_*` environment variables.

use figment::{
    Figment,
    providers::{Env, Serialized},
};
use serde::{Deserialize, Serialize};

const ENV_PREFIX: &str = "SST_";

/// Configuration for the function shim (`SST_APP`, `SST_STAGE`,
/// `SST_FUNCTION_ID`, `SST_REGION`, `SST_APPSYNC_HTTP`,
/// `SST_APPSYNC_REALTIME`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FunctionConfig {
    pub app: String,
    pub stage: String,
    pub function_id: String,
    pub region: String,
    pub appsync_http: String,
    pub appsync_realtime: String,
}

impl FunctionConfig {
    /// Loads the config from the environment.
    ///
    /// # Errors
    ///
    /// Returns a figment error if a variable fails to parse.
    pub fn load() -> Result<Self, Box<figment::Error>> {
        Figment::new()
            .merge(Serialized::defaults(FunctionConfig::default()))
            .merge(Env::prefixed(ENV_PREFIX))
            .extract()
            .map_err(Box::new)
    }
}

/// Configuration for the task shim (`SST_TASK_ID` instead of a function
/// id).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    pub app: String,
    pub stage: String,
    pub task_id: String,
    pub region: String,
    pub appsync_http: String,
    pub appsync_realtime: String,
}

impl TaskConfig {
    /// Loads the config from the environment.
    ///
    /// # Errors
    ///
    /// Returns a figment error if a variable fails to parse.
    pub fn load() -> Result<Self, Box<figment::Error>> {
        Figment::new()
            .merge(Serialized::defaults(TaskConfig::default()))
            .merge(Env::prefixed(ENV_PREFIX))
            .extract()
            .map_err(Box::new)
    }
}
