//! Environment capture for `Init` and `TaskStart` announcements.
//!
//! The worker on the developer's machine runs with the remote
//! environment, minus variables that only make sense inside the Lambda
//! sandbox.

/// Variables never forwarded to local workers.
const DENYLIST: &[&str] = &[
    "SST_DEBUG_ENDPOINT",
    "SST_DEBUG_SRC_HANDLER",
    "SST_DEBUG_SRC_PATH",
    "AWS_LAMBDA_FUNCTION_MEMORY_SIZE",
    "AWS_LAMBDA_LOG_GROUP_NAME",
    "AWS_LAMBDA_LOG_STREAM_NAME",
    "LD_LIBRARY_PATH",
    "LAMBDA_TASK_ROOT",
    "AWS_LAMBDA_RUNTIME_API",
    "AWS_EXECUTION_ENV",
    "AWS_XRAY_DAEMON_ADDRESS",
    "AWS_LAMBDA_INITIALIZATION_TYPE",
    "PATH",
    "PWD",
    "LAMBDA_RUNTIME_DIR",
    "LANG",
    "NODE_PATH",
    "SHLVL",
    "AWS_XRAY_DAEMON_PORT",
    "AWS_XRAY_CONTEXT_MISSING",
    "_HANDLER",
    "_LAMBDA_CONSOLE_SOCKET",
    "_LAMBDA_CONTROL_SOCKET",
    "_LAMBDA_LOG_FD",
    "_LAMBDA_RUNTIME_LOAD_TIME",
    "_LAMBDA_SB_ID",
    "_LAMBDA_SERVER_PORT",
    "_LAMBDA_SHARED_MEM_FD",
];

/// Collects `KEY=value` pairs from the process environment, dropping the
/// denylisted Lambda internals.
pub fn filtered() -> Vec<String> {
    std::env::vars()
        .filter(|(key, _)| !DENYLIST.contains(&key.as_str()))
        .map(|(key, value)| format!("{key}={value}"))
        .collect()
}

/// Collects the full environment as `KEY=value` pairs (tasks forward
/// everything).
pub fn all() -> Vec<String> {
    std::env::vars()
        .map(|(key, value)| format!("{key}={value}"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filtered_drops_lambda_internals() {
        temp_env::with_vars(
            [
                ("_HANDLER", Some("index.handler")),
                ("BRIDGE_TEST_KEEP", Some("1")),
            ],
            || {
                let env = filtered();
                assert!(env.iter().any(|e| e == "BRIDGE_TEST_KEEP=1"));
                assert!(!env.iter().any(|e| e.starts_with("_HANDLER=")));
            },
        );
    }
}
