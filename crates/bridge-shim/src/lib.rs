//! # Bridge Shim
//!
//! The remote side of the live-lambda dev bridge. Two binaries:
//!
//! - `bridge` replaces the customer handler inside a Lambda execution
//!   environment. On each invocation it pings the developer over the
//!   bridge, tunnels the Lambda Runtime API to the developer's machine,
//!   and returns whatever the local worker produced as the function
//!   result. When nobody is listening it answers with a fixed fallback
//!   response after three seconds so the caller fails fast.
//! - `bridge-task` runs as a container task's entrypoint: it announces
//!   `TaskStart` with the container environment (credentials included) and
//!   idles until the developer's locally-run task completes.

pub mod config;
pub mod environment;
pub mod error;
pub mod function;
pub mod task;

pub use config::{FunctionConfig, TaskConfig};
pub use error::{Error, Result};
