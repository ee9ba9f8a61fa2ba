//! Live-Lambda Dev Bridge - integration tests for the bridge workspace.
//!
//! This is a virtual package that provides workspace-level integration
//! tests. The actual functionality is provided by the workspace member
//! crates:
//!
//! - `appsync-events`: AppSync Events realtime connection with SigV4 auth
//! - `bridge-protocol`: packet framing, ordered reassembly, HTTP tunneling
//! - `dev-bridge`: local worker controller, runtime abstraction, adapter
//! - `bridge-shim`: the remote Lambda runtime and container task shims
//! - `mock-appsync`: in-process AppSync Events server for tests
