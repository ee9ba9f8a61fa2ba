//! Channel naming for the bridge namespace.
//!
//! Channels are hierarchical strings rooted at `/sst/{app}/{stage}`:
//! the developer side listens on `…/in`, each worker on `…/{workerId}/in`.

/// Namespace prefix for one dev session.
pub fn prefix(app: &str, stage: &str) -> String {
    format!("/sst/{app}/{stage}")
}

/// The developer inbox: workers publish `Init`, `Ping`, `Next`, and
/// tunneled replies here.
pub fn dev_inbox(prefix: &str) -> String {
    format!("{prefix}/in")
}

/// A worker's inbox: the developer publishes `Ping`, `Reboot`, and
/// tunneled requests here.
pub fn worker_inbox(prefix: &str, worker_id: &str) -> String {
    format!("{prefix}/{worker_id}/in")
}
