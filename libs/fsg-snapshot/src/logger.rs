//! The `logger` external collaborator (spec §1, §6): capability set
//! `{info, warn, error}`. Defaults to forwarding onto `tracing`.

use crate::error::Error;

pub trait SnapshotLogger: Send + Sync {
    fn info(&self, message: &str);
    fn warn(&self, message: &str);
    fn error(&self, message: &str);
}

/// Forwards to the `tracing` facade, matching the rest of the workspace's
/// logging idiom.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogger;

impl SnapshotLogger for TracingLogger {
    fn info(&self, message: &str) {
        tracing::info!("{message}");
    }

    fn warn(&self, message: &str) {
        tracing::warn!("{message}");
    }

    fn error(&self, message: &str) {
        tracing::error!("{message}");
    }
}

/// Logs `err` at `error` exactly once and returns it unchanged, so that
/// propagation through several call frames never logs twice (spec §7:
/// "the orchestrator wraps thrown values through a 'prethrow' helper").
pub fn prethrow(logger: &dyn SnapshotLogger, err: Error) -> Error {
    logger.error(&format!("[{}] {err}", err.as_code()));
    err
}
