//! Process-wide error types (spec.md §7; SPEC_FULL.md §7 "ambient: Rust shape").
//!
//! Subsystem enums that belong to the stateful engine (`StoreError`,
//! `TokenError`, `MountError`, `SupervisorError`, `IpcError`) live in
//! `codeclaw_runtime::errors` and are re-exported here. This module
//! adds the ones specific to the process boundary: webhook ingress and
//! a catch-all bridging to `anyhow`, mirroring the teacher's
//! `FactoryError::Other(#[from] anyhow::Error)` pattern.

use thiserror::Error;

pub use codeclaw_runtime::{DispatchError, IpcError, MountError, StoreError, SupervisorError, TokenError};

#[derive(Debug, Error)]
pub enum IngressError {
    #[error("missing required header: {0}")]
    MissingHeader(&'static str),
    #[error("webhook signature does not match")]
    BadSignature,
    #[error("payload is not valid json: {0}")]
    MalformedJson(#[from] serde_json::Error),
    #[error("server is not yet ready to accept webhooks")]
    NotReady,
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error(transparent)]
    Mount(#[from] MountError),
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
    #[error(transparent)]
    Ipc(#[from] IpcError),
    #[error(transparent)]
    Ingress(#[from] IngressError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ingress_error_messages_name_the_missing_header() {
        let err = IngressError::MissingHeader("signature");
        assert_eq!(err.to_string(), "missing required header: signature");
    }

    #[test]
    fn app_error_wraps_anyhow_transparently() {
        let source = anyhow::anyhow!("boom");
        let wrapped: AppError = source.into();
        assert_eq!(wrapped.to_string(), "boom");
    }
}
