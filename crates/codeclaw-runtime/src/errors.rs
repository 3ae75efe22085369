//! Typed error hierarchy, one enum per subsystem (spec.md §7).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("failed to (de)serialize stored json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("stored thread id is malformed: {0}")]
    Tid(#[from] codeclaw_common::TidError),
    #[error("{0} not found")]
    NotFound(String),
}

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("failed to sign app jwt: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),
    #[error("app private key could not be read: {0}")]
    KeyUnreadable(String),
    #[error("installation token request failed: {0}")]
    Http(String),
    #[error("no installation found for {owner}/{repo}")]
    NoInstallation { owner: String, repo: String },
}

#[derive(Debug, Error)]
pub enum MountError {
    #[error("mount allow-list is missing or unreadable; refusing all additional mounts")]
    AllowlistUnavailable,
    #[error("container path must be a non-empty absolute path without '..'")]
    InvalidContainerPath,
    #[error("host path {0} does not exist")]
    HostPathMissing(String),
    #[error("host path {0} contains a blocked segment '{1}'")]
    BlockedSegment(String, String),
    #[error("host path {0} is not under any allowed root")]
    OutsideAllowedRoots(String),
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("docker is not available")]
    DockerUnavailable,
    #[error("failed to spawn container: {0}")]
    SpawnFailed(#[source] bollard::errors::Error),
    #[error("container exited {exit_code} with no output: {stderr_tail}")]
    NonZeroExitNoOutput { exit_code: i64, stderr_tail: String },
    #[error("mount request rejected: {0}")]
    Mount(#[from] MountError),
}

#[derive(Debug, Error)]
pub enum IpcError {
    #[error("could not read ipc file {0}: {1}")]
    Unreadable(String, String),
    #[error("ipc file {0} is not valid json: {1}")]
    MalformedJson(String, String),
    #[error("folder '{sender_folder}' is not authorized to target thread owned by folder '{owner_folder}'")]
    Unauthorized {
        sender_folder: String,
        owner_folder: String,
    },
    #[error("unknown ipc message type '{0}'")]
    UnknownType(String),
    #[error("task {0} not found")]
    UnknownFolder(String),
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("dispatch queue is shutting down")]
    ShuttingDown,
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
    #[error(transparent)]
    Store(#[from] StoreError),
}
