//! Shared domain types for the codeclaw orchestrator.
//!
//! These are the pure, serde-able shapes and pure functions both the
//! runtime engine and the host binary depend on: thread identifiers,
//! the persisted record shapes, folder-name grammar, outbound prompt
//! formatting, and collaborator-permission ranking.

pub mod folder;
pub mod models;
pub mod permission;
pub mod prompt;
pub mod tid;

pub use folder::{FolderError, validate_folder_name};
pub use models::*;
pub use permission::PermissionLevel;
pub use prompt::{escape_xml, format_messages, format_outbound, strip_internal_tags};
pub use tid::{Tid, TidError, ThreadKind};
