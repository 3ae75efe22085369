//! Persisted record shapes (spec.md §3, supplemented per SPEC_FULL.md §3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::tid::Tid;

/// A repository the orchestrator has been installed/registered against.
/// Created on installation or explicit registration; never silently
/// renamed once persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredRepository {
    /// `<platform>:<owner>/<repo>` — unique.
    pub repo_prefix: String,
    pub display_name: String,
    /// Safe on-disk identifier — unique, validated by [`crate::folder::validate_folder_name`].
    pub folder: String,
    pub trigger_pattern: Option<String>,
    pub container_config: ContainerConfigOverride,
    pub requires_trigger: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerConfigOverride {
    pub timeout_ms: Option<u64>,
    pub additional_mounts: Vec<MountRequest>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountRequest {
    pub host_path: String,
    pub container_path: String,
    pub read_write: bool,
}

/// An immutable inbound message persisted to the chat's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Unique per chat — used as the upsert key together with `chat`.
    pub delivery_id: String,
    pub chat: Tid,
    pub sender_handle: String,
    pub sender_display: String,
    /// Structured text the agent will see (already prompt-formatted).
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub is_bot: bool,
}

/// Retained 24h solely to make webhook ingestion idempotent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessedEventRecord {
    pub delivery_id: String,
    pub processed_at: DateTime<Utc>,
}

/// `folder -> agent-session-id`, survives container restarts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub folder: String,
    pub agent_session_id: String,
}

/// `chat TID -> last-processed-timestamp`, advanced only on a clean run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentCursor {
    pub chat: Tid,
    pub last_processed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleKind {
    Cron,
    Interval,
    Once,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextMode {
    Group,
    Isolated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Active,
    Paused,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub id: i64,
    pub folder: String,
    pub chat: Tid,
    pub prompt: String,
    pub schedule_kind: ScheduleKind,
    /// Cron expression, interval milliseconds (as string), or RFC3339
    /// instant, depending on `schedule_kind`.
    pub schedule_value: String,
    pub context_mode: ContextMode,
    pub next_run: Option<DateTime<Utc>>,
    pub last_run: Option<DateTime<Utc>>,
    pub last_result: Option<String>,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOutcome {
    Completed,
    Failed,
}

/// Operator-visible record of one scheduled-task firing. Additive:
/// nothing in the control flow reads it back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRunLog {
    pub task_id: i64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: TaskOutcome,
    pub summary: Option<String>,
}

/// A source-control platform's channel identity. Only one variant is
/// anticipated (spec.md §9 design note: "a small variant set").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelPlatform {
    Github,
}

impl ChannelPlatform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Github => "github",
        }
    }

    pub fn owns(&self, tid: &Tid) -> bool {
        tid.platform == self.as_str()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_owns_matching_platform() {
        let tid: Tid = "github:acme/widgets#issue:1".parse().unwrap();
        assert!(ChannelPlatform::Github.owns(&tid));
    }

    #[test]
    fn channel_does_not_own_other_platform() {
        let tid: Tid = "gitlab:acme/widgets#issue:1".parse().unwrap();
        assert!(!ChannelPlatform::Github.owns(&tid));
    }
}
