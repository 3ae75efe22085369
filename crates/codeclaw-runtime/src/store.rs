//! C1 Store — single-writer embedded relational store.
//!
//! All methods are synchronous; cross-process concurrency is out of
//! scope (single host). [`StoreHandle`] is the thin `Arc<Mutex<_>>`
//! callers actually hold, mirroring the host's `DbHandle` convention.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use codeclaw_common::{
    ContainerConfigOverride, ContextMode, Message, RegisteredRepository, ScheduleKind,
    ScheduledTask, Session, TaskOutcome, TaskRunLog, TaskStatus, Tid,
};
use rusqlite::{Connection, OptionalExtension, params};

use crate::errors::StoreError;

type Result<T> = std::result::Result<T, StoreError>;

pub struct Store {
    conn: Connection,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<()> {
        self.conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS registered_repositories (
                repo_prefix       TEXT PRIMARY KEY,
                display_name      TEXT NOT NULL,
                folder            TEXT NOT NULL UNIQUE,
                trigger_pattern   TEXT,
                container_config  TEXT NOT NULL,
                requires_trigger  INTEGER NOT NULL,
                created_at        TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS messages (
                delivery_id    TEXT NOT NULL,
                chat           TEXT NOT NULL,
                sender_handle  TEXT NOT NULL,
                sender_display TEXT NOT NULL,
                content        TEXT NOT NULL,
                timestamp      TEXT NOT NULL,
                is_bot         INTEGER NOT NULL,
                PRIMARY KEY (delivery_id, chat)
            );
            CREATE INDEX IF NOT EXISTS idx_messages_chat ON messages(chat, timestamp);

            CREATE TABLE IF NOT EXISTS processed_events (
                delivery_id  TEXT PRIMARY KEY,
                processed_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sessions (
                folder           TEXT PRIMARY KEY,
                agent_session_id TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS agent_cursors (
                chat               TEXT PRIMARY KEY,
                last_processed_at  TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS scheduled_tasks (
                id             INTEGER PRIMARY KEY AUTOINCREMENT,
                folder         TEXT NOT NULL,
                chat           TEXT NOT NULL,
                prompt         TEXT NOT NULL,
                schedule_kind  TEXT NOT NULL,
                schedule_value TEXT NOT NULL,
                context_mode   TEXT NOT NULL,
                next_run       TEXT,
                last_run       TEXT,
                last_result    TEXT,
                status         TEXT NOT NULL,
                created_at     TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_due ON scheduled_tasks(status, next_run);

            CREATE TABLE IF NOT EXISTS task_run_log (
                task_id      INTEGER NOT NULL,
                started_at   TEXT NOT NULL,
                finished_at  TEXT NOT NULL,
                outcome      TEXT NOT NULL,
                summary      TEXT
            );
            ",
        )?;
        Ok(())
    }

    // ── Registered repositories ─────────────────────────────────────

    pub fn register_repository(&self, repo: &RegisteredRepository) -> Result<()> {
        self.conn.execute(
            "INSERT INTO registered_repositories
                (repo_prefix, display_name, folder, trigger_pattern, container_config, requires_trigger, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(repo_prefix) DO UPDATE SET
                display_name=excluded.display_name,
                trigger_pattern=excluded.trigger_pattern,
                container_config=excluded.container_config,
                requires_trigger=excluded.requires_trigger",
            params![
                repo.repo_prefix,
                repo.display_name,
                repo.folder,
                repo.trigger_pattern,
                serde_json::to_string(&repo.container_config)?,
                repo.requires_trigger as i64,
                repo.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_repository(&self, repo_prefix: &str) -> Result<Option<RegisteredRepository>> {
        self.conn
            .query_row(
                "SELECT repo_prefix, display_name, folder, trigger_pattern, container_config, requires_trigger, created_at
                 FROM registered_repositories WHERE repo_prefix = ?1",
                params![repo_prefix],
                Self::row_to_repository,
            )
            .optional()
            .map_err(StoreError::from)
    }

    pub fn get_repository_by_folder(&self, folder: &str) -> Result<Option<RegisteredRepository>> {
        self.conn
            .query_row(
                "SELECT repo_prefix, display_name, folder, trigger_pattern, container_config, requires_trigger, created_at
                 FROM registered_repositories WHERE folder = ?1",
                params![folder],
                Self::row_to_repository,
            )
            .optional()
            .map_err(StoreError::from)
    }

    pub fn list_repositories(&self) -> Result<Vec<RegisteredRepository>> {
        let mut stmt = self.conn.prepare(
            "SELECT repo_prefix, display_name, folder, trigger_pattern, container_config, requires_trigger, created_at
             FROM registered_repositories ORDER BY repo_prefix",
        )?;
        let rows = stmt.query_map([], Self::row_to_repository)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(StoreError::from)
    }

    fn row_to_repository(row: &rusqlite::Row<'_>) -> rusqlite::Result<RegisteredRepository> {
        let container_config: String = row.get(4)?;
        let created_at: String = row.get(6)?;
        Ok(RegisteredRepository {
            repo_prefix: row.get(0)?,
            display_name: row.get(1)?,
            folder: row.get(2)?,
            trigger_pattern: row.get(3)?,
            container_config: serde_json::from_str(&container_config).unwrap_or_else(|_| ContainerConfigOverride::default()),
            requires_trigger: row.get::<_, i64>(5)? != 0,
            created_at: DateTime::parse_from_rfc3339(&created_at)
                .map(|d| d.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
        })
    }

    // ── Messages ─────────────────────────────────────────────────────

    /// Upsert on `(delivery_id, chat)`.
    pub fn insert_message(&self, msg: &Message) -> Result<()> {
        self.conn.execute(
            "INSERT INTO messages (delivery_id, chat, sender_handle, sender_display, content, timestamp, is_bot)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(delivery_id, chat) DO UPDATE SET
                sender_handle=excluded.sender_handle,
                sender_display=excluded.sender_display,
                content=excluded.content,
                timestamp=excluded.timestamp,
                is_bot=excluded.is_bot",
            params![
                msg.delivery_id,
                msg.chat.to_string(),
                msg.sender_handle,
                msg.sender_display,
                msg.content,
                msg.timestamp.to_rfc3339(),
                msg.is_bot as i64,
            ],
        )?;
        Ok(())
    }

    /// Messages for `chat` strictly after `cursor`, excluding bot rows
    /// and rows whose content begins with `"<bot_prefix>:"`.
    pub fn messages_since(
        &self,
        chat: &Tid,
        cursor: DateTime<Utc>,
        bot_prefix: &str,
    ) -> Result<Vec<Message>> {
        let mut stmt = self.conn.prepare(
            "SELECT delivery_id, chat, sender_handle, sender_display, content, timestamp, is_bot
             FROM messages
             WHERE chat = ?1 AND timestamp > ?2 AND is_bot = 0
             ORDER BY timestamp ASC",
        )?;
        let prefix_needle = format!("{bot_prefix}:");
        let rows = stmt.query_map(params![chat.to_string(), cursor.to_rfc3339()], |row| {
            let chat_str: String = row.get(1)?;
            let timestamp: String = row.get(5)?;
            Ok((
                row.get::<_, String>(0)?,
                chat_str,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                timestamp,
                row.get::<_, i64>(6)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (delivery_id, chat_str, sender_handle, sender_display, content, timestamp, is_bot) =
                row?;
            if content.starts_with(&prefix_needle) {
                continue;
            }
            out.push(Message {
                delivery_id,
                chat: chat_str.parse().map_err(StoreError::from)?,
                sender_handle,
                sender_display,
                content,
                timestamp: DateTime::parse_from_rfc3339(&timestamp)
                    .map(|d| d.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now()),
                is_bot: is_bot != 0,
            });
        }
        Ok(out)
    }

    // ── Cursors ──────────────────────────────────────────────────────

    pub fn set_cursor(&self, chat: &Tid, at: DateTime<Utc>) -> Result<()> {
        self.conn.execute(
            "INSERT INTO agent_cursors (chat, last_processed_at) VALUES (?1, ?2)
             ON CONFLICT(chat) DO UPDATE SET last_processed_at = excluded.last_processed_at",
            params![chat.to_string(), at.to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn get_cursor(&self, chat: &Tid) -> Result<Option<DateTime<Utc>>> {
        let value: Option<String> = self
            .conn
            .query_row(
                "SELECT last_processed_at FROM agent_cursors WHERE chat = ?1",
                params![chat.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value.and_then(|v| DateTime::parse_from_rfc3339(&v).ok().map(|d| d.with_timezone(&Utc))))
    }

    // ── Sessions ─────────────────────────────────────────────────────

    pub fn set_session(&self, folder: &str, agent_session_id: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO sessions (folder, agent_session_id) VALUES (?1, ?2)
             ON CONFLICT(folder) DO UPDATE SET agent_session_id = excluded.agent_session_id",
            params![folder, agent_session_id],
        )?;
        Ok(())
    }

    pub fn get_session(&self, folder: &str) -> Result<Option<Session>> {
        self.conn
            .query_row(
                "SELECT folder, agent_session_id FROM sessions WHERE folder = ?1",
                params![folder],
                |row| {
                    Ok(Session {
                        folder: row.get(0)?,
                        agent_session_id: row.get(1)?,
                    })
                },
            )
            .optional()
            .map_err(StoreError::from)
    }

    // ── Processed events (idempotent ingestion) ─────────────────────

    /// A set: re-marking an already-processed id is a no-op.
    pub fn mark_processed(&self, delivery_id: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO processed_events (delivery_id, processed_at) VALUES (?1, ?2)",
            params![delivery_id, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn is_processed(&self, delivery_id: &str) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM processed_events WHERE delivery_id = ?1",
            params![delivery_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Reclaims processed-event records older than `age`. Returns the
    /// number of rows removed.
    pub fn cleanup_processed(&self, age: ChronoDuration) -> Result<usize> {
        let cutoff = (Utc::now() - age).to_rfc3339();
        let removed = self.conn.execute(
            "DELETE FROM processed_events WHERE processed_at < ?1",
            params![cutoff],
        )?;
        Ok(removed)
    }

    // ── Scheduled tasks ──────────────────────────────────────────────

    pub fn create_task(&self, task: &ScheduledTask) -> Result<ScheduledTask> {
        self.conn.execute(
            "INSERT INTO scheduled_tasks
                (folder, chat, prompt, schedule_kind, schedule_value, context_mode, next_run, last_run, last_result, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                task.folder,
                task.chat.to_string(),
                task.prompt,
                schedule_kind_str(task.schedule_kind),
                task.schedule_value,
                context_mode_str(task.context_mode),
                task.next_run.map(|t| t.to_rfc3339()),
                task.last_run.map(|t| t.to_rfc3339()),
                task.last_result,
                task_status_str(task.status),
                task.created_at.to_rfc3339(),
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        self.get_task(id)?
            .ok_or_else(|| StoreError::NotFound(format!("scheduled task {id}")))
    }

    pub fn update_task(&self, task: &ScheduledTask) -> Result<()> {
        self.conn.execute(
            "UPDATE scheduled_tasks SET
                folder=?2, chat=?3, prompt=?4, schedule_kind=?5, schedule_value=?6,
                context_mode=?7, next_run=?8, last_run=?9, last_result=?10, status=?11
             WHERE id=?1",
            params![
                task.id,
                task.folder,
                task.chat.to_string(),
                task.prompt,
                schedule_kind_str(task.schedule_kind),
                task.schedule_value,
                context_mode_str(task.context_mode),
                task.next_run.map(|t| t.to_rfc3339()),
                task.last_run.map(|t| t.to_rfc3339()),
                task.last_result,
                task_status_str(task.status),
            ],
        )?;
        Ok(())
    }

    pub fn delete_task(&self, id: i64) -> Result<()> {
        self.conn
            .execute("DELETE FROM scheduled_tasks WHERE id = ?1", params![id])?;
        Ok(())
    }

    pub fn get_task(&self, id: i64) -> Result<Option<ScheduledTask>> {
        self.conn
            .query_row(
                "SELECT id, folder, chat, prompt, schedule_kind, schedule_value, context_mode,
                        next_run, last_run, last_result, status, created_at
                 FROM scheduled_tasks WHERE id = ?1",
                params![id],
                Self::row_to_task,
            )
            .optional()
            .map_err(StoreError::from)
    }

    pub fn list_tasks(&self) -> Result<Vec<ScheduledTask>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, folder, chat, prompt, schedule_kind, schedule_value, context_mode,
                    next_run, last_run, last_result, status, created_at
             FROM scheduled_tasks ORDER BY id",
        )?;
        let rows = stmt.query_map([], Self::row_to_task)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(StoreError::from)
    }

    /// `status = active AND next_run <= now`.
    pub fn due_tasks(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledTask>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, folder, chat, prompt, schedule_kind, schedule_value, context_mode,
                    next_run, last_run, last_result, status, created_at
             FROM scheduled_tasks
             WHERE status = 'active' AND next_run IS NOT NULL AND next_run <= ?1
             ORDER BY next_run ASC",
        )?;
        let rows = stmt.query_map(params![now.to_rfc3339()], Self::row_to_task)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(StoreError::from)
    }

    pub fn record_task_run(&self, log: &TaskRunLog) -> Result<()> {
        self.conn.execute(
            "INSERT INTO task_run_log (task_id, started_at, finished_at, outcome, summary)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                log.task_id,
                log.started_at.to_rfc3339(),
                log.finished_at.to_rfc3339(),
                match log.outcome {
                    TaskOutcome::Completed => "completed",
                    TaskOutcome::Failed => "failed",
                },
                log.summary,
            ],
        )?;
        Ok(())
    }

    fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<ScheduledTask> {
        let chat: String = row.get(2)?;
        let schedule_kind: String = row.get(4)?;
        let context_mode: String = row.get(6)?;
        let next_run: Option<String> = row.get(7)?;
        let last_run: Option<String> = row.get(8)?;
        let status: String = row.get(10)?;
        let created_at: String = row.get(11)?;
        Ok(ScheduledTask {
            id: row.get(0)?,
            folder: row.get(1)?,
            chat: chat.parse().unwrap_or_else(|_| {
                // defensive: a corrupt row should never panic the store
                "github:invalid/invalid#issue:0".parse().unwrap()
            }),
            prompt: row.get(3)?,
            schedule_kind: parse_schedule_kind(&schedule_kind),
            schedule_value: row.get(5)?,
            context_mode: parse_context_mode(&context_mode),
            next_run: next_run.and_then(|v| DateTime::parse_from_rfc3339(&v).ok().map(|d| d.with_timezone(&Utc))),
            last_run: last_run.and_then(|v| DateTime::parse_from_rfc3339(&v).ok().map(|d| d.with_timezone(&Utc))),
            last_result: row.get(9)?,
            status: parse_task_status(&status),
            created_at: DateTime::parse_from_rfc3339(&created_at)
                .map(|d| d.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
        })
    }
}

fn schedule_kind_str(kind: ScheduleKind) -> &'static str {
    match kind {
        ScheduleKind::Cron => "cron",
        ScheduleKind::Interval => "interval",
        ScheduleKind::Once => "once",
    }
}

fn parse_schedule_kind(s: &str) -> ScheduleKind {
    match s {
        "cron" => ScheduleKind::Cron,
        "interval" => ScheduleKind::Interval,
        _ => ScheduleKind::Once,
    }
}

fn context_mode_str(mode: ContextMode) -> &'static str {
    match mode {
        ContextMode::Group => "group",
        ContextMode::Isolated => "isolated",
    }
}

fn parse_context_mode(s: &str) -> ContextMode {
    match s {
        "group" => ContextMode::Group,
        _ => ContextMode::Isolated,
    }
}

fn task_status_str(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Active => "active",
        TaskStatus::Paused => "paused",
        TaskStatus::Completed => "completed",
    }
}

fn parse_task_status(s: &str) -> TaskStatus {
    match s {
        "active" => TaskStatus::Active,
        "paused" => TaskStatus::Paused,
        _ => TaskStatus::Completed,
    }
}

/// Thin, cloneable handle around the store, matching the host's
/// `Arc<Mutex<_>>` convention so callers never hold the lock across an
/// `.await`.
#[derive(Clone)]
pub struct StoreHandle(Arc<Mutex<Store>>);

impl StoreHandle {
    pub fn new(store: Store) -> Self {
        Self(Arc::new(Mutex::new(store)))
    }

    pub fn lock_sync(&self) -> MutexGuard<'_, Store> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codeclaw_common::ContextMode;

    fn sample_message(delivery_id: &str, chat: &str, content: &str) -> Message {
        Message {
            delivery_id: delivery_id.into(),
            chat: chat.parse().unwrap(),
            sender_handle: "alice".into(),
            sender_display: "Alice".into(),
            content: content.into(),
            timestamp: Utc::now(),
            is_bot: false,
        }
    }

    #[test]
    fn insert_message_is_upsert_on_delivery_and_chat() {
        let store = Store::open_in_memory().unwrap();
        let chat = "github:acme/widgets#issue:1";
        store.insert_message(&sample_message("d1", chat, "first")).unwrap();
        store.insert_message(&sample_message("d1", chat, "edited")).unwrap();

        let msgs = store
            .messages_since(&chat.parse().unwrap(), Utc::now() - ChronoDuration::hours(1), "codeclaw")
            .unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].content, "edited");
    }

    #[test]
    fn messages_since_excludes_bot_rows_and_bot_prefixed_content() {
        let store = Store::open_in_memory().unwrap();
        let chat: Tid = "github:acme/widgets#issue:1".parse().unwrap();
        let mut bot_msg = sample_message("d2", "github:acme/widgets#issue:1", "reply");
        bot_msg.is_bot = true;
        store.insert_message(&bot_msg).unwrap();
        store
            .insert_message(&sample_message("d3", "github:acme/widgets#issue:1", "codeclaw: ignore me"))
            .unwrap();
        store
            .insert_message(&sample_message("d4", "github:acme/widgets#issue:1", "a real message"))
            .unwrap();

        let since = Utc::now() - ChronoDuration::hours(1);
        let msgs = store.messages_since(&chat, since, "codeclaw").unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].content, "a real message");
    }

    #[test]
    fn processed_events_mark_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        store.mark_processed("evt-1").unwrap();
        store.mark_processed("evt-1").unwrap();
        assert!(store.is_processed("evt-1").unwrap());
        assert!(!store.is_processed("evt-2").unwrap());
    }

    #[test]
    fn cleanup_processed_reclaims_old_rows_only() {
        let store = Store::open_in_memory().unwrap();
        store.mark_processed("old").unwrap();
        store
            .conn
            .execute(
                "UPDATE processed_events SET processed_at = ?1 WHERE delivery_id = 'old'",
                params![(Utc::now() - ChronoDuration::hours(48)).to_rfc3339()],
            )
            .unwrap();
        store.mark_processed("new").unwrap();

        let removed = store.cleanup_processed(ChronoDuration::hours(24)).unwrap();
        assert_eq!(removed, 1);
        assert!(!store.is_processed("old").unwrap());
        assert!(store.is_processed("new").unwrap());
    }

    #[test]
    fn due_tasks_requires_active_status_and_past_next_run() {
        let store = Store::open_in_memory().unwrap();
        let chat: Tid = "github:acme/widgets#issue:1".parse().unwrap();
        let now = Utc::now();

        let active_due = ScheduledTask {
            id: 0,
            folder: "acme-widgets".into(),
            chat: chat.clone(),
            prompt: "do thing".into(),
            schedule_kind: ScheduleKind::Once,
            schedule_value: now.to_rfc3339(),
            context_mode: ContextMode::Group,
            next_run: Some(now - ChronoDuration::minutes(1)),
            last_run: None,
            last_result: None,
            status: TaskStatus::Active,
            created_at: now,
        };
        let paused_due = ScheduledTask {
            status: TaskStatus::Paused,
            ..active_due.clone()
        };
        let active_future = ScheduledTask {
            next_run: Some(now + ChronoDuration::hours(1)),
            ..active_due.clone()
        };

        store.create_task(&active_due).unwrap();
        store.create_task(&paused_due).unwrap();
        store.create_task(&active_future).unwrap();

        let due = store.due_tasks(now).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].prompt, "do thing");
    }

    #[test]
    fn register_repository_lookup_by_prefix_and_folder() {
        let store = Store::open_in_memory().unwrap();
        let repo = RegisteredRepository {
            repo_prefix: "github:acme/widgets".into(),
            display_name: "Widgets".into(),
            folder: "acme-widgets".into(),
            trigger_pattern: None,
            container_config: ContainerConfigOverride::default(),
            requires_trigger: false,
            created_at: Utc::now(),
        };
        store.register_repository(&repo).unwrap();

        assert!(store.get_repository("github:acme/widgets").unwrap().is_some());
        assert!(store.get_repository_by_folder("acme-widgets").unwrap().is_some());
        assert!(store.get_repository("github:other/other").unwrap().is_none());
    }

    #[test]
    fn store_handle_clones_share_state() {
        let handle = StoreHandle::new(Store::open_in_memory().unwrap());
        let other = handle.clone();
        handle.lock_sync().mark_processed("shared").unwrap();
        assert!(other.lock_sync().is_processed("shared").unwrap());
    }
}
