//! C8 IPC Watcher — polls per-folder IPC directories for files written
//! by the agent running inside the container, authorizes, dispatches,
//! deletes.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use codeclaw_common::{Tid, validate_folder_name};
use serde::Deserialize;
use tokio::fs;
use tracing::{error, warn};

use crate::errors::IpcError;
use crate::scheduler::compute_next_run;
use crate::store::StoreHandle;

const POLL_INTERVAL: Duration = Duration::from_secs(1);
const MAIN_FOLDER: &str = "main";

/// Routes outbound agent actions to the source-control platform. The
/// runtime knows nothing about REST payloads; that lives in the
/// channel implementation.
#[async_trait]
pub trait OutboundChannel: Send + Sync {
    async fn send_message(&self, chat: &Tid, text: &str);
    async fn send_comment(&self, chat: &Tid, text: &str);
    async fn send_review(&self, chat: &Tid, body: &str, event: &str, comments: serde_json::Value);
    async fn create_pr(&self, chat: &Tid, title: &str, body: &str, head: &str, base: &str);
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(rename = "chatJid")]
    chat_jid: Option<String>,
    text: Option<String>,
    #[serde(rename = "issueNumber")]
    #[allow(dead_code)]
    issue_number: Option<u64>,
    #[serde(default)]
    event: Option<String>,
    #[serde(default)]
    comments: Option<serde_json::Value>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    head: Option<String>,
    #[serde(default)]
    base: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawTask {
    #[serde(rename = "type")]
    kind: String,
    prompt: Option<String>,
    schedule_type: Option<String>,
    schedule_value: Option<String>,
    #[serde(rename = "targetJid")]
    target_jid: Option<String>,
    context_mode: Option<String>,
    #[serde(rename = "taskId")]
    task_id: Option<i64>,
}

pub struct IpcWatcher {
    store: StoreHandle,
    channel: Box<dyn OutboundChannel>,
    data_dir: PathBuf,
}

impl IpcWatcher {
    pub fn new(store: StoreHandle, channel: Box<dyn OutboundChannel>, data_dir: PathBuf) -> Self {
        Self { store, channel, data_dir }
    }

    pub async fn run_forever(&self) {
        loop {
            if let Err(err) = self.scan_once().await {
                error!(error = %err, "error scanning ipc directory");
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn scan_once(&self) -> std::io::Result<()> {
        let ipc_base = self.data_dir.join("ipc");
        fs::create_dir_all(&ipc_base).await?;

        let mut entries = fs::read_dir(&ipc_base).await?;
        let mut folders = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                let name = entry.file_name().to_string_lossy().to_string();
                if name != "errors" {
                    folders.push(name);
                }
            }
        }

        for folder in folders {
            let is_main = folder == MAIN_FOLDER;
            self.process_dir(&ipc_base, &folder, "messages", is_main).await;
            self.process_dir(&ipc_base, &folder, "tasks", is_main).await;
        }
        Ok(())
    }

    async fn process_dir(&self, ipc_base: &Path, folder: &str, kind: &str, is_main: bool) {
        let dir = ipc_base.join(folder).join(kind);
        let Ok(mut entries) = fs::read_dir(&dir).await else { return };
        let mut files = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().is_some_and(|e| e == "json") {
                files.push(path);
            }
        }
        files.sort();

        for path in files {
            let result = match fs::read_to_string(&path).await {
                Ok(raw) => {
                    if kind == "messages" {
                        self.handle_message_file(&raw, folder, is_main).await
                    } else {
                        self.handle_task_file(&raw, folder, is_main).await
                    }
                }
                Err(e) => Err(IpcError::Unreadable(path.display().to_string(), e.to_string())),
            };

            match result {
                Ok(()) => {
                    let _ = fs::remove_file(&path).await;
                }
                Err(err) => {
                    warn!(file = %path.display(), error = %err, "dropping malformed or unauthorized ipc file");
                    let errors_dir = ipc_base.join("errors");
                    let _ = fs::create_dir_all(&errors_dir).await;
                    let dest = errors_dir.join(format!("{folder}-{}", path.file_name().unwrap().to_string_lossy()));
                    let _ = fs::rename(&path, &dest).await;
                }
            }
        }
    }

    /// `S=main` OR the registered repository owning `T` has folder `S`.
    async fn authorize(&self, target: &Tid, source_folder: &str, is_main: bool) -> Result<(), IpcError> {
        if is_main {
            return Ok(());
        }
        let repo = self
            .store
            .lock_sync()
            .get_repository(&target.repo_prefix())
            .map_err(|e| IpcError::Unreadable(target.to_string(), e.to_string()))?;
        match repo {
            Some(r) if r.folder == source_folder => Ok(()),
            Some(r) => Err(IpcError::Unauthorized {
                sender_folder: source_folder.to_string(),
                owner_folder: r.folder,
            }),
            None => Err(IpcError::Unauthorized {
                sender_folder: source_folder.to_string(),
                owner_folder: "<unregistered>".to_string(),
            }),
        }
    }

    async fn handle_message_file(&self, raw: &str, folder: &str, is_main: bool) -> Result<(), IpcError> {
        let data: RawMessage =
            serde_json::from_str(raw).map_err(|e| IpcError::MalformedJson(folder.to_string(), e.to_string()))?;
        let Some(chat_jid) = &data.chat_jid else {
            return Err(IpcError::MalformedJson(folder.to_string(), "missing chatJid".to_string()));
        };
        let chat: Tid = chat_jid
            .parse()
            .map_err(|_| IpcError::MalformedJson(folder.to_string(), "chatJid is not a valid thread id".to_string()))?;

        self.authorize(&chat, folder, is_main).await?;

        match data.kind.as_str() {
            "message" => {
                if let Some(text) = &data.text {
                    self.channel.send_message(&chat, text).await;
                }
            }
            "github_comment" => {
                if let Some(text) = &data.text {
                    self.channel.send_comment(&chat, text).await;
                }
            }
            "github_review" => {
                if let Some(body) = &data.body {
                    let event = data.event.as_deref().unwrap_or("COMMENT");
                    let comments = data.comments.clone().unwrap_or(serde_json::Value::Null);
                    self.channel.send_review(&chat, body, event, comments).await;
                }
            }
            "github_create_pr" => {
                if let Some(title) = &data.title {
                    self.channel
                        .create_pr(
                            &chat,
                            title,
                            data.body.as_deref().unwrap_or(""),
                            data.head.as_deref().unwrap_or(""),
                            data.base.as_deref().unwrap_or(""),
                        )
                        .await;
                }
            }
            other => return Err(IpcError::UnknownType(other.to_string())),
        }
        Ok(())
    }

    async fn handle_task_file(&self, raw: &str, folder: &str, is_main: bool) -> Result<(), IpcError> {
        let data: RawTask =
            serde_json::from_str(raw).map_err(|e| IpcError::MalformedJson(folder.to_string(), e.to_string()))?;

        match data.kind.as_str() {
            "schedule_task" => self.handle_schedule_task(data, folder, is_main).await,
            "pause_task" => self.handle_status_change(data.task_id, folder, is_main, "paused").await,
            "resume_task" => self.handle_status_change(data.task_id, folder, is_main, "active").await,
            "cancel_task" => self.handle_cancel(data.task_id, folder, is_main).await,
            other => Err(IpcError::UnknownType(other.to_string())),
        }
    }

    async fn handle_schedule_task(&self, data: RawTask, folder: &str, is_main: bool) -> Result<(), IpcError> {
        let (Some(prompt), Some(schedule_type), Some(schedule_value), Some(target_jid)) =
            (data.prompt, data.schedule_type, data.schedule_value, data.target_jid)
        else {
            return Err(IpcError::MalformedJson(folder.to_string(), "schedule_task missing required fields".to_string()));
        };
        let chat: Tid = target_jid
            .parse()
            .map_err(|_| IpcError::MalformedJson(folder.to_string(), "targetJid is not a valid thread id".to_string()))?;

        let repo = self
            .store
            .lock_sync()
            .get_repository(&chat.repo_prefix())
            .map_err(|e| IpcError::Unreadable(folder.to_string(), e.to_string()))?
            .ok_or_else(|| IpcError::UnknownFolder(chat.repo_prefix()))?;

        if !is_main && repo.folder != folder {
            return Err(IpcError::Unauthorized {
                sender_folder: folder.to_string(),
                owner_folder: repo.folder,
            });
        }

        if !matches!(schedule_type.as_str(), "cron" | "interval" | "once") {
            return Err(IpcError::MalformedJson(folder.to_string(), format!("unknown schedule_type '{schedule_type}'")));
        }

        let next_run = compute_next_run(&schedule_type, &schedule_value, Utc::now())
            .map_err(|e| IpcError::MalformedJson(folder.to_string(), e))?;

        let context_mode = match data.context_mode.as_deref() {
            Some("group") => codeclaw_common::ContextMode::Group,
            _ => codeclaw_common::ContextMode::Isolated,
        };

        let task = codeclaw_common::ScheduledTask {
            id: 0,
            folder: repo.folder.clone(),
            chat,
            prompt,
            schedule_kind: match schedule_type.as_str() {
                "cron" => codeclaw_common::ScheduleKind::Cron,
                "interval" => codeclaw_common::ScheduleKind::Interval,
                _ => codeclaw_common::ScheduleKind::Once,
            },
            schedule_value,
            context_mode,
            next_run: Some(next_run),
            last_run: None,
            last_result: None,
            status: codeclaw_common::TaskStatus::Active,
            created_at: Utc::now(),
        };
        self.store
            .lock_sync()
            .create_task(&task)
            .map_err(|e| IpcError::Unreadable(folder.to_string(), e.to_string()))?;
        Ok(())
    }

    async fn handle_status_change(
        &self,
        task_id: Option<i64>,
        folder: &str,
        is_main: bool,
        new_status: &str,
    ) -> Result<(), IpcError> {
        let task_id = task_id.ok_or_else(|| IpcError::MalformedJson(folder.to_string(), "missing taskId".to_string()))?;
        let mut task = self
            .store
            .lock_sync()
            .get_task(task_id)
            .map_err(|e| IpcError::Unreadable(folder.to_string(), e.to_string()))?
            .ok_or_else(|| IpcError::UnknownFolder(task_id.to_string()))?;

        if !is_main && task.folder != folder {
            return Err(IpcError::Unauthorized {
                sender_folder: folder.to_string(),
                owner_folder: task.folder,
            });
        }

        task.status = match new_status {
            "paused" => codeclaw_common::TaskStatus::Paused,
            _ => codeclaw_common::TaskStatus::Active,
        };
        self.store
            .lock_sync()
            .update_task(&task)
            .map_err(|e| IpcError::Unreadable(folder.to_string(), e.to_string()))
    }

    async fn handle_cancel(&self, task_id: Option<i64>, folder: &str, is_main: bool) -> Result<(), IpcError> {
        let task_id = task_id.ok_or_else(|| IpcError::MalformedJson(folder.to_string(), "missing taskId".to_string()))?;
        let task = self
            .store
            .lock_sync()
            .get_task(task_id)
            .map_err(|e| IpcError::Unreadable(folder.to_string(), e.to_string()))?
            .ok_or_else(|| IpcError::UnknownFolder(task_id.to_string()))?;

        if !is_main && task.folder != folder {
            return Err(IpcError::Unauthorized {
                sender_folder: folder.to_string(),
                owner_folder: task.folder,
            });
        }
        self.store
            .lock_sync()
            .delete_task(task_id)
            .map_err(|e| IpcError::Unreadable(folder.to_string(), e.to_string()))
    }
}

/// Re-exported solely so callers constructing `register_repository`
/// IPC payloads can validate the folder before writing the file.
pub fn validate_register_folder(folder: &str) -> Result<(), codeclaw_common::FolderError> {
    validate_folder_name(folder)
}
