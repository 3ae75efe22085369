//! C6 Dispatch Queue — per-repo-prefix concurrency and message/task
//! admission, bounded by a global concurrency cap.

use std::collections::VecDeque;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::errors::DispatchError;

const MAX_RETRIES: u32 = 5;
const BASE_RETRY: Duration = Duration::from_secs(5);

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type ProcessMessagesFn = Arc<dyn Fn(String) -> Pin<Box<dyn Future<Output = bool> + Send>> + Send + Sync>;

struct QueuedTask {
    id: String,
    make_fn: Arc<dyn Fn() -> BoxFuture + Send + Sync>,
}

#[derive(Default)]
struct PrefixState {
    active: bool,
    idle_waiting: bool,
    is_task_container: bool,
    pending_messages: bool,
    pending_tasks: VecDeque<QueuedTask>,
    group_folder: Option<String>,
    retry_count: u32,
}

struct Inner {
    states: DashMap<String, PrefixState>,
    active_count: Mutex<u32>,
    waiting_prefixes: Mutex<VecDeque<String>>,
    process_messages_fn: Mutex<Option<ProcessMessagesFn>>,
    shutting_down: std::sync::atomic::AtomicBool,
    max_concurrent: u32,
    data_dir: PathBuf,
}

/// Per-repo-prefix serialization: at most one container runs per
/// prefix, and no more than `max_concurrent` run globally.
#[derive(Clone)]
pub struct DispatchQueue(Arc<Inner>);

impl DispatchQueue {
    pub fn new(data_dir: PathBuf, max_concurrent: u32) -> Self {
        Self(Arc::new(Inner {
            states: DashMap::new(),
            active_count: Mutex::new(0),
            waiting_prefixes: Mutex::new(VecDeque::new()),
            process_messages_fn: Mutex::new(None),
            shutting_down: std::sync::atomic::AtomicBool::new(false),
            max_concurrent,
            data_dir,
        }))
    }

    pub async fn set_process_messages_fn<F, Fut>(&self, f: F)
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let wrapped: ProcessMessagesFn = Arc::new(move |prefix| Box::pin(f(prefix)));
        *self.0.process_messages_fn.lock().await = Some(wrapped);
    }

    fn is_shutting_down(&self) -> bool {
        self.0.shutting_down.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub async fn enqueue_message_check(&self, prefix: &str) {
        if self.is_shutting_down() {
            return;
        }

        let mut activate = false;
        {
            let mut entry = self.0.states.entry(prefix.to_string()).or_default();
            if entry.active {
                entry.pending_messages = true;
                debug!(prefix, "container active, message queued");
                return;
            }
        }

        let mut count = self.0.active_count.lock().await;
        if *count >= self.0.max_concurrent {
            let mut entry = self.0.states.entry(prefix.to_string()).or_default();
            entry.pending_messages = true;
            drop(entry);
            let mut waiting = self.0.waiting_prefixes.lock().await;
            if !waiting.contains(&prefix.to_string()) {
                waiting.push_back(prefix.to_string());
            }
            debug!(prefix, active_count = *count, "at concurrency limit, message queued");
            return;
        }

        self.0.states.entry(prefix.to_string()).or_default().active = true;
        *count += 1;
        activate = true;
        drop(count);

        if activate {
            self.spawn_run_for_prefix(prefix.to_string(), "message").await;
        }
    }

    pub async fn enqueue_task(
        &self,
        prefix: &str,
        task_id: &str,
        make_fn: Arc<dyn Fn() -> BoxFuture + Send + Sync>,
    ) {
        if self.is_shutting_down() {
            return;
        }

        {
            let entry = self.0.states.get(prefix);
            if let Some(entry) = &entry {
                if entry.pending_tasks.iter().any(|t| t.id == task_id) {
                    debug!(prefix, task_id, "task already queued, skipping");
                    return;
                }
            }
        }

        let already_active = {
            let entry = self.0.states.get(prefix);
            entry.map(|e| e.active).unwrap_or(false)
        };

        if already_active {
            let idle_waiting = {
                let mut entry = self.0.states.entry(prefix.to_string()).or_default();
                entry.pending_tasks.push_back(QueuedTask {
                    id: task_id.to_string(),
                    make_fn,
                });
                entry.idle_waiting
            };
            if idle_waiting {
                self.close_stdin(prefix).await;
            }
            debug!(prefix, task_id, "container active, task queued");
            return;
        }

        let mut count = self.0.active_count.lock().await;
        if *count >= self.0.max_concurrent {
            self.0
                .states
                .entry(prefix.to_string())
                .or_default()
                .pending_tasks
                .push_back(QueuedTask {
                    id: task_id.to_string(),
                    make_fn,
                });
            let mut waiting = self.0.waiting_prefixes.lock().await;
            if !waiting.contains(&prefix.to_string()) {
                waiting.push_back(prefix.to_string());
            }
            debug!(prefix, task_id, active_count = *count, "at concurrency limit, task queued");
            return;
        }

        self.0.states.entry(prefix.to_string()).or_default().active = true;
        *count += 1;
        drop(count);

        self.spawn_run_task(prefix.to_string(), task_id.to_string(), make_fn).await;
    }

    pub fn register_process(&self, prefix: &str, group_folder: &str) {
        let mut entry = self.0.states.entry(prefix.to_string()).or_default();
        entry.group_folder = Some(group_folder.to_string());
    }

    pub async fn notify_idle(&self, prefix: &str) {
        let has_pending_tasks = {
            let mut entry = self.0.states.entry(prefix.to_string()).or_default();
            entry.idle_waiting = true;
            !entry.pending_tasks.is_empty()
        };
        if has_pending_tasks {
            self.close_stdin(prefix).await;
        }
    }

    /// Writes a message into the live container's IPC input directory.
    /// `false` means the caller must fall back to `enqueue_message_check`.
    pub async fn send_message(&self, prefix: &str, text: &str) -> bool {
        let (eligible, folder) = {
            let entry = self.0.states.get(prefix);
            match entry {
                Some(e) if e.active && !e.is_task_container && e.group_folder.is_some() => {
                    (true, e.group_folder.clone().unwrap())
                }
                _ => (false, String::new()),
            }
        };
        if !eligible {
            return false;
        }
        self.0.states.entry(prefix.to_string()).or_default().idle_waiting = false;

        let input_dir = self.0.data_dir.join("ipc").join(&folder).join("input");
        if fs::create_dir_all(&input_dir).await.is_err() {
            return false;
        }
        let filename = format!(
            "{}-{}.json",
            chrono::Utc::now().timestamp_millis(),
            hex::encode(rand_suffix())
        );
        let payload = serde_json::json!({"type": "message", "text": text}).to_string();
        let temp_path = input_dir.join(format!("{filename}.tmp"));
        let final_path = input_dir.join(&filename);
        if fs::write(&temp_path, payload).await.is_err() {
            return false;
        }
        fs::rename(&temp_path, &final_path).await.is_ok()
    }

    pub async fn close_stdin(&self, prefix: &str) {
        let folder = {
            let entry = self.0.states.get(prefix);
            match entry {
                Some(e) if e.active && e.group_folder.is_some() => e.group_folder.clone(),
                _ => None,
            }
        };
        let Some(folder) = folder else { return };
        let input_dir = self.0.data_dir.join("ipc").join(&folder).join("input");
        if fs::create_dir_all(&input_dir).await.is_ok() {
            let _ = fs::write(input_dir.join("_close"), "").await;
        }
    }

    async fn spawn_run_for_prefix(&self, prefix: String, reason: &'static str) {
        let this = self.clone();
        tokio::spawn(async move {
            this.run_for_prefix(prefix, reason).await;
        });
    }

    async fn run_for_prefix(&self, prefix: String, reason: &'static str) {
        {
            let mut entry = self.0.states.entry(prefix.clone()).or_default();
            entry.idle_waiting = false;
            entry.is_task_container = false;
            entry.pending_messages = false;
        }
        debug!(prefix = %prefix, reason, "starting container for prefix");

        let process_fn = self.0.process_messages_fn.lock().await.clone();
        let outcome = if let Some(f) = process_fn {
            Some(f(prefix.clone()).await)
        } else {
            None
        };

        match outcome {
            Some(true) => {
                self.0.states.entry(prefix.clone()).or_default().retry_count = 0;
            }
            Some(false) => self.schedule_retry(&prefix).await,
            None => {}
        }

        self.finish_run(&prefix).await;
    }

    async fn spawn_run_task(
        &self,
        prefix: String,
        task_id: String,
        make_fn: Arc<dyn Fn() -> BoxFuture + Send + Sync>,
    ) {
        let this = self.clone();
        tokio::spawn(async move {
            this.run_task(prefix, task_id, make_fn).await;
        });
    }

    async fn run_task(
        &self,
        prefix: String,
        task_id: String,
        make_fn: Arc<dyn Fn() -> BoxFuture + Send + Sync>,
    ) {
        {
            let mut entry = self.0.states.entry(prefix.clone()).or_default();
            entry.idle_waiting = false;
            entry.is_task_container = true;
        }
        debug!(prefix = %prefix, task_id, "running queued task");

        make_fn().await;
        self.finish_run(&prefix).await;
    }

    async fn finish_run(&self, prefix: &str) {
        {
            let mut entry = self.0.states.entry(prefix.to_string()).or_default();
            entry.active = false;
            entry.is_task_container = false;
            entry.group_folder = None;
        }
        *self.0.active_count.lock().await -= 1;
        self.drain_prefix(prefix).await;
    }

    async fn schedule_retry(&self, prefix: &str) {
        let retry_count = {
            let mut entry = self.0.states.entry(prefix.to_string()).or_default();
            entry.retry_count += 1;
            entry.retry_count
        };
        if retry_count > MAX_RETRIES {
            error!(prefix, retry_count, "max retries exceeded, dropping messages");
            self.0.states.entry(prefix.to_string()).or_default().retry_count = 0;
            return;
        }

        let delay = BASE_RETRY * 2u32.pow(retry_count - 1);
        info!(prefix, retry_count, delay_secs = delay.as_secs(), "scheduling retry with backoff");

        let this = self.clone();
        let prefix = prefix.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if !this.is_shutting_down() {
                this.enqueue_message_check(&prefix).await;
            }
        });
    }

    async fn drain_prefix(&self, prefix: &str) {
        if self.is_shutting_down() {
            return;
        }

        let next_task = {
            let mut entry = self.0.states.entry(prefix.to_string()).or_default();
            entry.pending_tasks.pop_front()
        };
        if let Some(task) = next_task {
            self.0.states.entry(prefix.to_string()).or_default().active = true;
            *self.0.active_count.lock().await += 1;
            self.spawn_run_task(prefix.to_string(), task.id, task.make_fn).await;
            return;
        }

        let has_pending_messages = {
            let entry = self.0.states.get(prefix);
            entry.map(|e| e.pending_messages).unwrap_or(false)
        };
        if has_pending_messages {
            self.0.states.entry(prefix.to_string()).or_default().active = true;
            *self.0.active_count.lock().await += 1;
            self.spawn_run_for_prefix(prefix.to_string(), "drain").await;
            return;
        }

        self.drain_waiting().await;
    }

    async fn drain_waiting(&self) {
        loop {
            let active_count = *self.0.active_count.lock().await;
            if active_count >= self.0.max_concurrent {
                break;
            }
            let next_prefix = self.0.waiting_prefixes.lock().await.pop_front();
            let Some(next_prefix) = next_prefix else { break };

            let next_task = {
                let mut entry = self.0.states.entry(next_prefix.clone()).or_default();
                entry.pending_tasks.pop_front()
            };
            if let Some(task) = next_task {
                self.0.states.entry(next_prefix.clone()).or_default().active = true;
                *self.0.active_count.lock().await += 1;
                self.spawn_run_task(next_prefix, task.id, task.make_fn).await;
                continue;
            }

            let has_pending_messages = {
                let entry = self.0.states.get(&next_prefix);
                entry.map(|e| e.pending_messages).unwrap_or(false)
            };
            if has_pending_messages {
                self.0.states.entry(next_prefix.clone()).or_default().active = true;
                *self.0.active_count.lock().await += 1;
                self.spawn_run_for_prefix(next_prefix, "drain").await;
            }
        }
    }

    /// Marks the queue as shutting down. Active containers are left
    /// running (detached), not killed; the next start reaps orphans.
    pub fn shutdown(&self) {
        self.0.shutting_down.store(true, std::sync::atomic::Ordering::SeqCst);
        let detached: Vec<String> = self
            .0
            .states
            .iter()
            .filter(|e| e.active)
            .map(|e| e.key().clone())
            .collect();
        info!(detached_prefixes = ?detached, "dispatch queue shutting down, containers detached");
    }
}

fn rand_suffix() -> [u8; 3] {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().subsec_nanos();
    nanos.to_le_bytes()[0..3].try_into().unwrap()
}
