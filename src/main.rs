use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use codeclaw::config::RuntimeConfig;
use codeclaw::github_channel::GitHubChannel;
use codeclaw::router::{self, AppContext};
use codeclaw::webhook::{WebhookState, build_router};
use codeclaw_common::{ContainerConfigOverride, RegisteredRepository, validate_folder_name};
use codeclaw_runtime::StoreHandle;
use codeclaw_runtime::dispatch::DispatchQueue;
use codeclaw_runtime::mount_security::MountSecurity;
use codeclaw_runtime::scheduler::Scheduler;
use codeclaw_runtime::store::Store;
use codeclaw_runtime::supervisor::ContainerSupervisor;
use codeclaw_runtime::token::TokenManager;

#[derive(Parser)]
#[command(name = "codeclaw")]
#[command(version, about = "Autonomous agent orchestrator for source-control webhooks")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the webhook server, scheduler, and IPC watcher.
    Serve,
    /// Inspect or validate configuration.
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
    /// Manage registered repositories.
    Repos {
        #[command(subcommand)]
        command: ReposCommands,
    },
    /// Inspect scheduled tasks.
    Tasks {
        #[command(subcommand)]
        command: TasksCommands,
    },
    /// Check that docker, the store, and the mount allowlist are reachable.
    Doctor,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    Show,
    Validate,
}

#[derive(Subcommand)]
pub enum ReposCommands {
    List,
    Register {
        /// `<platform>:<owner>/<repo>`, e.g. `github:octocat/hello-world`
        repo_prefix: String,
        /// On-disk folder name the container mounts for this repo.
        folder: String,
        #[arg(long)]
        display_name: Option<String>,
        #[arg(long)]
        trigger_pattern: Option<String>,
        #[arg(long)]
        requires_trigger: bool,
    },
}

#[derive(Subcommand)]
pub enum TasksCommands {
    List {
        #[arg(long)]
        active_only: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve => cmd_serve().await,
        Commands::Config { command } => cmd_config(command),
        Commands::Repos { command } => cmd_repos(command),
        Commands::Tasks { command } => cmd_tasks(command),
        Commands::Doctor => cmd_doctor().await,
    }
}

fn open_store(config: &RuntimeConfig) -> Result<StoreHandle> {
    config.ensure_directories()?;
    let store = Store::open(&config.store_path()).context("failed to open store")?;
    Ok(StoreHandle::new(store))
}

async fn cmd_serve() -> Result<()> {
    let config = Arc::new(RuntimeConfig::load()?);
    let store = open_store(&config)?;

    let creds = codeclaw::config::load_app_credentials(&config.project_root)?
        .context("codeclaw.app.json not found; run is impossible without GitHub App credentials")?;
    let private_key = std::fs::read(&creds.private_key_path)
        .with_context(|| format!("failed to read private key at {}", creds.private_key_path.display()))?;

    let tokens = Arc::new(
        TokenManager::new(creds.app_id.clone(), &private_key, creds.installation_ids.clone())
            .context("failed to initialize GitHub App token manager")?,
    );

    let mount_security = Arc::new(MountSecurity::new(config.mount_allowlist_path.clone()));
    let supervisor = Arc::new(ContainerSupervisor::connect().await.context("failed to connect to docker")?);
    if !supervisor.is_available().await {
        tracing::warn!("docker does not appear to be reachable; container runs will fail until it is");
    }

    let queue = DispatchQueue::new(config.data_dir.clone(), config.max_concurrent_containers);
    let channel = Arc::new(GitHubChannel::new(tokens.clone()));

    let ctx = Arc::new(AppContext::new(
        config.clone(),
        store.clone(),
        tokens.clone(),
        mount_security,
        supervisor,
        queue.clone(),
        channel.clone(),
    ));
    router::install_process_messages_fn(ctx.clone()).await;

    let scheduler = Scheduler::new(store.clone(), queue, ctx.clone());
    tokio::spawn(async move { scheduler.run_forever().await });

    let ipc_channel: Box<dyn codeclaw_runtime::ipc::OutboundChannel> = Box::new(GitHubChannel::new(tokens));
    let ipc_watcher = codeclaw_runtime::ipc::IpcWatcher::new(store, ipc_channel, config.data_dir.join("ipc"));
    tokio::spawn(async move { ipc_watcher.run_forever().await });

    let webhook_secret = creds.webhook_secret;
    let state = Arc::new(WebhookState::new(webhook_secret, ctx));
    state.mark_ready();
    let app = build_router(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await.with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(addr, "codeclaw listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    tracing::info!("shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c().await.expect("failed to install ctrl-c handler");
    tracing::info!("received shutdown signal");
}

fn cmd_config(command: ConfigCommands) -> Result<()> {
    match command {
        ConfigCommands::Show => {
            let config = RuntimeConfig::load()?;
            println!("assistant_name: {}", config.assistant_name);
            println!("port: {}", config.port);
            println!("container_image: {}", config.container_image);
            println!("max_concurrent_containers: {}", config.max_concurrent_containers);
            println!("container_timeout_ms: {}", config.container_timeout_ms);
            println!("idle_timeout_ms: {}", config.idle_timeout_ms);
            println!("timezone: {}", config.timezone);
            println!("store_dir: {}", config.store_dir.display());
            println!("groups_dir: {}", config.groups_dir.display());
            println!("mount_allowlist_path: {}", config.mount_allowlist_path.display());
        }
        ConfigCommands::Validate => {
            let config = RuntimeConfig::load()?;
            config.validate()?;
            println!("configuration is valid");
        }
    }
    Ok(())
}

fn cmd_repos(command: ReposCommands) -> Result<()> {
    let config = RuntimeConfig::load()?;
    let store = open_store(&config)?;

    match command {
        ReposCommands::List => {
            let repos = store.lock_sync().list_repositories()?;
            if repos.is_empty() {
                println!("no repositories registered");
                return Ok(());
            }
            for repo in repos {
                println!(
                    "{}  folder={}  trigger_required={}  registered_at={}",
                    repo.repo_prefix, repo.folder, repo.requires_trigger, repo.created_at
                );
            }
        }
        ReposCommands::Register { repo_prefix, folder, display_name, trigger_pattern, requires_trigger } => {
            validate_folder_name(&folder).context("invalid folder name")?;
            let repo = RegisteredRepository {
                display_name: display_name.unwrap_or_else(|| repo_prefix.clone()),
                repo_prefix,
                folder,
                trigger_pattern,
                container_config: ContainerConfigOverride::default(),
                requires_trigger,
                created_at: chrono::Utc::now(),
            };
            store.lock_sync().register_repository(&repo)?;
            println!("registered {} -> {}", repo.repo_prefix, repo.folder);
        }
    }
    Ok(())
}

fn cmd_tasks(command: TasksCommands) -> Result<()> {
    let config = RuntimeConfig::load()?;
    let store = open_store(&config)?;

    match command {
        TasksCommands::List { active_only } => {
            let tasks = store.lock_sync().list_tasks()?;
            let tasks: Vec<_> = tasks
                .into_iter()
                .filter(|t| !active_only || t.status == codeclaw_common::TaskStatus::Active)
                .collect();
            if tasks.is_empty() {
                println!("no scheduled tasks");
                return Ok(());
            }
            for task in tasks {
                println!(
                    "#{} folder={} chat={} schedule={:?}:{} next_run={:?} status={:?}",
                    task.id, task.folder, task.chat, task.schedule_kind, task.schedule_value, task.next_run, task.status
                );
            }
        }
    }
    Ok(())
}

async fn cmd_doctor() -> Result<()> {
    let config = RuntimeConfig::load()?;
    println!("project_root: {}", config.project_root.display());

    match Store::open(&config.store_path()) {
        Ok(_) => println!("store: ok ({})", config.store_path().display()),
        Err(err) => println!("store: FAILED ({err})"),
    }

    if config.mount_allowlist_path.exists() {
        println!("mount allowlist: present ({})", config.mount_allowlist_path.display());
    } else {
        println!("mount allowlist: absent, every additional mount will be rejected ({})", config.mount_allowlist_path.display());
    }

    match ContainerSupervisor::connect().await {
        Ok(supervisor) => {
            if supervisor.is_available().await {
                println!("docker: ok");
            } else {
                println!("docker: connected but not responding");
            }
        }
        Err(err) => println!("docker: FAILED ({err})"),
    }

    match codeclaw::config::load_app_credentials(&config.project_root)? {
        Some(_) => println!("github app credentials: present"),
        None => println!("github app credentials: absent (codeclaw.app.json)"),
    }

    Ok(())
}
