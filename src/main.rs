use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use chrono_tz::Tz;
use task_scheduler::agent::AgentRunner;
use task_scheduler::clock::SystemClock;
use task_scheduler::config::Config;
use task_scheduler::context::{ContextStore, InMemoryContextStore};
use task_scheduler::http::{router, AppState};
use task_scheduler::scheduler::Scheduler;
use task_scheduler::store::TaskStore;
use tracing_subscriber::EnvFilter;

/// Placeholder [`AgentRunner`] until a real conversational-agent backend is
/// wired in. Always succeeds immediately with an empty result; real
/// deployments should supply their own implementation.
struct NoopAgentRunner;

#[async_trait::async_trait]
impl AgentRunner for NoopAgentRunner {
    async fn run(
        &self,
        _bundle: task_scheduler::agent::PromptBundle,
        _cancel_token: tokio_util::sync::CancellationToken,
    ) -> Result<String, task_scheduler::agent::AgentError> {
        Ok(String::new())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config_path = std::env::var("SCHEDULER_CONFIG").ok().map(PathBuf::from);
    let config = Arc::new(Config::load(config_path.as_deref())?);

    let default_timezone: Tz = config
        .clock
        .default_timezone
        .parse()
        .unwrap_or(Tz::UTC);
    let clock: Arc<dyn task_scheduler::clock::Clock> = Arc::new(SystemClock::new(default_timezone));

    let store = Arc::new(TaskStore::open(&config.store.path).await?);
    let agent: Arc<dyn AgentRunner> = Arc::new(NoopAgentRunner);
    let context: Arc<dyn ContextStore> = Arc::new(InMemoryContextStore::new());

    let scheduler = Scheduler::with_options(
        clock.clone(),
        store.clone(),
        agent,
        context,
        Some(config.scheduler.max_parallelism),
        Some(config.scheduler.worker_queue_capacity),
        Some(config.cancel_grace()),
    );

    let state = AppState::new(config.clone(), clock, store, scheduler.clone());
    let app = router(state);

    let addr: SocketAddr = config.server.bind_addr.parse()?;
    tracing::info!(%addr, "task-scheduler listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal(scheduler))
        .await?;

    Ok(())
}

async fn shutdown_signal(scheduler: Arc<Scheduler>) {
    tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    tracing::info!("shutdown signal received, draining in-flight runs");
    scheduler.shutdown().await;
}
