use std::sync::Arc;
use std::time::Duration;

use agent_tasks::builtin::{ECHO_KIND, EchoAgentFactory, EchoExecutor};
use agent_tasks::config::AppConfig;
use agent_tasks::context::AppContext;

/// How long each pool gets to cancel its in-flight tasks on exit.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = AppConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    });

    eprintln!("Agent Tasks worker v{}", env!("CARGO_PKG_VERSION"));
    eprintln!(
        "   Store: {}",
        if config.store.redis_url.is_some() {
            "redis"
        } else {
            "in-memory"
        }
    );
    eprintln!(
        "   Pool size: {} (poll every {:?})",
        config.pool.pool_size, config.pool.poll_interval
    );
    eprintln!("   Background partitions: {}", config.pool.partitions.join(", "));
    if !config.store.key_prefix.is_empty() {
        eprintln!("   Key prefix: {}", config.store.key_prefix);
    }

    let maintenance_interval = config.orchestrator.cleanup_interval;
    let ctx = AppContext::from_config(config, Arc::new(EchoAgentFactory)).await?;
    eprintln!("   Worker id: {}", ctx.worker_id());

    ctx.executors()
        .register(ECHO_KIND, Arc::new(EchoExecutor))
        .await;

    let _maintenance = ctx.orchestrator().spawn_maintenance(maintenance_interval);
    ctx.start_background_pool().await?;
    ctx.start_session_pool().await?;

    eprintln!("   Press Ctrl-C to stop.\n");
    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutdown signal received");
    ctx.shutdown(SHUTDOWN_TIMEOUT).await?;
    Ok(())
}
