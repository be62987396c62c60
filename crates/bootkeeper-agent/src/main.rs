use anyhow::Context;
use bootkeeper_agent::{SlotRegistry, Supervisor, SupervisorConfig};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let Some(dir) = std::env::var("BOOTKEEPER_LOG_DIR")
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
    else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        return None;
    };

    let appender = tracing_appender::rolling::daily(dir, "bootkeeper-agent.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(fmt::layer().with_ansi(false).with_writer(writer))
        .init();
    Some(guard)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_guard = init_tracing();

    let registry = SlotRegistry::from_env().context("load slot registry")?;
    let config = SupervisorConfig::from_env();
    for spec in registry.iter() {
        tracing::info!(
            slot = %spec.id,
            name = %spec.name,
            init_steps = spec.init.len(),
            settle_delay_ms = spec.settle_delay.as_millis() as u64,
            "slot configured"
        );
    }

    let supervisor = Supervisor::new(registry, config);
    tracing::info!(
        slots = supervisor.registry().len(),
        version = env!("CARGO_PKG_VERSION"),
        "bootkeeper-agent ready"
    );

    let auto_start = if supervisor.config().autostart_enabled {
        supervisor.schedule_auto_start()
    } else {
        tracing::info!("auto-start disabled");
        None
    };

    shutdown_signal().await;
    tracing::info!("shutdown requested");

    if let Some(task) = auto_start {
        task.abort();
    }
    supervisor.shutdown().await;

    Ok(())
}
