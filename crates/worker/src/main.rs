use std::sync::Arc;
use std::time::Duration;

use jobflow::api::{self, ApiState};
use jobflow::config::Config;
use jobflow::db;
use jobflow::jobs::{JobStore, MemoryStore, PgStore};
use jobflow::Dispatcher;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod handlers;

/// Upper bound on waiting for in-flight jobs after shutdown is requested.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = Config::from_env()?;
    init_tracing(cfg.log_json);

    tracing::info!(
        worker_id = %cfg.worker_id,
        api = %cfg.api_addr.as_deref().unwrap_or("disabled"),
        store = if cfg.database_url.is_some() { "postgres" } else { "memory" },
        workers_per_type = cfg.workers_per_type,
        poll_timeout_ms = u64::try_from(cfg.poll_timeout.as_millis()).unwrap_or(u64::MAX),
        max_attempts = cfg.max_attempts,
        migrate_on_startup = cfg.migrate_on_startup,
        "jobflow starting"
    );

    let store: Arc<dyn JobStore> = match &cfg.database_url {
        Some(url) => {
            let pool = db::make_pool(url).await?;
            if cfg.migrate_on_startup {
                db::run_migrations(&pool).await?;
            }
            Arc::new(PgStore::new(pool))
        }
        None => {
            tracing::warn!("DATABASE_URL not set, jobs are kept in memory only");
            Arc::new(MemoryStore::new())
        }
    };

    let dispatcher = Dispatcher::new(store, cfg.dispatcher());
    let registry = handlers::build_registry();

    let recovered = dispatcher.recover(&registry.job_types()).await?;
    tracing::info!(recovered, job_types = ?registry.job_types(), "queues ready");

    let cancel = CancellationToken::new();

    // ---- Executor ----
    let executor = dispatcher.executor(registry, cfg.executor());
    let mut executor_handle = tokio::spawn(executor.run(cancel.clone()));

    // ---- API ----
    let app = api::router(ApiState {
        dispatcher: dispatcher.clone(),
    });
    let api_addr = cfg.api_addr.clone();
    let api_cancel = cancel.clone();
    let mut api_handle = tokio::spawn(async move {
        if let Some(addr) = api_addr {
            let listener = tokio::net::TcpListener::bind(&addr).await?;
            tracing::info!(addr = %addr, "api listening");
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { api_cancel.cancelled().await })
                .await?;
        } else {
            api_cancel.cancelled().await;
        }
        Ok::<(), anyhow::Error>(())
    });

    let outcome = tokio::select! {
        () = shutdown_signal() => Ok(()),
        res = &mut api_handle => match res {
            Ok(inner) => inner,
            Err(e) => Err(e.into()),
        },
    };

    if let Err(e) = &outcome {
        tracing::error!(error = %e, "api server stopped");
    }

    // ---- Drain ----
    cancel.cancel();

    if tokio::time::timeout(DRAIN_TIMEOUT, &mut executor_handle)
        .await
        .is_err()
    {
        tracing::warn!("executor did not drain in time, aborting");
        executor_handle.abort();
    }

    if !api_handle.is_finished()
        && tokio::time::timeout(Duration::from_secs(5), &mut api_handle)
            .await
            .is_err()
    {
        api_handle.abort();
    }

    tracing::info!(
        connections = dispatcher.registry().connection_count(),
        "jobflow stopped"
    );
    outcome
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl-C");
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
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received Ctrl-C, shutting down"),
        () = terminate => tracing::info!("received SIGTERM, shutting down"),
    }
}
