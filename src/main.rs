use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use http::HeaderValue;
use tokio::{
    signal,
    sync::{mpsc, watch},
};
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
};
use tracing::{error, info};

use erp_fulfillment as api;
use api::message_queue::{JobWorker, WorkerOptions};
use api::scheduler::{LowStockSweep, OverdueInvoiceSweep, Scheduler};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = api::config::load_config().context("failed to load configuration")?;
    api::config::init_tracing(cfg.log_level(), cfg.log_json);
    api::handlers::health::init_start_time();

    // Init DB
    let db_pool = api::db::establish_connection_from_app_config(&cfg)
        .await
        .context("failed to connect to the database")?;
    if cfg.auto_migrate {
        api::db::run_migrations(&db_pool).await.map_err(|e| {
            error!("Failed running migrations: {}", e);
            e
        })?;
    }
    let db_arc = Arc::new(db_pool);

    // Init events
    let (event_tx, event_rx) = mpsc::channel(1024);
    let event_sender = Arc::new(api::events::EventSender::new(event_tx));
    tokio::spawn(api::events::process_events(event_rx));

    let mail = Arc::new(api::services::mail::MailService::from_config(&cfg)?);
    let auth_service = Arc::new(api::auth::AuthService::new(&cfg.jwt_secret));
    let services = api::handlers::AppServices::new(db_arc.clone(), event_sender.clone(), mail);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Order-processing workers
    let worker_options = WorkerOptions {
        concurrency: cfg.queue_concurrency,
        poll_interval: Duration::from_millis(cfg.queue_poll_interval_ms),
        remove_on_complete: cfg.queue_remove_on_complete,
        remove_on_fail: cfg.queue_remove_on_fail,
        stall_timeout: Duration::from_secs(cfg.queue_stall_timeout_secs),
    };
    let mut background = JobWorker::spawn(
        services.order_queue.clone(),
        services.order_processor.clone(),
        worker_options,
        shutdown_rx.clone(),
    );

    // Daily sweeps
    if cfg.scheduler_enabled {
        let scheduler = Scheduler::new()
            .daily(
                cfg.overdue_sweep_time()?,
                Arc::new(OverdueInvoiceSweep::new(
                    services.invoices.clone(),
                    services.notifications.clone(),
                )),
            )
            .daily(
                cfg.low_stock_sweep_time()?,
                Arc::new(LowStockSweep::new(
                    services.products.clone(),
                    services.notifications.clone(),
                )),
            );
        info!(tasks = scheduler.len(), "scheduler enabled");
        background.extend(scheduler.spawn(shutdown_rx.clone()));
    } else {
        info!("scheduler disabled by configuration");
    }

    // Compose shared app state
    let app_state = api::AppState {
        db: db_arc.clone(),
        config: cfg.clone(),
        event_sender,
        services,
        auth: auth_service,
    };

    // Build CORS layer from config
    let configured_origins: Option<Vec<HeaderValue>> = cfg
        .cors_allowed_origins
        .as_ref()
        .map(|raw| {
            raw.split(',')
                .filter_map(|origin| {
                    let trimmed = origin.trim();
                    if trimmed.is_empty() {
                        None
                    } else {
                        HeaderValue::from_str(trimmed).ok()
                    }
                })
                .collect::<Vec<_>>()
        })
        .filter(|origins| !origins.is_empty());

    let cors_layer = match configured_origins {
        Some(origins) => CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any),
        None => {
            info!("Using permissive CORS because explicit origins were not configured");
            CorsLayer::permissive()
        }
    };

    let app = api::app_router(app_state)
        .layer(CompressionLayer::new())
        .layer(cors_layer);

    // Bind and serve
    let host: std::net::IpAddr = cfg
        .host
        .parse()
        .with_context(|| format!("invalid host address {}", cfg.host))?;
    let addr = SocketAddr::from((host, cfg.port));
    info!("erp-fulfillment listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Stop workers and sweeps, letting in-flight jobs finish
    let _ = shutdown_tx.send(true);
    for handle in background {
        if let Err(e) = handle.await {
            error!(error = %e, "background task ended abnormally");
        }
    }
    info!("shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
