pub mod api;
pub mod cli;
pub mod config;
pub mod constants;
pub mod db;
pub mod domain;
pub mod entities;
pub mod parser;
pub mod services;
pub mod state;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use cli::{Cli, Commands};
pub use config::Config;
use services::{Scheduler, WebhookNotifier, WorkerPool};
use state::SharedState;

pub async fn run(config: Config) -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Daemon) {
        Commands::Init => {
            if Config::create_default_if_missing()? {
                println!("✓ Config file created. Edit config.toml and run again.");
            } else {
                println!("config.toml already exists, leaving it untouched.");
            }
            Ok(())
        }

        Commands::Cron { expression, count } => cli::cmd_cron(&expression, count),

        Commands::Verify { path } => cli::cmd_verify(&path),

        Commands::Daemon => {
            config.validate()?;
            let prometheus_handle = init_observability(&config)?;
            run_daemon(config, prometheus_handle).await
        }
    }
}

fn init_observability(
    config: &Config,
) -> anyhow::Result<Option<metrics_exporter_prometheus::PrometheusHandle>> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.general.log_level));

    let json = config.observability.log_format.eq_ignore_ascii_case("json");

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(json.then(|| fmt::layer().json()))
        .with((!json).then(fmt::layer));

    if config.observability.loki_enabled {
        let url = url::Url::parse(&config.observability.loki_url).context("Invalid Loki URL")?;

        let mut builder = tracing_loki::builder();
        for (key, value) in &config.observability.loki_labels {
            builder = builder.label(key.as_str(), value.as_str())?;
        }
        let (layer, task) = builder.build_url(url)?;

        tokio::spawn(task);

        registry.with(layer).init();
        info!(
            "Loki logging initialized at {}",
            config.observability.loki_url
        );
    } else {
        registry.init();
    }

    let prometheus_handle = if config.observability.metrics_enabled {
        use metrics_exporter_prometheus::PrometheusBuilder;
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .context("Failed to install Prometheus recorder")?;
        info!("Prometheus metrics recorder initialized");
        Some(handle)
    } else {
        None
    };

    Ok(prometheus_handle)
}

async fn run_daemon(
    config: Config,
    prometheus_handle: Option<metrics_exporter_prometheus::PrometheusHandle>,
) -> anyhow::Result<()> {
    info!(
        "ldapguard v{} starting in daemon mode...",
        env!("CARGO_PKG_VERSION")
    );
    if config.jwt_secret_is_default() {
        warn!("security.jwt_secret is the built-in default, set LDAPGUARD_JWT_SECRET");
    }

    let shared = Arc::new(SharedState::new(config.clone()).await?);

    let pool = WorkerPool::new(shared.job_runner(), shared.queue.clone(), config.jobs.clone());
    let receiver = shared
        .take_job_receiver()
        .await
        .context("Job queue receiver already taken")?;
    let worker_handles = pool.start(receiver).await?;

    let scheduler = Arc::new(Scheduler::new(
        shared.schedule_runner.clone(),
        shared.retention.clone(),
        config.scheduler.clone(),
    ));
    let scheduler_handle = {
        let sched = Arc::clone(&scheduler);
        tokio::spawn(async move {
            if let Err(e) = sched.start().await {
                error!("Scheduler error: {}", e);
            }
        })
    };

    let notifier_handle = if config.webhooks.enabled {
        let notifier = WebhookNotifier::new(&config.webhooks)?;
        Some(tokio::spawn(notifier.run(shared.event_bus.subscribe())))
    } else {
        None
    };

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    let server_handle = if config.server.enabled {
        let port = config.server.port;
        let api_state = api::create_app_state(Arc::clone(&shared), prometheus_handle);
        let app = api::router(api_state).await;
        let addr = format!("0.0.0.0:{port}");
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind {addr}"))?;

        Some(tokio::spawn(async move {
            info!("Web API listening on http://0.0.0.0:{}", port);
            let shutdown = async move {
                let _ = shutdown_rx.changed().await;
            };
            if let Err(e) = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(shutdown)
            .await
            {
                error!("Web server error: {}", e);
            }
        }))
    } else {
        None
    };

    info!("Daemon running. Press Ctrl+C to stop.");

    match signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => error!("Error listening for shutdown: {}", e),
    }

    scheduler.stop().await;
    pool.stop().await;
    let _ = shutdown_tx.send(true);

    if let Some(handle) = server_handle {
        let _ = handle.await;
    }
    let _ = scheduler_handle.await;

    // Jobs interrupted here are picked up by recovery on the next start.
    for handle in worker_handles {
        handle.abort();
    }
    if let Some(handle) = notifier_handle {
        handle.abort();
    }

    info!("Daemon stopped");
    Ok(())
}
