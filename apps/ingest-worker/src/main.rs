//! Ingestion worker binary.
//!
//! Pulls events off a NATS JetStream source stream, persists them into
//! Postgres, and dead-letters anything that cannot be processed, per
//! the processing loop. Exposes health/readiness/metrics on
//! `HEALTH_PORT`.

mod config;

use std::process::ExitCode;

use core_config::{Environment, FromEnv};
use database::postgres::run_migrations;
use domain_ingest::PostgresStore;
use ingest_core::ProcessingLoop;
use nats_log::{init_metrics, HealthServer, IngestMetrics, NatsDeadLetterLog, NatsSourceLog};
use tokio::sync::watch;
use tracing::{error, info};

use crate::config::IngestConfig;

#[tokio::main]
async fn main() -> ExitCode {
    let environment = Environment::from_env();
    core_config::tracing::init_tracing(&environment);

    let config = match IngestConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("invalid configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "ingest worker exiting on startup failure");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: IngestConfig) -> eyre::Result<()> {
    info!(nats_url = %config.nats_url, workers = config.worker_count, "starting ingest worker");

    let db = database::postgres::connect_with_retry(&config.database_url, None).await?;
    run_migrations::<migration::Migrator>(&db, "ingest-worker").await?;

    let client = async_nats::connect(&config.nats_url).await?;
    let jetstream = async_nats::jetstream::new(client.clone());

    let source_log = NatsSourceLog::connect(jetstream.clone(), config.stream.clone()).await?;
    let dead_letter_log =
        NatsDeadLetterLog::connect(client.clone(), jetstream.clone(), &config.stream).await?;

    let metrics_handle = init_metrics();
    let health = HealthServer::new(config.stream.health_port).with_metrics(metrics_handle);
    let health_state = health.state();

    let (cancel_tx, cancel_rx) = watch::channel(false);

    let health_task = tokio::spawn(async move {
        if let Err(e) = health.run().await {
            error!(error = %e, "health server exited");
        }
    });

    let mut worker_handles = Vec::with_capacity(config.worker_count);
    for worker_id in 0..config.worker_count {
        let log = source_log.clone_for_worker();
        let store = PostgresStore::new(db.clone());
        let dlq = dead_letter_log.clone();
        let policy = config.retry;
        let cancel_rx = cancel_rx.clone();
        let health_state = health_state.clone();

        let stream_name = config.stream.source_stream.clone();
        let consumer_name = config.stream.consumer_durable_name.clone();

        worker_handles.push(tokio::spawn(async move {
            let processing = ProcessingLoop::new(log, store, dlq, policy)
                .with_metrics(IngestMetrics::new(&stream_name, &consumer_name));
            info!(worker_id, "worker started");
            processing.run(cancel_rx).await;
            health_state.set_loop_healthy(false).await;
            info!(worker_id, "worker stopped");
        }));
    }

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, cancelling workers");
    let _ = cancel_tx.send(true);

    for handle in worker_handles {
        let _ = handle.await;
    }

    health_task.abort();
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
