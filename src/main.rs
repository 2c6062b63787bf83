use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};

mod boot;
mod broadcast;
mod cache;
mod config;
mod errors;
mod health;
mod ingest;
mod metrics;
mod models;
mod mqtt;
mod persist;
mod processor;

use broadcast::Broadcaster;
use cache::VehicleCache;
use config::AppConfig;
use health::HealthMonitor;
use ingest::MessageReceiver;
use mqtt::{ConnectionManager, ConnectionPool};
use persist::{BatchPersister, DatabaseService, LocationStore};
use processor::Processor;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();

    info!("starting geotrack-ingest v{}", env!("CARGO_PKG_VERSION"));
    boot::print_banner();

    let config = match AppConfig::load() {
        Ok(config) => {
            config.validate()?;
            info!(config = ?config.display_safe(), "configuration loaded and validated");
            config
        }
        Err(e) => {
            error!(error = %e, "failed to load configuration, falling back to development defaults");
            AppConfig::default_dev()
        }
    };

    let shutdown_signal = setup_shutdown_handler();

    let services = match initialize_services(&config).await {
        Ok(services) => services,
        Err(e) => {
            error!(error = %e, "service initialization failed, aborting startup");
            return Err(e);
        }
    };

    info!("all services initialized");

    let result = run(services, shutdown_signal).await;
    match &result {
        Ok(()) => info!("geotrack-ingest exited cleanly"),
        Err(e) => error!(error = %e, "geotrack-ingest exited with an error"),
    }
    result
}

struct Services {
    config: AppConfig,
    pool: Arc<ConnectionPool>,
    receiver: Arc<MessageReceiver>,
    persister: Arc<BatchPersister>,
    health_monitor: Arc<HealthMonitor>,
    connection_manager: Arc<ConnectionManager>,
    ingest_session: Arc<mqtt::Session>,
    cache: Arc<VehicleCache>,
}

async fn initialize_services(config: &AppConfig) -> Result<Services> {
    info!("connecting to Postgres");
    let db = Arc::new(DatabaseService::new(&config.database_url(), &config.database).await?);
    persist::database::run_migrations_best_effort(&db).await;

    let cache = Arc::new(VehicleCache::new(db.clone(), &config.cache));
    let location_store = Arc::new(LocationStore::new(db.clone(), cache.clone()));
    let persister = BatchPersister::spawn(db.clone(), config.batch.clone());
    let broadcaster = Arc::new(Broadcaster::new(config.batch.enqueue_buffer_size));

    info!("bringing up MQTT connection pool");
    let connection_manager = Arc::new(ConnectionManager::new(config.mqtt.clone()));
    let pool = ConnectionPool::new(connection_manager.clone(), config.pool.clone()).await?;

    info!("bringing up the dedicated ingest session");
    let ingest_session = Arc::new(connection_manager.create()?);
    connection_manager.connect(&ingest_session).await?;

    let health_monitor = Arc::new(HealthMonitor::new(config.health.clone(), pool.clone(), persister.clone()));

    let processor = Arc::new(Processor::new(
        config.processing.clone(),
        cache.clone(),
        persister.clone(),
        location_store.clone(),
        broadcaster.clone(),
        db.clone(),
        health_monitor.clone(),
    ));
    let receiver = MessageReceiver::new(processor.clone());

    Ok(Services {
        config: config.clone(),
        pool,
        receiver,
        persister,
        health_monitor,
        connection_manager,
        ingest_session,
        cache,
    })
}

async fn run(services: Services, shutdown_signal: tokio::sync::oneshot::Receiver<()>) -> Result<()> {
    let ingest_task = spawn_ingest_loop(services.ingest_session.clone(), services.receiver.clone());

    let scale_pool = services.pool.clone();
    let scale_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            scale_pool.scale_tick().await;
        }
    });

    let health_pool_monitor = services.health_monitor.clone();
    let health_interval = Duration::from_secs(services.config.health.check_interval_secs);
    let health_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(health_interval);
        loop {
            interval.tick().await;
            match health_pool_monitor.run_once().await {
                Some(alerts) => {
                    for alert in alerts {
                        warn!(category = %alert.category, message = %alert.message, "health alert");
                    }
                }
                None => {
                    warn!("health check skipped: circuit breaker open");
                }
            }
        }
    });

    let maintenance_cache = services.cache.clone();
    let maintenance_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(300));
        loop {
            interval.tick().await;
            maintenance_cache.maintenance_tick().await;
        }
    });

    let reporting_pool = services.pool.clone();
    let reporting_health = services.health_monitor.clone();
    let reporting_receiver = services.receiver.clone();
    let reporting_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(10));
        loop {
            interval.tick().await;
            let active = reporting_receiver.active_device_count() as i64;
            reporting_pool.record_active_devices(active as usize);
            reporting_health.record_active_devices(active);
        }
    });

    tokio::select! {
        _ = shutdown_signal => {
            info!("shutdown signal received");
        }
        _ = ingest_task => {
            warn!("ingest task terminated unexpectedly");
        }
        _ = scale_task => {
            warn!("pool scaling task terminated unexpectedly");
        }
        _ = health_task => {
            warn!("health monitor task terminated unexpectedly");
        }
    }

    shutdown(services).await;
    Ok(())
}

fn spawn_ingest_loop(
    session: Arc<mqtt::Session>,
    receiver: Arc<MessageReceiver>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let mut event_loop = session.event_loop.lock().await;
            match event_loop.poll().await {
                Ok(rumqttc::Event::Incoming(rumqttc::Packet::Publish(publish))) => {
                    drop(event_loop);
                    let receiver = receiver.clone();
                    let topic = publish.topic.clone();
                    let payload = publish.payload.clone();
                    tokio::spawn(async move {
                        if let Err(e) = receiver.ingest(&topic, &payload).await {
                            warn!(%topic, error = %e, "failed to ingest message");
                        }
                    });
                }
                Ok(_) => {}
                Err(e) => {
                    drop(event_loop);
                    warn!(error = %e, "ingest session event loop error");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    })
}

async fn shutdown(services: Services) {
    info!("beginning graceful shutdown");

    // (1) stop accepting new sessions / (2) stop accepting enqueue is
    // implicit once we stop polling; (3) drain worker queues.
    services.persister.shutdown().await;

    // (4) disconnect sessions with a per-session timeout.
    services
        .connection_manager
        .disconnect(&services.ingest_session, Duration::from_secs(5))
        .await
        .ok();
    services.pool.shutdown(Duration::from_secs(5)).await;

    info!("shutdown complete");
}

fn setup_shutdown_handler() -> tokio::sync::oneshot::Receiver<()> {
    let (tx, rx) = tokio::sync::oneshot::channel();

    tokio::spawn(async move {
        let mut tx = Some(tx);
        if signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received");
            if let Some(sender) = tx.take() {
                let _ = sender.send(());
            }
        }
    });

    rx
}
