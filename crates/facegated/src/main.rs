use anyhow::{Context, Result};
use facegate_core::event_log::EventLogWriter;
use facegate_core::memory::MemoryKeyStore;
use facegate_core::notifier::Notifier;
use facegate_core::sqlite::SqliteStore;
use facegate_core::{DedupConfig, DedupCoordinator, ImageStore, KeyValueStore, PipelineContext};
use rumqttc::AsyncClient;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod mqtt;
mod redis_store;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("facegated starting");

    let config = config::Config::from_env();
    tracing::info!(
        broker = %format!("{}:{}", config.mqtt_host, config.mqtt_port),
        topic = %config.subscribe_topic,
        db = %config.db_path.display(),
        uploads = %config.upload_root.display(),
        "configuration loaded"
    );

    let images = ImageStore::under(&config.upload_root);
    images
        .ensure_dirs()
        .context("upload directories are not usable")?;

    let db = SqliteStore::open(&config.db_path)
        .await
        .with_context(|| format!("failed to open database {}", config.db_path.display()))?;

    let kv: Arc<dyn KeyValueStore> = if config.redis_url == config::MEMORY_STORE_URL {
        tracing::warn!("using in-process lock store; run a single listener only");
        Arc::new(MemoryKeyStore::new())
    } else {
        Arc::new(
            redis_store::RedisKeyStore::connect(&config.redis_url)
                .await
                .context("failed to connect to redis")?,
        )
    };

    let (client, mut eventloop) = AsyncClient::new(
        mqtt::options(&config),
        (config.max_in_flight * 2).max(10),
    );
    mqtt::connect(&client, &mut eventloop, &config.subscribe_topic)
        .await
        .context("failed to connect to MQTT broker")?;

    let io_timeout = config.io_timeout();
    let ctx = Arc::new(PipelineContext {
        images,
        identities: Arc::new(db.clone()),
        events: EventLogWriter::new(Arc::new(db), io_timeout),
        notifier: Notifier::new(
            Arc::new(mqtt::MqttPublisher::new(client.clone())),
            &config.public_base_url,
            io_timeout,
        ),
        dedup: DedupCoordinator::new(
            kv,
            DedupConfig {
                lock_ttl: config.lock_ttl(),
                cooldown: config.cooldown(),
                op_timeout: io_timeout,
            },
        ),
        io_timeout,
    });

    tracing::info!("facegated ready");

    tokio::select! {
        _ = mqtt::listen(ctx, client.clone(), eventloop, config.subscribe_topic.clone(), config.max_in_flight) => {
            tracing::warn!("listener stopped");
        }
        result = tokio::signal::ctrl_c() => {
            result?;
            tracing::info!("facegated shutting down");
        }
    }

    if let Err(e) = client.try_disconnect() {
        tracing::debug!(error = %e, "disconnect request not sent");
    }

    Ok(())
}
