//! cargo run --example producer [config.toml]

use saturday_kafka::{BrokerConfig, Publisher, SyncPublisher};
use saturday_utils::logging::{config_logger, init_log_bridge, Log};
use serde_json::json;
use slog::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let log = Log::default();
    let logger = config_logger(&log)?;
    init_log_bridge(logger.clone(), log.level.inner())?;

    let cfg = match std::env::args().nth(1) {
        Some(name) => BrokerConfig::load(Some(&name))?,
        None => BrokerConfig::new(["localhost:9094"]),
    };

    let publisher = SyncPublisher::new(&cfg, logger.clone())?;
    let id = uuid::Uuid::new_v4().to_string();
    publisher.write(&json!({"name": "Peter", "age": 20, "id": &id}), "test_topic").await?;
    info!(logger, "message sent"; "id" => id);

    publisher.close().await;
    Ok(())
}
