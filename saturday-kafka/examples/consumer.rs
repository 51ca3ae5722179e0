//! cargo run --example consumer [config.toml], stop with Ctrl-C

use bytes::Bytes;
use saturday_kafka::{BrokerConfig, MessageContext, Subscriber};
use saturday_utils::logging::{config_logger, init_log_bridge, Log};

async fn handler(ctx: MessageContext, topic: String, value: Bytes) -> anyhow::Result<()> {
    println!("[{}] {topic}/{}@{}: {}", ctx.request_id, ctx.partition, ctx.offset, String::from_utf8_lossy(&value));
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let log = Log::default();
    let logger = config_logger(&log)?;
    init_log_bridge(logger.clone(), log.level.inner())?;

    let cfg = match std::env::args().nth(1) {
        Some(name) => BrokerConfig::load(Some(&name))?,
        None => {
            let mut cfg = BrokerConfig::new(["localhost:9094"]);
            cfg.group = "test".into();
            cfg.topics = vec!["test_topic".into()];
            cfg
        }
    };

    Subscriber::new(&cfg, logger)?.read(handler).await?;
    Ok(())
}
