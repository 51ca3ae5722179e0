use async_trait::async_trait;
use bytes::Bytes;
use slog::{debug, error, o, Logger};
use tokio::sync::broadcast;

use crate::broker::{ProducerRecord, ProducerSettings, SyncProducer};
use crate::config::BrokerConfig;
use crate::kafka::KafkaSyncProducer;
use crate::size::{SizeGovernor, SizeWarning};
use crate::Result;

use super::Publisher;

/// Every write waits for the partition leader to acknowledge the record and returns
/// the broker error if it does not.
pub struct SyncPublisher {
    producer: Box<dyn SyncProducer>,
    size: SizeGovernor,
    logger: Logger,
}

impl SyncPublisher {
    pub fn new(cfg: &BrokerConfig, logger: Logger) -> Result<Self> {
        cfg.validate()?;
        let logger = logger.new(o!("publisher" => "sync"));
        let settings = ProducerSettings::from_config(cfg);
        let producer = KafkaSyncProducer::new(&settings, logger.clone())?;
        Ok(Self::with_producer(producer, settings.max_message_bytes, logger))
    }

    pub fn with_producer(producer: impl SyncProducer + 'static, ceiling: usize, logger: Logger) -> Self {
        Self { producer: Box::new(producer), size: SizeGovernor::new(ceiling, logger.clone()), logger }
    }

    #[inline]
    pub fn max_message_bytes(&self) -> usize {
        self.size.ceiling()
    }
}

#[async_trait]
impl Publisher for SyncPublisher {
    async fn write_bytes(&self, topic: &str, key: Option<&str>, payload: Bytes) -> Result<()> {
        self.size.check(topic, payload.len());
        let record = ProducerRecord::new(topic, key.map(str::to_owned), payload);
        match self.producer.send(record).await {
            Ok((partition, offset)) => {
                debug!(self.logger, "message sent"; "topic" => topic, "partition" => partition, "offset" => offset);
                Ok(())
            }
            Err(e) => {
                error!(self.logger, "send message failed"; "topic" => topic, "error" => %e);
                Err(e)
            }
        }
    }

    fn subscribe_size_warnings(&self) -> broadcast::Receiver<SizeWarning> {
        self.size.subscribe()
    }

    async fn close(self) {
        if let Err(e) = self.producer.close().await {
            error!(self.logger, "close producer failed"; "error" => %e);
        }
    }
}
