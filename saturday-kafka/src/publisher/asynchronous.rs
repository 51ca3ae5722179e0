use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use slog::{debug, error, o, Logger};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::broker::{AsyncProducer, ProducerError, ProducerRecord, ProducerSettings};
use crate::config::BrokerConfig;
use crate::kafka::KafkaAsyncProducer;
use crate::size::{SizeGovernor, SizeWarning};
use crate::{Error, Result};

use super::Publisher;

/// Writes return once the record is queued. Broker failures never reach the caller,
/// a drain task logs them.
pub struct AsyncPublisher {
    producer: Arc<dyn AsyncProducer>,
    size: SizeGovernor,
    drain: JoinHandle<()>,
    logger: Logger,
}

impl AsyncPublisher {
    /// Fails with [`Error::NoRuntime`] outside a tokio runtime.
    pub fn new(cfg: &BrokerConfig, logger: Logger) -> Result<Self> {
        cfg.validate()?;
        tokio::runtime::Handle::try_current()?;
        let logger = logger.new(o!("publisher" => "async"));
        let settings = ProducerSettings::from_config(cfg);
        let producer = KafkaAsyncProducer::new(&settings, logger.clone())?;
        Self::with_producer(producer, settings.max_message_bytes, logger)
    }

    /// Must be called inside a tokio runtime, the drain task starts here.
    pub fn with_producer(producer: impl AsyncProducer + 'static, ceiling: usize, logger: Logger) -> Result<Self> {
        let errors = producer.take_errors().ok_or(Error::Closed)?;
        let drain = tokio::spawn(drain_errors(errors, logger.clone()));
        Ok(Self {
            producer: Arc::new(producer),
            size: SizeGovernor::new(ceiling, logger.clone()),
            drain,
            logger,
        })
    }

    #[inline]
    pub fn max_message_bytes(&self) -> usize {
        self.size.ceiling()
    }

    /// Start drain-and-close without waiting for in-flight records. The returned handle
    /// resolves once the producer is closed and every pending failure was logged.
    pub fn close_with_handle(self) -> DrainHandle {
        let producer = self.producer;
        let logger = self.logger;
        let closing = tokio::spawn(async move {
            if let Err(e) = producer.close().await {
                error!(logger, "close producer failed"; "error" => %e);
            }
        });
        DrainHandle { closing, drain: self.drain }
    }
}

#[async_trait]
impl Publisher for AsyncPublisher {
    async fn write_bytes(&self, topic: &str, key: Option<&str>, payload: Bytes) -> Result<()> {
        self.size.check(topic, payload.len());
        self.producer.enqueue(ProducerRecord::new(topic, key.map(str::to_owned), payload)).await
    }

    fn subscribe_size_warnings(&self) -> broadcast::Receiver<SizeWarning> {
        self.size.subscribe()
    }

    async fn close(self) {
        // detached, the drain task exits when the producer ends its error stream
        let _ = self.close_with_handle();
    }
}

/// Owner handle of the background close and error drain
pub struct DrainHandle {
    closing: JoinHandle<()>,
    drain: JoinHandle<()>,
}

impl DrainHandle {
    pub async fn join(self) -> Result<()> {
        self.closing.await?;
        self.drain.await?;
        Ok(())
    }
}

async fn drain_errors(mut errors: mpsc::UnboundedReceiver<ProducerError>, logger: Logger) {
    while let Some(ProducerError { record, error }) = errors.recv().await {
        error!(logger, "failed to write entry";
            "topic" => &record.topic, "key" => ?record.key, "len" => record.payload.len(), "error" => %error);
    }
    debug!(logger, "producer error stream closed");
}
