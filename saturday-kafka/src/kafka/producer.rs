use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rdkafka::client::ClientContext;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::Message;
use rdkafka::producer::{
    BaseRecord, DeliveryResult, FutureProducer, FutureRecord, Producer, ProducerContext, ThreadedProducer,
};
use rdkafka::util::Timeout;
use slog::{info, Logger};
use tokio::sync::mpsc;

use crate::broker::{AsyncProducer, Delivery, ProducerError, ProducerRecord, ProducerSettings, SyncProducer};
use crate::{Error, Result};

const FLUSH_TIMEOUT: Duration = Duration::from_secs(10);
const QUEUE_FULL_BACKOFF: Duration = Duration::from_millis(10);

pub struct KafkaSyncProducer {
    producer: FutureProducer,
}

impl KafkaSyncProducer {
    pub fn new(settings: &ProducerSettings, logger: Logger) -> Result<Self> {
        let producer: FutureProducer = settings.client_config().create()?;
        info!(logger, "sync producer created"; "servers" => &settings.bootstrap_servers);
        Ok(Self { producer })
    }
}

#[async_trait]
impl SyncProducer for KafkaSyncProducer {
    async fn send(&self, record: ProducerRecord) -> Result<Delivery> {
        let mut frecord: FutureRecord<'_, str, [u8]> =
            FutureRecord::to(&record.topic).payload(record.payload.as_ref());
        if let Some(key) = record.key.as_deref() {
            frecord = frecord.key(key);
        }
        self.producer.send(frecord, Timeout::Never).await.map_err(|(e, _)| Error::Kafka(e))
    }

    async fn close(&self) -> Result<()> {
        let producer = self.producer.clone();
        tokio::task::spawn_blocking(move || producer.flush(FLUSH_TIMEOUT)).await??;
        Ok(())
    }
}

struct DeliveryContext {
    errors: Mutex<Option<mpsc::UnboundedSender<ProducerError>>>,
}

impl DeliveryContext {
    fn report(&self, record: ProducerRecord, error: KafkaError) {
        if let Some(tx) = self.errors.lock().as_ref() {
            let _ = tx.send(ProducerError { record, error: Error::Kafka(error) });
        }
    }
}

impl ClientContext for DeliveryContext {}

impl ProducerContext for DeliveryContext {
    type DeliveryOpaque = ();

    fn delivery(&self, delivery_result: &DeliveryResult<'_>, _: Self::DeliveryOpaque) {
        if let Err((e, m)) = delivery_result {
            let record = ProducerRecord {
                topic: m.topic().to_owned(),
                key: m.key().map(|k| String::from_utf8_lossy(k).into_owned()),
                payload: m.payload().map(Bytes::copy_from_slice).unwrap_or_default(),
            };
            self.report(record, e.clone());
        }
    }
}

/// Queues records and reports delivery failures through the error stream. librdkafka
/// batches and sends in the background every `linger.ms`.
pub struct KafkaAsyncProducer {
    producer: Arc<ThreadedProducer<DeliveryContext>>,
    errors_rx: Mutex<Option<mpsc::UnboundedReceiver<ProducerError>>>,
    closed: AtomicBool,
}

impl KafkaAsyncProducer {
    pub fn new(settings: &ProducerSettings, logger: Logger) -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let ctx = DeliveryContext { errors: Mutex::new(Some(tx)) };
        let producer: ThreadedProducer<DeliveryContext> = settings.client_config().create_with_context(ctx)?;
        info!(logger, "async producer created"; "servers" => &settings.bootstrap_servers);
        Ok(Self { producer: Arc::new(producer), errors_rx: Mutex::new(Some(rx)), closed: AtomicBool::new(false) })
    }
}

#[async_trait]
impl AsyncProducer for KafkaAsyncProducer {
    async fn enqueue(&self, record: ProducerRecord) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        loop {
            let mut base: BaseRecord<'_, str, [u8]> = BaseRecord::to(&record.topic).payload(record.payload.as_ref());
            if let Some(key) = record.key.as_deref() {
                base = base.key(key);
            }
            match self.producer.send(base) {
                Ok(()) => return Ok(()),
                Err((KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull), _)) => {
                    tokio::time::sleep(QUEUE_FULL_BACKOFF).await;
                }
                Err((e, _)) => {
                    // rejected before reaching the queue, still reported out of band
                    self.producer.context().report(record.clone(), e);
                    return Ok(());
                }
            }
        }
    }

    fn take_errors(&self) -> Option<mpsc::UnboundedReceiver<ProducerError>> {
        self.errors_rx.lock().take()
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let producer = self.producer.clone();
        let flushed = tokio::task::spawn_blocking(move || producer.flush(FLUSH_TIMEOUT)).await;
        self.producer.context().errors.lock().take();
        flushed??;
        Ok(())
    }
}
