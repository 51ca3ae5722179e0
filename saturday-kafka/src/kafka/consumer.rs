use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rdkafka::client::ClientContext;
use rdkafka::consumer::stream_consumer::StreamConsumer;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance};
use rdkafka::error::{KafkaError, KafkaResult, RDKafkaErrorCode};
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::topic_partition_list::TopicPartitionList;
use slog::{debug, info, warn, Logger};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

use crate::broker::{ConsumerGroup, ConsumerSettings, GroupClaim, GroupHandler, GroupSession, Record};
use crate::{Error, Result};

const ERROR_BACKOFF: Duration = Duration::from_millis(1000);

struct GroupContext {
    logger: Logger,
    errors: Mutex<Option<mpsc::UnboundedSender<Error>>>,
    generation: Mutex<Option<CancellationToken>>,
    assigned: AtomicBool,
    assign_notify: Notify,
}

impl GroupContext {
    fn report(&self, e: Error) {
        match self.errors.lock().as_ref() {
            Some(tx) => {
                let _ = tx.send(e);
            }
            None => debug!(self.logger, "consumer error"; "error" => %e),
        }
    }
}

impl ClientContext for GroupContext {
    fn error(&self, error: KafkaError, reason: &str) {
        debug!(self.logger, "client error"; "reason" => reason);
        self.report(Error::Kafka(error));
    }
}

impl ConsumerContext for GroupContext {
    fn pre_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        debug!(self.logger, "pre rebalance"; "rebalance" => ?rebalance);
        if let Rebalance::Revoke(_) = rebalance {
            self.assigned.store(false, Ordering::SeqCst);
            if let Some(generation) = self.generation.lock().take() {
                generation.cancel();
            }
        }
    }

    fn post_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        debug!(self.logger, "post rebalance"; "rebalance" => ?rebalance);
        match rebalance {
            Rebalance::Assign(_) => {
                self.assigned.store(true, Ordering::SeqCst);
                self.assign_notify.notify_one();
            }
            Rebalance::Error(e) => self.report(Error::Kafka(e.clone())),
            Rebalance::Revoke(_) => {}
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, _offsets: &TopicPartitionList) {
        match result {
            Ok(_) => debug!(self.logger, "offsets committed successfully"),
            Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset)) => {}
            Err(e) => warn!(self.logger, "error while committing offsets"; "error" => %e),
        }
    }
}

/// Consumer-group member over a librdkafka stream consumer.
///
/// A generation begins with the partition assignment and ends when the partitions are
/// revoked. The whole assignment is delivered through one claim, so records of a
/// partition keep their order.
pub struct KafkaConsumerGroup {
    consumer: Arc<StreamConsumer<GroupContext>>,
    subscribed: Mutex<Vec<String>>,
    errors_rx: Mutex<Option<mpsc::UnboundedReceiver<Error>>>,
    logger: Logger,
}

impl KafkaConsumerGroup {
    pub fn new(settings: &ConsumerSettings, logger: Logger) -> Result<Self> {
        let (errors, errors_rx) = if settings.return_errors {
            let (tx, rx) = mpsc::unbounded_channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        let ctx = GroupContext {
            logger: logger.clone(),
            errors: Mutex::new(errors),
            generation: Mutex::new(None),
            assigned: AtomicBool::new(false),
            assign_notify: Notify::new(),
        };
        let consumer: StreamConsumer<GroupContext> = settings.client_config().create_with_context(ctx)?;
        info!(logger, "consumer group created"; "group" => &settings.group, "servers" => &settings.bootstrap_servers);
        Ok(Self {
            consumer: Arc::new(consumer),
            subscribed: Mutex::new(Vec::new()),
            errors_rx: Mutex::new(errors_rx),
            logger,
        })
    }

    fn subscribe(&self, topics: &[String]) -> Result<()> {
        let mut subscribed = self.subscribed.lock();
        if subscribed.as_slice() != topics {
            let names = topics.iter().map(String::as_str).collect::<Vec<_>>();
            self.consumer.subscribe(&names)?;
            *subscribed = topics.to_vec();
            info!(self.logger, "subscribed"; "topics" => ?topics);
        }
        Ok(())
    }

    /// Waits for the partition assignment. Returns the first record if one arrived
    /// before the assignment notification, `None` from the outer option on cancellation.
    async fn wait_assignment(&self, generation: &CancellationToken) -> Option<Option<Record>> {
        let ctx = self.consumer.context();
        loop {
            if ctx.assigned.load(Ordering::SeqCst) {
                return Some(None);
            }
            tokio::select! {
                _ = generation.cancelled() => return None,
                _ = ctx.assign_notify.notified() => {}
                msg = self.consumer.recv() => match msg {
                    Ok(m) => return Some(Some(to_record(&m))),
                    Err(e) => {
                        ctx.report(Error::Kafka(e));
                        tokio::time::sleep(ERROR_BACKOFF).await;
                    }
                },
            }
        }
    }
}

#[async_trait]
impl ConsumerGroup for KafkaConsumerGroup {
    async fn consume(&self, ctx: &CancellationToken, topics: &[String], handler: &dyn GroupHandler) -> Result<()> {
        if ctx.is_cancelled() {
            return Ok(());
        }
        self.subscribe(topics)?;

        let generation = ctx.child_token();
        *self.consumer.context().generation.lock() = Some(generation.clone());

        let first = match self.wait_assignment(&generation).await {
            Some(first) => first,
            None => return Ok(()),
        };

        let session = KafkaSession {
            consumer: self.consumer.clone(),
            token: generation.clone(),
            logger: self.logger.clone(),
        };
        let mut claim = KafkaClaim { consumer: self.consumer.clone(), token: generation.clone(), pending: first };

        let result = match handler.setup(&session).await {
            Ok(()) => {
                let consumed = handler.consume_claim(&session, &mut claim).await;
                let cleaned = handler.cleanup(&session).await;
                consumed.and(cleaned)
            }
            Err(e) => Err(e),
        };
        generation.cancel();
        self.consumer.context().generation.lock().take();
        result
    }

    fn pause_all(&self) {
        match self.consumer.assignment() {
            Ok(tpl) => match self.consumer.pause(&tpl) {
                Ok(()) => info!(self.logger, "paused all partitions"; "count" => tpl.count()),
                Err(e) => warn!(self.logger, "pause partitions failed"; "error" => %e),
            },
            Err(e) => warn!(self.logger, "get assignment failed"; "error" => %e),
        }
    }

    fn take_errors(&self) -> Option<mpsc::UnboundedReceiver<Error>> {
        self.errors_rx.lock().take()
    }

    async fn close(&self) -> Result<()> {
        let consumer = self.consumer.clone();
        let closed = tokio::task::spawn_blocking(move || {
            let committed = match consumer.commit_consumer_state(CommitMode::Sync) {
                Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset)) => Ok(()),
                other => other,
            };
            consumer.unsubscribe();
            committed
        })
        .await;
        self.consumer.context().errors.lock().take();
        closed??;
        info!(self.logger, "consumer group closed");
        Ok(())
    }
}

struct KafkaSession {
    consumer: Arc<StreamConsumer<GroupContext>>,
    token: CancellationToken,
    logger: Logger,
}

impl GroupSession for KafkaSession {
    fn mark_message(&self, record: &Record) {
        if self.token.is_cancelled() {
            debug!(self.logger, "session done, mark skipped";
                "topic" => &record.topic, "partition" => record.partition, "offset" => record.offset);
            return;
        }
        if let Err(e) = self.consumer.store_offset(&record.topic, record.partition, record.offset + 1) {
            warn!(self.logger, "store offset failed";
                "topic" => &record.topic, "partition" => record.partition, "offset" => record.offset, "error" => %e);
        }
    }

    fn context(&self) -> &CancellationToken {
        &self.token
    }
}

struct KafkaClaim {
    consumer: Arc<StreamConsumer<GroupContext>>,
    token: CancellationToken,
    pending: Option<Record>,
}

#[async_trait]
impl GroupClaim for KafkaClaim {
    async fn next(&mut self) -> Option<Record> {
        if let Some(record) = self.pending.take() {
            return Some(record);
        }
        loop {
            tokio::select! {
                _ = self.token.cancelled() => return None,
                msg = self.consumer.recv() => match msg {
                    Ok(m) => return Some(to_record(&m)),
                    Err(e) => {
                        self.consumer.context().report(Error::Kafka(e));
                        tokio::time::sleep(ERROR_BACKOFF).await;
                    }
                },
            }
        }
    }
}

fn to_record(m: &BorrowedMessage<'_>) -> Record {
    Record {
        topic: m.topic().to_owned(),
        partition: m.partition(),
        offset: m.offset(),
        key: m.key().map(Bytes::copy_from_slice),
        payload: m.payload().map(Bytes::copy_from_slice).unwrap_or_default(),
        timestamp: m.timestamp().to_millis(),
    }
}
