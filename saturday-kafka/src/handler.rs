use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use slog::{error, info, warn, Logger};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::broker::{GroupClaim, GroupHandler, GroupSession, Record};
use crate::Result;

/// Per-message execution context
#[derive(Debug, Clone)]
pub struct MessageContext {
    pub request_id: Uuid,
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    /// Cancelled when the group session ends
    pub token: CancellationToken,
}

/// Application callback for consumed records. An `Err` leaves the record unmarked so
/// it is delivered again after the next rebalance or restart.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, ctx: MessageContext, topic: String, payload: Bytes) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(MessageContext, String, Bytes) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, ctx: MessageContext, topic: String, payload: Bytes) -> anyhow::Result<()> {
        (self)(ctx, topic, payload).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Mark the record, its offset is committed
    Acknowledge,
    /// Leave the record unmarked
    Redeliver,
}

impl<T, E> From<&std::result::Result<T, E>> for Outcome {
    #[inline]
    fn from(res: &std::result::Result<T, E>) -> Self {
        if res.is_ok() {
            Outcome::Acknowledge
        } else {
            Outcome::Redeliver
        }
    }
}

/// Closed once, by the first `setup` of a join attempt.
#[derive(Debug, Clone, Default)]
pub struct ReadinessGate(CancellationToken);

impl ReadinessGate {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn close(&self) {
        self.0.cancel();
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.0.is_cancelled()
    }

    pub async fn wait(&self) {
        self.0.cancelled().await
    }
}

/// Bridges group lifecycle events to the application callback. One instance per join
/// attempt.
pub(crate) struct SessionHandler {
    callback: Arc<dyn MessageHandler>,
    group: String,
    gate: ReadinessGate,
    max_processing_time: Duration,
    logger: Logger,
}

impl SessionHandler {
    pub(crate) fn new(
        callback: Arc<dyn MessageHandler>,
        group: String,
        gate: ReadinessGate,
        max_processing_time: Duration,
        logger: Logger,
    ) -> Self {
        Self { callback, group, gate, max_processing_time, logger }
    }

    async fn deliver(&self, session: &dyn GroupSession, record: &Record) -> Outcome {
        let ctx = MessageContext {
            request_id: Uuid::new_v4(),
            topic: record.topic.clone(),
            partition: record.partition,
            offset: record.offset,
            token: session.context().child_token(),
        };
        let request_id = ctx.request_id;

        let now = Instant::now();
        let res = self.callback.handle(ctx, record.topic.clone(), record.payload.clone()).await;
        let elapsed = now.elapsed();
        if elapsed > self.max_processing_time {
            warn!(self.logger, "slow message handler";
                "request_id" => %request_id, "topic" => &record.topic, "partition" => record.partition,
                "offset" => record.offset, "elapsed" => ?elapsed, "max_processing_time" => ?self.max_processing_time);
        }
        if let Err(e) = &res {
            error!(self.logger, "handle message failed";
                "request_id" => %request_id, "topic" => &record.topic, "partition" => record.partition,
                "offset" => record.offset, "error" => ?e);
        }
        Outcome::from(&res)
    }
}

#[async_trait]
impl GroupHandler for SessionHandler {
    async fn setup(&self, _session: &dyn GroupSession) -> Result<()> {
        info!(self.logger, "setup consumer group handler"; "group" => &self.group);
        self.gate.close();
        Ok(())
    }

    async fn cleanup(&self, _session: &dyn GroupSession) -> Result<()> {
        info!(self.logger, "cleanup consumer group handler"; "group" => &self.group);
        Ok(())
    }

    async fn consume_claim(&self, session: &dyn GroupSession, claim: &mut dyn GroupClaim) -> Result<()> {
        loop {
            let record = tokio::select! {
                biased;
                _ = session.context().cancelled() => break,
                record = claim.next() => match record {
                    Some(record) => record,
                    None => break,
                },
            };
            match self.deliver(session, &record).await {
                Outcome::Acknowledge => session.mark_message(&record),
                Outcome::Redeliver => {}
            }
        }
        Ok(())
    }
}
