//! The broker client seam.
//!
//! Publishers and the subscriber only talk to these traits. [`crate::kafka`] implements
//! them on top of librdkafka; tests use in-memory doubles.

use async_trait::async_trait;
use bytes::Bytes;
use rdkafka::config::{ClientConfig, RDKafkaLogLevel};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::{BrokerConfig, InitialOffset, KafkaVersion};
use crate::sasl::ScramAuth;
use crate::{Error, Result};

/// A record delivered to a consumer-group member
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Bytes>,
    pub payload: Bytes,
    pub timestamp: Option<i64>,
}

/// A record handed to a producer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerRecord {
    pub topic: String,
    pub key: Option<String>,
    pub payload: Bytes,
}

impl ProducerRecord {
    pub fn new(topic: impl Into<String>, key: Option<String>, payload: impl Into<Bytes>) -> Self {
        Self { topic: topic.into(), key, payload: payload.into() }
    }
}

/// Partition and offset the broker stored a record at
pub type Delivery = (i32, i64);

/// A record the broker refused after it was enqueued
#[derive(Debug)]
pub struct ProducerError {
    pub record: ProducerRecord,
    pub error: Error,
}

/// Waits for the broker acknowledgement of every record.
#[async_trait]
pub trait SyncProducer: Send + Sync {
    async fn send(&self, record: ProducerRecord) -> Result<Delivery>;

    async fn close(&self) -> Result<()>;
}

/// Fire-and-forget delivery, failures arrive on the error stream.
#[async_trait]
pub trait AsyncProducer: Send + Sync {
    /// Resolves once the record is queued locally. Fails only when the producer is closed.
    async fn enqueue(&self, record: ProducerRecord) -> Result<()>;

    /// The error stream, available once
    fn take_errors(&self) -> Option<mpsc::UnboundedReceiver<ProducerError>>;

    /// Flush what is queued, then end the error stream
    async fn close(&self) -> Result<()>;
}

/// One generation of group membership
pub trait GroupSession: Send + Sync {
    /// Mark `record` as processed. Ignored once the session is done.
    fn mark_message(&self, record: &Record);

    /// Cancelled when the generation ends
    fn context(&self) -> &CancellationToken;
}

/// Records of the partitions claimed in this generation, in partition order
#[async_trait]
pub trait GroupClaim: Send {
    /// `None` when the claim ends
    async fn next(&mut self) -> Option<Record>;
}

/// Group lifecycle callbacks
#[async_trait]
pub trait GroupHandler: Send + Sync {
    async fn setup(&self, session: &dyn GroupSession) -> Result<()>;

    async fn cleanup(&self, session: &dyn GroupSession) -> Result<()>;

    async fn consume_claim(&self, session: &dyn GroupSession, claim: &mut dyn GroupClaim) -> Result<()>;
}

#[async_trait]
pub trait ConsumerGroup: Send + Sync {
    /// Join the group and run one generation through `handler`. Returns `Ok` when the
    /// generation ends by rebalance or by `ctx` being cancelled.
    async fn consume(&self, ctx: &CancellationToken, topics: &[String], handler: &dyn GroupHandler) -> Result<()>;

    /// Stop fetching from every assigned partition
    fn pause_all(&self);

    /// The consumer error stream, available once
    fn take_errors(&self) -> Option<mpsc::UnboundedReceiver<Error>>;

    async fn close(&self) -> Result<()>;
}

/// Producer properties derived from a [`BrokerConfig`]
#[derive(Debug, Clone)]
pub struct ProducerSettings {
    pub bootstrap_servers: String,
    pub client_id: Option<String>,
    pub max_message_bytes: usize,
    pub compress: bool,
    pub linger: Duration,
    pub auth: Option<ScramAuth>,
    pub properties: Vec<(String, String)>,
}

impl ProducerSettings {
    pub fn from_config(cfg: &BrokerConfig) -> Self {
        Self {
            bootstrap_servers: cfg.bootstrap_servers(),
            client_id: cfg.client_id.clone().filter(|c| !c.is_empty()),
            max_message_bytes: cfg.max_message_bytes(),
            compress: cfg.compress,
            linger: Duration::from_millis(50),
            auth: ScramAuth::from_acl(&cfg.acl),
            properties: owned_properties(cfg),
        }
    }

    pub fn client_config(&self) -> ClientConfig {
        let mut client_cfg = ClientConfig::new();
        client_cfg
            .set("bootstrap.servers", &self.bootstrap_servers)
            .set("acks", "1")
            .set("linger.ms", self.linger.as_millis().to_string())
            .set("message.max.bytes", self.max_message_bytes.to_string())
            .set("compression.type", if self.compress { "gzip" } else { "none" });
        if let Some(client_id) = &self.client_id {
            client_cfg.set("client.id", client_id);
        }
        if let Some(auth) = &self.auth {
            auth.apply(&mut client_cfg);
        }
        for (key, val) in &self.properties {
            client_cfg.set(key, val);
        }
        client_cfg.set_log_level(RDKafkaLogLevel::Info);
        client_cfg
    }
}

/// Consumer-group properties derived from a [`BrokerConfig`]
#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub bootstrap_servers: String,
    pub group: String,
    pub client_id: String,
    pub version: KafkaVersion,
    pub initial_offset: InitialOffset,
    pub heartbeat_interval: Duration,
    pub session_timeout: Duration,
    pub max_processing_time: Duration,
    pub return_errors: bool,
    pub auth: Option<ScramAuth>,
    pub properties: Vec<(String, String)>,
}

impl ConsumerSettings {
    pub fn from_config(cfg: &BrokerConfig) -> Self {
        Self {
            bootstrap_servers: cfg.bootstrap_servers(),
            group: cfg.group.clone(),
            client_id: cfg.group_id.clone(),
            version: cfg.kafka_version(),
            initial_offset: cfg.initial_offset(),
            heartbeat_interval: cfg.consumer.heartbeat_interval(),
            session_timeout: cfg.consumer.session_timeout(),
            max_processing_time: cfg.consumer.max_processing_time(),
            return_errors: cfg.consumer.return_errors(),
            auth: ScramAuth::from_acl(&cfg.acl),
            properties: owned_properties(cfg),
        }
    }

    /// Offsets are stored explicitly by `mark_message` and committed in the background
    pub fn client_config(&self) -> ClientConfig {
        let mut client_cfg = ClientConfig::new();
        client_cfg
            .set("bootstrap.servers", &self.bootstrap_servers)
            .set("group.id", &self.group)
            .set("heartbeat.interval.ms", self.heartbeat_interval.as_millis().to_string())
            .set("session.timeout.ms", self.session_timeout.as_millis().to_string())
            .set("auto.offset.reset", self.initial_offset.as_str())
            .set("broker.version.fallback", self.version.to_string())
            .set("enable.auto.commit", "true")
            .set("auto.commit.interval.ms", "1000")
            .set("enable.auto.offset.store", "false")
            .set("enable.partition.eof", "false");
        if !self.client_id.is_empty() {
            client_cfg.set("client.id", &self.client_id);
        }
        if let Some(auth) = &self.auth {
            auth.apply(&mut client_cfg);
        }
        for (key, val) in &self.properties {
            client_cfg.set(key, val);
        }
        client_cfg.set_log_level(RDKafkaLogLevel::Info);
        client_cfg
    }
}

fn owned_properties(cfg: &BrokerConfig) -> Vec<(String, String)> {
    cfg.extra_properties().map(|(k, v)| (k.to_owned(), v.to_owned())).collect()
}
