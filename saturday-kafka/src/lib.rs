#![deny(unsafe_code)]

//! Kafka publishing and consumer-group subscription.
//!
//! ```no_run
//! use saturday_kafka::{BrokerConfig, MessageContext, Publisher, Subscriber, SyncPublisher};
//! use slog::{o, Logger};
//!
//! # async fn run() -> saturday_kafka::Result<()> {
//! let logger = Logger::root(slog::Discard, o!());
//! let mut cfg = BrokerConfig::new(["localhost:9094"]);
//! cfg.topics = vec!["test_topic".into()];
//! cfg.group = "test".into();
//!
//! let publisher = SyncPublisher::new(&cfg, logger.clone())?;
//! publisher.write_with_key(&serde_json::json!({"name": "Peter", "age": 20}), "k1", "test_topic").await?;
//! publisher.close().await;
//!
//! Subscriber::new(&cfg, logger)?
//!     .read(|_ctx: MessageContext, topic: String, payload: bytes::Bytes| async move {
//!         println!("{topic}: {}", String::from_utf8_lossy(&payload));
//!         Ok::<_, anyhow::Error>(())
//!     })
//!     .await
//! # }
//! ```

pub mod broker;
pub mod config;
mod error;
pub mod handler;
pub mod kafka;
pub mod publisher;
pub mod sasl;
pub mod scram;
mod size;
pub mod subscriber;

#[cfg(test)]
pub(crate) mod testing;

pub use config::BrokerConfig;
pub use error::{Error, Result};
pub use handler::{MessageContext, MessageHandler, Outcome, ReadinessGate};
pub use publisher::{AsyncPublisher, DrainHandle, Publisher, SyncPublisher};
pub use scram::{Authenticator, HashAlgorithm, ScramClient, ScramError};
pub use size::SizeWarning;
pub use subscriber::{shutdown_signal, Subscriber};
