use std::io;

use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use thiserror::Error;

use crate::scram::ScramError;

#[derive(Error, Debug)]
pub enum Error {
    /// Error reported by the broker client, delivery failures included
    #[error("kafka error, {0}")]
    Kafka(#[from] KafkaError),
    #[error("serialize error, {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("authentication error, {0}")]
    Scram(#[from] ScramError),
    #[error("config error, {0}")]
    Config(#[from] config::ConfigError),
    #[error("invalid config, {0}")]
    InvalidConfig(String),
    #[error("{0}")]
    Io(#[from] io::Error),
    #[error("closed")]
    Closed,
    #[error("task join error, {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("{0}")]
    NoRuntime(#[from] tokio::runtime::TryCurrentError),
}

impl Error {
    /// Transient network conditions that the broker client recovers from by itself.
    pub fn is_temporary(&self) -> bool {
        match self {
            Error::Io(e) => is_temporary_io(e),
            Error::Kafka(e) => matches!(
                e.rdkafka_error_code(),
                Some(
                    RDKafkaErrorCode::BrokerTransportFailure
                        | RDKafkaErrorCode::AllBrokersDown
                        | RDKafkaErrorCode::NetworkException
                )
            ),
            _ => false,
        }
    }
}

#[inline]
fn is_temporary_io(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::BrokenPipe
    )
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
