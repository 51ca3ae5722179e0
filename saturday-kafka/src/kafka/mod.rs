//! librdkafka backed implementations of the broker traits.

mod consumer;
mod producer;

pub use consumer::KafkaConsumerGroup;
pub use producer::{KafkaAsyncProducer, KafkaSyncProducer};
