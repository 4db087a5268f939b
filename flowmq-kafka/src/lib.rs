//! Reactive messaging connector core for Kafka-compatible brokers.
//!
//! Two subsystems make up the crate: the outbound [`sink`] publishing
//! application messages to topics through a demand-driven sender pipeline,
//! and the [`transaction`] emitter grouping produced records and consumed
//! offsets into atomic exactly-once units.
//!
//! The broker-facing surface is the [`producer::ProducerClient`] /
//! [`transaction::ConsumerClient`] pair of seams; [`producer::RdKafkaProducer`]
//! is the rdkafka-backed implementation used in production.

pub use self::error::Result;

pub mod cloudevents;
pub mod config;
mod context;
pub mod error;
pub mod health;
pub mod message;
pub mod producer;
pub mod record;
mod retry;
mod sender;
pub mod sink;
pub mod transaction;

#[cfg(test)]
pub(crate) mod test_utils;

pub use cloudevents::CloudEventMetadata;
pub use config::{CloudEventsMode, KafkaSinkConfig, RETRIES_UNLIMITED, UNBOUNDED, ValueSerializer};
pub use error::{Error, SendError, SendErrorKind};
pub use health::{ChannelHealth, FailureRegistry, HealthReportBuilder};
pub use message::{
    DeliveryMetadata, IncomingBatchMetadata, IncomingRecordMetadata, Message,
    OutgoingRecordMetadata, Payload, SendAck, TopicPartition,
};
pub use producer::{GroupMetadata, ProducerClient, RdKafkaProducer};
pub use record::{OutgoingRecord, RecordHeader};
pub use sink::KafkaSink;
pub use transaction::{ClientService, ConsumerClient, KafkaTransactions, TransactionalEmitter};
