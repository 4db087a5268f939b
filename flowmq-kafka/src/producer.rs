//! Broker-facing producer surface. The [`ProducerClient`] trait is the seam
//! the sink, the retry policy, and the transaction coordinator are written
//! against; [`RdKafkaProducer`] is the rdkafka-backed implementation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use rdkafka::ClientConfig;
use rdkafka::TopicPartitionList;
use rdkafka::consumer::ConsumerGroupMetadata as NativeGroupMetadata;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use tokio::task::spawn_blocking;
use tracing::{debug, error, info};

use crate::config::KafkaSinkConfig;
use crate::error::{Error, Result, SendError, SendErrorKind};
use crate::message::{DeliveryMetadata, TopicPartition};
use crate::record::OutgoingRecord;

/// Resolves once the broker acknowledged (or definitively rejected) a
/// dispatched record.
pub type DeliveryFuture = BoxFuture<'static, std::result::Result<DeliveryMetadata, SendError>>;

/// Consumer group coordinates for fencing transactional offset commits.
#[derive(Clone)]
pub struct GroupMetadata {
    pub group_id: String,
    pub generation_id: i32,
    native: Option<Arc<NativeGroupMetadata>>,
}

impl GroupMetadata {
    pub fn new(group_id: impl Into<String>, generation_id: i32) -> Self {
        Self {
            group_id: group_id.into(),
            generation_id,
            native: None,
        }
    }

    /// Attaches the broker client's opaque metadata handle, required when
    /// the offsets are sent through a real producer.
    pub fn with_native(mut self, native: NativeGroupMetadata) -> Self {
        self.native = Some(Arc::new(native));
        self
    }
}

impl std::fmt::Debug for GroupMetadata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupMetadata")
            .field("group_id", &self.group_id)
            .field("generation_id", &self.generation_id)
            .finish()
    }
}

/// What the connector needs from a producer. Methods returning `Result`
/// surface enqueue-time failures; broker-side outcomes arrive through the
/// [`DeliveryFuture`].
#[trait_variant::make(ProducerClient: Send)]
pub trait LocalProducerClient: Send + Sync + 'static {
    /// Enqueues the record into the transmit buffer. The outer result
    /// resolves at enqueue time, the returned future at broker
    /// acknowledgement.
    async fn dispatch(
        &self,
        record: OutgoingRecord,
    ) -> std::result::Result<DeliveryFuture, SendError>;

    async fn flush(&self) -> Result<()>;

    async fn begin_transaction(&self) -> Result<()>;

    async fn commit_transaction(&self) -> Result<()>;

    async fn abort_transaction(&self) -> Result<()>;

    /// Atomically attaches the consumed offsets to the open transaction.
    async fn send_offsets_to_transaction(
        &self,
        offsets: HashMap<TopicPartition, i64>,
        group: GroupMetadata,
    ) -> Result<()>;

    /// Broker-side probe used by the health checks. Must not be called from
    /// the I/O context; implementations move the blocking call off it.
    async fn check_topic(&self, topic: String) -> Result<()>;
}

/// Maps a broker client failure onto the fixed recoverability
/// classification. Everything not in the fatal set stays retryable.
pub(crate) fn classify_kafka_error(err: &KafkaError) -> SendError {
    let kind = match err.rdkafka_error_code() {
        Some(RDKafkaErrorCode::InvalidTopic) => SendErrorKind::InvalidTopic,
        Some(RDKafkaErrorCode::OffsetMetadataTooLarge) => SendErrorKind::OffsetMetadataTooLarge,
        Some(RDKafkaErrorCode::MessageBatchTooLarge) => SendErrorKind::RecordBatchTooLarge,
        Some(RDKafkaErrorCode::MessageSizeTooLarge) => SendErrorKind::RecordTooLarge,
        Some(RDKafkaErrorCode::Unknown) => SendErrorKind::UnknownServer,
        Some(RDKafkaErrorCode::KeySerialization | RDKafkaErrorCode::ValueSerialization) => {
            SendErrorKind::Serialization
        }
        Some(RDKafkaErrorCode::PurgeQueue | RDKafkaErrorCode::PurgeInflight) => {
            SendErrorKind::TransactionAborted
        }
        _ => SendErrorKind::Other,
    };
    SendError::new(kind, err.to_string())
}

/// rdkafka-backed producer. The transaction verbs of the underlying client
/// are blocking and run on the blocking pool.
pub struct RdKafkaProducer {
    producer: FutureProducer,
    transaction_timeout: Duration,
}

impl RdKafkaProducer {
    const METADATA_TIMEOUT: Duration = Duration::from_secs(10);
    const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

    pub fn new(config: &KafkaSinkConfig) -> Result<Self> {
        let bootstrap = config
            .kafka_raw_config
            .get("bootstrap.servers")
            .ok_or_else(|| Error::Config("bootstrap.servers must be configured".into()))?
            .clone();

        let mut client_config = ClientConfig::new();
        for (name, value) in &config.kafka_raw_config {
            client_config.set(name, value);
        }
        debug!("rdkafka configuration: {:?}", client_config);

        let producer: FutureProducer = client_config
            .create()
            .map_err(|e| Error::Config(format!("Unable to create the Kafka producer: {e}")))?;

        // Ping the brokers by requesting metadata before accepting traffic.
        match producer
            .client()
            .fetch_metadata(None, Self::METADATA_TIMEOUT)
        {
            Ok(metadata) => {
                info!(
                    client_id = config.client_id(),
                    servers = bootstrap.as_str(),
                    topic = config.topic_or_channel(),
                    topics = metadata.topics().len(),
                    "Connected to Kafka"
                );
            }
            Err(e) => {
                error!(?e, "Failed to fetch metadata from Kafka brokers");
                return Err(Error::Config(format!(
                    "Unable to connect to Kafka at {bootstrap}: {e}"
                )));
            }
        }

        let transaction_timeout = Duration::from_secs(10);
        if config.kafka_raw_config.contains_key("transactional.id") {
            producer
                .init_transactions(transaction_timeout)
                .map_err(|e| Error::Config(format!("Unable to initialize transactions: {e}")))?;
        }

        Ok(Self {
            producer,
            transaction_timeout,
        })
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(FutureProducer, Duration) -> Result<T> + Send + 'static,
    {
        let producer = self.producer.clone();
        let timeout = self.transaction_timeout;
        spawn_blocking(move || op(producer, timeout))
            .await
            .map_err(|e| Error::ActorTaskTerminated(e.to_string()))?
    }
}

impl ProducerClient for RdKafkaProducer {
    async fn dispatch(
        &self,
        record: OutgoingRecord,
    ) -> std::result::Result<DeliveryFuture, SendError> {
        let mut headers = OwnedHeaders::new_with_capacity(record.headers.len());
        for header in &record.headers {
            headers = headers.insert(Header {
                key: &header.key,
                value: header.value.as_deref(),
            });
        }

        let future_record = FutureRecord::<[u8], [u8]> {
            topic: &record.topic,
            partition: record.partition,
            payload: Some(record.payload.as_ref()),
            key: record.key.as_deref(),
            timestamp: record.timestamp,
            headers: Some(headers),
        };

        match self.producer.send_result(future_record) {
            Ok(delivery) => {
                let topic = record.topic.clone();
                Ok(async move {
                    match delivery.await {
                        Ok(Ok((partition, offset))) => Ok(DeliveryMetadata {
                            topic,
                            partition,
                            offset,
                        }),
                        Ok(Err((err, _))) => Err(classify_kafka_error(&err)),
                        // Cancelled due to timeout while the client retried
                        Err(_) => Err(SendError::recoverable(
                            "Delivery channel closed before the broker acknowledged",
                        )),
                    }
                }
                .boxed())
            }
            Err((err, _)) => Err(classify_kafka_error(&err)),
        }
    }

    async fn flush(&self) -> Result<()> {
        self.blocking(|producer, timeout| {
            producer
                .flush(timeout)
                .map_err(|e| Error::Transaction(format!("Flush failed: {e}")))
        })
        .await
    }

    async fn begin_transaction(&self) -> Result<()> {
        self.blocking(|producer, _| {
            producer
                .begin_transaction()
                .map_err(|e| Error::Transaction(format!("Unable to begin the transaction: {e}")))
        })
        .await
    }

    async fn commit_transaction(&self) -> Result<()> {
        self.blocking(|producer, timeout| {
            producer
                .commit_transaction(timeout)
                .map_err(|e| Error::Transaction(format!("Unable to commit the transaction: {e}")))
        })
        .await
    }

    async fn abort_transaction(&self) -> Result<()> {
        self.blocking(|producer, timeout| {
            producer
                .abort_transaction(timeout)
                .map_err(|e| Error::Transaction(format!("Unable to abort the transaction: {e}")))
        })
        .await
    }

    async fn send_offsets_to_transaction(
        &self,
        offsets: HashMap<TopicPartition, i64>,
        group: GroupMetadata,
    ) -> Result<()> {
        let mut tpl = TopicPartitionList::new();
        for (tp, offset) in &offsets {
            tpl.add_partition_offset(&tp.topic, tp.partition, rdkafka::Offset::Offset(*offset))
                .map_err(|e| Error::Transaction(format!("Invalid offset entry: {e}")))?;
        }
        let native = group.native.clone().ok_or_else(|| {
            Error::Transaction("Consumer group metadata handle is not available".into())
        })?;
        self.blocking(move |producer, timeout| {
            producer
                .send_offsets_to_transaction(&tpl, &native, timeout)
                .map_err(|e| {
                    Error::Transaction(format!("Unable to send offsets to the transaction: {e}"))
                })
        })
        .await
    }

    async fn check_topic(&self, topic: String) -> Result<()> {
        let producer = self.producer.clone();
        spawn_blocking(move || {
            producer
                .client()
                .fetch_metadata(Some(&topic), Self::PROBE_TIMEOUT)
                .map(|_| ())
                .map_err(|e| Error::Health(e.to_string()))
        })
        .await
        .map_err(|e| Error::ActorTaskTerminated(e.to_string()))?
    }
}
