//! The outbound sink: owns the producer, wires the sender pipeline to the
//! per-message write function, and surfaces health.

use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::cloudevents::CloudEventCodec;
use crate::config::KafkaSinkConfig;
use crate::error::{Error, Result};
use crate::health::{FailureRegistry, HealthReportBuilder, KafkaSinkHealth};
use crate::message::{Message, Payload};
use crate::producer::{ProducerClient, RdKafkaProducer};
use crate::record::{OutgoingRecord, RecordBuilder};
use crate::retry::RetryPolicy;
use crate::sender::{FailureHook, SenderPipeline, WriteFn};

/// Per-message write path shared by the sink pipeline and the transactional
/// emitter: build the record, dispatch, retry, terminal ack/nack.
pub(crate) struct MessageWriter<C> {
    config: KafkaSinkConfig,
    producer: Arc<C>,
    retry: RetryPolicy,
}

impl<C: ProducerClient> MessageWriter<C> {
    pub(crate) fn new(config: KafkaSinkConfig, producer: Arc<C>) -> Result<Self> {
        let retry = RetryPolicy::from_config(&config)?;
        Ok(Self {
            config,
            producer,
            retry,
        })
    }

    /// Writes one message. The message is always resolved: ack on delivery,
    /// nack with the cause otherwise. The returned error mirrors the nack
    /// cause so callers can do their own bookkeeping.
    pub(crate) async fn write(&self, message: Message) -> Result<()> {
        let record = match self.build_record(&message) {
            Ok(record) => record,
            Err(e) => {
                error!(?e, channel = self.config.channel.as_str(), "Unable to build the outgoing record");
                message.nack(e.clone());
                return Err(e);
            }
        };

        debug!(
            channel = self.config.channel.as_str(),
            topic = record.topic.as_str(),
            "Sending message to Kafka topic"
        );
        if self.config.tracing_enabled {
            debug!(
                target: "flowmq_kafka::trace",
                topic = record.topic.as_str(),
                partition = record.partition.unwrap_or(-1),
                headers = record.headers.len(),
                client_id = self.config.client_id(),
                group_id = self.config.group_id(),
                "Outgoing record"
            );
        }

        let producer = self.producer.clone();
        let attempt_record = record.clone();
        let result = self
            .retry
            .run(move || {
                let producer = producer.clone();
                let record = attempt_record.clone();
                async move {
                    match producer.dispatch(record).await {
                        Ok(delivery) => delivery.await,
                        Err(enqueue_err) => Err(enqueue_err),
                    }
                }
            })
            .await;

        match result {
            Ok(delivery) => {
                debug!(
                    channel = self.config.channel.as_str(),
                    topic = delivery.topic.as_str(),
                    partition = delivery.partition,
                    offset = delivery.offset,
                    "Message written to Kafka"
                );
                message.set_delivery(delivery);
                message.ack();
                Ok(())
            }
            Err(send_err) => {
                let err = Error::Send(send_err);
                warn!(
                    ?err,
                    channel = self.config.channel.as_str(),
                    topic = record.topic.as_str(),
                    "Nacking message, unable to write to Kafka"
                );
                message.nack(err.clone());
                Err(err)
            }
        }
    }

    fn build_record(&self, message: &Message) -> Result<OutgoingRecord> {
        let record = RecordBuilder::new(&self.config).build(message)?;
        if matches!(message.payload, Payload::Prebuilt(_)) {
            return Ok(record);
        }
        let codec = CloudEventCodec::new(&self.config);
        if codec.applies(message) {
            codec.encode(record, message)
        } else {
            Ok(record)
        }
    }
}

/// The outbound connector endpoint for one channel.
#[derive(Debug)]
pub struct KafkaSink<C: ProducerClient> {
    channel: String,
    pipeline: SenderPipeline,
    failures: Arc<FailureRegistry>,
    health: Option<KafkaSinkHealth<C>>,
    health_enabled: bool,
    health_readiness_enabled: bool,
}

impl KafkaSink<RdKafkaProducer> {
    /// Builds the producer from the configuration and wires the sink.
    pub fn new(config: KafkaSinkConfig) -> Result<Self> {
        config.validate()?;
        let producer = Arc::new(RdKafkaProducer::new(&config)?);
        Self::with_producer(config, producer)
    }
}

impl<C: ProducerClient> KafkaSink<C> {
    /// Wires the sink on top of an existing producer client.
    pub fn with_producer(config: KafkaSinkConfig, producer: Arc<C>) -> Result<Self> {
        config.validate()?;

        let failures = Arc::new(FailureRegistry::new());
        let writer = Arc::new(MessageWriter::new(config.clone(), producer.clone())?);

        let write: WriteFn = {
            let writer = writer.clone();
            Arc::new(move |message: Message| {
                let writer = writer.clone();
                async move { writer.write(message).await }.boxed()
            })
        };
        let on_failure: FailureHook = {
            let failures = failures.clone();
            Arc::new(move |e: Error| failures.report(e))
        };
        let pipeline = SenderPipeline::start(
            config.max_inflight_messages,
            config.wait_for_write_completion,
            write,
            on_failure,
        );

        let health = config.health_enabled.then(|| {
            KafkaSinkHealth::new(
                config.channel.clone(),
                config.topic_or_channel().to_string(),
                producer.clone(),
            )
        });

        Ok(Self {
            channel: config.channel.clone(),
            pipeline,
            failures,
            health,
            health_enabled: config.health_enabled,
            health_readiness_enabled: config.health_readiness_enabled,
        })
    }

    /// The subscriber end of the pipeline; the upstream pushes messages
    /// into it and observes demand through its bounded capacity.
    pub fn sink(&self) -> mpsc::Sender<Message> {
        self.pipeline.sender()
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Recent send failures, for external inspection.
    pub fn failures(&self) -> Arc<FailureRegistry> {
        self.failures.clone()
    }

    /// Liveness: healthy while no failure has been recorded. Reports
    /// nothing when health is disabled.
    pub fn is_alive(&self, builder: &mut HealthReportBuilder) {
        if !self.health_enabled {
            return;
        }
        let failures = self.failures.snapshot();
        if failures.is_empty() {
            builder.add(self.channel.clone(), true);
        } else {
            let joined = failures
                .iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            builder.add_with_message(self.channel.clone(), false, joined);
        }
    }

    /// Readiness: broker-side probe. Must not be called from the I/O
    /// context.
    pub async fn is_ready(&self, builder: &mut HealthReportBuilder) {
        if let Some(health) = &self.health
            && self.health_readiness_enabled
        {
            health.is_ready(builder).await;
        }
    }

    /// Startup: broker-side probe, latched after the first success. Must
    /// not be called from the I/O context.
    pub async fn is_started(&self, builder: &mut HealthReportBuilder) {
        if let Some(health) = &self.health {
            health.is_started(builder).await;
        }
    }

    /// Cancels the pipeline and drops the health probe; errors are logged,
    /// never raised. The producer closes when its last reference drops.
    pub fn close_quietly(&mut self) {
        self.pipeline.cancel();
        self.health = None;
        debug!(channel = self.channel.as_str(), "Kafka sink closed");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;
    use crate::cloudevents::CloudEventMetadata;
    use crate::config::{CloudEventsMode, ValueSerializer};
    use crate::error::{SendError, SendErrorKind};
    use crate::message::SendAck;
    use crate::test_utils::{FakeOutcome, FakeProducer};

    fn sink_config() -> KafkaSinkConfig {
        let mut config = KafkaSinkConfig::new("channel");
        config.topic = Some("t".to_string());
        config.cloud_events = false;
        config.retries = 2;
        config
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn default_route_acks_on_delivery() {
        let producer = Arc::new(FakeProducer::new());
        let sink = KafkaSink::with_producer(sink_config(), producer.clone()).unwrap();

        let (message, ack) = Message::new("v1").with_ack_channel();
        let probe = message.clone();
        sink.sink().send(message).await.unwrap();

        assert_eq!(ack.await.unwrap(), SendAck::Ack);
        let records = producer.dispatched();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].topic, "t");
        assert_eq!(records[0].partition, None);
        assert_eq!(records[0].key, None);
        assert_eq!(records[0].payload, Bytes::from_static(b"v1"));

        let delivery = probe.delivery().expect("delivery metadata stamped");
        assert_eq!(delivery.topic, "t");
        assert_eq!(delivery.offset, 0);
    }

    #[tokio::test]
    async fn cloud_event_binary_framing_applies() {
        let mut config = sink_config();
        config.cloud_events = true;
        let producer = Arc::new(FakeProducer::new());
        let sink = KafkaSink::with_producer(config, producer.clone()).unwrap();

        let (message, ack) = Message::new(Bytes::from_static(&[0x01, 0x02]))
            .with_cloud_event(CloudEventMetadata {
                id: Some("1".to_string()),
                source: Some("/a".to_string()),
                ty: Some("x".to_string()),
                partition_key: Some("p".to_string()),
                ..Default::default()
            })
            .with_ack_channel();
        sink.sink().send(message).await.unwrap();
        assert_eq!(ack.await.unwrap(), SendAck::Ack);

        let record = &producer.dispatched()[0];
        assert_eq!(record.key, Some(Bytes::from_static(b"p")));
        assert_eq!(record.payload, Bytes::from_static(&[0x01, 0x02]));
        assert_eq!(
            record.header("ce_id").unwrap().value,
            Some(Bytes::from_static(b"1"))
        );
        assert_eq!(
            record.header("ce_source").unwrap().value,
            Some(Bytes::from_static(b"/a"))
        );
        assert_eq!(
            record.header("ce_type").unwrap().value,
            Some(Bytes::from_static(b"x"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn retry_exhaustion_nacks_and_registers_one_failure() {
        let producer = Arc::new(FakeProducer::new());
        producer.script([
            FakeOutcome::DeliveryFail(SendError::recoverable("one")),
            FakeOutcome::DeliveryFail(SendError::recoverable("two")),
            FakeOutcome::DeliveryFail(SendError::recoverable("three")),
        ]);
        let sink = KafkaSink::with_producer(sink_config(), producer.clone()).unwrap();

        let (message, ack) = Message::new("v").with_ack_channel();
        sink.sink().send(message).await.unwrap();

        match ack.await.unwrap() {
            SendAck::Nack(Error::Send(e)) => assert!(e.is_recoverable()),
            other => panic!("expected send nack, got {other:?}"),
        }
        // initial attempt + two retries
        assert_eq!(producer.dispatch_count(), 3);
        settle().await;
        assert_eq!(sink.failures().snapshot().len(), 1);
    }

    #[tokio::test]
    async fn non_recoverable_failures_bypass_retries() {
        let producer = Arc::new(FakeProducer::new());
        producer.script([FakeOutcome::DeliveryFail(SendError::new(
            SendErrorKind::RecordTooLarge,
            "too big",
        ))]);
        let sink = KafkaSink::with_producer(sink_config(), producer.clone()).unwrap();

        let (message, ack) = Message::new("v").with_ack_channel();
        sink.sink().send(message).await.unwrap();

        match ack.await.unwrap() {
            SendAck::Nack(Error::Send(e)) => assert_eq!(e.kind, SendErrorKind::RecordTooLarge),
            other => panic!("expected send nack, got {other:?}"),
        }
        assert_eq!(producer.dispatch_count(), 1);
    }

    #[tokio::test]
    async fn enqueue_failures_are_retried_like_delivery_failures() {
        let producer = Arc::new(FakeProducer::new());
        producer.script([FakeOutcome::EnqueueFail(SendError::recoverable(
            "queue full",
        ))]);
        let mut config = sink_config();
        config.retries = 1;
        let sink = KafkaSink::with_producer(config, producer.clone()).unwrap();

        let (message, ack) = Message::new("v").with_ack_channel();
        let started = tokio::time::Instant::now();
        tokio::time::pause();
        sink.sink().send(message).await.unwrap();
        assert_eq!(ack.await.unwrap(), SendAck::Ack);
        assert!(started.elapsed() >= Duration::from_secs(1));
        assert_eq!(producer.dispatch_count(), 2);
    }

    #[tokio::test]
    async fn record_build_failures_nack_and_register() {
        let producer = Arc::new(FakeProducer::new());
        let sink = KafkaSink::with_producer(sink_config(), producer.clone()).unwrap();

        let (message, ack) = Message::new("v")
            .with_incoming(crate::message::IncomingRecordMetadata {
                channel: "in".into(),
                topic: "in".into(),
                partition: 0,
                offset: 0,
                key: None,
                generation_id: 0,
                headers: vec![crate::record::RecordHeader::new(
                    crate::record::REPLY_PARTITION_HEADER,
                    &b"bad"[..],
                )],
            })
            .with_ack_channel();
        sink.sink().send(message).await.unwrap();

        match ack.await.unwrap() {
            SendAck::Nack(Error::Record(_)) => {}
            other => panic!("expected record nack, got {other:?}"),
        }
        assert_eq!(producer.dispatch_count(), 0);
        settle().await;
        assert_eq!(sink.failures().snapshot().len(), 1);
    }

    #[tokio::test]
    async fn liveness_reflects_the_failure_registry() {
        let producer = Arc::new(FakeProducer::new());
        let sink = KafkaSink::with_producer(sink_config(), producer).unwrap();

        let mut builder = HealthReportBuilder::new();
        sink.is_alive(&mut builder);
        assert!(builder.is_healthy());
        assert_eq!(builder.entries().len(), 1);

        sink.failures().report(Error::Record("boom".into()));
        let mut builder = HealthReportBuilder::new();
        sink.is_alive(&mut builder);
        assert!(!builder.is_healthy());
    }

    #[tokio::test]
    async fn disabled_health_reports_nothing() {
        let mut config = sink_config();
        config.health_enabled = false;
        let producer = Arc::new(FakeProducer::new());
        let sink = KafkaSink::with_producer(config, producer).unwrap();

        let mut builder = HealthReportBuilder::new();
        sink.is_alive(&mut builder);
        sink.is_ready(&mut builder).await;
        sink.is_started(&mut builder).await;
        assert!(builder.entries().is_empty());
    }

    #[tokio::test]
    async fn readiness_and_startup_probe_the_broker() {
        let producer = Arc::new(FakeProducer::new());
        let sink = KafkaSink::with_producer(sink_config(), producer).unwrap();

        let mut builder = HealthReportBuilder::new();
        sink.is_ready(&mut builder).await;
        sink.is_started(&mut builder).await;
        assert_eq!(builder.entries().len(), 2);
        assert!(builder.is_healthy());
    }

    #[tokio::test]
    async fn structured_cloud_events_validate_the_serializer_at_construction() {
        let mut config = sink_config();
        config.cloud_events = true;
        config.cloud_events_mode = CloudEventsMode::Structured;
        let producer = Arc::new(FakeProducer::new());
        let err = KafkaSink::with_producer(config.clone(), producer.clone()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        config.value_serializer = ValueSerializer::String;
        KafkaSink::with_producer(config, producer).expect("string serializer accepted");
    }

    #[tokio::test]
    async fn close_quietly_cancels_the_pipeline() {
        let producer = Arc::new(FakeProducer::new());
        let mut sink = KafkaSink::with_producer(sink_config(), producer).unwrap();
        let sender = sink.sink();
        sink.close_quietly();
        settle().await;
        assert!(sender.send(Message::new("late")).await.is_err());
    }
}
