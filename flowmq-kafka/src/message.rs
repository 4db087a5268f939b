//! The message handed to the sink, together with the metadata that steers
//! record construction and the acknowledgement plumbing back to the upstream.
//! A message is cheap to clone; the acknowledgement handle is reference
//! counted and resolves exactly once.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::oneshot;

use crate::cloudevents::CloudEventMetadata;
use crate::error::Error;
use crate::record::{OutgoingRecord, RecordHeader};

/// Terminal outcome reported to the upstream for one message.
#[derive(Debug, Clone, PartialEq)]
pub enum SendAck {
    Ack,
    Nack(Error),
}

/// One-shot acknowledgement handle. Whichever of [`AckHandle::ack`] or
/// [`AckHandle::nack`] runs first wins; the other becomes a no-op. Dropping
/// an unresolved handle nacks, so a message discarded on a cancelled
/// pipeline still resolves.
#[derive(Debug)]
pub struct AckHandle {
    sender: Mutex<Option<oneshot::Sender<SendAck>>>,
}

impl AckHandle {
    pub fn new(sender: oneshot::Sender<SendAck>) -> Self {
        Self {
            sender: Mutex::new(Some(sender)),
        }
    }

    pub fn ack(&self) {
        if let Some(sender) = self.take() {
            let _ = sender.send(SendAck::Ack);
        }
    }

    pub fn nack(&self, cause: Error) {
        if let Some(sender) = self.take() {
            let _ = sender.send(SendAck::Nack(cause));
        }
    }

    fn take(&self) -> Option<oneshot::Sender<SendAck>> {
        self.sender.lock().expect("ack handle lock poisoned").take()
    }
}

impl Drop for AckHandle {
    fn drop(&mut self) {
        if let Some(sender) = self.take() {
            let _ = sender.send(SendAck::Nack(Error::Cancelled(
                "message discarded before completion".into(),
            )));
        }
    }
}

/// Result metadata stamped onto the message once the broker acknowledged
/// the record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryMetadata {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

/// A topic/partition pair, used for transactional offset maps.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

/// What the application handed us to publish.
#[derive(Debug, Clone)]
pub enum Payload {
    /// Opaque payload bytes; key resolution follows the configured rules.
    Bytes(Bytes),
    /// A keyed record; the key participates in key resolution and the value
    /// becomes the record value.
    Record { key: Option<Bytes>, value: Bytes },
    /// A fully-formed record, used verbatim; topic routing is skipped.
    Prebuilt(OutgoingRecord),
}

impl Default for Payload {
    fn default() -> Self {
        Payload::Bytes(Bytes::new())
    }
}

/// Routing hints supplied by the application for one outgoing message.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingRecordMetadata {
    pub topic: Option<String>,
    /// `-1` means unset.
    pub partition: i32,
    pub key: Option<Bytes>,
    pub timestamp: Option<DateTime<Utc>>,
    pub headers: Vec<RecordHeader>,
}

impl Default for OutgoingRecordMetadata {
    fn default() -> Self {
        Self {
            topic: None,
            partition: -1,
            key: None,
            timestamp: None,
            headers: Vec::new(),
        }
    }
}

/// Metadata of the consumed record a message originated from. Carries the
/// routing hints (reply headers, key) and everything the transactional
/// emitter needs for offset commits.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingRecordMetadata {
    pub channel: String,
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Bytes>,
    /// Consumer group generation at the time the record was polled.
    pub generation_id: i32,
    pub headers: Vec<RecordHeader>,
}

/// Batch variant: the highest consumed offset per partition.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingBatchMetadata {
    pub channel: String,
    pub generation_id: i32,
    pub offsets: HashMap<TopicPartition, i64>,
}

/// The unit that flows through the sender pipeline.
#[derive(Debug, Clone, Default)]
pub struct Message {
    pub payload: Payload,
    pub outgoing: Option<OutgoingRecordMetadata>,
    pub incoming: Option<IncomingRecordMetadata>,
    pub incoming_batch: Option<IncomingBatchMetadata>,
    pub cloud_event: Option<CloudEventMetadata>,
    pub ack_handle: Option<Arc<AckHandle>>,
    delivery: Arc<OnceLock<DeliveryMetadata>>,
}

impl Message {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: Payload::Bytes(payload.into()),
            ..Default::default()
        }
    }

    pub fn from_record(key: Option<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            payload: Payload::Record {
                key,
                value: value.into(),
            },
            ..Default::default()
        }
    }

    pub fn from_outgoing_record(record: OutgoingRecord) -> Self {
        Self {
            payload: Payload::Prebuilt(record),
            ..Default::default()
        }
    }

    pub fn with_outgoing(mut self, metadata: OutgoingRecordMetadata) -> Self {
        self.outgoing = Some(metadata);
        self
    }

    pub fn with_incoming(mut self, metadata: IncomingRecordMetadata) -> Self {
        self.incoming = Some(metadata);
        self
    }

    pub fn with_incoming_batch(mut self, metadata: IncomingBatchMetadata) -> Self {
        self.incoming_batch = Some(metadata);
        self
    }

    pub fn with_cloud_event(mut self, metadata: CloudEventMetadata) -> Self {
        self.cloud_event = Some(metadata);
        self
    }

    /// Wires the acknowledgement channel; the receiver resolves with the
    /// terminal [`SendAck`] for this message.
    pub fn with_ack(mut self, sender: oneshot::Sender<SendAck>) -> Self {
        self.ack_handle = Some(Arc::new(AckHandle::new(sender)));
        self
    }

    /// Convenience for callers that want to await the outcome.
    pub fn with_ack_channel(self) -> (Self, oneshot::Receiver<SendAck>) {
        let (tx, rx) = oneshot::channel();
        (self.with_ack(tx), rx)
    }

    pub fn ack(&self) {
        if let Some(handle) = &self.ack_handle {
            handle.ack();
        }
    }

    pub fn nack(&self, cause: Error) {
        if let Some(handle) = &self.ack_handle {
            handle.nack(cause);
        }
    }

    /// Where the record landed, available after a successful send.
    pub fn delivery(&self) -> Option<&DeliveryMetadata> {
        self.delivery.get()
    }

    pub(crate) fn set_delivery(&self, delivery: DeliveryMetadata) {
        let _ = self.delivery.set(delivery);
    }
}
