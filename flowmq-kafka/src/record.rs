//! Broker-bound record model and the rules turning a [`Message`] plus its
//! metadata and the channel configuration into one record.

use bytes::Bytes;

use crate::config::KafkaSinkConfig;
use crate::error::{Error, Result};
use crate::message::{IncomingRecordMetadata, Message, OutgoingRecordMetadata, Payload};

/// Reserved header carrying the topic a reply should be produced to.
pub const REPLY_TOPIC_HEADER: &str = "kafka_replyTopic";
/// Reserved header carrying the reply partition as a big-endian i32.
pub const REPLY_PARTITION_HEADER: &str = "kafka_replyPartition";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordHeader {
    pub key: String,
    pub value: Option<Bytes>,
}

impl RecordHeader {
    pub fn new(key: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
        }
    }
}

/// The record handed to the producer.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingRecord {
    pub topic: String,
    /// Absent lets the broker client pick the partition.
    pub partition: Option<i32>,
    /// Epoch millis; absent lets the broker stamp the append time.
    pub timestamp: Option<i64>,
    pub key: Option<Bytes>,
    pub payload: Bytes,
    pub headers: Vec<RecordHeader>,
}

impl OutgoingRecord {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            partition: None,
            timestamp: None,
            key: None,
            payload: payload.into(),
            headers: Vec::new(),
        }
    }

    /// Last header with the given name, matching the broker client's
    /// `lastHeader` semantics.
    pub fn header(&self, name: &str) -> Option<&RecordHeader> {
        self.headers.iter().rev().find(|h| h.key == name)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.topic.is_empty() {
            return Err(Error::Record("Record topic must not be empty".into()));
        }
        if let Some(partition) = self.partition
            && partition < 0
        {
            return Err(Error::Record(format!(
                "Record partition must not be negative, got {partition}"
            )));
        }
        if let Some(timestamp) = self.timestamp
            && timestamp < 0
        {
            return Err(Error::Record(format!(
                "Record timestamp must not be negative, got {timestamp}"
            )));
        }
        Ok(())
    }
}

fn last_header<'a>(headers: &'a [RecordHeader], name: &str) -> Option<&'a RecordHeader> {
    headers.iter().rev().find(|h| h.key == name)
}

/// Builds producer records from messages per the channel configuration.
/// Pure over its inputs.
pub(crate) struct RecordBuilder<'a> {
    config: &'a KafkaSinkConfig,
}

impl<'a> RecordBuilder<'a> {
    pub(crate) fn new(config: &'a KafkaSinkConfig) -> Self {
        Self { config }
    }

    pub(crate) fn build(&self, message: &Message) -> Result<OutgoingRecord> {
        if let Payload::Prebuilt(record) = &message.payload {
            let record = record.clone();
            record.validate()?;
            return Ok(record);
        }

        let outgoing = message.outgoing.as_ref();
        let incoming = message.incoming.as_ref();

        let record = OutgoingRecord {
            topic: self.resolve_topic(outgoing, incoming),
            partition: self.resolve_partition(outgoing, incoming)?,
            timestamp: outgoing
                .and_then(|om| om.timestamp)
                .map(|ts| ts.timestamp_millis()),
            key: self.resolve_key(message, outgoing, incoming),
            payload: match &message.payload {
                Payload::Bytes(bytes) => bytes.clone(),
                Payload::Record { value, .. } => value.clone(),
                Payload::Prebuilt(_) => unreachable!("handled above"),
            },
            headers: self.resolve_headers(outgoing, incoming),
        };
        record.validate()?;
        Ok(record)
    }

    fn resolve_topic(
        &self,
        outgoing: Option<&OutgoingRecordMetadata>,
        incoming: Option<&IncomingRecordMetadata>,
    ) -> String {
        if let Some(im) = incoming
            && let Some(header) = last_header(&im.headers, REPLY_TOPIC_HEADER)
            && let Some(value) = &header.value
        {
            return String::from_utf8_lossy(value).into_owned();
        }
        if let Some(topic) = outgoing.and_then(|om| om.topic.as_deref()) {
            return topic.to_string();
        }
        self.config.topic_or_channel().to_string()
    }

    fn resolve_partition(
        &self,
        outgoing: Option<&OutgoingRecordMetadata>,
        incoming: Option<&IncomingRecordMetadata>,
    ) -> Result<Option<i32>> {
        if let Some(im) = incoming
            && let Some(header) = last_header(&im.headers, REPLY_PARTITION_HEADER)
            && let Some(value) = &header.value
        {
            let bytes: [u8; 4] = value.as_ref().try_into().map_err(|_| {
                Error::Record(format!(
                    "Header {REPLY_PARTITION_HEADER} must be a 4-byte big-endian integer, got {} bytes",
                    value.len()
                ))
            })?;
            return Ok(Some(i32::from_be_bytes(bytes)));
        }
        let partition = match outgoing {
            Some(om) if om.partition >= 0 => om.partition,
            _ => self.config.partition,
        };
        Ok((partition >= 0).then_some(partition))
    }

    fn resolve_key(
        &self,
        message: &Message,
        outgoing: Option<&OutgoingRecordMetadata>,
        incoming: Option<&IncomingRecordMetadata>,
    ) -> Option<Bytes> {
        if let Some(key) = outgoing.and_then(|om| om.key.clone()) {
            return Some(key);
        }
        if let Payload::Record { key: Some(key), .. } = &message.payload {
            return Some(key.clone());
        }
        if self.config.propagate_record_key
            && let Some(key) = incoming.and_then(|im| im.key.clone())
        {
            return Some(key);
        }
        self.config
            .key
            .as_ref()
            .map(|k| Bytes::copy_from_slice(k.as_bytes()))
    }

    fn resolve_headers(
        &self,
        outgoing: Option<&OutgoingRecordMetadata>,
        incoming: Option<&IncomingRecordMetadata>,
    ) -> Vec<RecordHeader> {
        let mut headers: Vec<RecordHeader> = outgoing
            .map(|om| om.headers.clone())
            .unwrap_or_default();

        if let Some(im) = incoming {
            for name in &self.config.propagate_headers {
                // outgoing metadata wins on name collision
                if headers.iter().any(|h| &h.key == name) {
                    continue;
                }
                headers.extend(
                    im.headers
                        .iter()
                        .filter(|h| &h.key == name)
                        .cloned(),
                );
            }
        }
        headers
    }
}
