//! CloudEvents framing for outgoing records: binary mode turns the attribute
//! set into `ce_` headers, structured mode wraps attributes and payload into
//! a single JSON envelope.

use std::collections::HashMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value, json};
use uuid::Uuid;

use crate::config::{CloudEventsMode, KafkaSinkConfig};
use crate::error::{Error, Result, SendError, SendErrorKind};
use crate::message::Message;
use crate::record::{OutgoingRecord, RecordHeader};

pub const CE_HEADER_PREFIX: &str = "ce_";
pub const CE_SPEC_VERSION: &str = "1.0";
pub const CONTENT_TYPE_HEADER: &str = "content-type";
pub const STRUCTURED_CONTENT_TYPE: &str = "application/cloudevents+json; charset=UTF-8";

/// CloudEvent attributes attached to a message.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CloudEventMetadata {
    pub id: Option<String>,
    pub source: Option<String>,
    pub ty: Option<String>,
    pub subject: Option<String>,
    pub time: Option<DateTime<Utc>>,
    pub data_content_type: Option<String>,
    pub data_schema: Option<String>,
    /// Extension steering the record key, not emitted as an attribute header.
    pub partition_key: Option<String>,
    pub extensions: HashMap<String, String>,
}

impl CloudEventMetadata {
    /// Reads the attribute set back from a binary-mode record.
    pub fn from_binary_record(record: &OutgoingRecord) -> Self {
        let text = |name: &str| {
            record
                .header(&format!("{CE_HEADER_PREFIX}{name}"))
                .and_then(|h| h.value.as_ref())
                .map(|v| String::from_utf8_lossy(v).into_owned())
        };
        let mut extensions = HashMap::new();
        for header in &record.headers {
            if let Some(name) = header.key.strip_prefix(CE_HEADER_PREFIX)
                && !matches!(
                    name,
                    "specversion" | "id" | "source" | "type" | "subject" | "time" | "dataschema"
                )
                && let Some(value) = &header.value
            {
                extensions.insert(
                    name.to_string(),
                    String::from_utf8_lossy(value).into_owned(),
                );
            }
        }
        Self {
            id: text("id"),
            source: text("source"),
            ty: text("type"),
            subject: text("subject"),
            time: text("time")
                .and_then(|t| DateTime::parse_from_rfc3339(&t).ok())
                .map(|t| t.with_timezone(&Utc)),
            data_content_type: record
                .header(CONTENT_TYPE_HEADER)
                .and_then(|h| h.value.as_ref())
                .map(|v| String::from_utf8_lossy(v).into_owned()),
            data_schema: text("dataschema"),
            partition_key: None,
            extensions,
        }
    }
}

/// Fully-resolved attribute set: message metadata first, channel
/// configuration as the fallback, generated id as the last resort.
struct ResolvedAttributes {
    id: String,
    source: String,
    ty: String,
    subject: Option<String>,
    time: Option<DateTime<Utc>>,
    data_content_type: Option<String>,
    data_schema: Option<String>,
    partition_key: Option<String>,
    extensions: HashMap<String, String>,
}

pub(crate) struct CloudEventCodec<'a> {
    config: &'a KafkaSinkConfig,
}

impl<'a> CloudEventCodec<'a> {
    pub(crate) fn new(config: &'a KafkaSinkConfig) -> Self {
        Self { config }
    }

    /// CloudEvent framing applies when it is enabled and either the message
    /// carries CloudEvent metadata or the mandatory attributes are
    /// configured on the channel.
    pub(crate) fn applies(&self, message: &Message) -> bool {
        self.config.cloud_events
            && (message.cloud_event.is_some()
                || self.config.mandatory_cloud_event_attributes_set())
    }

    pub(crate) fn encode(&self, base: OutgoingRecord, message: &Message) -> Result<OutgoingRecord> {
        let attributes = self.resolve(message)?;
        match self.config.cloud_events_mode {
            CloudEventsMode::Binary => Ok(self.encode_binary(base, attributes)),
            CloudEventsMode::Structured => self.encode_structured(base, attributes),
        }
    }

    fn resolve(&self, message: &Message) -> Result<ResolvedAttributes> {
        let metadata = message.cloud_event.clone().unwrap_or_default();
        let source = metadata
            .source
            .or_else(|| self.config.cloud_events_source.clone())
            .ok_or_else(|| {
                Error::Config(
                    "Cloud Event 'source' attribute is required; set it on the message \
                     metadata or configure cloud-events-source"
                        .into(),
                )
            })?;
        let ty = metadata
            .ty
            .or_else(|| self.config.cloud_events_type.clone())
            .ok_or_else(|| {
                Error::Config(
                    "Cloud Event 'type' attribute is required; set it on the message \
                     metadata or configure cloud-events-type"
                        .into(),
                )
            })?;
        let time = metadata.time.or_else(|| {
            self.config
                .cloud_events_insert_timestamp
                .then(Utc::now)
        });
        Ok(ResolvedAttributes {
            id: metadata.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            source,
            ty,
            subject: metadata
                .subject
                .or_else(|| self.config.cloud_events_subject.clone()),
            time,
            data_content_type: metadata
                .data_content_type
                .or_else(|| self.config.cloud_events_data_content_type.clone()),
            data_schema: metadata.data_schema,
            partition_key: metadata.partition_key,
            extensions: metadata.extensions,
        })
    }

    /// Attributes become `ce_` headers, the record value stays untouched.
    fn encode_binary(
        &self,
        mut record: OutgoingRecord,
        attributes: ResolvedAttributes,
    ) -> OutgoingRecord {
        let mut push = |name: &str, value: String| {
            record
                .headers
                .push(RecordHeader::new(format!("{CE_HEADER_PREFIX}{name}"), value));
        };
        push("specversion", CE_SPEC_VERSION.to_string());
        push("id", attributes.id);
        push("source", attributes.source);
        push("type", attributes.ty);
        if let Some(subject) = attributes.subject {
            push("subject", subject);
        }
        if let Some(time) = attributes.time {
            push("time", time.to_rfc3339());
        }
        if let Some(schema) = attributes.data_schema {
            push("dataschema", schema);
        }
        for (name, value) in attributes.extensions {
            push(&name, value);
        }
        if let Some(content_type) = attributes.data_content_type {
            record
                .headers
                .push(RecordHeader::new(CONTENT_TYPE_HEADER, content_type));
        }
        if record.key.is_none()
            && let Some(partition_key) = attributes.partition_key
        {
            record.key = Some(Bytes::from(partition_key.into_bytes()));
        }
        record
    }

    /// Attributes and payload are serialized into one JSON envelope placed
    /// in the record value.
    fn encode_structured(
        &self,
        mut record: OutgoingRecord,
        attributes: ResolvedAttributes,
    ) -> Result<OutgoingRecord> {
        let mut envelope = Map::new();
        envelope.insert("specversion".into(), json!(CE_SPEC_VERSION));
        envelope.insert("id".into(), json!(attributes.id));
        envelope.insert("source".into(), json!(attributes.source));
        envelope.insert("type".into(), json!(attributes.ty));
        if let Some(subject) = &attributes.subject {
            envelope.insert("subject".into(), json!(subject));
        }
        if let Some(time) = &attributes.time {
            envelope.insert("time".into(), json!(time.to_rfc3339()));
        }
        if let Some(content_type) = &attributes.data_content_type {
            envelope.insert("datacontenttype".into(), json!(content_type));
        }
        if let Some(schema) = &attributes.data_schema {
            envelope.insert("dataschema".into(), json!(schema));
        }
        for (name, value) in &attributes.extensions {
            envelope.insert(name.clone(), json!(value));
        }

        let is_json = attributes
            .data_content_type
            .as_deref()
            .is_some_and(|ct| ct.contains("json"));
        if is_json {
            let value: Value = serde_json::from_slice(&record.payload).map_err(|e| {
                SendError::new(
                    SendErrorKind::Serialization,
                    format!("Payload is not valid JSON for datacontenttype: {e}"),
                )
            })?;
            envelope.insert("data".into(), value);
        } else if let Ok(text) = std::str::from_utf8(&record.payload) {
            envelope.insert("data".into(), json!(text));
        } else {
            envelope.insert("data_base64".into(), json!(BASE64.encode(&record.payload)));
        }

        record.payload = Bytes::from(
            serde_json::to_vec(&Value::Object(envelope)).map_err(|e| {
                SendError::new(
                    SendErrorKind::Serialization,
                    format!("Unable to serialize the Cloud Event envelope: {e}"),
                )
            })?,
        );
        record
            .headers
            .push(RecordHeader::new(CONTENT_TYPE_HEADER, STRUCTURED_CONTENT_TYPE));
        if record.key.is_none()
            && let Some(partition_key) = attributes.partition_key
        {
            record.key = Some(Bytes::from(partition_key.into_bytes()));
        }
        Ok(record)
    }
}
