use std::collections::HashMap;
use std::time::Duration;

use crate::error::{Error, Result};

/// Sentinel for an unbounded sender pipeline.
pub const UNBOUNDED: usize = usize::MAX;

/// Sentinel for "no retry budget, keep retrying until the delivery timeout".
pub const RETRIES_UNLIMITED: u32 = u32::MAX;

const DEFAULT_MAX_INFLIGHT_MESSAGES: usize = 1024;
// The broker client's documented default for delivery.timeout.ms.
const DEFAULT_DELIVERY_TIMEOUT_MS: u64 = 120_000;

/// Outgoing channel configuration. Typed fields cover the channel attributes;
/// everything else flows to the producer untouched through
/// `kafka_raw_config` (`bootstrap.servers`, `client.id`,
/// `delivery.timeout.ms`, ...).
#[derive(Debug, Clone, PartialEq)]
pub struct KafkaSinkConfig {
    /// Name of the logical channel this sink is bound to. Also the default
    /// topic when none is configured.
    pub channel: String,
    pub topic: Option<String>,
    pub key: Option<String>,
    /// Target partition; `-1` lets the broker client pick one.
    pub partition: i32,
    /// Retry budget per message; [`RETRIES_UNLIMITED`] switches to a
    /// delivery-timeout bounded budget.
    pub retries: u32,
    /// Cap on dispatched-but-unacknowledged sends; [`UNBOUNDED`] disables
    /// the cap and leans on the producer's buffer for admission control.
    pub max_inflight_messages: usize,
    /// When false, the pipeline requests the next message as soon as a send
    /// is enqueued instead of waiting for the broker acknowledgement.
    pub wait_for_write_completion: bool,
    pub cloud_events: bool,
    pub cloud_events_mode: CloudEventsMode,
    pub cloud_events_type: Option<String>,
    pub cloud_events_source: Option<String>,
    pub cloud_events_subject: Option<String>,
    pub cloud_events_data_content_type: Option<String>,
    pub cloud_events_insert_timestamp: bool,
    pub value_serializer: ValueSerializer,
    /// Inherit the incoming record key when no explicit key is set.
    pub propagate_record_key: bool,
    /// Incoming header names copied onto outgoing records; empty disables
    /// propagation.
    pub propagate_headers: Vec<String>,
    pub tracing_enabled: bool,
    pub health_enabled: bool,
    pub health_readiness_enabled: bool,
    /// Raw librdkafka properties, passed through to the producer.
    pub kafka_raw_config: HashMap<String, String>,
}

impl KafkaSinkConfig {
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            topic: None,
            key: None,
            partition: -1,
            retries: RETRIES_UNLIMITED,
            max_inflight_messages: DEFAULT_MAX_INFLIGHT_MESSAGES,
            wait_for_write_completion: true,
            cloud_events: true,
            cloud_events_mode: CloudEventsMode::Binary,
            cloud_events_type: None,
            cloud_events_source: None,
            cloud_events_subject: None,
            cloud_events_data_content_type: None,
            cloud_events_insert_timestamp: true,
            value_serializer: ValueSerializer::Bytes,
            propagate_record_key: false,
            propagate_headers: Vec::new(),
            tracing_enabled: true,
            health_enabled: true,
            health_readiness_enabled: true,
            kafka_raw_config: HashMap::new(),
        }
    }

    /// Builds a configuration from the string-keyed channel attributes.
    /// Unrecognized dotted keys are treated as raw producer properties.
    pub fn from_properties(
        channel: impl Into<String>,
        properties: &HashMap<String, String>,
    ) -> Result<Self> {
        let mut config = Self::new(channel);
        for (name, value) in properties {
            match name.as_str() {
                "topic" => config.topic = Some(value.clone()),
                "key" => config.key = Some(value.clone()),
                "partition" => config.partition = parse_number(name, value)?,
                "retries" => {
                    let retries: i64 = parse_number(name, value)?;
                    // the client's conventional MAX sentinel selects the
                    // delivery-timeout bounded mode
                    config.retries = if retries < 0 || retries >= i32::MAX as i64 {
                        RETRIES_UNLIMITED
                    } else {
                        retries as u32
                    };
                }
                "max-inflight-messages" => {
                    let inflight: i64 = parse_number(name, value)?;
                    config.max_inflight_messages = if inflight <= 0 {
                        UNBOUNDED
                    } else {
                        inflight as usize
                    };
                }
                "wait-for-write-completion" => {
                    config.wait_for_write_completion = parse_bool(name, value)?
                }
                "cloud-events" => config.cloud_events = parse_bool(name, value)?,
                "cloud-events-mode" => config.cloud_events_mode = value.parse()?,
                "cloud-events-type" => config.cloud_events_type = Some(value.clone()),
                "cloud-events-source" => config.cloud_events_source = Some(value.clone()),
                "cloud-events-subject" => config.cloud_events_subject = Some(value.clone()),
                "cloud-events-data-content-type" => {
                    config.cloud_events_data_content_type = Some(value.clone())
                }
                "cloud-events-insert-timestamp" => {
                    config.cloud_events_insert_timestamp = parse_bool(name, value)?
                }
                "value.serializer" => config.value_serializer = value.parse()?,
                "propagate-record-key" => config.propagate_record_key = parse_bool(name, value)?,
                "propagate-headers" => {
                    config.propagate_headers = value
                        .split(',')
                        .map(|h| h.trim().to_string())
                        .filter(|h| !h.is_empty())
                        .collect()
                }
                "tracing-enabled" => config.tracing_enabled = parse_bool(name, value)?,
                "health-enabled" => config.health_enabled = parse_bool(name, value)?,
                "health-readiness-enabled" => {
                    config.health_readiness_enabled = parse_bool(name, value)?
                }
                other if other.contains('.') => {
                    config
                        .kafka_raw_config
                        .insert(other.to_string(), value.clone());
                }
                other => {
                    return Err(Error::Config(format!(
                        "Unknown channel attribute '{other}'"
                    )));
                }
            }
        }
        config.validate()?;
        Ok(config)
    }

    /// Construction-time checks; a failure here fails the sink.
    pub fn validate(&self) -> Result<()> {
        if self.channel.is_empty() {
            return Err(Error::Config("Channel name must not be empty".into()));
        }
        if self.partition < -1 {
            return Err(Error::Config(format!(
                "Invalid partition {}, expected -1 or a partition number",
                self.partition
            )));
        }
        if self.cloud_events
            && self.cloud_events_mode == CloudEventsMode::Structured
            && self.value_serializer != ValueSerializer::String
        {
            return Err(Error::Config(format!(
                "Invalid value serializer to write a structured Cloud Event, \
                 the string serializer must be used, found: {:?}",
                self.value_serializer
            )));
        }
        Ok(())
    }

    /// Topic resolution fallback: configured topic, else the channel name.
    pub fn topic_or_channel(&self) -> &str {
        self.topic.as_deref().unwrap_or(&self.channel)
    }

    /// Whether CloudEvent framing applies to messages without their own
    /// CloudEvent metadata: both mandatory attributes must be configured.
    pub fn mandatory_cloud_event_attributes_set(&self) -> bool {
        self.cloud_events_type.is_some() && self.cloud_events_source.is_some()
    }

    /// `delivery.timeout.ms` from the raw producer properties, with the
    /// broker client's documented default.
    pub fn delivery_timeout(&self) -> Result<Duration> {
        match self.kafka_raw_config.get("delivery.timeout.ms") {
            None => Ok(Duration::from_millis(DEFAULT_DELIVERY_TIMEOUT_MS)),
            Some(raw) => {
                let ms: u64 = raw.parse().map_err(|_| {
                    Error::Config(format!("Invalid delivery.timeout.ms value '{raw}'"))
                })?;
                Ok(Duration::from_millis(ms))
            }
        }
    }

    pub fn client_id(&self) -> Option<&str> {
        self.kafka_raw_config.get("client.id").map(String::as_str)
    }

    pub fn group_id(&self) -> Option<&str> {
        self.kafka_raw_config.get("group.id").map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CloudEventsMode {
    #[default]
    Binary,
    Structured,
}

impl std::str::FromStr for CloudEventsMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "binary" => Ok(CloudEventsMode::Binary),
            "structured" => Ok(CloudEventsMode::Structured),
            other => Err(Error::Config(format!(
                "Unknown cloud-events-mode '{other}', expected 'binary' or 'structured'"
            ))),
        }
    }
}

/// How record values are rendered on the wire. The broker client has no
/// serializer classes, so this is the typed equivalent of the
/// `value.serializer` attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ValueSerializer {
    #[default]
    Bytes,
    String,
}

impl std::str::FromStr for ValueSerializer {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "bytes" => Ok(ValueSerializer::Bytes),
            "string" => Ok(ValueSerializer::String),
            other => Err(Error::Config(format!(
                "Unknown value.serializer '{other}', expected 'bytes' or 'string'"
            ))),
        }
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    value
        .parse()
        .map_err(|_| Error::Config(format!("Invalid boolean for '{name}': '{value}'")))
}

fn parse_number<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| Error::Config(format!("Invalid number for '{name}': '{value}'")))
}
