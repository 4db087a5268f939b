//! Health reporting: the bounded failure ring backing liveness, and the
//! broker-side probes backing readiness/startup.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::warn;

use crate::error::Error;
use crate::producer::ProducerClient;

const MAX_REPORTED_FAILURES: usize = 10;

/// Bounded ring of recent send failures, oldest evicted first. Shared
/// between the pipeline failure hook and the liveness check.
#[derive(Debug, Default)]
pub struct FailureRegistry {
    failures: Mutex<VecDeque<Error>>,
}

impl FailureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn report(&self, failure: Error) {
        let mut failures = self.failures.lock().expect("failure registry poisoned");
        if failures.len() == MAX_REPORTED_FAILURES {
            failures.pop_front();
        }
        failures.push_back(failure);
    }

    pub fn snapshot(&self) -> Vec<Error> {
        self.failures
            .lock()
            .expect("failure registry poisoned")
            .iter()
            .cloned()
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.failures
            .lock()
            .expect("failure registry poisoned")
            .is_empty()
    }
}

/// One channel's contribution to a health report.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelHealth {
    pub channel: String,
    pub healthy: bool,
    pub message: Option<String>,
}

/// Collects per-channel verdicts; a probe that has nothing to say simply
/// does not add an entry.
#[derive(Debug, Default)]
pub struct HealthReportBuilder {
    entries: Vec<ChannelHealth>,
}

impl HealthReportBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, channel: impl Into<String>, healthy: bool) {
        self.entries.push(ChannelHealth {
            channel: channel.into(),
            healthy,
            message: None,
        });
    }

    pub fn add_with_message(
        &mut self,
        channel: impl Into<String>,
        healthy: bool,
        message: impl Into<String>,
    ) {
        self.entries.push(ChannelHealth {
            channel: channel.into(),
            healthy,
            message: Some(message.into()),
        });
    }

    pub fn entries(&self) -> &[ChannelHealth] {
        &self.entries
    }

    pub fn is_healthy(&self) -> bool {
        self.entries.iter().all(|e| e.healthy)
    }
}

/// Broker-side probes for the sink. Startup latches on the first successful
/// metadata fetch; readiness re-probes every time.
#[derive(Debug)]
pub(crate) struct KafkaSinkHealth<C> {
    channel: String,
    topic: String,
    producer: Arc<C>,
    started: AtomicBool,
}

impl<C: ProducerClient> KafkaSinkHealth<C> {
    pub(crate) fn new(channel: String, topic: String, producer: Arc<C>) -> Self {
        Self {
            channel,
            topic,
            producer,
            started: AtomicBool::new(false),
        }
    }

    pub(crate) async fn is_ready(&self, builder: &mut HealthReportBuilder) {
        match self.producer.check_topic(self.topic.clone()).await {
            Ok(()) => builder.add(self.channel.clone(), true),
            Err(e) => {
                warn!(?e, topic = self.topic.as_str(), "Readiness probe failed");
                builder.add_with_message(self.channel.clone(), false, e.to_string());
            }
        }
    }

    pub(crate) async fn is_started(&self, builder: &mut HealthReportBuilder) {
        if self.started.load(Ordering::Relaxed) {
            builder.add(self.channel.clone(), true);
            return;
        }
        match self.producer.check_topic(self.topic.clone()).await {
            Ok(()) => {
                self.started.store(true, Ordering::Relaxed);
                builder.add(self.channel.clone(), true);
            }
            Err(e) => builder.add_with_message(self.channel.clone(), false, e.to_string()),
        }
    }
}
