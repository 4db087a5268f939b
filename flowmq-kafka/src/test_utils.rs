//! In-memory fakes for the broker-facing seams, shared by the unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicUsize, Ordering};

use async_trait::async_trait;
use futures::FutureExt;

use crate::error::{Error, Result, SendError};
use crate::message::{DeliveryMetadata, TopicPartition};
use crate::producer::{DeliveryFuture, GroupMetadata, ProducerClient};
use crate::record::OutgoingRecord;
use crate::transaction::ConsumerClient;

/// Scripted outcome for one dispatch, consumed in order. An exhausted
/// script delivers successfully.
#[derive(Debug)]
pub(crate) enum FakeOutcome {
    Deliver,
    EnqueueFail(SendError),
    DeliveryFail(SendError),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ProducerEvent {
    Dispatch { topic: String },
    Flush,
    BeginTransaction,
    CommitTransaction,
    AbortTransaction,
    SendOffsets {
        offsets: HashMap<TopicPartition, i64>,
        generation_id: i32,
    },
}

#[derive(Debug, Default)]
pub(crate) struct FakeProducer {
    outcomes: Mutex<VecDeque<FakeOutcome>>,
    pub(crate) events: Mutex<Vec<ProducerEvent>>,
    pub(crate) records: Mutex<Vec<OutgoingRecord>>,
    next_offset: AtomicI64,
    fail_commit: AtomicBool,
}

impl FakeProducer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn script(&self, outcomes: impl IntoIterator<Item = FakeOutcome>) {
        self.outcomes.lock().unwrap().extend(outcomes);
    }

    pub(crate) fn fail_next_commit(&self) {
        self.fail_commit.store(true, Ordering::SeqCst);
    }

    pub(crate) fn events(&self) -> Vec<ProducerEvent> {
        self.events.lock().unwrap().clone()
    }

    pub(crate) fn dispatched(&self) -> Vec<OutgoingRecord> {
        self.records.lock().unwrap().clone()
    }

    pub(crate) fn dispatch_count(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    fn record_event(&self, event: ProducerEvent) {
        self.events.lock().unwrap().push(event);
    }
}

impl ProducerClient for FakeProducer {
    async fn dispatch(
        &self,
        record: OutgoingRecord,
    ) -> std::result::Result<DeliveryFuture, SendError> {
        self.record_event(ProducerEvent::Dispatch {
            topic: record.topic.clone(),
        });
        let outcome = self
            .outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(FakeOutcome::Deliver);
        let delivered = DeliveryMetadata {
            topic: record.topic.clone(),
            partition: record.partition.unwrap_or(0),
            offset: self.next_offset.fetch_add(1, Ordering::SeqCst),
        };
        self.records.lock().unwrap().push(record);
        match outcome {
            FakeOutcome::Deliver => Ok(std::future::ready(Ok(delivered)).boxed()),
            FakeOutcome::EnqueueFail(err) => Err(err),
            FakeOutcome::DeliveryFail(err) => Ok(std::future::ready(Err(err)).boxed()),
        }
    }

    async fn flush(&self) -> Result<()> {
        self.record_event(ProducerEvent::Flush);
        Ok(())
    }

    async fn begin_transaction(&self) -> Result<()> {
        self.record_event(ProducerEvent::BeginTransaction);
        Ok(())
    }

    async fn commit_transaction(&self) -> Result<()> {
        self.record_event(ProducerEvent::CommitTransaction);
        if self.fail_commit.swap(false, Ordering::SeqCst) {
            return Err(Error::Transaction("commit failed".into()));
        }
        Ok(())
    }

    async fn abort_transaction(&self) -> Result<()> {
        self.record_event(ProducerEvent::AbortTransaction);
        Ok(())
    }

    async fn send_offsets_to_transaction(
        &self,
        offsets: HashMap<TopicPartition, i64>,
        group: GroupMetadata,
    ) -> Result<()> {
        self.record_event(ProducerEvent::SendOffsets {
            offsets,
            generation_id: group.generation_id,
        });
        Ok(())
    }

    async fn check_topic(&self, _topic: String) -> Result<()> {
        Ok(())
    }
}

/// Consumer stub with a controllable live generation id.
pub(crate) struct FakeConsumer {
    group_id: String,
    generation_id: AtomicI32,
    pub(crate) seeks: AtomicUsize,
}

impl FakeConsumer {
    pub(crate) fn new(group_id: impl Into<String>, generation_id: i32) -> Self {
        Self {
            group_id: group_id.into(),
            generation_id: AtomicI32::new(generation_id),
            seeks: AtomicUsize::new(0),
        }
    }

    pub(crate) fn set_generation(&self, generation_id: i32) {
        self.generation_id.store(generation_id, Ordering::SeqCst);
    }

    pub(crate) fn seek_count(&self) -> usize {
        self.seeks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConsumerClient for FakeConsumer {
    async fn group_metadata(&self) -> Result<GroupMetadata> {
        Ok(GroupMetadata::new(
            self.group_id.clone(),
            self.generation_id.load(Ordering::SeqCst),
        ))
    }

    async fn seek_to_last_committed(&self) -> Result<()> {
        self.seeks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
