//! Transactional emitter: groups produced records, and optionally the
//! consumed offsets they were derived from, into atomic exactly-once units.
//!
//! One transaction at a time per emitter instance; the slot is guarded by a
//! mutex whose critical section only swaps a flag, never spans an await.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{error, warn};

use crate::config::KafkaSinkConfig;
use crate::context::ContextExecutor;
use crate::error::{Error, Result, SendError, SendErrorKind};
use crate::message::{Message, TopicPartition};
use crate::producer::{GroupMetadata, ProducerClient};
use crate::sink::MessageWriter;

/// The consumer-side contract the exactly-once path relies on: the live
/// group generation for fencing, and a rollback to the last committed
/// positions after an abort.
#[async_trait]
pub trait ConsumerClient: Send + Sync {
    async fn group_metadata(&self) -> Result<GroupMetadata>;

    /// Resets the consumer position to the last committed offsets.
    async fn seek_to_last_committed(&self) -> Result<()>;
}

/// Registry binding channels to their consumers.
#[derive(Default)]
pub struct ClientService {
    consumers: RwLock<HashMap<String, Vec<Arc<dyn ConsumerClient>>>>,
}

impl ClientService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_consumer(&self, channel: impl Into<String>, consumer: Arc<dyn ConsumerClient>) {
        self.consumers
            .write()
            .expect("client service lock poisoned")
            .entry(channel.into())
            .or_default()
            .push(consumer);
    }

    pub fn consumers(&self, channel: &str) -> Vec<Arc<dyn ConsumerClient>> {
        self.consumers
            .read()
            .expect("client service lock poisoned")
            .get(channel)
            .cloned()
            .unwrap_or_default()
    }
}

/// Offsets and fencing data extracted from the triggering message.
struct ExactlyOnceContext {
    channel: String,
    generation_id: i32,
    /// Next offset to consume per partition (consumed offset + 1).
    offsets: HashMap<TopicPartition, i64>,
}

impl ExactlyOnceContext {
    fn from_message(message: &Message) -> Result<Self> {
        if let Some(batch) = &message.incoming_batch {
            return Ok(Self {
                channel: batch.channel.clone(),
                generation_id: batch.generation_id,
                offsets: batch
                    .offsets
                    .iter()
                    .map(|(tp, offset)| (tp.clone(), offset + 1))
                    .collect(),
            });
        }
        if let Some(record) = &message.incoming {
            return Ok(Self {
                channel: record.channel.clone(),
                generation_id: record.generation_id,
                offsets: HashMap::from([(
                    TopicPartition::new(record.topic.clone(), record.partition),
                    record.offset + 1,
                )]),
            });
        }
        Err(Error::NoRecordMetadata)
    }
}

/// Rolls the slot back and aborts the broker transaction when the caller's
/// future is dropped mid-transaction.
struct TransactionGuard<C: ProducerClient> {
    in_progress: Arc<Mutex<bool>>,
    producer: Arc<C>,
    armed: bool,
}

impl<C: ProducerClient> TransactionGuard<C> {
    fn new(in_progress: Arc<Mutex<bool>>, producer: Arc<C>) -> Self {
        Self {
            in_progress,
            producer,
            armed: true,
        }
    }

    fn disarm(mut self) {
        *self.in_progress.lock().expect("transaction slot poisoned") = false;
        self.armed = false;
    }
}

impl<C: ProducerClient> Drop for TransactionGuard<C> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        *self.in_progress.lock().expect("transaction slot poisoned") = false;
        warn!("Transaction cancelled before completion, aborting");
        let producer = self.producer.clone();
        if let Ok(handle) = Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = producer.abort_transaction().await {
                    error!(?e, "Unable to abort the cancelled transaction");
                }
            });
        }
    }
}

/// Handle given to the `work` function: submit sends into the open
/// transaction, or flag it for abort without raising.
pub struct TransactionalEmitter<C: ProducerClient> {
    writer: Arc<MessageWriter<C>>,
    sends: Arc<Mutex<Vec<JoinHandle<Result<()>>>>>,
    abort: Arc<AtomicBool>,
}

impl<C: ProducerClient> Clone for TransactionalEmitter<C> {
    fn clone(&self) -> Self {
        Self {
            writer: self.writer.clone(),
            sends: self.sends.clone(),
            abort: self.abort.clone(),
        }
    }
}

impl<C: ProducerClient> TransactionalEmitter<C> {
    fn new(writer: Arc<MessageWriter<C>>) -> Self {
        Self {
            writer,
            sends: Arc::new(Mutex::new(Vec::new())),
            abort: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn send(&self, payload: impl Into<Bytes>) {
        self.send_message(Message::new(payload));
    }

    /// Submits a produce; its completion is awaited before the commit.
    pub fn send_message(&self, message: Message) {
        let writer = self.writer.clone();
        let handle = tokio::spawn(async move {
            writer
                .write(message)
                .await
                .inspect_err(|e| error!(?e, "Unable to send record within the transaction"))
        });
        self.sends
            .lock()
            .expect("transaction sends lock poisoned")
            .push(handle);
    }

    /// Flags the transaction for abort without raising an error.
    pub fn mark_for_abort(&self) {
        self.abort.store(true, Ordering::SeqCst);
    }

    pub fn is_marked_for_abort(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    /// Awaits every registered send, collecting the failures.
    async fn join_sends(&self) -> Vec<Error> {
        let handles: Vec<_> = std::mem::take(
            &mut *self
                .sends
                .lock()
                .expect("transaction sends lock poisoned"),
        );
        let mut failures = Vec::new();
        for handle in handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => failures.push(e),
                Err(join_err) => failures.push(Error::Cancelled(join_err.to_string())),
            }
        }
        failures
    }
}

/// Coordinator for broker transactions on one channel's producer.
pub struct KafkaTransactions<C: ProducerClient> {
    channel: String,
    producer: Arc<C>,
    writer: Arc<MessageWriter<C>>,
    clients: Arc<ClientService>,
    in_progress: Arc<Mutex<bool>>,
}

impl<C: ProducerClient> KafkaTransactions<C> {
    pub fn new(
        config: KafkaSinkConfig,
        producer: Arc<C>,
        clients: Arc<ClientService>,
    ) -> Result<Self> {
        config.validate()?;
        let writer = Arc::new(MessageWriter::new(config.clone(), producer.clone())?);
        Ok(Self {
            channel: config.channel,
            producer,
            writer,
            clients,
            in_progress: Arc::new(Mutex::new(false)),
        })
    }

    pub fn is_transaction_in_progress(&self) -> bool {
        *self.in_progress.lock().expect("transaction slot poisoned")
    }

    /// Opens a transaction, runs `work`, awaits its sends, flushes, then
    /// commits; any failure or cancellation aborts instead.
    pub async fn with_transaction<R, F, Fut>(&self, work: F) -> Result<R>
    where
        F: FnOnce(TransactionalEmitter<C>) -> Fut,
        Fut: Future<Output = Result<R>>,
        R: Send + 'static,
    {
        self.execute(None, work).await
    }

    /// Exactly-once variant: additionally fences and commits the consumed
    /// offsets carried by `message` within the same transaction. The
    /// message's channel must be served by exactly one consumer.
    pub async fn with_transaction_for<R, F, Fut>(&self, message: &Message, work: F) -> Result<R>
    where
        F: FnOnce(TransactionalEmitter<C>) -> Fut,
        Fut: Future<Output = Result<R>>,
        R: Send + 'static,
    {
        let exactly_once = ExactlyOnceContext::from_message(message)?;
        let mut consumers = self.clients.consumers(&exactly_once.channel);
        let consumer = match consumers.len() {
            0 => return Err(Error::NoConsumerForChannel(exactly_once.channel)),
            1 => consumers.remove(0),
            n => {
                return Err(Error::MultipleConsumersForChannel(exactly_once.channel, n));
            }
        };
        self.execute(Some((exactly_once, consumer)), work).await
    }

    async fn execute<R, F, Fut>(
        &self,
        exactly_once: Option<(ExactlyOnceContext, Arc<dyn ConsumerClient>)>,
        work: F,
    ) -> Result<R>
    where
        F: FnOnce(TransactionalEmitter<C>) -> Fut,
        Fut: Future<Output = Result<R>>,
        R: Send + 'static,
    {
        {
            let mut in_progress = self.in_progress.lock().expect("transaction slot poisoned");
            if *in_progress {
                return Err(Error::TransactionInProgress(self.channel.clone()));
            }
            *in_progress = true;
        }
        let guard = TransactionGuard::new(self.in_progress.clone(), self.producer.clone());
        let executor = ContextExecutor::capture();

        let result = self.run(exactly_once, work, &executor).await;
        guard.disarm();
        // hand the outcome back on the caller's context
        executor.emit_on(std::future::ready(result)).await
    }

    async fn run<R, F, Fut>(
        &self,
        exactly_once: Option<(ExactlyOnceContext, Arc<dyn ConsumerClient>)>,
        work: F,
        executor: &ContextExecutor,
    ) -> Result<R>
    where
        F: FnOnce(TransactionalEmitter<C>) -> Fut,
        Fut: Future<Output = Result<R>>,
        R: Send + 'static,
    {
        // begin, then re-emit so `work` runs on the caller's context
        {
            let producer = self.producer.clone();
            executor
                .emit_on(async move { producer.begin_transaction().await })
                .await?;
        }

        let emitter = TransactionalEmitter::new(self.writer.clone());
        let work_result = work(emitter.clone()).await;
        // wait until all send operations completed, success or not
        let send_failures = emitter.join_sends().await;

        let consumer = exactly_once.as_ref().map(|(_, c)| c.clone());
        let outcome = match work_result {
            Err(e) => Err(e),
            Ok(value) => match send_failures.into_iter().next() {
                Some(send_failure) => Err(send_failure),
                // only flush if the work completed cleanly
                None => self.producer.flush().await.map(|()| value),
            },
        };

        let value = match outcome {
            Ok(value) => value,
            Err(e) => {
                self.abort(consumer.as_deref()).await;
                return Err(e);
            }
        };

        if emitter.is_marked_for_abort() {
            self.abort(consumer.as_deref()).await;
            return Err(Error::Send(SendError::new(
                SendErrorKind::TransactionAborted,
                "Transaction marked for abort",
            )));
        }

        if let Some((ctx, consumer)) = &exactly_once {
            let group = match consumer.group_metadata().await {
                Ok(group) => group,
                Err(e) => {
                    self.abort(Some(consumer.as_ref())).await;
                    return Err(e);
                }
            };
            if group.generation_id != ctx.generation_id {
                warn!(
                    channel = ctx.channel.as_str(),
                    expected = ctx.generation_id,
                    live = group.generation_id,
                    "Consumer group rebalanced during exactly-once processing, aborting"
                );
                self.abort(Some(consumer.as_ref())).await;
                return Err(Error::Rebalance {
                    channel: ctx.channel.clone(),
                    expected: ctx.generation_id,
                    live: group.generation_id,
                });
            }
            if let Err(e) = self
                .producer
                .send_offsets_to_transaction(ctx.offsets.clone(), group)
                .await
            {
                self.abort(Some(consumer.as_ref())).await;
                return Err(e);
            }
        }

        match self.producer.commit_transaction().await {
            Ok(()) => Ok(value),
            Err(commit_err) => {
                warn!(?commit_err, "Transaction commit failed, aborting");
                self.abort(consumer.as_deref()).await;
                Err(commit_err)
            }
        }
    }

    /// Aborts the broker transaction; with an exactly-once consumer, also
    /// rolls its position back to the last committed offsets.
    async fn abort(&self, consumer: Option<&dyn ConsumerClient>) {
        if let Err(e) = self.producer.abort_transaction().await {
            error!(?e, "Unable to abort the transaction");
        }
        if let Some(consumer) = consumer
            && let Err(e) = consumer.seek_to_last_committed().await
        {
            error!(?e, "Unable to reset the consumer to the last committed positions");
        }
    }
}
