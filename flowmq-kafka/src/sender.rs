//! Demand-driven sender pipeline. A single upstream feeds messages through a
//! bounded window; each message is handed to the write function and the
//! window is replenished on completion (or on dispatch when the sink does
//! not wait for write completion). Completions surface in broker
//! acknowledgement order, not submission order.

use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::UNBOUNDED;
use crate::error::{Error, Result};
use crate::message::Message;

/// Per-message write function; the future resolves once the message reached
/// its terminal ack/nack.
pub(crate) type WriteFuture = BoxFuture<'static, Result<()>>;
pub(crate) type WriteFn = Arc<dyn Fn(Message) -> WriteFuture + Send + Sync>;
/// Invoked for failures the write function could not absorb; never
/// terminates the pipeline.
pub(crate) type FailureHook = Arc<dyn Fn(Error) + Send + Sync>;

/// Window capacity handed to the upstream before any completion.
fn channel_capacity(max_inflight: usize) -> usize {
    if max_inflight == UNBOUNDED {
        1024
    } else {
        max_inflight
    }
}

#[derive(Debug)]
pub(crate) struct SenderPipeline {
    sender: mpsc::Sender<Message>,
    cancel: CancellationToken,
}

impl SenderPipeline {
    /// Spawns the pipeline task. `max_inflight` of zero is a contract
    /// violation by the caller and fails fast; the unbounded mode uses the
    /// [`UNBOUNDED`] sentinel.
    pub(crate) fn start(
        max_inflight: usize,
        wait_for_write_completion: bool,
        write: WriteFn,
        on_failure: FailureHook,
    ) -> Self {
        assert!(max_inflight >= 1, "max_inflight must be at least 1");
        let (sender, receiver) = mpsc::channel(channel_capacity(max_inflight));
        let cancel = CancellationToken::new();
        tokio::spawn(run(
            receiver,
            cancel.clone(),
            max_inflight,
            wait_for_write_completion,
            write,
            on_failure,
        ));
        Self { sender, cancel }
    }

    /// The subscriber end handed to the upstream.
    pub(crate) fn sender(&self) -> mpsc::Sender<Message> {
        self.sender.clone()
    }

    /// Propagates cancellation; queued messages are discarded quietly.
    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }
}

async fn run(
    mut receiver: mpsc::Receiver<Message>,
    cancel: CancellationToken,
    max_inflight: usize,
    wait_for_write_completion: bool,
    write: WriteFn,
    on_failure: FailureHook,
) {
    let mut inflight: FuturesUnordered<WriteFuture> = FuturesUnordered::new();
    info!(
        max_inflight,
        wait_for_write_completion, "Starting sender pipeline"
    );

    loop {
        let can_request = max_inflight == UNBOUNDED || inflight.len() < max_inflight;
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                warn!("Sender pipeline cancelled, discarding outstanding sends");
                return;
            }

            Some(result) = inflight.next(), if !inflight.is_empty() => {
                if let Err(e) = result {
                    error!(?e, "Unable to dispatch a message to Kafka");
                    on_failure(e);
                }
            }

            maybe_message = receiver.recv(), if can_request => {
                match maybe_message {
                    Some(message) => {
                        let fut = write(message);
                        if wait_for_write_completion {
                            inflight.push(fut);
                        } else {
                            // replenish demand right away, the producer's
                            // buffer is the admission control
                            let on_failure = on_failure.clone();
                            tokio::spawn(async move {
                                if let Err(e) = fut.await {
                                    error!(?e, "Unable to dispatch a message to Kafka");
                                    on_failure(e);
                                }
                            });
                        }
                    }
                    None => break,
                }
            }
        }
    }

    // Upstream completed; let outstanding sends finish unless cancelled.
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            maybe = inflight.next() => match maybe {
                Some(Err(e)) => {
                    error!(?e, "Unable to dispatch a message to Kafka");
                    on_failure(e);
                }
                Some(Ok(())) => {}
                None => break,
            }
        }
    }
    info!("Sender pipeline completed");
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use futures::FutureExt;
    use tokio::sync::oneshot;

    use super::*;
    use crate::message::SendAck;

    fn noop_failure_hook() -> FailureHook {
        Arc::new(|_| {})
    }

    /// Write function that records invocation order and completes each
    /// message when the paired trigger fires.
    fn manual_write(
        invocations: Arc<AtomicUsize>,
        completions: Arc<Mutex<Vec<usize>>>,
        triggers: Arc<Mutex<Vec<Option<oneshot::Receiver<()>>>>>,
    ) -> WriteFn {
        let index = Arc::new(AtomicUsize::new(0));
        Arc::new(move |message: Message| {
            let i = index.fetch_add(1, Ordering::SeqCst);
            invocations.fetch_add(1, Ordering::SeqCst);
            let trigger = triggers.lock().unwrap()[i].take();
            let completions = completions.clone();
            async move {
                if let Some(trigger) = trigger {
                    let _ = trigger.await;
                }
                message.ack();
                completions.lock().unwrap().push(i);
                Ok(())
            }
            .boxed()
        })
    }

    #[tokio::test]
    async fn emits_in_completion_order() {
        let invocations = Arc::new(AtomicUsize::new(0));
        let completions = Arc::new(Mutex::new(Vec::new()));
        let (tx0, rx0) = oneshot::channel();
        let (tx1, rx1) = oneshot::channel();
        let triggers = Arc::new(Mutex::new(vec![Some(rx0), Some(rx1)]));
        let pipeline = SenderPipeline::start(
            4,
            true,
            manual_write(invocations.clone(), completions.clone(), triggers),
            noop_failure_hook(),
        );

        let sender = pipeline.sender();
        sender.send(Message::new("first")).await.unwrap();
        sender.send(Message::new("second")).await.unwrap();
        drop(sender);

        // complete the second send before the first
        tx1.send(()).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx0.send(()).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(*completions.lock().unwrap(), vec![1, 0]);
    }

    #[tokio::test]
    async fn bounded_window_caps_inflight_sends() {
        let invocations = Arc::new(AtomicUsize::new(0));
        let completions = Arc::new(Mutex::new(Vec::new()));
        let (tx0, rx0) = oneshot::channel();
        let (tx1, rx1) = oneshot::channel();
        let triggers = Arc::new(Mutex::new(vec![Some(rx0), Some(rx1)]));
        let pipeline = SenderPipeline::start(
            1,
            true,
            manual_write(invocations.clone(), completions.clone(), triggers),
            noop_failure_hook(),
        );

        let sender = pipeline.sender();
        sender.send(Message::new("first")).await.unwrap();
        sender.send(Message::new("second")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        // the second write must wait for the first completion
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
        tx0.send(()).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(invocations.load(Ordering::SeqCst), 2);
        tx1.send(()).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(*completions.lock().unwrap(), vec![0, 1]);
    }

    #[tokio::test]
    async fn with_max_inflight_one_acks_appear_in_send_order() {
        let write: WriteFn = Arc::new(|message: Message| {
            async move {
                message.ack();
                Ok(())
            }
            .boxed()
        });
        let pipeline = SenderPipeline::start(1, true, write, noop_failure_hook());
        let sender = pipeline.sender();

        let mut acks = Vec::new();
        for i in 0..5 {
            let (message, rx) = Message::new(format!("m{i}")).with_ack_channel();
            sender.send(message).await.unwrap();
            acks.push(rx);
        }
        drop(sender);
        for rx in acks {
            assert_eq!(rx.await.unwrap(), SendAck::Ack);
        }
    }

    #[tokio::test]
    async fn without_wait_for_write_completion_demand_replenishes_on_dispatch() {
        let invocations = Arc::new(AtomicUsize::new(0));
        let completions = Arc::new(Mutex::new(Vec::new()));
        let (_tx0, rx0) = oneshot::channel();
        let (_tx1, rx1) = oneshot::channel();
        let triggers = Arc::new(Mutex::new(vec![Some(rx0), Some(rx1)]));
        let pipeline = SenderPipeline::start(
            1,
            false,
            manual_write(invocations.clone(), completions.clone(), triggers),
            noop_failure_hook(),
        );

        let sender = pipeline.sender();
        sender.send(Message::new("first")).await.unwrap();
        sender.send(Message::new("second")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        // both writes dispatched although neither send completed
        assert_eq!(invocations.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failures_do_not_terminate_the_pipeline() {
        let failures = Arc::new(Mutex::new(Vec::new()));
        let hook_failures = failures.clone();
        let on_failure: FailureHook = Arc::new(move |e| {
            hook_failures.lock().unwrap().push(e);
        });
        let counter = Arc::new(AtomicUsize::new(0));
        let write_counter = counter.clone();
        let write: WriteFn = Arc::new(move |message: Message| {
            let i = write_counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if i == 0 {
                    message.nack(Error::Record("broken".into()));
                    Err(Error::Record("broken".into()))
                } else {
                    message.ack();
                    Ok(())
                }
            }
            .boxed()
        });
        let pipeline = SenderPipeline::start(1, true, write, on_failure);
        let sender = pipeline.sender();

        let (first, first_ack) = Message::new("first").with_ack_channel();
        let (second, second_ack) = Message::new("second").with_ack_channel();
        sender.send(first).await.unwrap();
        sender.send(second).await.unwrap();
        drop(sender);

        assert!(matches!(first_ack.await.unwrap(), SendAck::Nack(_)));
        assert_eq!(second_ack.await.unwrap(), SendAck::Ack);
        assert_eq!(failures.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cancellation_discards_queued_messages() {
        let (_tx0, rx0) = oneshot::channel();
        let invocations = Arc::new(AtomicUsize::new(0));
        let completions = Arc::new(Mutex::new(Vec::new()));
        let triggers = Arc::new(Mutex::new(vec![Some(rx0)]));
        let pipeline = SenderPipeline::start(
            1,
            true,
            manual_write(invocations.clone(), completions, triggers),
            noop_failure_hook(),
        );

        let sender = pipeline.sender();
        sender.send(Message::new("held")).await.unwrap();
        let (queued, queued_ack) = Message::new("queued").with_ack_channel();
        sender.send(queued).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        pipeline.cancel();
        drop(sender);

        // the queued message never reached the write function and resolves
        // with a cancellation nack
        match queued_ack.await.unwrap() {
            SendAck::Nack(Error::Cancelled(_)) => {}
            other => panic!("expected cancellation nack, got {other:?}"),
        }
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn upstream_completion_drains_outstanding_sends() {
        let invocations = Arc::new(AtomicUsize::new(0));
        let completions = Arc::new(Mutex::new(Vec::new()));
        let (tx0, rx0) = oneshot::channel();
        let triggers = Arc::new(Mutex::new(vec![Some(rx0)]));
        let pipeline = SenderPipeline::start(
            2,
            true,
            manual_write(invocations.clone(), completions.clone(), triggers),
            noop_failure_hook(),
        );

        let sender = pipeline.sender();
        sender.send(Message::new("outstanding")).await.unwrap();
        drop(sender);
        drop(pipeline);

        tokio::time::sleep(Duration::from_millis(20)).await;
        tx0.send(()).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(*completions.lock().unwrap(), vec![0]);
    }
}
