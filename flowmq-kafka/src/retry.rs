//! Retry discipline for sends: capped exponential backoff, gated by the
//! failure classification, bounded either by an attempt budget or by the
//! producer's delivery timeout.

use std::future::Future;
use std::time::Duration;

use backoff::strategy::ExponentialBackoff;
use backoff::{RetryBudget, retry};

use crate::config::{KafkaSinkConfig, RETRIES_UNLIMITED};
use crate::error::{Result, SendError};
use crate::message::DeliveryMetadata;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(20);

#[derive(Debug, Clone)]
pub(crate) struct RetryPolicy {
    retries: u32,
    delivery_timeout: Duration,
}

impl RetryPolicy {
    pub(crate) fn from_config(config: &KafkaSinkConfig) -> Result<Self> {
        Ok(Self {
            retries: config.retries,
            delivery_timeout: config.delivery_timeout()?,
        })
    }

    fn budget(&self) -> RetryBudget {
        if self.retries == RETRIES_UNLIMITED {
            RetryBudget::Deadline(self.delivery_timeout)
        } else {
            RetryBudget::Attempts(self.retries)
        }
    }

    /// Drives `attempt` to success or a terminal failure. Non-recoverable
    /// failures are never retried.
    pub(crate) async fn run<F, Fut>(
        &self,
        attempt: F,
    ) -> std::result::Result<DeliveryMetadata, SendError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<DeliveryMetadata, SendError>>,
    {
        retry(
            ExponentialBackoff::new(INITIAL_BACKOFF, MAX_BACKOFF),
            self.budget(),
            attempt,
            SendError::is_recoverable,
        )
        .await
    }
}
