use std::future::Future;
use std::time::Duration;

use tokio::time::{Instant, sleep};

/// Bound on a retry loop, independent of the delay strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryBudget {
    /// At most this many retries after the initial attempt. `Attempts(0)`
    /// means the first failure is final.
    Attempts(u32),
    /// Keep retrying until the given duration has elapsed since the first
    /// attempt. A retry whose cool-off would end past the deadline is not
    /// started.
    Deadline(Duration),
}

/// Runs `op` until it succeeds, the error is not retryable, or the budget is
/// exhausted. Returns the last error in the failure cases.
///
/// `delays` supplies the cool-off before each retry; an exhausted iterator
/// also ends the loop.
pub async fn retry<T, E, F, Fut, C>(
    mut delays: impl Iterator<Item = Duration>,
    budget: RetryBudget,
    mut op: F,
    mut is_retryable: C,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: FnMut(&E) -> bool,
{
    let started = Instant::now();
    let mut attempts_left = match budget {
        RetryBudget::Attempts(n) => Some(n),
        RetryBudget::Deadline(_) => None,
    };
    let deadline = match budget {
        RetryBudget::Deadline(d) => Some(started + d),
        RetryBudget::Attempts(_) => None,
    };

    loop {
        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if !is_retryable(&err) {
            return Err(err);
        }

        if let Some(left) = attempts_left.as_mut() {
            if *left == 0 {
                return Err(err);
            }
            *left -= 1;
        }

        let Some(delay) = delays.next() else {
            return Err(err);
        };

        if let Some(deadline) = deadline
            && Instant::now() + delay >= deadline
        {
            return Err(err);
        }

        sleep(delay).await;
    }
}
