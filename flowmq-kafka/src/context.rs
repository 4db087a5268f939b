//! Stickiness to the caller's runtime across asynchronous steps. Broker
//! client callbacks and the blocking transaction verbs resolve on foreign
//! threads; continuations that follow them must land back on the runtime
//! the caller started from.

use std::future::Future;

use tokio::runtime::Handle;

use crate::error::{Error, Result};

/// Captures the caller's runtime handle (when there is one) at
/// construction; [`ContextExecutor::emit_on`] re-dispatches a future so its
/// continuation runs on that runtime. Callers outside any runtime run the
/// future in place.
#[derive(Debug, Clone)]
pub(crate) struct ContextExecutor {
    handle: Option<Handle>,
}

impl ContextExecutor {
    pub(crate) fn capture() -> Self {
        Self {
            handle: Handle::try_current().ok(),
        }
    }

    pub(crate) async fn emit_on<R>(
        &self,
        fut: impl Future<Output = Result<R>> + Send + 'static,
    ) -> Result<R>
    where
        R: Send + 'static,
    {
        match &self.handle {
            None => fut.await,
            Some(handle) => handle
                .spawn(fut)
                .await
                .map_err(|e| Error::Cancelled(format!("context hop failed: {e}")))?,
        }
    }
}
