//! Turns handler outcomes into broker dispositions.

use std::sync::Arc;
use std::time::Duration;

use tracing::{Instrument, debug, error, info_span, warn};

use super::retry::AttemptTracker;
use super::{Disposition, InboundMessage, MessageHandler};
use crate::error::ProcessingError;

/// Runs a handler under a deadline and settles the outcome.
///
/// Permanent failures are rejected, best-effort failures acknowledged, and
/// transient failures (including an expired deadline) requeued until the
/// attempt ceiling is reached.
#[derive(Clone)]
pub struct Dispatcher {
    queue: String,
    handler: Arc<dyn MessageHandler>,
    attempts: AttemptTracker,
    deadline: Duration,
}

impl Dispatcher {
    /// Create a dispatcher for messages from `queue`.
    #[must_use]
    pub fn new(
        queue: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
        attempts: AttemptTracker,
        deadline: Duration,
    ) -> Self {
        Self {
            queue: queue.into(),
            handler,
            attempts,
            deadline,
        }
    }

    /// The queue this dispatcher serves.
    #[must_use]
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Handle one message and decide its disposition.
    pub async fn dispatch(&self, message: &InboundMessage) -> Disposition {
        let key = message.idempotency_key();
        let span = info_span!("dispatch", queue = %self.queue, key = %key, redelivered = message.redelivered);

        async {
            let outcome = tokio::time::timeout(self.deadline, self.handler.handle(message))
                .await
                .unwrap_or_else(|_| {
                    Err(ProcessingError::transient(format!(
                        "handler exceeded {}s deadline",
                        self.deadline.as_secs()
                    )))
                });

            match outcome {
                Ok(()) => {
                    debug!("message handled");
                    self.attempts.clear(&key).await;
                    Disposition::Ack
                }
                Err(failure) => self.settle_failure(&key, &failure).await,
            }
        }
        .instrument(span)
        .await
    }

    async fn settle_failure(&self, key: &str, failure: &ProcessingError) -> Disposition {
        match failure.disposition() {
            Disposition::Ack => {
                warn!(error = %failure, "completed with cleanup failures");
                self.attempts.clear(key).await;
                Disposition::Ack
            }
            Disposition::Reject => {
                error!(error = %failure, "rejecting message");
                self.attempts.clear(key).await;
                Disposition::Reject
            }
            Disposition::Requeue => self.attempts.on_transient(key, failure).await,
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("queue", &self.queue)
            .field("attempts", &self.attempts)
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}
