use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    config::{ChangeFeedConfig, StartPosition},
    error::{LeaseError, ProcessingError, SourceError},
    interface::observer::{ChangeFeedObserver, ObserverContext},
    source::{ChangeBatch, DataSource},
    util::sleep_or_cancelled,
};

#[derive(Debug, Clone)]
pub(crate) struct ProcessorSettings {
    pub(crate) max_items: usize,
    pub(crate) poll_delay: Duration,
    pub(crate) start_position: StartPosition,
    pub(crate) auto_checkpoint: bool,
}

impl From<&ChangeFeedConfig> for ProcessorSettings {
    fn from(config: &ChangeFeedConfig) -> Self {
        Self {
            max_items: config.max_items_per_batch,
            poll_delay: config.feed_poll_delay,
            start_position: config.start_position,
            auto_checkpoint: config.auto_checkpoint,
        }
    }
}

/// Reads one partition and hands its changes to the observer.
pub(crate) struct PartitionProcessor {
    lease_token: String,
    source: Arc<dyn DataSource>,
    observer: Arc<dyn ChangeFeedObserver>,
    context: ObserverContext,
    settings: ProcessorSettings,
    continuation: Mutex<Option<String>>,
    last_processed_time: Mutex<Instant>,
    result: Mutex<Option<ProcessingError>>,
}

enum Step {
    Continue,
    Stop(ProcessingError),
}

impl PartitionProcessor {
    pub(crate) fn new(
        lease_token: String,
        continuation: Option<String>,
        source: Arc<dyn DataSource>,
        observer: Arc<dyn ChangeFeedObserver>,
        context: ObserverContext,
        settings: ProcessorSettings,
    ) -> Self {
        Self {
            lease_token,
            source,
            observer,
            context,
            settings,
            continuation: Mutex::new(continuation),
            last_processed_time: Mutex::new(Instant::now()),
            result: Mutex::new(None),
        }
    }

    pub(crate) async fn run(&self, token: CancellationToken) {
        let mut max_items = self.settings.max_items;
        while !token.is_cancelled() {
            let continuation = self.continuation.lock().clone();
            let read = self
                .source
                .read_batch(
                    &self.lease_token,
                    continuation.as_deref(),
                    self.settings.start_position,
                    max_items,
                )
                .await;

            let step = match read {
                Ok(batch) if batch.is_empty() => {
                    if let Some(next) = batch.continuation {
                        *self.continuation.lock() = Some(next);
                    }
                    sleep_or_cancelled(self.settings.poll_delay, &token).await;
                    Step::Continue
                }
                Ok(batch) => {
                    let step = self.dispatch(batch).await;
                    max_items = self.settings.max_items;
                    step
                }
                Err(err) => self.handle_read_error(err, &mut max_items, &token).await,
            };

            if let Step::Stop(err) = step {
                info!(lease_token = %self.lease_token, error = %err, "Partition processor stopping");
                *self.result.lock() = Some(err);
                return;
            }
        }
    }

    async fn dispatch(&self, batch: ChangeBatch) -> Step {
        let count = batch.items.len();
        let context = self.context.for_batch(batch.continuation.clone());
        if let Err(source) = self.observer.process_changes(&context, batch.items).await {
            return Step::Stop(ProcessingError::Observer {
                lease_token: self.lease_token.clone(),
                source,
            });
        }

        *self.last_processed_time.lock() = Instant::now();
        if let Some(next) = batch.continuation {
            *self.continuation.lock() = Some(next);
        }
        debug!(lease_token = %self.lease_token, count, "Dispatched changes");

        if !self.settings.auto_checkpoint {
            return Step::Continue;
        }
        match context.checkpoint().await {
            Ok(()) => Step::Continue,
            Err(LeaseError::Lost(token)) => Step::Stop(ProcessingError::LeaseLost(token)),
            Err(err) => {
                warn!(lease_token = %self.lease_token, error = %err, "Checkpoint failed (will retry)");
                Step::Continue
            }
        }
    }

    async fn handle_read_error(
        &self,
        err: SourceError,
        max_items: &mut usize,
        token: &CancellationToken,
    ) -> Step {
        match err {
            SourceError::NotFound(_) => Step::Stop(ProcessingError::LeaseLost(self.lease_token.clone())),
            SourceError::Gone(_) => Step::Stop(ProcessingError::LeaseGone(self.lease_token.clone())),
            SourceError::TooLarge if *max_items > 1 => {
                *max_items /= 2;
                warn!(lease_token = %self.lease_token, max_items = *max_items, "Response too large, reducing batch size");
                Step::Continue
            }
            SourceError::TooLarge => Step::Stop(ProcessingError::Undefined {
                lease_token: self.lease_token.clone(),
                reason: "response too large even for a single item".to_string(),
            }),
            SourceError::Throttled { retry_after } => {
                debug!(lease_token = %self.lease_token, ?retry_after, "Read throttled");
                sleep_or_cancelled(retry_after, token).await;
                Step::Continue
            }
            SourceError::Transient(message) => {
                warn!(lease_token = %self.lease_token, error = %message, "Transient read failure");
                sleep_or_cancelled(self.settings.poll_delay, token).await;
                Step::Continue
            }
            SourceError::Other(message) => Step::Stop(ProcessingError::Undefined {
                lease_token: self.lease_token.clone(),
                reason: message,
            }),
        }
    }

    pub(crate) fn last_processed_time(&self) -> Instant {
        *self.last_processed_time.lock()
    }

    pub(crate) fn has_failed(&self) -> bool {
        self.result.lock().is_some()
    }

    pub(crate) fn take_result(&self) -> Option<ProcessingError> {
        self.result.lock().take()
    }
}
