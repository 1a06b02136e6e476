//! Bounded background queue for fact extraction.
//!
//! Exchanges are submitted without waiting and processed one at a time by
//! a single worker task. A full queue drops the new job with a warning;
//! the reply path never blocks on extraction.

use crate::extraction::extractor::FactExtractor;
use lorekeep_core::fact::FactProvenance;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// One completed exchange awaiting extraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionJob {
    pub user_id: String,
    pub character_id: Option<String>,
    pub session_id: Option<String>,
    pub user_message: String,
    pub assistant_reply: String,
}

/// Handle to the extraction worker.
pub struct ExtractionQueue {
    sender: mpsc::Sender<ExtractionJob>,
    worker: JoinHandle<()>,
}

impl ExtractionQueue {
    /// Start the worker. Must be called from within a Tokio runtime.
    pub fn spawn(extractor: Arc<FactExtractor>, capacity: usize) -> Self {
        let (sender, mut receiver) = mpsc::channel::<ExtractionJob>(capacity.max(1));

        let worker = tokio::spawn(async move {
            while let Some(job) = receiver.recv().await {
                let provenance = FactProvenance {
                    conversation_id: job.session_id.clone(),
                    message_id: None,
                };
                let result = extractor
                    .extract_and_store(
                        &job.user_message,
                        &job.assistant_reply,
                        &job.user_id,
                        job.character_id.as_deref(),
                        &provenance,
                    )
                    .await;
                match result {
                    Ok(writes) if writes.is_empty() => {}
                    Ok(writes) => info!(user_id = %job.user_id, facts = writes.len(), "Extraction committed"),
                    Err(e) => warn!(user_id = %job.user_id, error = %e, "Fact extraction failed"),
                }
            }
            debug!("Extraction worker stopped");
        });

        Self { sender, worker }
    }

    /// Queue an exchange. Returns false when the job was dropped.
    pub fn submit(&self, job: ExtractionJob) -> bool {
        match self.sender.try_send(job) {
            Ok(()) => true,
            Err(TrySendError::Full(job)) => {
                warn!(user_id = %job.user_id, "Extraction queue full, dropping exchange");
                false
            }
            Err(TrySendError::Closed(job)) => {
                warn!(user_id = %job.user_id, "Extraction worker gone, dropping exchange");
                false
            }
        }
    }

    /// Jobs waiting in the queue (not counting the one in progress).
    pub fn pending(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }

    /// Stop accepting jobs and let the worker drain for up to `grace`.
    ///
    /// Returns true if every queued job finished. Otherwise the worker is
    /// aborted; a batch is committed atomically, so an aborted job leaves
    /// either all of its facts or none.
    pub async fn shutdown(self, grace: Duration) -> bool {
        let Self { sender, mut worker } = self;
        drop(sender);
        match tokio::time::timeout(grace, &mut worker).await {
            Ok(_) => true,
            Err(_) => {
                warn!(grace_ms = grace.as_millis() as u64, "Extraction did not drain in time, aborting");
                worker.abort();
                false
            }
        }
    }
}
