//! Attachment upload pipeline.
//!
//! Files of a batch are uploaded one after another against the message the
//! batch belongs to. Each file is tracked by its placeholder's [`LocalId`],
//! never by position, because live events may rewrite the attachment list
//! while uploads are running.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch, Mutex, RwLock};

use super::chat_types::{Attachment, ChatEvent, LocalId, Message, StoredObject, UploadFile};
use super::connection::ConnectionManager;
use super::timeline::MessageTimeline;
use super::transport::AttachmentStore;
use crate::error::{Result, SyncError};

/// Target type sent to the attachment store for message uploads.
pub const MESSAGE_TARGET: &str = "message";

/// Result of one file in a batch.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadOutcome {
    pub file_name: String,
    #[serde(skip)]
    pub local_id: LocalId,
    pub stored: Option<StoredObject>,
    pub error: Option<String>,
}

/// Result of a whole batch.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadReport {
    pub message_id: String,
    pub outcomes: Vec<UploadOutcome>,
}

impl UploadReport {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.stored.is_some()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }
}

pub struct UploadPipeline {
    store: Arc<dyn AttachmentStore>,
    timeline: Arc<RwLock<MessageTimeline>>,
    connection: Arc<ConnectionManager>,
    events: broadcast::Sender<ChatEvent>,
    cancel_tokens: Mutex<HashMap<String, watch::Sender<bool>>>,
}

impl UploadPipeline {
    pub fn new(
        store: Arc<dyn AttachmentStore>,
        timeline: Arc<RwLock<MessageTimeline>>,
        connection: Arc<ConnectionManager>,
        events: broadcast::Sender<ChatEvent>,
    ) -> Self {
        Self {
            store,
            timeline,
            connection,
            events,
            cancel_tokens: Mutex::new(HashMap::new()),
        }
    }

    /// Stop a running batch. Files already uploading finish; the rest are
    /// marked failed with "cancelled".
    pub async fn cancel(&self, message_id: &str) -> Result<()> {
        match self.cancel_tokens.lock().await.get(message_id) {
            Some(sender) => {
                let _ = sender.send(true);
                Ok(())
            }
            None => Err(SyncError::Upload(format!(
                "No running upload batch for message {}",
                message_id
            ))),
        }
    }

    /// Upload `files` onto `message`, which the server has already acknowledged.
    pub async fn run(
        &self,
        scope_id: &str,
        message: &Message,
        files: Vec<UploadFile>,
    ) -> UploadReport {
        let conversation_id = message.conversation_id.clone();
        let batch: Vec<(LocalId, UploadFile)> =
            files.into_iter().map(|f| (LocalId::new(), f)).collect();

        {
            let placeholders = batch
                .iter()
                .map(|(local_id, file)| Attachment::placeholder(*local_id, file))
                .collect();
            let mut timeline = self.timeline.write().await;
            timeline.attach_placeholders(message, placeholders);
        }
        self.notify(ChatEvent::TimelineChanged {
            conversation_id: conversation_id.clone(),
        });

        let (cancel_tx, cancel_rx) = watch::channel(false);
        self.cancel_tokens
            .lock()
            .await
            .insert(message.id.clone(), cancel_tx);

        let mut outcomes = Vec::with_capacity(batch.len());
        for (local_id, file) in batch {
            let file_name = file.name.clone();
            let result = if *cancel_rx.borrow() {
                Err(SyncError::Upload("cancelled".to_string()))
            } else {
                self.upload_one(scope_id, message, local_id, file).await
            };

            let outcome = match result {
                Ok(stored) => {
                    self.timeline.write().await.finalize_placeholder(
                        &conversation_id,
                        &message.id,
                        local_id,
                        stored.clone(),
                    );
                    self.signal_uploaded(&message.id).await;
                    UploadOutcome {
                        file_name,
                        local_id,
                        stored: Some(stored),
                        error: None,
                    }
                }
                Err(e) => {
                    log::warn!(
                        "Upload of {} for message {} failed: {}",
                        file_name,
                        message.id,
                        e
                    );
                    let reason = e.to_string();
                    self.timeline.write().await.fail_placeholder(
                        &conversation_id,
                        &message.id,
                        local_id,
                        &reason,
                    );
                    UploadOutcome {
                        file_name,
                        local_id,
                        stored: None,
                        error: Some(reason),
                    }
                }
            };
            outcomes.push(outcome);
            self.notify(ChatEvent::TimelineChanged {
                conversation_id: conversation_id.clone(),
            });
        }

        self.cancel_tokens.lock().await.remove(&message.id);

        let report = UploadReport {
            message_id: message.id.clone(),
            outcomes,
        };
        log::info!(
            "Upload batch for message {} finished: {} ok, {} failed",
            report.message_id,
            report.succeeded(),
            report.failed()
        );
        report
    }

    async fn upload_one(
        &self,
        scope_id: &str,
        message: &Message,
        local_id: LocalId,
        file: UploadFile,
    ) -> Result<StoredObject> {
        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
        let upload = self
            .store
            .upload(scope_id, MESSAGE_TARGET, &message.id, file, progress_tx);
        tokio::pin!(upload);

        loop {
            tokio::select! {
                biased;
                Some(pct) = progress_rx.recv() => {
                    self.apply_progress(message, local_id, pct).await;
                }
                result = &mut upload => {
                    // Progress sent right before completion is still applied in order.
                    while let Ok(pct) = progress_rx.try_recv() {
                        self.apply_progress(message, local_id, pct).await;
                    }
                    return result;
                }
            }
        }
    }

    async fn apply_progress(&self, message: &Message, local_id: LocalId, pct: u8) {
        let changed = self.timeline.write().await.update_placeholder_progress(
            &message.conversation_id,
            &message.id,
            local_id,
            pct,
        );
        if changed {
            self.notify(ChatEvent::AttachmentProgress {
                conversation_id: message.conversation_id.clone(),
                message_id: message.id.clone(),
                attachment_id: local_id.to_string(),
                progress: pct.min(100),
            });
        }
    }

    /// Ask the server to broadcast the canonical attachment list.
    async fn signal_uploaded(&self, message_id: &str) {
        match self.connection.current().await {
            Some(handle) => {
                if let Err(e) = handle.channel().attachment_uploaded(message_id).await {
                    log::warn!("Completion signal for message {} failed: {}", message_id, e);
                }
            }
            None => log::debug!(
                "Live channel down, no completion signal for message {}",
                message_id
            ),
        }
    }

    fn notify(&self, event: ChatEvent) {
        let _ = self.events.send(event);
    }
}
