//! One sync pass for one subscription: list what is new since the high-water
//! mark, fetch it, store it.

use crate::{
    credentials::CredentialError,
    gateway::{GatewayError, MailSource, Pages},
    model::{HighWaterMark, PageToken, SubscriptionId},
    store::{StoreError, SyncStore},
};
use async_trait::async_trait;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

// long label backfills must not starve the scheduler timers
const YIELD_EVERY: usize = 5;

/// Outward error taxonomy. Everything below the queue is classified into
/// one of these before the queue sees it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    #[error("sign-in required: {0}")]
    CredentialUnavailable(String),
    #[error("sign-in required, refresh was rejected: {0}")]
    CredentialRefreshFailed(String),
    #[error("temporary failure: {0}")]
    Retryable(String),
    #[error("{0}")]
    Fatal(String),
}

impl SyncError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Retryable(_))
    }

    /// Whether the user has to sign in again before anything can succeed.
    pub fn requires_sign_in(&self) -> bool {
        matches!(
            self,
            SyncError::CredentialUnavailable(_) | SyncError::CredentialRefreshFailed(_)
        )
    }
}

impl From<CredentialError> for SyncError {
    fn from(err: CredentialError) -> Self {
        match err {
            CredentialError::Unavailable(account) => {
                SyncError::CredentialUnavailable(account.to_string())
            }
            CredentialError::RefreshFailed { reason, .. } => {
                SyncError::CredentialRefreshFailed(reason)
            }
            CredentialError::RefreshInterrupted(reason) => SyncError::Retryable(reason),
            err @ (CredentialError::Storage(_) | CredentialError::Crypto(_)) => {
                SyncError::Fatal(err.to_string())
            }
        }
    }
}

impl From<GatewayError> for SyncError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Credential(err) => err.into(),
            GatewayError::Retryable(reason) => SyncError::Retryable(reason),
            GatewayError::Fatal(reason) => SyncError::Fatal(reason),
        }
    }
}

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        SyncError::Fatal(format!("storage: {err}"))
    }
}

/// The work the fetch queue runs for a task. Returns the number of messages
/// that were not stored before.
#[async_trait]
pub trait SyncJob: Send + Sync {
    async fn run(&self, subscription: &SubscriptionId) -> Result<usize, SyncError>;
}

pub struct GmailSync {
    source: Arc<dyn MailSource>,
    store: Arc<dyn SyncStore>,
    checkpoints: Mutex<HashMap<SubscriptionId, Checkpoint>>,
}

/// Where a listing stopped after a retryable failure. Every page before
/// `page` is stored, so the retry picks up from there.
struct Checkpoint {
    query: Option<String>,
    page: PageToken,
    newest: Option<HighWaterMark>,
}

#[derive(Default)]
struct Progress {
    newest: Option<HighWaterMark>,
    new_messages: usize,
    seen: usize,
    /// Token of the page being worked on, `None` on the first page.
    page: Option<PageToken>,
}

impl GmailSync {
    pub fn new(source: Arc<dyn MailSource>, store: Arc<dyn SyncStore>) -> Self {
        Self {
            source,
            store,
            checkpoints: Mutex::default(),
        }
    }

    fn checkpoints(&self) -> MutexGuard<'_, HashMap<SubscriptionId, Checkpoint>> {
        self.checkpoints.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn list_and_store(
        &self,
        id: &SubscriptionId,
        pages: &mut Pages<'_>,
        progress: &mut Progress,
    ) -> Result<(), SyncError> {
        loop {
            progress.page = pages.page_token().cloned();
            let Some(page) = pages.next_page().await else {
                return Ok(());
            };
            for listed in page? {
                progress.seen += 1;
                if progress.seen % YIELD_EVERY == 0 {
                    tokio::task::yield_now().await;
                }
                let internal_date = match self.store.stored_internal_date(&listed.id).await? {
                    Some(date) => date,
                    None => {
                        let message = self.source.get_message(&listed.id).await?;
                        let date = message.internal_date;
                        if self.store.upsert_message(id, message).await? {
                            progress.new_messages += 1;
                        }
                        date
                    }
                };
                progress.newest = progress.newest.max(Some(HighWaterMark(internal_date)));
            }
        }
    }
}

#[async_trait]
impl SyncJob for GmailSync {
    async fn run(&self, id: &SubscriptionId) -> Result<usize, SyncError> {
        let subscription = self
            .store
            .subscription(id)
            .await?
            .ok_or_else(|| SyncError::Fatal(format!("unknown subscription {id}")))?;
        let mark = self.store.high_water_mark(id).await?;
        let query = mark.map(|mark| mark.search_query());
        tracing::debug!(subscription = %id, label = %subscription.label_id, ?query, "syncing");

        let mut pages = Pages::new(self.source.as_ref(), &subscription.label_id, query.as_deref());
        let mut progress = Progress {
            newest: mark,
            ..Default::default()
        };
        let checkpoint = self
            .checkpoints()
            .remove(id)
            .filter(|checkpoint| checkpoint.query == query);
        if let Some(checkpoint) = checkpoint {
            tracing::debug!(subscription = %id, page = checkpoint.page.as_str(), "resuming listing");
            progress.newest = progress.newest.max(checkpoint.newest);
            pages = pages.resume_from(checkpoint.page);
        }

        if let Err(err) = self.list_and_store(id, &mut pages, &mut progress).await {
            if let Some(page) = progress.page.filter(|_| err.is_retryable()) {
                self.checkpoints().insert(
                    id.clone(),
                    Checkpoint {
                        query,
                        page,
                        newest: progress.newest,
                    },
                );
            }
            return Err(err);
        }

        // only after the whole listing went through, otherwise older unsynced
        // mail would end up below the mark
        if let Some(newest) = progress.newest.filter(|newest| Some(*newest) > mark) {
            self.store.set_high_water_mark(id, newest).await?;
        }
        tracing::debug!(
            subscription = %id,
            seen = progress.seen,
            new_messages = progress.new_messages,
            "sync pass done"
        );
        Ok(progress.new_messages)
    }
}
