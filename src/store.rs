//! Persistence seams consumed by the sync subsystem.
//!
//! Message upserts must be idempotent per message id: a sync that is
//! abandoned halfway and replayed later has to converge on the same rows.

mod database;
mod memory;

pub use database::Store;
pub use memory::MemoryStore;

use crate::{
    blocking::OffLoopError,
    model::{AccountId, HighWaterMark, MessageContent, MessageId, Subscription, SubscriptionId},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Database(#[from] duckdb::Error),
    #[error(transparent)]
    OffLoop(#[from] OffLoopError),
    #[error("store lock poisoned")]
    Poisoned,
    #[error("invalid stored value: {0}")]
    Corrupt(String),
}

/// Token set as it sits on disk: both tokens are ciphertext.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedCredential {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

#[async_trait]
pub trait CredentialBackend: Send + Sync {
    async fn load_credential(&self, account: &AccountId)
    -> Result<Option<EncryptedCredential>, StoreError>;

    /// Replaces whatever is stored for `account`.
    async fn save_credential(
        &self,
        account: &AccountId,
        credential: EncryptedCredential,
    ) -> Result<(), StoreError>;

    async fn delete_credential(&self, account: &AccountId) -> Result<(), StoreError>;
}

#[async_trait]
pub trait SyncStore: Send + Sync {
    async fn subscription(&self, id: &SubscriptionId) -> Result<Option<Subscription>, StoreError>;

    /// Internal date of a stored message, `None` when it is not stored.
    async fn stored_internal_date(
        &self,
        id: &MessageId,
    ) -> Result<Option<DateTime<Utc>>, StoreError>;

    /// Returns whether the message was not stored before.
    async fn upsert_message(
        &self,
        subscription: &SubscriptionId,
        message: MessageContent,
    ) -> Result<bool, StoreError>;

    async fn high_water_mark(
        &self,
        subscription: &SubscriptionId,
    ) -> Result<Option<HighWaterMark>, StoreError>;

    async fn set_high_water_mark(
        &self,
        subscription: &SubscriptionId,
        mark: HighWaterMark,
    ) -> Result<(), StoreError>;
}
