//! In-process storage, used by tests and as a scratch backend.

use super::{CredentialBackend, EncryptedCredential, StoreError, SyncStore};
use crate::model::{
    AccountId, HighWaterMark, MessageContent, MessageId, Subscription, SubscriptionId,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{
    collections::{BTreeMap, HashMap},
    sync::{Mutex, MutexGuard},
};

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    subscriptions: HashMap<SubscriptionId, Subscription>,
    messages: BTreeMap<MessageId, (SubscriptionId, MessageContent)>,
    high_water_marks: HashMap<SubscriptionId, HighWaterMark>,
    credentials: HashMap<AccountId, EncryptedCredential>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        self.inner.lock().map_err(|_| StoreError::Poisoned)
    }

    pub fn add_subscription(&self, subscription: Subscription) -> Result<(), StoreError> {
        self.lock()?
            .subscriptions
            .insert(subscription.id.clone(), subscription);
        Ok(())
    }

    /// Stored messages of one subscription, ordered by id.
    pub fn messages(&self, subscription: &SubscriptionId) -> Result<Vec<MessageContent>, StoreError> {
        Ok(self
            .lock()?
            .messages
            .values()
            .filter(|(owner, _)| owner == subscription)
            .map(|(_, message)| message.clone())
            .collect())
    }
}

#[async_trait]
impl CredentialBackend for MemoryStore {
    async fn load_credential(
        &self,
        account: &AccountId,
    ) -> Result<Option<EncryptedCredential>, StoreError> {
        Ok(self.lock()?.credentials.get(account).cloned())
    }

    async fn save_credential(
        &self,
        account: &AccountId,
        credential: EncryptedCredential,
    ) -> Result<(), StoreError> {
        self.lock()?.credentials.insert(account.clone(), credential);
        Ok(())
    }

    async fn delete_credential(&self, account: &AccountId) -> Result<(), StoreError> {
        self.lock()?.credentials.remove(account);
        Ok(())
    }
}

#[async_trait]
impl SyncStore for MemoryStore {
    async fn subscription(&self, id: &SubscriptionId) -> Result<Option<Subscription>, StoreError> {
        Ok(self.lock()?.subscriptions.get(id).cloned())
    }

    async fn stored_internal_date(
        &self,
        id: &MessageId,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self
            .lock()?
            .messages
            .get(id)
            .map(|(_, message)| message.internal_date))
    }

    async fn upsert_message(
        &self,
        subscription: &SubscriptionId,
        message: MessageContent,
    ) -> Result<bool, StoreError> {
        let previous = self
            .lock()?
            .messages
            .insert(message.id.clone(), (subscription.clone(), message));
        Ok(previous.is_none())
    }

    async fn high_water_mark(
        &self,
        subscription: &SubscriptionId,
    ) -> Result<Option<HighWaterMark>, StoreError> {
        Ok(self.lock()?.high_water_marks.get(subscription).copied())
    }

    async fn set_high_water_mark(
        &self,
        subscription: &SubscriptionId,
        mark: HighWaterMark,
    ) -> Result<(), StoreError> {
        self.lock()?
            .high_water_marks
            .insert(subscription.clone(), mark);
        Ok(())
    }
}
