//! Encrypted OAuth token persistence with refresh-on-expiry.
//!
//! Tokens are decrypted only while a [`Credential`] is held in memory. Writes
//! go through one async mutex per account, so concurrent callers that all see
//! an expiring token share a single refresh round trip.

use crate::{
    crypto::{CryptoError, TokenCipher},
    model::AccountId,
    oauth::{AccessToken, OAuthTokens, RefreshError, RefreshToken, TokenRefresher},
    store::{CredentialBackend, EncryptedCredential, StoreError},
};
use chrono::{DateTime, Utc};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

pub const REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// Decrypted token set. Never persisted in this form.
#[derive(Debug, Clone)]
pub struct Credential {
    pub access_token: AccessToken,
    pub refresh_token: RefreshToken,
    pub expiry: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("no usable credential for {0}, sign-in required")]
    Unavailable(AccountId),
    #[error("credential refresh for {account} was rejected: {reason}")]
    RefreshFailed { account: AccountId, reason: String },
    #[error("credential refresh did not complete: {0}")]
    RefreshInterrupted(String),
    #[error(transparent)]
    Storage(#[from] StoreError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

pub struct CredentialStore {
    backend: Arc<dyn CredentialBackend>,
    refresher: Arc<dyn TokenRefresher>,
    cipher: TokenCipher,
    refresh_margin: Duration,
    refresh_locks: Mutex<HashMap<AccountId, Arc<tokio::sync::Mutex<()>>>>,
}

impl CredentialStore {
    pub fn new(
        backend: Arc<dyn CredentialBackend>,
        refresher: Arc<dyn TokenRefresher>,
        cipher: TokenCipher,
    ) -> Self {
        Self {
            backend,
            refresher,
            cipher,
            refresh_margin: REFRESH_MARGIN,
            refresh_locks: Mutex::default(),
        }
    }

    /// Returns a credential that will not expire within the refresh margin,
    /// refreshing it first when necessary.
    pub async fn get_valid_credential(
        &self,
        account: &AccountId,
    ) -> Result<Credential, CredentialError> {
        let credential = self
            .load(account)
            .await?
            .ok_or_else(|| CredentialError::Unavailable(account.clone()))?;
        if !self.needs_refresh(&credential) {
            return Ok(credential);
        }
        self.refresh(account, None).await
    }

    /// Refreshes even though the stored token looks valid, because the API
    /// just refused `rejected`. A concurrent caller that already replaced the
    /// rejected token satisfies the request without another round trip.
    pub async fn force_refresh(
        &self,
        account: &AccountId,
        rejected: &AccessToken,
    ) -> Result<Credential, CredentialError> {
        self.refresh(account, Some(rejected)).await
    }

    pub async fn store_credential(
        &self,
        account: &AccountId,
        tokens: OAuthTokens,
    ) -> Result<(), CredentialError> {
        let credential = Credential {
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
            expiry: tokens.expires_at,
        };
        self.persist(account, &credential).await?;
        tracing::info!(%account, expiry = %credential.expiry, "credential stored");
        Ok(())
    }

    pub async fn clear_credential(&self, account: &AccountId) -> Result<(), CredentialError> {
        self.backend.delete_credential(account).await?;
        tracing::info!(%account, "credential cleared");
        Ok(())
    }

    fn needs_refresh(&self, credential: &Credential) -> bool {
        credential.expiry <= Utc::now() + self.refresh_margin
    }

    fn refresh_lock(&self, account: &AccountId) -> Arc<tokio::sync::Mutex<()>> {
        self.refresh_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(account.clone())
            .or_default()
            .clone()
    }

    async fn refresh(
        &self,
        account: &AccountId,
        rejected: Option<&AccessToken>,
    ) -> Result<Credential, CredentialError> {
        let lock = self.refresh_lock(account);
        let _guard = lock.lock().await;

        // whoever held the lock before us may have done the work already
        let current = self
            .load(account)
            .await?
            .ok_or_else(|| CredentialError::Unavailable(account.clone()))?;
        let superseded = rejected.is_none_or(|token| *token != current.access_token);
        if superseded && !self.needs_refresh(&current) {
            tracing::debug!(%account, "credential refreshed concurrently");
            return Ok(current);
        }

        tracing::debug!(%account, forced = rejected.is_some(), "refreshing access token");
        match self.refresher.refresh(&current.refresh_token).await {
            Ok(refreshed) => {
                let credential = Credential {
                    access_token: refreshed.access_token,
                    refresh_token: refreshed.refresh_token.unwrap_or(current.refresh_token),
                    expiry: refreshed.expires_at,
                };
                self.persist(account, &credential).await?;
                tracing::info!(%account, expiry = %credential.expiry, "access token refreshed");
                Ok(credential)
            }
            Err(RefreshError::Rejected(reason)) => {
                tracing::warn!(%account, %reason, "refresh rejected, purging credential");
                self.backend.delete_credential(account).await?;
                Err(CredentialError::RefreshFailed {
                    account: account.clone(),
                    reason,
                })
            }
            Err(RefreshError::Transient(reason)) => {
                tracing::warn!(%account, %reason, "refresh interrupted, credential kept");
                Err(CredentialError::RefreshInterrupted(reason))
            }
        }
    }

    async fn load(&self, account: &AccountId) -> Result<Option<Credential>, CredentialError> {
        let Some(stored) = self.backend.load_credential(account).await? else {
            return Ok(None);
        };
        let decrypted = self.cipher.decrypt(&stored.access_token).and_then(|access| {
            let refresh = self.cipher.decrypt(&stored.refresh_token)?;
            Ok((access, refresh))
        });
        match decrypted {
            Ok((access, refresh)) => Ok(Some(Credential {
                access_token: access.into(),
                refresh_token: refresh.into(),
                expiry: stored.expires_at,
            })),
            // most likely the encryption key changed; the row is useless now
            Err(err) => {
                tracing::warn!(%account, error = %err, "stored credential unreadable, purging");
                self.backend.delete_credential(account).await?;
                Ok(None)
            }
        }
    }

    async fn persist(
        &self,
        account: &AccountId,
        credential: &Credential,
    ) -> Result<(), CredentialError> {
        let encrypted = EncryptedCredential {
            access_token: self.cipher.encrypt(credential.access_token.as_str())?,
            refresh_token: self.cipher.encrypt(credential.refresh_token.as_str())?,
            expires_at: credential.expiry,
        };
        self.backend.save_credential(account, encrypted).await?;
        Ok(())
    }
}
