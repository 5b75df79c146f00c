//! Wiring of the whole subsystem. Nothing in here is global: every component
//! is built by [`App`] and lives exactly as long as it does.

use crate::{
    config::Config,
    credentials::{CredentialError, CredentialStore},
    crypto::TokenCipher,
    gateway::{GatewayError, GmailGateway},
    model::{LabelId, MinimalLabel, Subscription, SubscriptionId},
    oauth::{ClientCredentials, OAuthTokens, TokenRefresher, client::OAuthClient},
    queue::{FetchQueue, Priority, QueueError, SyncResult, TaskId},
    scheduler::{self, Scheduler},
    store::Store,
    sync::GmailSync,
};
use bon::bon;
use reqwest::Url;
use std::{sync::Arc, time::Duration};
use tokio::sync::broadcast;

const RESULT_BACKLOG: usize = 64;

pub struct App {
    config: Config,
    store: Store,
    credentials: Arc<CredentialStore>,
    gateway: GmailGateway,
    queue: FetchQueue,
    scheduler: Scheduler,
    results: broadcast::Sender<SyncResult>,
}

#[bon]
impl App {
    #[builder]
    pub fn new(
        config: Config,
        store: Store,
        refresher: Arc<dyn TokenRefresher>,
        gmail_base_url: Option<Url>,
    ) -> eyre::Result<Self> {
        let cipher = TokenCipher::new(&config.encryption_key)?;
        let credentials = Arc::new(CredentialStore::new(
            Arc::new(store.clone()),
            refresher,
            cipher,
        ));
        let gateway = match gmail_base_url {
            Some(base_url) => GmailGateway::with_base_url(
                credentials.clone(),
                config.account.clone(),
                base_url,
                config.request_timeout,
            ),
            None => GmailGateway::new(
                credentials.clone(),
                config.account.clone(),
                config.request_timeout,
            ),
        };

        let sync = GmailSync::new(Arc::new(gateway.clone()), Arc::new(store.clone()));
        let (results, _) = broadcast::channel(RESULT_BACKLOG);
        let queue = FetchQueue::new(
            config.queue.clone(),
            Arc::new(sync),
            Arc::new(results.clone()),
        );
        let scheduler = Scheduler::new(Arc::new(queue.clone()));

        Ok(Self {
            config,
            store,
            credentials,
            gateway,
            queue,
            scheduler,
            results,
        })
    }
}

impl App {
    /// Opens the database and the Google client secrets named in `config`.
    pub fn open(config: Config) -> eyre::Result<Self> {
        let store = Store::open(&config.db)?;
        let creds = ClientCredentials::load_from_file(&config.secrets_file)?;
        let refresher = Arc::new(OAuthClient::new(creds, config.request_timeout));
        App::builder()
            .config(config)
            .store(store)
            .refresher(refresher)
            .build()
    }

    pub fn queue(&self) -> &FetchQueue {
        &self.queue
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Every [`SyncResult`] produced after this call.
    pub fn results(&self) -> broadcast::Receiver<SyncResult> {
        self.results.subscribe()
    }

    /// Schedules every stored subscription and starts the queue worker.
    pub async fn start(&self) -> eyre::Result<()> {
        let subscriptions = self.store.subscriptions().await?;
        for subscription in &subscriptions {
            self.scheduler
                .schedule(&subscription.id, subscription.interval)?;
        }
        self.queue.start();
        tracing::info!(subscriptions = subscriptions.len(), "sync started");
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.scheduler.shutdown();
        self.queue.shutdown().await;
    }

    pub fn refresh(
        &self,
        subscription: &SubscriptionId,
        priority: Priority,
    ) -> Result<TaskId, QueueError> {
        self.queue.enqueue(subscription, priority)
    }

    /// Queues every stored subscription at LOW priority.
    pub async fn refresh_all(&self) -> eyre::Result<Vec<TaskId>> {
        let ids: Vec<SubscriptionId> = self
            .store
            .subscriptions()
            .await?
            .into_iter()
            .map(|subscription| subscription.id)
            .collect();
        Ok(self.queue.enqueue_all(&ids, Priority::Low)?)
    }

    pub async fn subscriptions(&self) -> eyre::Result<Vec<Subscription>> {
        Ok(self.store.subscriptions().await?)
    }

    /// Adds or updates a subscription. A running app picks up the new
    /// interval right away.
    pub async fn subscribe(
        &self,
        id: SubscriptionId,
        label_id: LabelId,
        interval: Option<Duration>,
    ) -> eyre::Result<Subscription> {
        let subscription = Subscription {
            id,
            label_id,
            interval: interval.unwrap_or(self.config.default_fetch_interval),
        };
        scheduler::check_interval(&subscription.id, subscription.interval)?;
        self.store.add_subscription(subscription.clone()).await?;
        if self.queue.is_running() {
            self.scheduler
                .reschedule(&subscription.id, subscription.interval)?;
        }
        tracing::info!(subscription = %subscription.id, label = %subscription.label_id, "subscribed");
        Ok(subscription)
    }

    /// Stops scheduling, drops waiting fetches and deletes stored messages.
    pub async fn unsubscribe(&self, id: &SubscriptionId) -> eyre::Result<bool> {
        self.scheduler.unschedule(id);
        for task in self.queue.pending() {
            if &task.subscription_id == id {
                self.queue.cancel(task.id);
            }
        }
        let removed = self.store.remove_subscription(id).await?;
        if removed {
            tracing::info!(subscription = %id, "unsubscribed");
        }
        Ok(removed)
    }

    pub async fn labels(&self) -> Result<Vec<MinimalLabel>, GatewayError> {
        self.gateway.list_labels().await
    }

    pub async fn import_tokens(&self, tokens: OAuthTokens) -> Result<(), CredentialError> {
        self.credentials
            .store_credential(&self.config.account, tokens)
            .await
    }

    pub async fn sign_out(&self) -> Result<(), CredentialError> {
        self.credentials.clear_credential(&self.config.account).await
    }
}
