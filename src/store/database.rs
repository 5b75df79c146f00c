use super::{CredentialBackend, EncryptedCredential, StoreError, SyncStore};
use crate::{
    blocking::off_loop,
    model::{
        AccountId, HighWaterMark, LabelId, MessageContent, MessageId, Subscription, SubscriptionId,
    },
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use duckdb::{Connection, params};
use std::{
    path::Path,
    sync::{Arc, Mutex},
    time::Duration,
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS credentials (
    account VARCHAR PRIMARY KEY,
    access_token VARCHAR NOT NULL,
    refresh_token VARCHAR NOT NULL,
    expires_at BIGINT NOT NULL
);
CREATE TABLE IF NOT EXISTS subscriptions (
    id VARCHAR PRIMARY KEY,
    label_id VARCHAR NOT NULL,
    interval_secs BIGINT NOT NULL,
    high_water_mark BIGINT
);
CREATE TABLE IF NOT EXISTS messages (
    id VARCHAR PRIMARY KEY,
    subscription_id VARCHAR NOT NULL,
    thread_id VARCHAR NOT NULL,
    subject VARCHAR NOT NULL,
    sender_name VARCHAR,
    sender_email VARCHAR NOT NULL,
    received_at BIGINT NOT NULL,
    internal_date BIGINT NOT NULL,
    snippet VARCHAR NOT NULL,
    body_text VARCHAR,
    body_html VARCHAR,
    size_bytes BIGINT NOT NULL
);
";

/// DuckDB-backed storage. Every statement runs on the blocking pool.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        off_loop(move || {
            let guard = conn.lock().map_err(|_| StoreError::Poisoned)?;
            f(&guard)
        })
        .await?
    }

    /// Registers a subscription, or updates label and interval of an
    /// existing one without touching its high-water mark.
    pub async fn add_subscription(&self, subscription: Subscription) -> Result<(), StoreError> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO subscriptions (id, label_id, interval_secs) VALUES (?, ?, ?)
                 ON CONFLICT (id) DO UPDATE SET
                    label_id = excluded.label_id,
                    interval_secs = excluded.interval_secs",
                params![
                    subscription.id.as_str(),
                    subscription.label_id.as_str(),
                    secs_to_i64(subscription.interval)?,
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn remove_subscription(&self, id: &SubscriptionId) -> Result<bool, StoreError> {
        let id = id.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM messages WHERE subscription_id = ?",
                params![id.as_str()],
            )?;
            let removed = conn.execute("DELETE FROM subscriptions WHERE id = ?", params![id.as_str()])?;
            Ok(removed > 0)
        })
        .await
    }

    pub async fn subscriptions(&self) -> Result<Vec<Subscription>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT id, label_id, interval_secs FROM subscriptions ORDER BY id")?;
            let mut rows = stmt.query(params![])?;
            let mut subscriptions = Vec::new();
            while let Some(row) = rows.next()? {
                subscriptions.push(Subscription {
                    id: SubscriptionId::from(row.get::<_, String>(0)?),
                    label_id: LabelId::from(row.get::<_, String>(1)?),
                    interval: secs_from_i64(row.get(2)?)?,
                });
            }
            Ok(subscriptions)
        })
        .await
    }

    pub async fn message_count(&self, subscription: &SubscriptionId) -> Result<usize, StoreError> {
        let id = subscription.clone();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare("SELECT count(*) FROM messages WHERE subscription_id = ?")?;
            let mut rows = stmt.query(params![id.as_str()])?;
            let count: i64 = match rows.next()? {
                Some(row) => row.get(0)?,
                None => 0,
            };
            usize::try_from(count).map_err(|err| StoreError::Corrupt(err.to_string()))
        })
        .await
    }
}

fn secs_to_i64(interval: Duration) -> Result<i64, StoreError> {
    i64::try_from(interval.as_secs()).map_err(|err| StoreError::Corrupt(err.to_string()))
}

fn secs_from_i64(secs: i64) -> Result<Duration, StoreError> {
    u64::try_from(secs)
        .map(Duration::from_secs)
        .map_err(|err| StoreError::Corrupt(format!("interval {secs}: {err}")))
}

fn datetime_from_millis(millis: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp {millis} out of range")))
}

#[async_trait]
impl CredentialBackend for Store {
    async fn load_credential(
        &self,
        account: &AccountId,
    ) -> Result<Option<EncryptedCredential>, StoreError> {
        let account = account.clone();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT access_token, refresh_token, expires_at FROM credentials WHERE account = ?",
            )?;
            let mut rows = stmt.query(params![account.as_str()])?;
            let Some(row) = rows.next()? else {
                return Ok(None);
            };
            Ok(Some(EncryptedCredential {
                access_token: row.get(0)?,
                refresh_token: row.get(1)?,
                expires_at: datetime_from_millis(row.get(2)?)?,
            }))
        })
        .await
    }

    async fn save_credential(
        &self,
        account: &AccountId,
        credential: EncryptedCredential,
    ) -> Result<(), StoreError> {
        let account = account.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO credentials (account, access_token, refresh_token, expires_at)
                 VALUES (?, ?, ?, ?)",
                params![
                    account.as_str(),
                    credential.access_token.as_str(),
                    credential.refresh_token.as_str(),
                    credential.expires_at.timestamp_millis(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn delete_credential(&self, account: &AccountId) -> Result<(), StoreError> {
        let account = account.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM credentials WHERE account = ?",
                params![account.as_str()],
            )?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl SyncStore for Store {
    async fn subscription(&self, id: &SubscriptionId) -> Result<Option<Subscription>, StoreError> {
        let id = id.clone();
        self.with_conn(move |conn| {
            let mut stmt =
                conn.prepare("SELECT label_id, interval_secs FROM subscriptions WHERE id = ?")?;
            let mut rows = stmt.query(params![id.as_str()])?;
            let Some(row) = rows.next()? else {
                return Ok(None);
            };
            Ok(Some(Subscription {
                label_id: LabelId::from(row.get::<_, String>(0)?),
                interval: secs_from_i64(row.get(1)?)?,
                id,
            }))
        })
        .await
    }

    async fn stored_internal_date(
        &self,
        id: &MessageId,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let id = id.clone();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare("SELECT internal_date FROM messages WHERE id = ?")?;
            let mut rows = stmt.query(params![id.as_str()])?;
            let Some(row) = rows.next()? else {
                return Ok(None);
            };
            datetime_from_millis(row.get(0)?).map(Some)
        })
        .await
    }

    async fn upsert_message(
        &self,
        subscription: &SubscriptionId,
        message: MessageContent,
    ) -> Result<bool, StoreError> {
        let subscription = subscription.clone();
        self.with_conn(move |conn| {
            let existed = {
                let mut stmt = conn.prepare("SELECT 1 FROM messages WHERE id = ?")?;
                let mut rows = stmt.query(params![message.id.as_str()])?;
                rows.next()?.is_some()
            };
            conn.execute(
                "INSERT OR REPLACE INTO messages (
                    id, subscription_id, thread_id, subject, sender_name, sender_email,
                    received_at, internal_date, snippet, body_text, body_html, size_bytes
                 ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    message.id.as_str(),
                    subscription.as_str(),
                    message.thread_id.as_str(),
                    message.subject.as_str(),
                    message.sender_name.as_deref(),
                    message.sender_email.as_str(),
                    message.received_at.timestamp_millis(),
                    message.internal_date.timestamp_millis(),
                    message.snippet.as_str(),
                    message.body_text.as_deref(),
                    message.body_html.as_deref(),
                    i64::try_from(message.size_bytes).unwrap_or(i64::MAX),
                ],
            )?;
            Ok(!existed)
        })
        .await
    }

    async fn high_water_mark(
        &self,
        subscription: &SubscriptionId,
    ) -> Result<Option<HighWaterMark>, StoreError> {
        let id = subscription.clone();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare("SELECT high_water_mark FROM subscriptions WHERE id = ?")?;
            let mut rows = stmt.query(params![id.as_str()])?;
            let Some(row) = rows.next()? else {
                return Ok(None);
            };
            row.get::<_, Option<i64>>(0)?
                .map(|millis| datetime_from_millis(millis).map(HighWaterMark))
                .transpose()
        })
        .await
    }

    async fn set_high_water_mark(
        &self,
        subscription: &SubscriptionId,
        mark: HighWaterMark,
    ) -> Result<(), StoreError> {
        let id = subscription.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE subscriptions SET high_water_mark = ? WHERE id = ?",
                params![mark.0.timestamp_millis(), id.as_str()],
            )?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ThreadId;

    fn subscription(id: &str, label: &str) -> Subscription {
        Subscription {
            id: id.into(),
            label_id: label.into(),
            interval: Duration::from_secs(3600),
        }
    }

    fn message(id: &str, subject: &str) -> MessageContent {
        MessageContent {
            id: MessageId::from(id),
            thread_id: ThreadId::from("t"),
            subject: subject.into(),
            sender_name: None,
            sender_email: "news@example.com".into(),
            received_at: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
            internal_date: DateTime::from_timestamp(1_700_000_007, 0).unwrap(),
            snippet: String::new(),
            body_text: Some("body".into()),
            body_html: None,
            size_bytes: 10,
        }
    }

    #[tokio::test]
    async fn persists_subscriptions_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.db");
        {
            let store = Store::open(&path).unwrap();
            store.add_subscription(subscription("rust", "Label_1")).await.unwrap();
            store.add_subscription(subscription("go", "Label_2")).await.unwrap();
        }

        let store = Store::open(&path).unwrap();
        let ids: Vec<_> = store
            .subscriptions()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.id.to_string())
            .collect();
        assert_eq!(ids, ["go", "rust"]);

        let rust = store.subscription(&"rust".into()).await.unwrap().unwrap();
        assert_eq!(rust.label_id.as_str(), "Label_1");
        assert_eq!(rust.interval, Duration::from_secs(3600));
    }

    #[tokio::test]
    async fn upsert_reports_new_rows_once() {
        let store = Store::open_in_memory().unwrap();
        let sub = SubscriptionId::from("rust");
        store.add_subscription(subscription("rust", "Label_1")).await.unwrap();

        assert!(store.upsert_message(&sub, message("m1", "first")).await.unwrap());
        assert!(!store.upsert_message(&sub, message("m1", "edited")).await.unwrap());
        let stored = store.stored_internal_date(&"m1".into()).await.unwrap();
        assert_eq!(stored.map(|date| date.timestamp()), Some(1_700_000_007));
        assert_eq!(store.message_count(&sub).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn high_water_mark_round_trips_and_survives_relabel() {
        let store = Store::open_in_memory().unwrap();
        let sub = SubscriptionId::from("rust");
        store.add_subscription(subscription("rust", "Label_1")).await.unwrap();
        assert_eq!(store.high_water_mark(&sub).await.unwrap(), None);

        let mark = HighWaterMark(DateTime::from_timestamp_millis(1_700_000_000_123).unwrap());
        store.set_high_water_mark(&sub, mark).await.unwrap();
        store.add_subscription(subscription("rust", "Label_9")).await.unwrap();
        assert_eq!(store.high_water_mark(&sub).await.unwrap(), Some(mark));
    }

    #[tokio::test]
    async fn credential_rows_are_replaced_and_deleted() {
        let store = Store::open_in_memory().unwrap();
        let account = AccountId::from("me");
        let credential = |access: &str| EncryptedCredential {
            access_token: access.into(),
            refresh_token: "r".into(),
            expires_at: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
        };

        store.save_credential(&account, credential("a")).await.unwrap();
        store.save_credential(&account, credential("b")).await.unwrap();
        assert_eq!(
            store.load_credential(&account).await.unwrap(),
            Some(credential("b"))
        );

        store.delete_credential(&account).await.unwrap();
        assert_eq!(store.load_credential(&account).await.unwrap(), None);
    }

    #[tokio::test]
    async fn removing_a_subscription_drops_its_messages() {
        let store = Store::open_in_memory().unwrap();
        let sub = SubscriptionId::from("rust");
        store.add_subscription(subscription("rust", "Label_1")).await.unwrap();
        store.upsert_message(&sub, message("m1", "x")).await.unwrap();

        assert!(store.remove_subscription(&sub).await.unwrap());
        assert!(!store.remove_subscription(&sub).await.unwrap());
        assert_eq!(store.stored_internal_date(&"m1".into()).await.unwrap(), None);
    }
}
