use crate::{
    blocking::{OffLoopError, off_loop},
    credentials::{CredentialError, CredentialStore},
    http::{GenericClient, HttpError, payload::GoogleError},
    model::{
        AccountId, FullMessage, LabelId, LabelList, MessageContent, MessageId, MessagePage,
        MinimalLabel, MinimalMessage, PageToken,
    },
    oauth::AccessToken,
};
use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use std::{
    sync::{Arc, LazyLock},
    time::Duration,
};

static BASE_URL: LazyLock<Url> =
    LazyLock::new(|| Url::parse("https://gmail.googleapis.com/gmail/v1").expect("valid url"));

const PAGE_SIZE: &str = "50";

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error(transparent)]
    Credential(#[from] CredentialError),
    #[error("transient gmail failure: {0}")]
    Retryable(String),
    #[error("gmail request failed: {0}")]
    Fatal(String),
}

impl From<HttpError> for GatewayError {
    fn from(err: HttpError) -> Self {
        if err.is_transient() {
            GatewayError::Retryable(err.to_string())
        } else {
            GatewayError::Fatal(err.to_string())
        }
    }
}

impl From<OffLoopError> for GatewayError {
    fn from(err: OffLoopError) -> Self {
        GatewayError::Fatal(err.to_string())
    }
}

/// Read access to one mailbox. Implementations are not required to be safe
/// for concurrent use against the same account; the fetch queue guarantees
/// they never are.
#[async_trait]
pub trait MailSource: Send + Sync {
    async fn list_messages(
        &self,
        label: &LabelId,
        query: Option<&str>,
        page_token: Option<&PageToken>,
    ) -> Result<MessagePage, GatewayError>;

    async fn get_message(&self, id: &MessageId) -> Result<MessageContent, GatewayError>;
}

#[derive(Clone)]
pub struct GmailGateway {
    inner: Arc<GmailGatewayInner>,
}

struct GmailGatewayInner {
    http_client: GenericClient<GoogleError>,
    credentials: Arc<CredentialStore>,
    account: AccountId,
}

impl GmailGateway {
    pub fn new(credentials: Arc<CredentialStore>, account: AccountId, timeout: Duration) -> Self {
        Self::with_base_url(credentials, account, BASE_URL.clone(), timeout)
    }

    pub fn with_base_url(
        credentials: Arc<CredentialStore>,
        account: AccountId,
        base_url: Url,
        timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(GmailGatewayInner {
                http_client: GenericClient::builder(base_url).timeout(timeout).build(),
                credentials,
                account,
            }),
        }
    }

    /// Runs `call` with a fresh access token. The credential is fetched per
    /// call, never cached here. A 401 earns exactly one forced refresh and
    /// one retry.
    async fn authorized<T, F, Fut>(&self, call: F) -> Result<T, GatewayError>
    where
        F: Fn(AccessToken) -> Fut,
        Fut: Future<Output = Result<T, HttpError>>,
    {
        let GmailGatewayInner {
            credentials,
            account,
            ..
        } = &*self.inner;

        let credential = credentials.get_valid_credential(account).await?;
        match call(credential.access_token.clone()).await {
            Err(err) if err.status() == Some(StatusCode::UNAUTHORIZED) => {
                tracing::debug!(%account, "access token rejected by gmail, forcing refresh");
                let credential = credentials
                    .force_refresh(account, &credential.access_token)
                    .await?;
                Ok(call(credential.access_token).await?)
            }
            result => Ok(result?),
        }
    }

    pub async fn list_labels(&self) -> Result<Vec<MinimalLabel>, GatewayError> {
        let http_client = &self.inner.http_client;
        let list: LabelList = self
            .authorized(|token| async move {
                http_client
                    .request(&["users", "me", "labels"])
                    .access_token(&token)
                    .send()
                    .await
            })
            .await?;
        Ok(list.labels)
    }
}

#[async_trait]
impl MailSource for GmailGateway {
    async fn list_messages(
        &self,
        label: &LabelId,
        query: Option<&str>,
        page_token: Option<&PageToken>,
    ) -> Result<MessagePage, GatewayError> {
        let mut params = vec![("labelIds", label.as_str()), ("maxResults", PAGE_SIZE)];
        if let Some(query) = query {
            params.push(("q", query));
        }
        if let Some(token) = page_token {
            params.push(("pageToken", token.as_str()));
        }

        let http_client = &self.inner.http_client;
        let params = &params;
        self.authorized(|token| async move {
            http_client
                .request(&["users", "me", "messages"])
                .access_token(&token)
                .query(params)
                .send()
                .await
        })
        .await
    }

    async fn get_message(&self, id: &MessageId) -> Result<MessageContent, GatewayError> {
        let http_client = &self.inner.http_client;
        let raw: serde_json::Value = self
            .authorized(|token| async move {
                http_client
                    .request(&["users", "me", "messages", id.as_str()])
                    .access_token(&token)
                    .query(&[("format", "full")])
                    .send()
                    .await
            })
            .await?;

        // base64 bodies and the MIME walk can be large; keep them off the loop
        off_loop(move || {
            serde_json::from_value::<FullMessage>(raw)
                .map(MessageContent::from)
                .map_err(|err| GatewayError::Fatal(format!("malformed message: {err}")))
        })
        .await?
    }
}

/// Lazy cursor over the message ids of a label. A failed page leaves the
/// cursor where it was, so calling [`Pages::next_page`] again retries it, and
/// a saved [`Pages::page_token`] can seed a new cursor later.
pub struct Pages<'a> {
    source: &'a dyn MailSource,
    label: &'a LabelId,
    query: Option<&'a str>,
    next: Option<PageToken>,
    exhausted: bool,
}

impl<'a> Pages<'a> {
    pub fn new(source: &'a dyn MailSource, label: &'a LabelId, query: Option<&'a str>) -> Self {
        Self {
            source,
            label,
            query,
            next: None,
            exhausted: false,
        }
    }

    pub fn resume_from(mut self, token: PageToken) -> Self {
        self.next = Some(token);
        self
    }

    pub fn page_token(&self) -> Option<&PageToken> {
        self.next.as_ref()
    }

    pub async fn next_page(&mut self) -> Option<Result<Vec<MinimalMessage>, GatewayError>> {
        if self.exhausted {
            return None;
        }
        let page = match self
            .source
            .list_messages(self.label, self.query, self.next.as_ref())
            .await
        {
            Ok(page) => page,
            Err(err) => return Some(Err(err)),
        };
        self.exhausted = page.next_page_token.is_none();
        self.next = page.next_page_token;
        Some(Ok(page.messages))
    }
}
