use crate::oauth::AccessToken;
use bon::bon;
use core::fmt;
use reqwest::{Method, Request, StatusCode, Url};
use serde::de::DeserializeOwned;
use std::{marker::PhantomData, time::Duration};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

pub mod payload {
    use serde::Deserialize;

    /// Error envelope of the Gmail REST API.
    #[derive(Debug, Deserialize)]
    pub struct GoogleError {
        pub error: ErrorDetails,
    }

    #[derive(Debug, Deserialize)]
    pub struct ErrorDetails {
        pub code: u16,
        pub message: String,
        #[serde(default)]
        pub status: Option<String>,
    }

    /// Error body returned by the OAuth token endpoint.
    #[derive(Debug, Deserialize)]
    pub struct OAuthError {
        pub error: String,
        #[serde(default)]
        pub error_description: Option<String>,
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
    #[error("request failed with status {status}: {detail}")]
    Status { status: StatusCode, detail: String },
    #[error("unexpected payload: {0}")]
    Decode(String),
}

impl HttpError {
    /// Failures worth trying again later: rate limiting, server trouble and
    /// anything that never produced a response.
    pub fn is_transient(&self) -> bool {
        match self {
            HttpError::Timeout(_) => true,
            HttpError::Transport(err) => !err.is_builder() && !err.is_decode(),
            HttpError::Status { status, .. } => {
                *status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
            }
            HttpError::Decode(_) => false,
        }
    }

    pub fn status(&self) -> Option<StatusCode> {
        match self {
            HttpError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// JSON-over-HTTP client rooted at a base url. `E` is the error body the
/// remote end returns, used only to render readable failures.
pub struct GenericClient<E = ()> {
    base_url: Url,
    http_client: reqwest::Client,
    timeout: Duration,
    _error: PhantomData<E>,
}

impl<E> Clone for GenericClient<E> {
    fn clone(&self) -> Self {
        Self {
            base_url: self.base_url.clone(),
            http_client: self.http_client.clone(),
            timeout: self.timeout,
            _error: Default::default(),
        }
    }
}

#[bon]
impl<E> GenericClient<E> {
    #[builder]
    pub fn new(
        #[builder(start_fn)] base_url: Url,
        #[builder(default)] http_client: reqwest::Client,
        #[builder(default = DEFAULT_TIMEOUT)] timeout: Duration,
    ) -> Self {
        Self {
            base_url,
            http_client,
            timeout,
            _error: Default::default(),
        }
    }
}

#[bon]
impl<E: DeserializeOwned + fmt::Debug> GenericClient<E> {
    #[builder(finish_fn = send)]
    pub async fn request<T: DeserializeOwned>(
        &self,
        #[builder(start_fn)] path: &[&str],
        #[builder(default = Method::GET)] method: Method,
        form: Option<&[(&str, &str)]>,
        query: Option<&[(&str, &str)]>,
        access_token: Option<&AccessToken>,
    ) -> Result<T, HttpError> {
        let url = {
            let mut url = self.base_url.clone();
            if !path.is_empty() {
                url.path_segments_mut()
                    .expect("http urls have path segments")
                    .pop_if_empty()
                    .extend(path);
            }
            url
        };

        let mut request_builder = self.http_client.request(method, url);
        if let Some(access_token) = access_token {
            request_builder = request_builder.bearer_auth(access_token.as_str());
        }
        if let Some(form) = form {
            request_builder = request_builder.form(form);
        }
        if let Some(query) = query {
            request_builder = request_builder.query(query);
        }
        let request = request_builder.build()?;
        self.make_request(request).await
    }

    /// Executes a single request, bounded by the client timeout. Retrying is
    /// up to the caller.
    pub async fn make_request<T: DeserializeOwned>(&self, request: Request) -> Result<T, HttpError> {
        tracing::debug!(
            method = %request.method(),
            url = %request.url(),
            "executing request");

        let response = tokio::time::timeout(self.timeout, self.http_client.execute(request))
            .await
            .map_err(|_| HttpError::Timeout(self.timeout))??;

        let status = response.status();
        let data = tokio::time::timeout(self.timeout, response.bytes())
            .await
            .map_err(|_| HttpError::Timeout(self.timeout))??;

        if !status.is_success() {
            let text = String::from_utf8_lossy(&data);
            let detail = match serde_json::from_str::<E>(&text) {
                Ok(payload) => format!("{payload:?}"),
                Err(_) => text.into_owned(),
            };
            return Err(HttpError::Status { status, detail });
        }

        serde_json::from_slice(&data).map_err(|err| {
            HttpError::Decode(format!("{err}: {}", String::from_utf8_lossy(&data)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{payload::GoogleError, *};
    use serde::Deserialize;
    use serde_json::json;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{header, method, path, query_param},
    };

    #[derive(Debug, Deserialize)]
    struct Pong {
        ok: bool,
    }

    fn client(server: &MockServer) -> GenericClient<GoogleError> {
        let url = Url::parse(&format!("{}/api/v1", server.uri())).unwrap();
        GenericClient::builder(url)
            .timeout(Duration::from_millis(500))
            .build()
    }

    #[tokio::test]
    async fn sends_path_query_and_bearer_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/users/me/ping"))
            .and(query_param("q", "x"))
            .and(header("authorization", "Bearer tok"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .expect(1)
            .mount(&server)
            .await;

        let token = AccessToken::from("tok");
        let pong: Pong = client(&server)
            .request(&["users", "me", "ping"])
            .query(&[("q", "x")])
            .access_token(&token)
            .send()
            .await
            .unwrap();
        assert!(pong.ok);
    }

    #[tokio::test]
    async fn classifies_statuses() {
        let server = MockServer::start().await;
        for (route, status) in [("/api/v1/limited", 429u16), ("/api/v1/broken", 503), ("/api/v1/denied", 403)] {
            Mock::given(path(route))
                .respond_with(ResponseTemplate::new(status).set_body_json(json!({
                    "error": {"code": status, "message": "nope", "status": "X"}
                })))
                .mount(&server)
                .await;
        }

        let client = client(&server);
        for (segment, transient) in [("limited", true), ("broken", true), ("denied", false)] {
            let result: Result<Pong, _> = client.request(&[segment]).send().await;
            let err = result.unwrap_err();
            assert_eq!(err.is_transient(), transient, "{segment}: {err}");
            assert!(err.to_string().contains("nope"));
        }
    }

    #[tokio::test]
    async fn slow_responses_time_out() {
        let server = MockServer::start().await;
        Mock::given(path("/api/v1/slow"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"ok": true}))
                    .set_delay(Duration::from_secs(3)),
            )
            .mount(&server)
            .await;

        let result: Result<Pong, _> = client(&server).request(&["slow"]).send().await;
        let err = result.unwrap_err();
        assert!(matches!(err, HttpError::Timeout(_)));
        assert!(err.is_transient());
    }
}
