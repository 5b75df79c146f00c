use super::{
    AccessToken, ClientCredentials, RefreshError, RefreshToken, RefreshedToken, TOKEN_ENDPOINT,
    TokenRefresher,
};
use crate::http::{GenericClient, payload::OAuthError};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Method, Url};
use serde::Deserialize;
use std::time::Duration;

pub struct OAuthClient {
    creds: ClientCredentials,
    http_client: GenericClient<OAuthError>,
}

impl OAuthClient {
    pub fn new(creds: ClientCredentials, timeout: Duration) -> Self {
        Self::with_token_endpoint(creds, TOKEN_ENDPOINT.clone(), timeout)
    }

    pub fn with_token_endpoint(creds: ClientCredentials, endpoint: Url, timeout: Duration) -> Self {
        Self {
            creds,
            http_client: GenericClient::builder(endpoint).timeout(timeout).build(),
        }
    }
}

#[async_trait]
impl TokenRefresher for OAuthClient {
    async fn refresh(&self, refresh_token: &RefreshToken) -> Result<RefreshedToken, RefreshError> {
        #[derive(Deserialize)]
        struct TokensResponse {
            access_token: AccessToken,
            expires_in: u64,
            refresh_token: Option<RefreshToken>,
        }

        let resp: TokensResponse = self
            .http_client
            .request(&[])
            .method(Method::POST)
            .form(&[
                ("client_id", self.creds.id.as_str()),
                ("client_secret", self.creds.secret.as_str()),
                ("refresh_token", refresh_token.as_str()),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await
            .map_err(|err| {
                let client_error = err.status().is_some_and(|s| s.is_client_error());
                if client_error && !err.is_transient() {
                    RefreshError::Rejected(err.to_string())
                } else {
                    RefreshError::Transient(err.to_string())
                }
            })?;

        tracing::debug!(
            expires_in = resp.expires_in,
            rotated = resp.refresh_token.is_some(),
            "access token refreshed"
        );
        Ok(RefreshedToken {
            access_token: resp.access_token,
            refresh_token: resp.refresh_token,
            expires_at: Utc::now() + Duration::from_secs(resp.expires_in),
        })
    }
}
