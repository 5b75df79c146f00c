pub mod client;

use crate::macros::{impl_as_str, impl_from_string, impl_redacted_debug};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Url;
use secrets_file::SecretsFile;
use serde::Deserialize;
use std::{
    fs::File,
    io::BufReader,
    path::Path,
    sync::{Arc, LazyLock},
};

pub static TOKEN_ENDPOINT: LazyLock<Url> =
    LazyLock::new(|| Url::parse("https://oauth2.googleapis.com/token").expect("valid url"));

impl_as_str!(ClientId, ClientSecret, AccessToken, RefreshToken);
impl_from_string!(AccessToken, RefreshToken);
impl_redacted_debug!(ClientSecret, AccessToken, RefreshToken);

#[derive(Debug, Clone, Deserialize)]
pub struct ClientId(String);

#[derive(Clone, Deserialize)]
pub struct ClientSecret(String);

#[derive(Clone)]
pub struct ClientCredentials {
    pub id: ClientId,
    pub secret: ClientSecret,
}

impl ClientCredentials {
    pub fn load_from_file(path: impl AsRef<Path>) -> eyre::Result<Self> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let secrets = serde_json::from_reader::<_, SecretsFile>(reader)?.into_inner();
        Ok(Self {
            id: secrets.client_id,
            secret: secrets.client_secret,
        })
    }
}

mod secrets_file {
    use super::{ClientId, ClientSecret};
    use serde::Deserialize;

    #[derive(Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum SecretsFile {
        Installed(ApplicationSecrets),
        Web(ApplicationSecrets),
    }

    impl SecretsFile {
        pub fn into_inner(self) -> ApplicationSecrets {
            match self {
                SecretsFile::Installed(inner) => inner,
                SecretsFile::Web(inner) => inner,
            }
        }
    }

    #[derive(Deserialize)]
    pub struct ApplicationSecrets {
        pub client_id: ClientId,
        pub client_secret: ClientSecret,
    }
}

#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct AccessToken(Arc<str>);

#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct RefreshToken(Arc<str>);

/// A complete token set as obtained from a consent flow.
#[derive(Debug, Clone)]
pub struct OAuthTokens {
    pub access_token: AccessToken,
    pub refresh_token: RefreshToken,
    pub expires_at: DateTime<Utc>,
}

impl OAuthTokens {
    /// Reads a token set exported by another OAuth tool:
    /// `{"access_token": .., "refresh_token": .., "expires_at": <unix seconds>}`.
    pub fn load_from_file(path: impl AsRef<Path>) -> eyre::Result<Self> {
        #[derive(Deserialize)]
        struct TokenFile {
            access_token: AccessToken,
            refresh_token: RefreshToken,
            expires_at: i64,
        }

        let file = File::open(path)?;
        let tokens: TokenFile = serde_json::from_reader(BufReader::new(file))?;
        let expires_at = DateTime::from_timestamp(tokens.expires_at, 0)
            .ok_or_else(|| eyre::eyre!("expires_at out of range"))?;
        Ok(Self {
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
            expires_at,
        })
    }
}

/// Outcome of a successful refresh round trip. Google only sends a refresh
/// token back when it rotates it.
#[derive(Debug, Clone)]
pub struct RefreshedToken {
    pub access_token: AccessToken,
    pub refresh_token: Option<RefreshToken>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum RefreshError {
    /// The provider refused the refresh token; only a new consent helps.
    #[error("refresh token rejected: {0}")]
    Rejected(String),
    #[error("token endpoint unavailable: {0}")]
    Transient(String),
}

#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, refresh_token: &RefreshToken) -> Result<RefreshedToken, RefreshError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_installed_app_secrets() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"installed": {{"client_id": "id.apps.googleusercontent.com", "client_secret": "shh"}}}}"#
        )
        .unwrap();

        let creds = ClientCredentials::load_from_file(file.path()).unwrap();
        assert_eq!(creds.id.as_str(), "id.apps.googleusercontent.com");
        assert_eq!(creds.secret.as_str(), "shh");
    }

    #[test]
    fn loads_exported_tokens() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"access_token": "ya29", "refresh_token": "1//r", "expires_at": 1700000000}}"#
        )
        .unwrap();

        let tokens = OAuthTokens::load_from_file(file.path()).unwrap();
        assert_eq!(tokens.access_token.as_str(), "ya29");
        assert_eq!(tokens.refresh_token.as_str(), "1//r");
        assert_eq!(tokens.expires_at.timestamp(), 1_700_000_000);
    }

    #[test]
    fn tokens_do_not_leak_through_debug() {
        let token = AccessToken::from("ya29.secret");
        assert_eq!(format!("{token:?}"), "AccessToken(<redacted>)");
    }
}
