//! Credential resolution
//!
//! Turns the configured credential mode into a [`ClientHandle`] that can
//! authorize backend requests. Token minting itself belongs to the
//! [`TokenProvider`] collaborator.

use crate::errors::CredentialError;
use async_trait::async_trait;
use reqwest::RequestBuilder;
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

const METADATA_URL: &str = "http://metadata.google.internal";
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq)]
pub enum CredentialMode {
    AmbientDefault,
    ApiKey(String),
    ServiceAccountFile(PathBuf),
}

/// Subset of a service account JSON key that we validate and use
///
/// The key is not used to sign token requests. Tokens for `client_email` come
/// from the resolver's [`TokenProvider`]. With [`MetadataTokenProvider`] that only
/// succeeds where the metadata server can mint tokens for that account, so a
/// key file for an account that is not attached to the host is rejected when
/// the generation starts.
#[derive(Clone, Deserialize)]
pub struct ServiceAccountKey {
    #[serde(rename = "type")]
    pub key_type: String,
    #[serde(default)]
    pub project_id: String,
    private_key: String,
    pub client_email: String,
}

impl fmt::Debug for ServiceAccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceAccountKey")
            .field("key_type", &self.key_type)
            .field("project_id", &self.project_id)
            .field("client_email", &self.client_email)
            .finish_non_exhaustive()
    }
}

impl ServiceAccountKey {
    pub async fn load(path: &Path) -> Result<Self, CredentialError> {
        let contents = tokio::fs::read_to_string(path).await.map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                CredentialError::FileNotFound(path.display().to_string())
            } else {
                CredentialError::Malformed(format!("{}: {}", path.display(), err))
            }
        })?;

        let key: ServiceAccountKey = serde_json::from_str(&contents)
            .map_err(|err| CredentialError::Malformed(format!("{}: {}", path.display(), err)))?;

        if key.key_type != "service_account" {
            return Err(CredentialError::Malformed(format!(
                "{}: expected key type `service_account`, got `{}`",
                path.display(),
                key.key_type
            )));
        }
        if key.client_email.is_empty() || key.private_key.is_empty() {
            return Err(CredentialError::Malformed(format!(
                "{}: client_email and private_key are required",
                path.display()
            )));
        }

        Ok(key)
    }
}

/// Which identity a token is requested for
#[derive(Debug, Clone, PartialEq)]
pub enum TokenIdentity {
    Default,
    ServiceAccount(String),
}

#[derive(Debug, Clone)]
pub struct AccessToken {
    pub token: String,
    pub expires_at: Instant,
}

impl AccessToken {
    fn is_fresh(&self) -> bool {
        Instant::now() + TOKEN_REFRESH_MARGIN < self.expires_at
    }
}

/// The "give me a token" contract of the credential subsystem
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn token(&self, identity: &TokenIdentity) -> Result<AccessToken, CredentialError>;
}

/// Fetches tokens from the platform metadata server
pub struct MetadataTokenProvider {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Deserialize)]
struct MetadataToken {
    access_token: String,
    expires_in: u64,
}

impl MetadataTokenProvider {
    pub fn new(timeout: Duration) -> Result<Self, CredentialError> {
        Self::with_base_url(METADATA_URL.to_string(), timeout)
    }

    pub fn with_base_url(base_url: String, timeout: Duration) -> Result<Self, CredentialError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| CredentialError::Token(err.to_string()))?;
        Ok(Self { client, base_url })
    }
}

#[async_trait]
impl TokenProvider for MetadataTokenProvider {
    async fn token(&self, identity: &TokenIdentity) -> Result<AccessToken, CredentialError> {
        let account = match identity {
            TokenIdentity::Default => "default",
            TokenIdentity::ServiceAccount(email) => email.as_str(),
        };
        let url = format!(
            "{}/computeMetadata/v1/instance/service-accounts/{}/token",
            self.base_url, account
        );

        let response = self
            .client
            .get(&url)
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .map_err(|err| CredentialError::Token(err.to_string()))?;

        if !response.status().is_success() {
            return Err(CredentialError::Token(format!(
                "metadata server returned {} for {}",
                response.status(),
                account
            )));
        }

        let token: MetadataToken = response
            .json()
            .await
            .map_err(|err| CredentialError::Token(err.to_string()))?;

        Ok(AccessToken {
            token: token.access_token,
            expires_at: Instant::now() + Duration::from_secs(token.expires_in),
        })
    }
}

enum Auth {
    ApiKey(String),
    Bearer {
        identity: TokenIdentity,
        provider: Arc<dyn TokenProvider>,
        cached: Mutex<Option<AccessToken>>,
    },
}

/// Authenticated client handle, shared read-only within one generation
#[derive(Clone)]
pub struct ClientHandle {
    auth: Arc<Auth>,
    service_account: Option<Arc<ServiceAccountKey>>,
}

impl ClientHandle {
    pub fn api_key(key: impl Into<String>) -> Self {
        Self {
            auth: Arc::new(Auth::ApiKey(key.into())),
            service_account: None,
        }
    }

    fn bearer(identity: TokenIdentity, provider: Arc<dyn TokenProvider>, first: AccessToken) -> Self {
        Self {
            auth: Arc::new(Auth::Bearer {
                identity,
                provider,
                cached: Mutex::new(Some(first)),
            }),
            service_account: None,
        }
    }

    pub fn service_account(&self) -> Option<&ServiceAccountKey> {
        self.service_account.as_deref()
    }

    /// Attach credentials to an outgoing request
    pub async fn authorize(&self, request: RequestBuilder) -> Result<RequestBuilder, CredentialError> {
        match self.auth.as_ref() {
            Auth::ApiKey(key) => Ok(request.query(&[("key", key.as_str())])),
            Auth::Bearer {
                identity,
                provider,
                cached,
            } => {
                let mut cached = cached.lock().await;
                let token = match cached.as_ref() {
                    Some(token) if token.is_fresh() => token.token.clone(),
                    _ => {
                        debug!("Refreshing access token for {:?}", identity);
                        let token = provider.token(identity).await?;
                        let value = token.token.clone();
                        *cached = Some(token);
                        value
                    }
                };
                Ok(request.bearer_auth(token))
            }
        }
    }
}

impl fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = match self.auth.as_ref() {
            Auth::ApiKey(_) => "api-key",
            Auth::Bearer { .. } => "bearer",
        };
        write!(f, "ClientHandle({})", mode)
    }
}

pub struct CredentialResolver {
    provider: Arc<dyn TokenProvider>,
}

impl CredentialResolver {
    pub fn new(provider: Arc<dyn TokenProvider>) -> Self {
        Self { provider }
    }

    /// Resolve a credential mode into a client handle. Bearer modes fetch their
    /// first token here so an unusable credential fails the generation up front.
    pub async fn resolve(&self, mode: &CredentialMode) -> Result<ClientHandle, CredentialError> {
        match mode {
            CredentialMode::ApiKey(key) => {
                if key.is_empty() {
                    return Err(CredentialError::Malformed("api key is empty".to_string()));
                }
                info!("Using API key credentials");
                Ok(ClientHandle::api_key(key.clone()))
            }
            CredentialMode::AmbientDefault => {
                let token = self.provider.token(&TokenIdentity::Default).await?;
                info!("Using ambient default credentials");
                Ok(ClientHandle::bearer(TokenIdentity::Default, Arc::clone(&self.provider), token))
            }
            CredentialMode::ServiceAccountFile(path) => {
                let key = ServiceAccountKey::load(path).await?;
                let identity = TokenIdentity::ServiceAccount(key.client_email.clone());
                let token = self.provider.token(&identity).await?;
                info!("Using service account credentials for {}", key.client_email);

                let mut handle = ClientHandle::bearer(identity, Arc::clone(&self.provider), token);
                handle.service_account = Some(Arc::new(key));
                Ok(handle)
            }
        }
    }
}
