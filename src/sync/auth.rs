//! Pluggable outbound credential injection: the core treats the credential
//! as opaque bytes injected into the request by a pluggable `AuthProvider`.
//! One implementation per `AuthConfig` variant.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Mutex;

use crate::config::AuthConfig;
use crate::sync::SyncError;

#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn authorize(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> Result<reqwest::RequestBuilder, SyncError>;

    /// Called after a `401` so a token-based provider can refresh before the
    /// next attempt. A no-op for static schemes.
    async fn invalidate(&self) {}
}

pub struct NoAuth;

#[async_trait]
impl AuthProvider for NoAuth {
    async fn authorize(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> Result<reqwest::RequestBuilder, SyncError> {
        Ok(builder)
    }
}

pub struct ApiKeyAuth {
    pub header: String,
    pub value: String,
}

#[async_trait]
impl AuthProvider for ApiKeyAuth {
    async fn authorize(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> Result<reqwest::RequestBuilder, SyncError> {
        Ok(builder.header(self.header.as_str(), self.value.as_str()))
    }
}

pub struct BearerAuth {
    pub token: String,
}

#[async_trait]
impl AuthProvider for BearerAuth {
    async fn authorize(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> Result<reqwest::RequestBuilder, SyncError> {
        Ok(builder.bearer_auth(&self.token))
    }
}

pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

#[async_trait]
impl AuthProvider for BasicAuth {
    async fn authorize(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> Result<reqwest::RequestBuilder, SyncError> {
        Ok(builder.basic_auth(&self.username, Some(&self.password)))
    }
}

pub struct CustomHeaderAuth {
    pub headers: Vec<(String, String)>,
}

#[async_trait]
impl AuthProvider for CustomHeaderAuth {
    async fn authorize(
        &self,
        mut builder: reqwest::RequestBuilder,
    ) -> Result<reqwest::RequestBuilder, SyncError> {
        for (name, value) in &self.headers {
            builder = builder.header(name, value);
        }
        Ok(builder)
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

struct CachedToken {
    value: Option<String>,
}

/// OAuth 2.0 client-credentials grant. The token is fetched lazily on first
/// use and cached until `invalidate` is called in response
/// to a `401`, rather than tracked against an expiry clock — the endpoint's
/// own `401` is the authoritative signal that a refresh is due.
pub struct OAuth2ClientCredentialsAuth {
    token_url: String,
    client_id: String,
    client_secret: String,
    scope: Option<String>,
    http: reqwest::Client,
    cached: Mutex<CachedToken>,
}

impl OAuth2ClientCredentialsAuth {
    pub fn new(
        token_url: String,
        client_id: String,
        client_secret: String,
        scope: Option<String>,
        http: reqwest::Client,
    ) -> Self {
        Self {
            token_url,
            client_id,
            client_secret,
            scope,
            http,
            cached: Mutex::new(CachedToken { value: None }),
        }
    }

    async fn fetch_token(&self) -> Result<String, SyncError> {
        let mut form = vec![
            ("grant_type", "client_credentials"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
        ];
        if let Some(scope) = &self.scope {
            form.push(("scope", scope.as_str()));
        }
        let response = self
            .http
            .post(&self.token_url)
            .form(&form)
            .send()
            .await
            .map_err(SyncError::Transport)?;
        if !response.status().is_success() {
            return Err(SyncError::Http {
                status: response.status().as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        let parsed: TokenResponse = response.json().await.map_err(SyncError::Transport)?;
        Ok(parsed.access_token)
    }
}

#[async_trait]
impl AuthProvider for OAuth2ClientCredentialsAuth {
    async fn authorize(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> Result<reqwest::RequestBuilder, SyncError> {
        let mut cached = self.cached.lock().await;
        if cached.value.is_none() {
            cached.value = Some(self.fetch_token().await?);
        }
        let token = cached.value.clone().expect("just populated above");
        Ok(builder.bearer_auth(token))
    }

    async fn invalidate(&self) {
        self.cached.lock().await.value = None;
    }
}

pub fn from_config(config: &AuthConfig, http: reqwest::Client) -> Arc<dyn AuthProvider> {
    match config {
        AuthConfig::None => Arc::new(NoAuth),
        AuthConfig::ApiKey { header, value } => Arc::new(ApiKeyAuth {
            header: header.clone(),
            value: value.clone(),
        }),
        AuthConfig::Bearer { token } => Arc::new(BearerAuth {
            token: token.clone(),
        }),
        AuthConfig::Basic { username, password } => Arc::new(BasicAuth {
            username: username.clone(),
            password: password.clone(),
        }),
        AuthConfig::CustomHeaders { headers } => Arc::new(CustomHeaderAuth {
            headers: headers.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        }),
        AuthConfig::OAuth2ClientCredentials {
            token_url,
            client_id,
            client_secret,
            scope,
        } => Arc::new(OAuth2ClientCredentialsAuth::new(
            token_url.clone(),
            client_id.clone(),
            client_secret.clone(),
            scope.clone(),
            http,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn api_key_auth_sets_header() {
        let auth = ApiKeyAuth {
            header: "X-Api-Key".into(),
            value: "secret".into(),
        };
        let client = reqwest::Client::new();
        let builder = client.get("https://example.test");
        let request = auth.authorize(builder).await.unwrap().build().unwrap();
        assert_eq!(request.headers().get("X-Api-Key").unwrap(), "secret");
    }

    #[tokio::test]
    async fn bearer_auth_sets_authorization_header() {
        let auth = BearerAuth { token: "tok".into() };
        let client = reqwest::Client::new();
        let builder = client.get("https://example.test");
        let request = auth.authorize(builder).await.unwrap().build().unwrap();
        assert_eq!(request.headers().get("authorization").unwrap(), "Bearer tok");
    }
}
