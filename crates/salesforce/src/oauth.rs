use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::Duration;
use crmgate_core::auth::{AuthError, RefreshedToken, TokenRefresher};
use crmgate_core::config::{SalesforceConfig, MAX_TOKEN_TTL_SECS};
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::{error, info};

/// Refresh-token grant against the org's OAuth token endpoint.
pub struct OAuthRefresher {
    client: Client,
    token_url: String,
    client_id: String,
    client_secret: SecretString,
}

#[derive(Deserialize)]
struct OAuthTokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    instance_url: Option<String>,
    expires_in: Option<i64>,
}

#[derive(Deserialize)]
struct OAuthErrorResponse {
    #[serde(default)]
    error: String,
    #[serde(default)]
    error_description: String,
}

impl OAuthRefresher {
    pub fn new(
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: SecretString,
        timeout: StdDuration,
    ) -> Result<Self, AuthError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| AuthError::RefreshFailed(format!("http client setup failed: {error}")))?;
        Ok(Self { client, token_url: token_url.into(), client_id: client_id.into(), client_secret })
    }

    /// `None` when the config carries no complete refresh grant.
    pub fn from_config(config: &SalesforceConfig) -> Result<Option<Self>, AuthError> {
        if !config.has_refresh_grant() {
            return Ok(None);
        }
        let (Some(client_id), Some(client_secret)) = (config.client_id.clone(), config.client_secret.clone())
        else {
            return Ok(None);
        };
        Self::new(config.resolved_token_url(), client_id, client_secret, StdDuration::from_secs(config.timeout_secs))
            .map(Some)
    }
}

#[async_trait]
impl TokenRefresher for OAuthRefresher {
    async fn refresh(&self, refresh_token: &SecretString) -> Result<RefreshedToken, AuthError> {
        let response = self
            .client
            .post(&self.token_url)
            .form(&[
                ("grant_type", "refresh_token"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.expose_secret()),
                ("refresh_token", refresh_token.expose_secret()),
            ])
            .send()
            .await
            .map_err(|error| {
                error!(event_name = "oauth.refresh_request_failed", error = %error, "token refresh request failed");
                AuthError::RefreshFailed("token endpoint unreachable".to_string())
            })?;

        let status = response.status();
        if matches!(status, StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED) {
            let failure = response
                .json::<OAuthErrorResponse>()
                .await
                .unwrap_or(OAuthErrorResponse { error: String::new(), error_description: String::new() });
            info!(
                event_name = "oauth.refresh_rejected",
                status = status.as_u16(),
                error = %failure.error,
                "token endpoint rejected refresh grant"
            );
            let reason = if failure.error_description.is_empty() { failure.error } else { failure.error_description };
            return Err(AuthError::RefreshRejected(reason));
        }
        if !status.is_success() {
            return Err(AuthError::RefreshFailed(format!("token endpoint returned {status}")));
        }

        let token: OAuthTokenResponse = response
            .json()
            .await
            .map_err(|error| AuthError::RefreshFailed(format!("failed to decode token response: {error}")))?;
        if token.access_token.is_empty() {
            return Err(AuthError::RefreshFailed("token endpoint returned empty access token".to_string()));
        }

        Ok(RefreshedToken {
            access_token: SecretString::from(token.access_token),
            refresh_token: token.refresh_token.filter(|value| !value.is_empty()).map(SecretString::from),
            instance_url: token.instance_url,
            expires_in: token
                .expires_in
                .filter(|secs| *secs > 0)
                .map(|secs| Duration::seconds(secs.min(MAX_TOKEN_TTL_SECS as i64))),
        })
    }
}
