//! OAuth2 authorization-code and refresh flows for Google Drive.

use async_trait::async_trait;
use oauth2::basic::BasicClient;
use oauth2::{
    AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, EndpointNotSet, EndpointSet,
    RedirectUrl, RefreshToken, Scope, TokenResponse, TokenUrl,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use driveline_common::{Error, Result};

use crate::provider::{TokenEndpoint, TokenGrant};

/// OAuth2 authorization endpoint.
const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
/// OAuth2 token endpoint.
const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
/// Redirect URL of the OAuth2 callback.
const REDIRECT_URL: &str = "http://localhost:8080/api/files/oauth2/callback";

/// Google Drive scope limited to files created by this application.
pub const DRIVE_FILE_SCOPE: &str = "https://www.googleapis.com/auth/drive.file";

type GoogleClient =
    BasicClient<EndpointSet, EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointSet>;

/// Configuration for OAuth2 authentication.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OAuthConfig {
    /// Client ID issued by the provider console.
    pub client_id: String,
    /// Client secret issued by the provider console.
    pub client_secret: String,
    /// Redirect URL registered for the callback.
    pub redirect_url: String,
    /// Authorization endpoint.
    pub auth_url: String,
    /// Token endpoint.
    pub token_url: String,
    /// Scope requested on consent.
    pub scope: String,
    /// TCP connect timeout for token requests.
    pub connect_timeout_secs: u64,
    /// Total timeout for token requests.
    pub request_timeout_secs: u64,
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            redirect_url: REDIRECT_URL.to_string(),
            auth_url: GOOGLE_AUTH_URL.to_string(),
            token_url: GOOGLE_TOKEN_URL.to_string(),
            scope: DRIVE_FILE_SCOPE.to_string(),
            connect_timeout_secs: 10,
            request_timeout_secs: 60,
        }
    }
}

/// Google OAuth2 token endpoint.
pub struct GoogleOAuth {
    client: GoogleClient,
    http: oauth2::reqwest::Client,
    config: OAuthConfig,
}

impl GoogleOAuth {
    /// Create a new token endpoint client.
    ///
    /// # Errors
    /// - Empty client id
    /// - Malformed endpoint or redirect URLs
    pub fn new(config: OAuthConfig) -> Result<Self> {
        if config.client_id.is_empty() {
            return Err(Error::InvalidInput("OAuth client id is not configured".to_string()));
        }

        let client = BasicClient::new(ClientId::new(config.client_id.clone()))
            .set_client_secret(ClientSecret::new(config.client_secret.clone()))
            .set_auth_uri(
                AuthUrl::new(config.auth_url.clone())
                    .map_err(|e| Error::InvalidInput(format!("Invalid auth URL: {}", e)))?,
            )
            .set_token_uri(
                TokenUrl::new(config.token_url.clone())
                    .map_err(|e| Error::InvalidInput(format!("Invalid token URL: {}", e)))?,
            )
            .set_redirect_uri(
                RedirectUrl::new(config.redirect_url.clone())
                    .map_err(|e| Error::InvalidInput(format!("Invalid redirect URL: {}", e)))?,
            );

        // Token endpoints must not follow redirects.
        let http = oauth2::reqwest::ClientBuilder::new()
            .redirect(oauth2::reqwest::redirect::Policy::none())
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| Error::InvalidInput(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            http,
            config,
        })
    }

    fn to_grant<T: TokenResponse>(token: &T) -> TokenGrant {
        TokenGrant {
            access_token: token.access_token().secret().clone(),
            refresh_token: token
                .refresh_token()
                .map(|t| t.secret().clone())
                .filter(|t| !t.is_empty()),
            expires_in: token.expires_in(),
            scope: token.scopes().map(|scopes| {
                scopes
                    .iter()
                    .map(|s| s.as_str())
                    .collect::<Vec<_>>()
                    .join(" ")
            }),
        }
    }
}

#[async_trait]
impl TokenEndpoint for GoogleOAuth {
    fn authorization_url(&self, state: &str) -> Result<String> {
        let state = state.to_string();
        let (auth_url, _) = self
            .client
            .authorize_url(move || CsrfToken::new(state))
            .add_scope(Scope::new(self.config.scope.clone()))
            .add_extra_param("access_type", "offline")
            .add_extra_param("prompt", "consent")
            .url();

        Ok(auth_url.to_string())
    }

    async fn exchange_code(&self, code: &str) -> Result<TokenGrant> {
        let token = self
            .client
            .exchange_code(AuthorizationCode::new(code.to_string()))
            .request_async(&self.http)
            .await
            .map_err(|e| Error::ProviderExchange(format!("Token exchange failed: {}", e)))?;

        Ok(Self::to_grant(&token))
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant> {
        let token = self
            .client
            .exchange_refresh_token(&RefreshToken::new(refresh_token.to_string()))
            .request_async(&self.http)
            .await
            .map_err(|e| Error::ProviderExchange(format!("Token refresh failed: {}", e)))?;

        Ok(Self::to_grant(&token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> OAuthConfig {
        OAuthConfig {
            client_id: "test_id".to_string(),
            client_secret: "test_secret".to_string(),
            ..OAuthConfig::default()
        }
    }

    #[test]
    fn test_oauth_config_serialization() {
        let config = test_config();
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: OAuthConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(deserialized.client_id, config.client_id);
        assert_eq!(deserialized.redirect_url, config.redirect_url);
    }

    #[test]
    fn test_oauth_config_partial_json_uses_defaults() {
        let config: OAuthConfig =
            serde_json::from_str(r#"{"client_id": "abc", "client_secret": "xyz"}"#).unwrap();
        assert_eq!(config.client_id, "abc");
        assert_eq!(config.token_url, GOOGLE_TOKEN_URL);
        assert_eq!(config.scope, DRIVE_FILE_SCOPE);
        assert_eq!(config.connect_timeout_secs, 10);
        assert_eq!(config.request_timeout_secs, 60);
    }

    #[test]
    fn test_missing_client_id_rejected() {
        assert!(GoogleOAuth::new(OAuthConfig::default()).is_err());
    }

    #[test]
    fn test_invalid_token_url_rejected() {
        let config = OAuthConfig {
            token_url: "not a url".to_string(),
            ..test_config()
        };
        assert!(GoogleOAuth::new(config).is_err());
    }

    #[test]
    fn test_authorization_url_carries_state() {
        let oauth = GoogleOAuth::new(test_config()).unwrap();
        let url = oauth.authorization_url("user:user-9").unwrap();
        let parsed = url::Url::parse(&url).unwrap();
        let pairs: Vec<(String, String)> = parsed
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();

        assert!(url.contains("accounts.google.com"));
        assert!(pairs.contains(&("client_id".to_string(), "test_id".to_string())));
        assert!(pairs.contains(&("state".to_string(), "user:user-9".to_string())));
        assert!(pairs.contains(&("access_type".to_string(), "offline".to_string())));
        assert!(pairs.contains(&("prompt".to_string(), "consent".to_string())));
        assert!(pairs.contains(&("scope".to_string(), DRIVE_FILE_SCOPE.to_string())));
    }
}
