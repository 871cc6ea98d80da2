//! Spotify OAuth session: token cache, proactive refresh and interactive sign-in.

use crate::config::SpotifyProviderConfig;
use crate::error::{Result, SpotifyError};
use axum::{extract::Query, response::Html, routing::get, Router};
use chrono::{DateTime, TimeDelta, Utc};
use rspotify::{prelude::*, scopes, AuthCodeSpotify, Credentials, OAuth, Token};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};

/// How long the callback server waits for the browser
const OAUTH_CALLBACK_TIMEOUT: Duration = Duration::from_secs(600);

/// Refresh when the access token has less than this left
const REFRESH_MARGIN_SECS: i64 = 60;

/// Token as written to the cache file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct CachedToken {
    access_token: String,
    refresh_token: Option<String>,
    /// Unix seconds
    expires_at: Option<i64>,
    scopes: Vec<String>,
}

impl From<&Token> for CachedToken {
    fn from(token: &Token) -> Self {
        let mut scopes: Vec<String> = token.scopes.iter().cloned().collect();
        scopes.sort();
        Self {
            access_token: token.access_token.clone(),
            refresh_token: token.refresh_token.clone(),
            expires_at: token.expires_at.map(|at| at.timestamp()),
            scopes,
        }
    }
}

impl From<CachedToken> for Token {
    fn from(cached: CachedToken) -> Self {
        Self {
            access_token: cached.access_token,
            refresh_token: cached.refresh_token,
            expires_at: cached
                .expires_at
                .and_then(|ts| DateTime::from_timestamp(ts, 0)),
            expires_in: TimeDelta::zero(),
            scopes: cached.scopes.into_iter().collect(),
        }
    }
}

/// Whether a token expiring at `expires_at` should be refreshed at `now`.
fn due_for_refresh(expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    expires_at.is_some_and(|at| (at - now).num_seconds() <= REFRESH_MARGIN_SECS)
}

/// Host, port and path of the redirect URI.
fn callback_address(redirect_uri: &str) -> Result<(SocketAddr, String)> {
    let parsed = url::Url::parse(redirect_uri).map_err(|e| SpotifyError::AuthFailed {
        reason: format!("Invalid redirect URI: {e}"),
    })?;

    let host = match parsed.host_str() {
        None | Some("localhost") => "127.0.0.1",
        Some(host) => host,
    };
    let port = parsed.port().unwrap_or(8888);

    let addr = format!("{host}:{port}")
        .parse()
        .map_err(|e| SpotifyError::AuthFailed {
            reason: format!("Invalid callback address {host}:{port}: {e}"),
        })?;
    Ok((addr, parsed.path().to_string()))
}

/// Identifies one version of the token cache file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenFileStamp {
    modified: SystemTime,
    len: u64,
}

/// Authorized Spotify client plus its on-disk token cache.
pub struct SpotifySession {
    client: AuthCodeSpotify,
    token_path: PathBuf,
}

impl SpotifySession {
    /// Session using the default token cache location.
    #[must_use]
    pub fn new(config: &SpotifyProviderConfig) -> Self {
        Self::with_token_path(config, crate::paths::spotify_token_cache_path())
    }

    #[must_use]
    pub fn with_token_path(config: &SpotifyProviderConfig, token_path: PathBuf) -> Self {
        let creds = Credentials::new(&config.client_id, &config.client_secret);
        let oauth = OAuth {
            redirect_uri: config.oauth_redirect_uri.clone(),
            scopes: scopes!(
                "user-read-currently-playing",
                "user-read-playback-state",
                "user-read-recently-played"
            ),
            ..Default::default()
        };

        Self {
            client: AuthCodeSpotify::new(creds, oauth),
            token_path,
        }
    }

    #[must_use]
    pub fn token_path(&self) -> &Path {
        &self.token_path
    }

    /// Get the underlying Spotify client
    #[must_use]
    pub const fn client(&self) -> &AuthCodeSpotify {
        &self.client
    }

    async fn lock_token(&self) -> Result<futures::lock::MutexGuard<'_, Option<Token>>> {
        self.client
            .token
            .lock()
            .await
            .map_err(|_| SpotifyError::AuthFailed {
                reason: "Failed to acquire token lock".to_string(),
            })
    }

    /// Whether a token is loaded.
    pub async fn has_token(&self) -> bool {
        self.lock_token()
            .await
            .is_ok_and(|guard| guard.is_some())
    }

    /// Modification time and size of the token cache file, if it exists.
    ///
    /// Changes whenever `listenlog auth` writes a new token.
    #[must_use]
    pub fn token_file_stamp(&self) -> Option<TokenFileStamp> {
        let meta = fs::metadata(&self.token_path).ok()?;
        Some(TokenFileStamp {
            modified: meta.modified().ok()?,
            len: meta.len(),
        })
    }

    /// Load the cached token, refreshing it if it has expired.
    ///
    /// Returns false when there is no usable token and sign-in is required.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache file is unreadable or the refresh fails.
    pub async fn load_cached_token(&self) -> Result<bool> {
        if !self.token_path.exists() {
            debug!("No cached Spotify token at {:?}", self.token_path);
            return Ok(false);
        }

        let content = fs::read_to_string(&self.token_path)?;
        let cached: CachedToken = serde_json::from_str(&content)?;
        let token = Token::from(cached);

        if token.is_expired() {
            if token.refresh_token.is_none() {
                debug!("Cached Spotify token expired without a refresh token");
                return Ok(false);
            }
            *self.lock_token().await? = Some(token);
            self.refresh_token().await?;
            return Ok(true);
        }

        *self.lock_token().await? = Some(token);
        info!("Loaded cached Spotify token");
        Ok(true)
    }

    async fn save_token(&self) -> Result<()> {
        let cached = {
            let guard = self.lock_token().await?;
            guard.as_ref().map(CachedToken::from)
        };
        let Some(cached) = cached else {
            return Ok(());
        };

        if let Some(parent) = self.token_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.token_path, serde_json::to_string_pretty(&cached)?)?;
        debug!("Saved Spotify token to {:?}", self.token_path);
        Ok(())
    }

    /// Refresh the access token and persist it.
    ///
    /// # Errors
    ///
    /// Returns an error if the token refresh fails or the token cannot be saved.
    pub async fn refresh_token(&self) -> Result<()> {
        info!("Refreshing Spotify access token");
        self.client
            .refresh_token()
            .await
            .map_err(|e| SpotifyError::AuthFailed {
                reason: format!("Token refresh failed: {e}"),
            })?;
        self.save_token().await
    }

    /// Make sure a token is loaded and not about to expire.
    ///
    /// # Errors
    ///
    /// Returns `NotAuthenticated` without a token, or an error if a refresh fails.
    pub async fn ensure_token_fresh(&self) -> Result<()> {
        let expires_at = {
            let guard = self.lock_token().await?;
            match guard.as_ref() {
                Some(token) => token.expires_at,
                None => return Err(SpotifyError::NotAuthenticated),
            }
        };

        if due_for_refresh(expires_at, Utc::now()) {
            debug!("Spotify token expires within {}s", REFRESH_MARGIN_SECS);
            self.refresh_token().await?;
        }
        Ok(())
    }

    /// Use the cached token if possible, otherwise run the browser sign-in.
    ///
    /// # Errors
    ///
    /// Returns an error if authentication or token refresh fails.
    pub async fn ensure_authenticated(&self) -> Result<()> {
        if self.load_cached_token().await? {
            return Ok(());
        }
        self.authenticate_interactive().await
    }

    /// Run the authorization-code flow with a local callback server.
    ///
    /// # Errors
    ///
    /// Returns an error if the server cannot start, the callback times out or the
    /// code exchange fails.
    pub async fn authenticate_interactive(&self) -> Result<()> {
        let (addr, callback_path) = callback_address(&self.client.oauth.redirect_uri)?;

        let (tx, rx) = oneshot::channel::<String>();
        let app = callback_router(&callback_path, Arc::new(Mutex::new(Some(tx))));

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| SpotifyError::AuthFailed {
                reason: format!("Failed to bind to {addr}: {e}"),
            })?;
        info!("OAuth callback server listening on http://{addr}{callback_path}");

        let auth_url = self
            .client
            .get_authorize_url(false)
            .map_err(|e| SpotifyError::AuthFailed {
                reason: format!("Failed to generate auth URL: {e}"),
            })?;
        if let Err(e) = open::that(&auth_url) {
            warn!("Could not open browser automatically: {}", e);
        }
        info!("Sign in to Spotify at:\n{auth_url}");

        let code = tokio::select! {
            result = rx => result.map_err(|_| SpotifyError::AuthFailed {
                reason: "Callback channel closed unexpectedly".into(),
            })?,
            _ = axum::serve(listener, app) => {
                return Err(SpotifyError::AuthFailed {
                    reason: "Callback server stopped unexpectedly".into(),
                });
            }
            () = tokio::time::sleep(OAUTH_CALLBACK_TIMEOUT) => {
                return Err(SpotifyError::AuthFailed {
                    reason: format!(
                        "No authorization callback within {} minutes",
                        OAUTH_CALLBACK_TIMEOUT.as_secs() / 60
                    ),
                });
            }
        };

        info!("Received authorization code, exchanging for token");
        self.client
            .request_token(&code)
            .await
            .map_err(|e| SpotifyError::AuthFailed {
                reason: format!("Token exchange failed: {e}"),
            })?;
        self.save_token().await?;
        info!("Signed in to Spotify; token saved to {:?}", self.token_path);
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct CallbackParams {
    code: Option<String>,
    error: Option<String>,
}

type CodeSender = Arc<Mutex<Option<oneshot::Sender<String>>>>;

fn callback_router(callback_path: &str, tx: CodeSender) -> Router {
    Router::new().route(
        callback_path,
        get(move |Query(params): Query<CallbackParams>| {
            let tx = tx.clone();
            async move { callback_page(params, tx).await }
        }),
    )
}

async fn callback_page(params: CallbackParams, tx: CodeSender) -> Html<String> {
    let message = match (params.code, params.error) {
        (Some(code), _) => {
            if let Some(sender) = tx.lock().await.take() {
                let _ = sender.send(code);
            }
            "listenlog is connected to Spotify. You can close this window.".to_string()
        }
        (None, Some(error)) => format!("Authorization failed: {error}. Close this window and retry."),
        (None, None) => "No authorization code received. Close this window and retry.".to_string(),
    };

    Html(format!(
        r#"<!DOCTYPE html>
<html>
<head><title>listenlog</title></head>
<body style="font-family: sans-serif; text-align: center; padding: 50px;">
    <p>{message}</p>
</body>
</html>"#
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SpotifyProviderConfig {
        SpotifyProviderConfig {
            client_id: "id".into(),
            client_secret: "secret".into(),
            oauth_redirect_uri: "http://localhost:9999/cb".into(),
        }
    }

    fn write_token(path: &Path, expires_at: DateTime<Utc>, refresh: Option<&str>) {
        let cached = CachedToken {
            access_token: "access".into(),
            refresh_token: refresh.map(str::to_string),
            expires_at: Some(expires_at.timestamp()),
            scopes: vec![],
        };
        fs::write(path, serde_json::to_string(&cached).unwrap()).unwrap();
    }

    #[test]
    fn test_cached_token_roundtrip_keeps_expiry() {
        let cached = CachedToken {
            access_token: "access".into(),
            refresh_token: Some("refresh".into()),
            expires_at: Some(1_700_000_000),
            scopes: vec!["user-read-recently-played".into()],
        };

        let token = Token::from(cached.clone());
        assert_eq!(token.expires_at.map(|at| at.timestamp()), Some(1_700_000_000));
        assert_eq!(CachedToken::from(&token), cached);
    }

    #[test]
    fn test_refresh_margin() {
        let now = Utc::now();
        assert!(due_for_refresh(Some(now + TimeDelta::seconds(30)), now));
        assert!(due_for_refresh(Some(now - TimeDelta::seconds(5)), now));
        assert!(!due_for_refresh(Some(now + TimeDelta::minutes(10)), now));
        assert!(!due_for_refresh(None, now));
    }

    #[test]
    fn test_callback_address_maps_localhost() {
        let (addr, path) = callback_address("http://localhost:9999/cb").unwrap();
        assert_eq!(addr.to_string(), "127.0.0.1:9999");
        assert_eq!(path, "/cb");
    }

    #[test]
    fn test_callback_address_rejects_garbage() {
        assert!(callback_address("not a url").is_err());
    }

    #[tokio::test]
    async fn test_missing_cache_means_signed_out() {
        let dir = tempfile::tempdir().unwrap();
        let session = SpotifySession::with_token_path(&config(), dir.path().join("token.json"));
        assert!(session.token_file_stamp().is_none());
        assert!(!session.load_cached_token().await.unwrap());
        assert!(!session.has_token().await);
        assert!(matches!(
            session.ensure_token_fresh().await,
            Err(SpotifyError::NotAuthenticated)
        ));
    }

    #[tokio::test]
    async fn test_valid_cached_token_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token.json");
        write_token(&path, Utc::now() + TimeDelta::hours(1), Some("refresh"));

        let session = SpotifySession::with_token_path(&config(), path);
        assert!(session.token_file_stamp().is_some());
        assert!(session.load_cached_token().await.unwrap());
        assert!(session.has_token().await);
        assert!(session.ensure_token_fresh().await.is_ok());
    }

    #[tokio::test]
    async fn test_expired_token_without_refresh_is_unusable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token.json");
        write_token(&path, Utc::now() - TimeDelta::hours(1), None);

        let session = SpotifySession::with_token_path(&config(), path);
        assert!(!session.load_cached_token().await.unwrap());
        assert!(!session.has_token().await);
    }
}
