//! Spotify provider configuration.

use const_format::concatcp;
use listenlog_core::{CoreError, ProvidersConfig};
use serde::{Deserialize, Serialize};

/// Provider name used in config file
pub const PROVIDER_NAME: &str = "spotify";

/// Redirect URI registered for the local OAuth callback server
pub const DEFAULT_REDIRECT_URI: &str = "http://127.0.0.1:8888/callback";

/// Spotify-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpotifyProviderConfig {
    /// Spotify OAuth client ID
    pub client_id: String,
    /// Spotify OAuth client secret
    pub client_secret: String,
    /// OAuth redirect URI
    #[serde(default = "default_redirect_uri")]
    pub oauth_redirect_uri: String,
}

fn default_redirect_uri() -> String {
    DEFAULT_REDIRECT_URI.into()
}

impl SpotifyProviderConfig {
    /// Extract Spotify config from the dynamic providers config.
    ///
    /// # Errors
    ///
    /// Returns an error if the config cannot be parsed.
    pub fn from_providers(providers: &ProvidersConfig) -> Result<Option<Self>, CoreError> {
        providers.get(PROVIDER_NAME)
    }

    /// Validate that required fields are present.
    ///
    /// # Errors
    ///
    /// Returns an error if required fields are missing or empty.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.client_id.is_empty() {
            return Err(CoreError::ConfigMissingField {
                field: "providers.spotify.client_id".into(),
            });
        }
        if self.client_secret.is_empty() {
            return Err(CoreError::ConfigMissingField {
                field: "providers.spotify.client_secret".into(),
            });
        }
        Ok(())
    }
}

/// Config template for Spotify provider.
/// This is appended to the base config template when creating a new config file.
pub const CONFIG_TEMPLATE: &str = concatcp!(
    r#"[providers.spotify]
# Get these from https://developer.spotify.com/dashboard
# The app needs the redirect URI below registered
client_id = ""
client_secret = ""
oauth_redirect_uri = ""#,
    DEFAULT_REDIRECT_URI,
    "\"\n"
);

#[cfg(test)]
mod tests {
    use super::*;
    use listenlog_core::{build_config_template, ListenlogConfig};

    #[test]
    fn test_template_parses_with_empty_credentials() {
        let template = build_config_template(Some(&[CONFIG_TEMPLATE][..]));
        let config = ListenlogConfig::parse(&template).unwrap();

        let spotify = SpotifyProviderConfig::from_providers(&config.providers)
            .unwrap()
            .unwrap();
        assert_eq!(spotify.oauth_redirect_uri, DEFAULT_REDIRECT_URI);
        assert!(matches!(
            spotify.validate(),
            Err(CoreError::ConfigMissingField { .. })
        ));
    }

    #[test]
    fn test_redirect_uri_defaults() {
        let config = ListenlogConfig::parse(
            "[providers.spotify]\nclient_id = \"id\"\nclient_secret = \"secret\"\n",
        )
        .unwrap();
        let spotify = SpotifyProviderConfig::from_providers(&config.providers)
            .unwrap()
            .unwrap();
        assert!(spotify.validate().is_ok());
        assert_eq!(spotify.oauth_redirect_uri, DEFAULT_REDIRECT_URI);
    }
}
