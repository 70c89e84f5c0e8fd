//! ICE server configuration loaded from environment variables.

use murmur_shared::constants::DEFAULT_STUN_URL;

/// TURN relay credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnServer {
    pub url: String,
    pub username: String,
    pub credential: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceConfig {
    /// Env: `MURMUR_STUN_URLS` (comma separated)
    /// Default: one public STUN server.
    pub stun_urls: Vec<String>,

    /// Env: `MURMUR_TURN_URL`, `MURMUR_TURN_USERNAME`, `MURMUR_TURN_CREDENTIAL`
    /// Default: none, so calls behind symmetric NAT will not connect.
    pub turn: Option<TurnServer>,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_urls: vec![DEFAULT_STUN_URL.to_string()],
            turn: None,
        }
    }
}

impl IceConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`IceConfig::from_env`] with an injectable variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(urls) = lookup("MURMUR_STUN_URLS") {
            let urls: Vec<String> = urls
                .split(',')
                .map(str::trim)
                .filter(|u| !u.is_empty())
                .map(str::to_string)
                .collect();
            if urls.is_empty() {
                tracing::warn!("Empty MURMUR_STUN_URLS, using default");
            } else {
                config.stun_urls = urls;
            }
        }

        if let Some(url) = lookup("MURMUR_TURN_URL").filter(|u| !u.is_empty()) {
            match (lookup("MURMUR_TURN_USERNAME"), lookup("MURMUR_TURN_CREDENTIAL")) {
                (Some(username), Some(credential)) => {
                    config.turn = Some(TurnServer {
                        url,
                        username,
                        credential,
                    });
                }
                _ => {
                    tracing::warn!(
                        url = %url,
                        "MURMUR_TURN_URL set without credentials, relay disabled"
                    );
                }
            }
        }

        config
    }
}
