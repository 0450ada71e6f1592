//! Authority configuration.

use std::{net::SocketAddr, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

/// Environment variable overriding the callback timeout, in milliseconds.
pub const ENV_CALLBACK_TIMEOUT_MS: &str = "SHARED_CACHE_CALLBACK_TIMEOUT_MS";
/// Environment variable overriding the store root directory.
pub const ENV_STORE_ROOT: &str = "SHARED_CACHE_ROOT";
/// Environment variable overriding the listen address.
pub const ENV_BIND_ADDR: &str = "SHARED_CACHE_BIND";

const DEFAULT_CALLBACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Runtime settings for an authority process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthorityConfig {
    /// Upper bound on a single `invalidate` or `writeback` callback.
    pub callback_timeout: Duration,
    /// Directory file names are resolved against.
    pub store_root: PathBuf,
    /// Address the transport listens on.
    pub bind_addr: SocketAddr,
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            callback_timeout: DEFAULT_CALLBACK_TIMEOUT,
            store_root: PathBuf::from("."),
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 7878)),
        }
    }
}

impl AuthorityConfig {
    /// Defaults overlaid with any `SHARED_CACHE_*` environment variables.
    ///
    /// Unparseable values are ignored with a warning.
    #[must_use]
    pub fn from_env() -> Self {
        Self::default().overlay(|key| std::env::var(key).ok())
    }

    /// Set the callback timeout.
    #[must_use]
    pub const fn with_callback_timeout(mut self, timeout: Duration) -> Self {
        self.callback_timeout = timeout;
        self
    }

    fn overlay(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(raw) = lookup(ENV_CALLBACK_TIMEOUT_MS) {
            match raw.parse::<u64>() {
                Ok(ms) => self.callback_timeout = Duration::from_millis(ms),
                Err(e) => tracing::warn!(value = %raw, "Ignoring {ENV_CALLBACK_TIMEOUT_MS}: {e}"),
            }
        }
        if let Some(raw) = lookup(ENV_STORE_ROOT) {
            self.store_root = PathBuf::from(raw);
        }
        if let Some(raw) = lookup(ENV_BIND_ADDR) {
            match raw.parse::<SocketAddr>() {
                Ok(addr) => self.bind_addr = addr,
                Err(e) => tracing::warn!(value = %raw, "Ignoring {ENV_BIND_ADDR}: {e}"),
            }
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn test_overlay_applies_valid_values() {
        let env = HashMap::from([
            (ENV_CALLBACK_TIMEOUT_MS, "250"),
            (ENV_STORE_ROOT, "/srv/files"),
            (ENV_BIND_ADDR, "0.0.0.0:9000"),
        ]);
        let config = AuthorityConfig::default().overlay(|k| env.get(k).map(ToString::to_string));

        assert_eq!(config.callback_timeout, Duration::from_millis(250));
        assert_eq!(config.store_root, PathBuf::from("/srv/files"));
        assert_eq!(config.bind_addr.port(), 9000);
    }

    #[test]
    fn test_overlay_ignores_garbage() {
        let env = HashMap::from([(ENV_CALLBACK_TIMEOUT_MS, "soon"), (ENV_BIND_ADDR, "nowhere")]);
        let config = AuthorityConfig::default().overlay(|k| env.get(k).map(ToString::to_string));

        assert_eq!(config, AuthorityConfig::default());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: AuthorityConfig =
            serde_json::from_str(r#"{"store_root": "/data"}"#).unwrap();
        assert_eq!(config.store_root, PathBuf::from("/data"));
        assert_eq!(config.callback_timeout, DEFAULT_CALLBACK_TIMEOUT);
    }
}
