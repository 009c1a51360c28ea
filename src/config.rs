//! Configuration management
//!
//! Loaded once at startup from an optional YAML file merged with `AUTHN_`
//! prefixed environment variables, then shared by reference with the registry,
//! the security pipeline and the signing-key cache.

use std::{env, path::Path, path::PathBuf, time::Duration};

use authn_types::{DEFAULT_AUTHENTICATOR, Webservice};
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Environment variable carrying the comma-separated authenticator allow-list.
pub const AUTHENTICATORS_ENV: &str = "AUTHN_AUTHENTICATORS";

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before the environment is read.
    /// Loaded in order, later files override earlier.
    pub env_files: Vec<String>,
    /// Default account, used by `login` and by the CLI.
    pub account: String,
    /// Operator allow-list of enabled webservices (`authn`, `authn-jwt/<id>`, ...).
    pub authenticators: Vec<String>,
    /// Server configuration
    pub server: ServerConfig,
    /// Outbound HTTP configuration
    pub http: HttpConfig,
    /// Deadline for one whole authentication call.
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Signing-key cache limits
    pub key_cache: KeyCacheConfig,
    /// JWT verification tuning
    pub jwt: JwtConfig,
    /// Access token issuance
    pub token: TokenConfig,
    /// YAML seed for the in-memory policy store.
    pub policy_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            env_files: Vec::new(),
            account: "default".to_string(),
            authenticators: Vec::new(),
            server: ServerConfig::default(),
            http: HttpConfig::default(),
            request_timeout: Duration::from_secs(30),
            key_cache: KeyCacheConfig::default(),
            jwt: JwtConfig::default(),
            token: TokenConfig::default(),
            policy_file: None,
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

/// Outbound HTTP configuration (OIDC discovery, JWKS fetch)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Per-call timeout
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Connect timeout
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Signing-key cache refresh limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyCacheConfig {
    /// Refreshes admitted per webservice per interval
    pub refreshes_per_interval: u32,
    /// Rate-limit window
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Refreshes allowed in flight across all webservices
    pub max_concurrent_refreshes: usize,
}

impl Default for KeyCacheConfig {
    fn default() -> Self {
        Self {
            refreshes_per_interval: 10,
            interval: Duration::from_secs(300),
            max_concurrent_refreshes: 3,
        }
    }
}

/// JWT verification tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JwtConfig {
    /// Clock skew tolerated on `exp`, `nbf` and `iat`
    #[serde(with = "humantime_serde")]
    pub leeway: Duration,
}

impl Default for JwtConfig {
    fn default() -> Self {
        Self {
            leeway: Duration::from_secs(60),
        }
    }
}

/// Access token issuance
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    /// Token lifetime
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    /// Base64 HMAC key. A random key is generated when empty.
    pub signing_key: String,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(8 * 60),
            signing_key: String::new(),
        }
    }
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist, cannot be parsed, or
    /// names an invalid authenticator.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        // Providers read the environment when merged, so env files named by the
        // first pass are loaded before the figment is built again.
        let bootstrap: Self = Self::figment(path)?
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;
        bootstrap.load_env_files();

        let mut config: Self = Self::figment(path)?
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        if let Ok(list) = env::var(AUTHENTICATORS_ENV) {
            config.authenticators = list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }

        config.validate()?;
        Ok(config)
    }

    fn figment(path: Option<&Path>) -> Result<Figment> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // The allow-list is a comma-separated string in the environment, not a
        // nested key, so it is read separately.
        Ok(figment.merge(
            Env::prefixed("AUTHN_")
                .ignore(&["AUTHENTICATORS"])
                .split("__"),
        ))
    }

    /// Load environment files into the process environment.
    /// Files that don't exist are skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let path = Path::new(path_str);
            if !path.exists() {
                tracing::debug!("Env file not found (skipped): {path_str}");
                continue;
            }
            match dotenvy::from_path(path) {
                Ok(()) => tracing::info!("Loaded env file: {path_str}"),
                Err(e) => tracing::warn!("Failed to load env file {path_str}: {e}"),
            }
        }
    }

    /// Check cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an unparsable allow-list entry or zero limits.
    pub fn validate(&self) -> Result<()> {
        if self.account.trim().is_empty() {
            return Err(Error::Config("account must not be empty".to_string()));
        }
        self.enabled_webservices(&self.account)?;
        if self.key_cache.refreshes_per_interval == 0 || self.key_cache.max_concurrent_refreshes == 0 {
            return Err(Error::Config(
                "key_cache limits must be greater than zero".to_string(),
            ));
        }
        if self.key_cache.interval.is_zero() {
            return Err(Error::Config("key_cache.interval must not be zero".to_string()));
        }
        Ok(())
    }

    /// Enabled webservice names. An empty allow-list enables only the default
    /// authenticator.
    #[must_use]
    pub fn enabled_names(&self) -> Vec<String> {
        if self.authenticators.is_empty() {
            vec![DEFAULT_AUTHENTICATOR.to_string()]
        } else {
            self.authenticators.clone()
        }
    }

    /// The allow-list parsed as webservices of `account`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when an entry is not a valid webservice name.
    pub fn enabled_webservices(&self, account: &str) -> Result<Vec<Webservice>> {
        self.enabled_names()
            .iter()
            .map(|name| {
                Webservice::parse(account, name)
                    .map_err(|e| Error::Config(format!("authenticators: {e}")))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_refresh_policy() {
        // GIVEN/WHEN: default config
        let config = Config::default();

        // THEN: 10 refreshes per 300 s, 3 in flight
        assert_eq!(config.key_cache.refreshes_per_interval, 10);
        assert_eq!(config.key_cache.interval, Duration::from_secs(300));
        assert_eq!(config.key_cache.max_concurrent_refreshes, 3);
        assert_eq!(config.token.ttl, Duration::from_secs(480));
    }

    #[test]
    fn empty_allow_list_enables_only_default() {
        let config = Config::default();
        assert_eq!(config.enabled_names(), vec!["authn".to_string()]);
    }

    #[test]
    fn load_reads_yaml_file() {
        // GIVEN: a YAML config file
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "account: acme\nauthenticators: [authn, authn-jwt/gitlab]\nkey_cache:\n  interval: 2m\njwt:\n  leeway: 5s"
        )
        .unwrap();

        // WHEN: loading
        let config = Config::load(Some(file.path())).unwrap();

        // THEN: values are applied, durations parsed
        assert_eq!(config.account, "acme");
        assert_eq!(config.key_cache.interval, Duration::from_secs(120));
        assert_eq!(config.jwt.leeway, Duration::from_secs(5));
        let enabled: Vec<String> = config
            .enabled_webservices("acme")
            .unwrap()
            .iter()
            .map(Webservice::name)
            .collect();
        assert_eq!(enabled, vec!["authn", "authn-jwt/gitlab"]);
    }

    #[test]
    fn env_file_values_reach_the_config() {
        // GIVEN: a YAML file naming an env file that sets the token lifetime
        let mut env_file = tempfile::NamedTempFile::new().unwrap();
        writeln!(env_file, "AUTHN_TOKEN__TTL=3m").unwrap();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "env_files: [\"{}\"]", env_file.path().display()).unwrap();

        // WHEN
        let config = Config::load(Some(file.path())).unwrap();

        // THEN: the env file value overrides the default
        assert_eq!(config.token.ttl, Duration::from_secs(180));
    }

    #[test]
    fn load_rejects_missing_file() {
        let err = Config::load(Some(Path::new("/nonexistent/authn.yaml"))).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn validate_rejects_service_less_jwt_entry() {
        // GIVEN: an allow-list entry without service id
        let config = Config {
            authenticators: vec!["authn-jwt".to_string()],
            ..Config::default()
        };

        // THEN: rejected at startup
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_limits() {
        let mut config = Config::default();
        config.key_cache.max_concurrent_refreshes = 0;
        assert!(config.validate().is_err());
    }
}
