//! Explicit runtime configuration, validated when it is built.

use std::fmt;

use thiserror::Error;

pub const DEFAULT_COMMUNITIES: &[&str] = &["python", "learnpython"];
pub const DEFAULT_POST_LIMIT: usize = 10;
pub const DEFAULT_BATCH_SIZE: usize = 1000;
pub const DEFAULT_DB_PORT: u16 = 5432;

pub const REDDIT_AUTH_URL: &str = "https://www.reddit.com";
pub const REDDIT_API_URL: &str = "https://oauth.reddit.com";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required setting {var}")]
    Missing { var: &'static str },
    #[error("invalid value {value:?} for {var}")]
    Invalid { var: &'static str, value: String },
}

fn required(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<String, ConfigError> {
    lookup(var)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or(ConfigError::Missing { var })
}

fn optional(lookup: &impl Fn(&str) -> Option<String>, var: &str) -> Option<String> {
    lookup(var)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parsed<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match optional(lookup, var) {
        None => Ok(default),
        Some(value) => value.parse().map_err(|_| ConfigError::Invalid { var, value }),
    }
}

fn env_lookup(var: &str) -> Option<String> {
    std::env::var(var).ok()
}

/// Relational store session settings.
#[derive(Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: Option<String>,
    pub database: String,
}

impl DatabaseConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        Ok(Self {
            host: required(&lookup, "DB_HOST")?,
            port: parsed(&lookup, "DB_PORT", DEFAULT_DB_PORT)?,
            username: required(&lookup, "DB_USERNAME")?,
            password: optional(&lookup, "DB_PASSWORD"),
            database: required(&lookup, "DB_NAME")?,
        })
    }
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("database", &self.database)
            .finish()
    }
}

/// Platform API credentials and endpoints.
#[derive(Clone, PartialEq, Eq)]
pub struct RedditConfig {
    pub client_id: String,
    pub client_secret: String,
    pub user_agent: String,
    pub auth_url: String,
    pub api_url: String,
}

impl RedditConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        Ok(Self {
            client_id: required(&lookup, "REDDIT_CLIENT_ID")?,
            client_secret: required(&lookup, "REDDIT_CLIENT_SECRET")?,
            user_agent: required(&lookup, "REDDIT_USER_AGENT")?,
            auth_url: optional(&lookup, "REDDIT_AUTH_URL")
                .unwrap_or_else(|| REDDIT_AUTH_URL.to_string()),
            api_url: optional(&lookup, "REDDIT_API_URL")
                .unwrap_or_else(|| REDDIT_API_URL.to_string()),
        })
    }
}

impl fmt::Debug for RedditConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedditConfig")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("user_agent", &self.user_agent)
            .field("auth_url", &self.auth_url)
            .field("api_url", &self.api_url)
            .finish()
    }
}

/// Defaults used when a caller does not pass explicit collection settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScraperDefaults {
    pub communities: Vec<String>,
    pub post_limit: usize,
    pub batch_size: usize,
}

impl Default for ScraperDefaults {
    fn default() -> Self {
        Self {
            communities: DEFAULT_COMMUNITIES.iter().map(|s| s.to_string()).collect(),
            post_limit: DEFAULT_POST_LIMIT,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

impl ScraperDefaults {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let base = Self::default();
        let communities = match optional(&lookup, "REDSCRAPE_SUBREDDITS") {
            Some(list) => parse_community_list(&list),
            None => base.communities,
        };
        let post_limit = parsed(&lookup, "REDSCRAPE_POST_LIMIT", base.post_limit)?;
        let batch_size = parsed(&lookup, "REDSCRAPE_BATCH_SIZE", base.batch_size)?;
        if batch_size == 0 {
            return Err(ConfigError::Invalid {
                var: "REDSCRAPE_BATCH_SIZE",
                value: "0".into(),
            });
        }
        Ok(Self {
            communities,
            post_limit,
            batch_size,
        })
    }
}

/// Split a comma-separated community list, dropping blanks and `r/` prefixes.
pub fn parse_community_list(input: &str) -> Vec<String> {
    input
        .split(',')
        .map(|s| s.trim().trim_start_matches("r/").to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn database_config_requires_host_user_and_name() {
        let err = DatabaseConfig::from_lookup(lookup_from(&[
            ("DB_HOST", "localhost"),
            ("DB_NAME", "reddit"),
        ]))
        .unwrap_err();
        assert_eq!(err, ConfigError::Missing { var: "DB_USERNAME" });

        let cfg = DatabaseConfig::from_lookup(lookup_from(&[
            ("DB_HOST", "localhost"),
            ("DB_USERNAME", "scraper"),
            ("DB_NAME", "reddit"),
        ]))
        .unwrap();
        assert_eq!(cfg.port, DEFAULT_DB_PORT);
        assert_eq!(cfg.password, None);
    }

    #[test]
    fn database_port_must_parse() {
        let err = DatabaseConfig::from_lookup(lookup_from(&[
            ("DB_HOST", "localhost"),
            ("DB_PORT", "not-a-port"),
            ("DB_USERNAME", "scraper"),
            ("DB_NAME", "reddit"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "DB_PORT", .. }));
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let cfg = DatabaseConfig {
            host: "h".into(),
            port: 5432,
            username: "u".into(),
            password: Some("hunter2".into()),
            database: "d".into(),
        };
        assert!(!format!("{cfg:?}").contains("hunter2"));
    }

    #[test]
    fn reddit_credentials_are_all_required() {
        let err = RedditConfig::from_lookup(lookup_from(&[
            ("REDDIT_CLIENT_ID", "id"),
            ("REDDIT_CLIENT_SECRET", "   "),
            ("REDDIT_USER_AGENT", "ua"),
        ]))
        .unwrap_err();
        assert_eq!(
            err,
            ConfigError::Missing {
                var: "REDDIT_CLIENT_SECRET"
            }
        );

        let cfg = RedditConfig::from_lookup(lookup_from(&[
            ("REDDIT_CLIENT_ID", "id"),
            ("REDDIT_CLIENT_SECRET", "secret"),
            ("REDDIT_USER_AGENT", "ua"),
        ]))
        .unwrap();
        assert_eq!(cfg.api_url, REDDIT_API_URL);
        assert!(!format!("{cfg:?}").contains("secret\""));
    }

    #[test]
    fn scraper_defaults_fall_back_and_override() {
        let defaults = ScraperDefaults::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(defaults, ScraperDefaults::default());
        assert_eq!(defaults.communities, vec!["python", "learnpython"]);

        let custom = ScraperDefaults::from_lookup(lookup_from(&[
            ("REDSCRAPE_SUBREDDITS", "rust, r/programming,,"),
            ("REDSCRAPE_POST_LIMIT", "25"),
        ]))
        .unwrap();
        assert_eq!(custom.communities, vec!["rust", "programming"]);
        assert_eq!(custom.post_limit, 25);
        assert_eq!(custom.batch_size, DEFAULT_BATCH_SIZE);
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let err =
            ScraperDefaults::from_lookup(lookup_from(&[("REDSCRAPE_BATCH_SIZE", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "REDSCRAPE_BATCH_SIZE", .. }));
    }
}
