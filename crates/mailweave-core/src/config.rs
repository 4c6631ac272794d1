//! Session configuration.

use std::path::Path;

use mailweave_mime::DecodeOptions;
use mailweave_mime::compose::DEFAULT_DOMAIN;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::scheduler::SchedulerConfig;

/// Settings for a [`MailSession`](crate::MailSession).
///
/// Every field has a default, so a config file only needs the values it
/// changes:
///
/// ```json
/// {
///   "scheduler": { "max_concurrent": 2, "retry_server_errors": true },
///   "decode": { "preview_chars": 120 },
///   "compose_domain": "example.com"
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Request scheduling limits.
    pub scheduler: SchedulerConfig,
    /// Body decoding options.
    pub decode: DecodeOptions,
    /// Domain used in generated Message-IDs and Content-IDs.
    pub compose_domain: String,
    /// Page size used when a caller passes zero to `list_messages`.
    pub page_size: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            decode: DecodeOptions::default(),
            compose_domain: DEFAULT_DOMAIN.to_string(),
            page_size: 50,
        }
    }
}

impl SessionConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the scheduler configuration.
    #[must_use]
    pub fn scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// Sets the decode options.
    #[must_use]
    pub const fn decode(mut self, decode: DecodeOptions) -> Self {
        self.decode = decode;
        self
    }

    /// Sets the compose domain.
    #[must_use]
    pub fn compose_domain(mut self, domain: impl Into<String>) -> Self {
        self.compose_domain = domain.into();
        self
    }

    /// Parses a JSON configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is malformed or the values are invalid.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a JSON configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or does not parse.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = tokio::fs::read_to_string(path).await?;
        let config = Self::from_json(&contents)?;
        tracing::debug!(path = %path.display(), "loaded session config");
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.scheduler.max_concurrent == 0 {
            return Err(Error::Config(
                "scheduler.max_concurrent must be at least 1".to_string(),
            ));
        }
        if self.scheduler.base_delay_ms > self.scheduler.max_delay_ms {
            return Err(Error::Config(
                "scheduler.base_delay_ms exceeds scheduler.max_delay_ms".to_string(),
            ));
        }
        if self.compose_domain.trim().is_empty() {
            return Err(Error::Config("compose_domain is empty".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = SessionConfig::from_json(
            r#"{"scheduler": {"max_concurrent": 2}, "compose_domain": "example.com"}"#,
        )
        .unwrap();

        assert_eq!(config.scheduler.max_concurrent, 2);
        assert_eq!(config.scheduler.max_retries, 3);
        assert_eq!(config.compose_domain, "example.com");
        assert_eq!(config.decode, DecodeOptions::default());
        assert_eq!(config.page_size, 50);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let zero = SessionConfig::from_json(r#"{"scheduler": {"max_concurrent": 0}}"#);
        assert!(matches!(zero, Err(Error::Config(_))));

        let inverted = SessionConfig::from_json(
            r#"{"scheduler": {"base_delay_ms": 5000, "max_delay_ms": 10}}"#,
        );
        assert!(matches!(inverted, Err(Error::Config(_))));

        let malformed = SessionConfig::from_json("{");
        assert!(matches!(malformed, Err(Error::Serde(_))));
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let result = SessionConfig::load("/nonexistent/mailweave/config.json").await;
        assert!(matches!(result, Err(Error::Io(_))));
    }

    #[tokio::test]
    async fn test_load_file() {
        let path = std::env::temp_dir().join(format!("mailweave-config-{}.json", std::process::id()));
        tokio::fs::write(&path, r#"{"decode": {"preview_chars": 80}}"#)
            .await
            .unwrap();

        let config = SessionConfig::load(&path).await.unwrap();
        tokio::fs::remove_file(&path).await.unwrap();

        assert_eq!(config.decode.preview_chars, 80);
    }
}
