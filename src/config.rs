// Client configuration, read from the environment

use crate::error::ConfigError;
use reqwest::Url;

pub const DEFAULT_BASE_URL: &str = "http://localhost:5001";
pub const ENV_BASE_URL: &str = "TICKETGEN_BASE_URL";

const GENERATE_PATH: &str = "generate-ticket";
const HEALTH_PATH: &str = "health";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    base_url: String,
}

impl ClientConfig {
    /// Validates `base_url` as an absolute http(s) URL and strips trailing slashes.
    pub fn new(base_url: &str) -> Result<Self, ConfigError> {
        let trimmed = base_url.trim().trim_end_matches('/');
        let invalid = |reason: String| ConfigError::InvalidBaseUrl {
            value: base_url.to_string(),
            reason,
        };

        let url = Url::parse(trimmed).map_err(|e| invalid(e.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(invalid(format!("unsupported scheme '{}'", url.scheme())));
        }
        if url.host_str().is_none() {
            return Err(invalid("missing host".to_string()));
        }

        Ok(Self {
            base_url: trimmed.to_string(),
        })
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        match lookup(ENV_BASE_URL).filter(|value| !value.trim().is_empty()) {
            Some(value) => Self::new(&value),
            None => Self::new(DEFAULT_BASE_URL),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn generate_url(&self) -> String {
        self.endpoint(GENERATE_PATH)
    }

    pub fn health_url(&self) -> String {
        self.endpoint(HEALTH_PATH)
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn falls_back_to_default_when_unset_or_blank() {
        let config = ClientConfig::from_lookup(|_| None).expect("default config");
        assert_eq!(config.base_url(), DEFAULT_BASE_URL);

        let config = ClientConfig::from_lookup(|_| Some("  ".to_string())).expect("blank config");
        assert_eq!(config, ClientConfig::default());
    }

    #[test]
    fn reads_base_url_from_lookup_and_normalises_trailing_slash() {
        let config = ClientConfig::from_lookup(|key| {
            (key == ENV_BASE_URL).then(|| "https://tickets.example.com/api/".to_string())
        })
        .expect("config from lookup");

        assert_eq!(
            config.generate_url(),
            "https://tickets.example.com/api/generate-ticket"
        );
        assert_eq!(config.health_url(), "https://tickets.example.com/api/health");
    }

    #[test]
    fn rejects_non_http_urls() {
        let err = ClientConfig::new("ftp://example.com").expect_err("ftp is rejected");
        assert!(matches!(err, ConfigError::InvalidBaseUrl { .. }));

        assert!(ClientConfig::new("not a url").is_err());
    }
}
