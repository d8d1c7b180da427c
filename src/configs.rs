use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};

use crate::errors::{PkiError, Result};

/// Backend configuration supplied by the embedding host.
///
/// The two lease TTLs are the system-wide defaults the issuance pipeline
/// falls back to when a role leaves its own TTL fields empty.
#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    #[serde(
        default = "default_lease_ttl",
        deserialize_with = "deserialize_duration"
    )]
    pub default_lease_ttl: Duration,
    #[serde(default = "max_lease_ttl", deserialize_with = "deserialize_duration")]
    pub max_lease_ttl: Duration,
    #[serde(default)]
    pub urls: UrlEntries,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            default_lease_ttl: default_lease_ttl(),
            max_lease_ttl: max_lease_ttl(),
            urls: UrlEntries::default(),
        }
    }
}

fn default_lease_ttl() -> Duration {
    Duration::from_secs(30 * 24 * 60 * 60)
}

fn max_lease_ttl() -> Duration {
    Duration::from_secs(365 * 24 * 60 * 60)
}

/// URL sets encoded into issued certificates: AIA issuer pointers, CRL
/// distribution points, and OCSP responders. Empty lists mean the
/// corresponding extension is omitted.
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq, Eq)]
pub struct UrlEntries {
    #[serde(default)]
    pub issuing_certificates: Vec<String>,
    #[serde(default)]
    pub crl_distribution_points: Vec<String>,
    #[serde(default)]
    pub ocsp_servers: Vec<String>,
}

impl BackendConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &str) -> Result<Self> {
        let config_str = std::fs::read_to_string(path)
            .map_err(|e| PkiError::internal(format!("failed to read config file {}: {}", path, e)))?;

        let config: BackendConfig = toml::from_str(&config_str)
            .map_err(|e| PkiError::internal(format!("failed to parse config file: {}", e)))?;

        Ok(config)
    }

    /// Load configuration with default path (certmint.toml)
    pub fn load() -> Result<Self> {
        Self::from_file("certmint.toml")
    }
}

fn deserialize_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
}

/// Parse a user- or role-supplied duration string such as `"72h"` or
/// `"30d"`. The field name is included in the policy error on failure.
pub(crate) fn parse_ttl_string(field: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value)
        .map_err(|e| PkiError::user(format!("invalid {}: {}", field, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config: BackendConfig = toml::from_str("").unwrap();
        assert_eq!(config.default_lease_ttl, Duration::from_secs(30 * 86400));
        assert_eq!(config.max_lease_ttl, Duration::from_secs(365 * 86400));
        assert!(config.urls.issuing_certificates.is_empty());
    }

    #[test]
    fn test_config_from_toml() {
        let config: BackendConfig = toml::from_str(
            r#"
            default_lease_ttl = "72h"
            max_lease_ttl = "30d"

            [urls]
            issuing_certificates = ["https://pki.example.com/v1/ca"]
            crl_distribution_points = ["https://pki.example.com/v1/crl"]
            "#,
        )
        .unwrap();
        assert_eq!(config.default_lease_ttl, Duration::from_secs(72 * 3600));
        assert_eq!(config.max_lease_ttl, Duration::from_secs(30 * 86400));
        assert_eq!(
            config.urls.issuing_certificates,
            vec!["https://pki.example.com/v1/ca".to_string()]
        );
        assert!(config.urls.ocsp_servers.is_empty());
    }

    #[test]
    fn test_parse_ttl_string() {
        assert_eq!(
            parse_ttl_string("ttl", "1h").unwrap(),
            Duration::from_secs(3600)
        );
        let err = parse_ttl_string("requested ttl", "1 fortnight").unwrap_err();
        assert!(err.is_user_error());
        assert!(err.to_string().starts_with("invalid requested ttl:"));
    }
}
