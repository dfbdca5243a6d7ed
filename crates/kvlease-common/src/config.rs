//! Store configuration

use serde::{Deserialize, Serialize};

use crate::error::{KvError, Result};

/// Where the backing table lives
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Table (or bucket) holding the items
    pub table: String,
    pub endpoints: Vec<String>,
    pub region: Option<String>,
}

impl StoreConfig {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            ..Default::default()
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoints.push(endpoint.into());
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.table.trim().is_empty() {
            return Err(KvError::InvalidConfiguration(
                "missing table name".to_string(),
            ));
        }
        if self.endpoints.len() > 1 {
            return Err(KvError::InvalidConfiguration(
                "only one endpoint is supported".to_string(),
            ));
        }
        Ok(())
    }

    /// The single configured endpoint, if any
    pub fn endpoint(&self) -> Option<&str> {
        self.endpoints.first().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_config() {
        let config = StoreConfig::new("locks")
            .with_endpoint("http://localhost:8000")
            .with_region("us-east-1");
        assert!(config.validate().is_ok());
        assert_eq!(config.endpoint(), Some("http://localhost:8000"));
        assert_eq!(config.region.as_deref(), Some("us-east-1"));
    }

    #[test]
    fn test_missing_table() {
        let err = StoreConfig::default().validate().unwrap_err();
        assert!(matches!(err, KvError::InvalidConfiguration(ref msg) if msg == "missing table name"));
    }

    #[test]
    fn test_multiple_endpoints_rejected() {
        let config = StoreConfig::new("locks")
            .with_endpoint("http://a:8000")
            .with_endpoint("http://b:8000");
        let err = config.validate().unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid configuration: only one endpoint is supported"
        );
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let config: StoreConfig = serde_json::from_str(r#"{"table":"locks"}"#).unwrap();
        assert_eq!(config, StoreConfig::new("locks"));
    }
}
