//! Registry credentials supplied by the platform.

use crate::ImageError;
use std::collections::BTreeMap;

/// Environment variable holding a JSON object of registry host to `Authorization` value.
pub const REGISTRY_AUTH_ENV: &str = "CNB_REGISTRY_AUTH";

/// Per-registry `Authorization` header values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Keychain {
    headers: BTreeMap<String, String>,
}

impl Keychain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `{"registry.example": "Basic dXNlcjpwYXNz", ...}`.
    pub fn from_json(input: &str) -> Result<Self, ImageError> {
        let headers: BTreeMap<String, String> = serde_json::from_str(input)
            .map_err(|e| ImageError::Auth(format!("invalid {REGISTRY_AUTH_ENV}: {e}")))?;
        Ok(Self { headers })
    }

    /// Read credentials from [`REGISTRY_AUTH_ENV`]; unset or empty means no credentials.
    pub fn from_env() -> Result<Self, ImageError> {
        match std::env::var(REGISTRY_AUTH_ENV) {
            Ok(value) if !value.trim().is_empty() => Self::from_json(&value),
            _ => Ok(Self::new()),
        }
    }

    #[must_use]
    pub fn with(mut self, registry: &str, header: &str) -> Self {
        self.headers.insert(registry.to_owned(), header.to_owned());
        self
    }

    pub fn authorization(&self, registry: &str) -> Option<&str> {
        self.headers.get(registry).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }
}
