use crate::domain::error::{AppError, Result};
use keyring::Entry;

pub struct KeyringManager {
    service: String,
}

impl KeyringManager {
    pub fn new(service: &str) -> Self {
        Self {
            service: service.to_string(),
        }
    }

    pub fn get_secret(&self, key: &str) -> Result<String> {
        let entry = Entry::new(&self.service, key).map_err(|e| {
            AppError::ConfigurationError(format!("Failed to access keychain: {}", e))
        })?;

        entry.get_password().map_err(|e| {
            AppError::ConfigurationError(format!(
                "Failed to retrieve '{}' from keychain: {}",
                key, e
            ))
        })
    }
}

/// Resolves a secret reference.
///
/// - `env:VAR` reads the environment variable `VAR`
/// - `keychain:NAME` reads entry `NAME` of the `text2sql` OS keychain service
/// - `plain:VALUE` returns `VALUE` (development only)
/// - anything else is taken literally
pub fn resolve_secret(reference: &str) -> Result<String> {
    if let Some(env_key) = reference.strip_prefix("env:") {
        std::env::var(env_key).map_err(|_| {
            AppError::ConfigurationError(format!(
                "Environment variable '{}' not found for password",
                env_key
            ))
        })
    } else if let Some(key_name) = reference.strip_prefix("keychain:") {
        KeyringManager::new("text2sql").get_secret(key_name)
    } else if let Some(value) = reference.strip_prefix("plain:") {
        Ok(value.to_string())
    } else {
        Ok(reference.to_string())
    }
}
