//! Configuration validator
//!
//! This module provides functionality for validating configuration.

use log::warn;

use crate::cipher::{is_plain_method, CipherError, CipherKind};
use crate::config::error::{ConfigError, Result};
use crate::config::types::RelayConfig;

/// Validate the configuration
pub fn validate_config(config: &RelayConfig) -> Result<()> {
    validate_network_settings(config)?;
    validate_cipher_settings(config)?;
    validate_general_settings(config)?;
    Ok(())
}

fn validate_network_settings(config: &RelayConfig) -> Result<()> {
    config.listen_addr()?;

    if config.handler.trim().is_empty() {
        return Err(ConfigError::MissingRequiredValue("handler".to_string()));
    }

    if config.connection_timeout == 0 {
        return Err(ConfigError::InvalidValue(
            "connection_timeout".to_string(),
            "Connection timeout must be greater than 0".to_string(),
        ));
    }

    Ok(())
}

fn validate_cipher_settings(config: &RelayConfig) -> Result<()> {
    if is_plain_method(&config.method) {
        if !config.password.is_empty() {
            warn!("Password is set but method '{}' does not encrypt", config.method);
        }
        return Ok(());
    }

    let kind: CipherKind = config.method.trim().parse()?;
    match config.key.as_deref().filter(|k| !k.is_empty()) {
        Some(key) if key.len() != kind.key_len() => Err(CipherError::InvalidKeyLength {
            expected: kind.key_len(),
            actual: key.len(),
        }
        .into()),
        Some(_) => Ok(()),
        None if config.password.is_empty() => {
            Err(ConfigError::MissingRequiredValue("password".to_string()))
        }
        None => Ok(()),
    }
}

fn validate_general_settings(config: &RelayConfig) -> Result<()> {
    match config.log_level.as_str() {
        "error" | "warn" | "info" | "debug" | "trace" => {}
        level => {
            warn!("Invalid log level: {}. Using default: info", level);
        }
    }

    if config.buffer_size == 0 {
        return Err(ConfigError::InvalidValue(
            "buffer_size".to_string(),
            "Buffer size must be greater than 0".to_string(),
        ));
    }

    if config.udp_buffer_size == 0 {
        return Err(ConfigError::InvalidValue(
            "udp_buffer_size".to_string(),
            "UDP buffer size must be greater than 0".to_string(),
        ));
    }

    if config.udp && config.udp_idle_timeout == 0 {
        return Err(ConfigError::InvalidValue(
            "udp_idle_timeout".to_string(),
            "UDP idle timeout must be greater than 0".to_string(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> RelayConfig {
        RelayConfig {
            password: "secret".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_valid_config() {
        assert!(validate_config(&valid()).is_ok());

        let mut plain = RelayConfig::default();
        plain.method = "none".to_string();
        assert!(validate_config(&plain).is_ok());
    }

    #[test]
    fn test_unknown_method() {
        let mut config = valid();
        config.method = "rc4-md5".to_string();
        assert!(matches!(
            validate_config(&config),
            Err(ConfigError::Cipher(CipherError::UnsupportedMethod(_)))
        ));
    }

    #[test]
    fn test_cipher_without_password() {
        let config = RelayConfig::default();
        assert!(matches!(
            validate_config(&config),
            Err(ConfigError::MissingRequiredValue(_))
        ));
    }

    #[test]
    fn test_key_length() {
        let mut config = RelayConfig::default();
        config.method = "aes-128-gcm".to_string();
        config.key = Some("short".to_string());
        assert!(matches!(
            validate_config(&config),
            Err(ConfigError::Cipher(CipherError::InvalidKeyLength { expected: 16, actual: 5 }))
        ));

        config.key = Some("0123456789abcdef".to_string());
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_zero_values_rejected() {
        let mut config = valid();
        config.buffer_size = 0;
        assert!(validate_config(&config).is_err());

        let mut config = valid();
        config.connection_timeout = 0;
        assert!(validate_config(&config).is_err());

        let mut config = valid();
        config.udp_buffer_size = 0;
        assert!(validate_config(&config).is_err());

        let mut config = valid();
        config.listen = "not an address".to_string();
        assert!(validate_config(&config).is_err());
    }
}
