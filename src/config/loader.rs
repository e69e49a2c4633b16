//! Configuration loader implementation
//!
//! Layers, lowest priority first:
//! 1. Default values (serde defaults)
//! 2. Configuration file (JSON)
//! 3. Environment variables (`SHADOW_RELAY_*`)
//! 4. Command line arguments, applied by the caller through
//!    [`RelayConfig::apply`](crate::config::RelayConfig::apply)

use std::path::{Path, PathBuf};

use config::{Config, Environment, File, FileFormat};
use log::debug;

use crate::config::defaults;
use crate::config::error::Result;
use crate::config::types::RelayConfig;
use crate::config::validator::validate_config;

impl RelayConfig {
    /// Load configuration from defaults, an optional file and the environment.
    ///
    /// An explicitly given file must exist. Without one, the file named by
    /// `SHADOW_RELAY_CONFIG_FILE` is used when set, and a missing file is
    /// not an error. The result is not validated; call
    /// [`RelayConfig::validate`] once every layer has been applied.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (config_path, required) = match path {
            Some(p) => (Some(p.to_path_buf()), true),
            None => (std::env::var(defaults::CONFIG_FILE_ENV).ok().map(PathBuf::from), false),
        };

        let mut builder = Config::builder();
        if let Some(path) = &config_path {
            builder = builder.add_source(
                File::from(path.as_path())
                    .format(FileFormat::Json)
                    .required(required),
            );
        }
        builder = builder.add_source(
            Environment::with_prefix(defaults::ENV_PREFIX)
                .prefix_separator("_")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("bypass"),
        );

        let config: RelayConfig = builder.build()?.try_deserialize()?;
        if let Some(path) = config_path.filter(|p| p.exists()) {
            debug!("Configuration loaded from {}", path.display());
        }
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        validate_config(self)?;
        debug!("Configuration validated successfully");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    #[serial]
    fn test_load_defaults_without_file() {
        let config = RelayConfig::load(None).unwrap();
        assert_eq!(config, RelayConfig::default());
    }

    #[test]
    #[serial]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"listen": "127.0.0.1:8400", "password": "pw", "retries": 2, "bypass": ["*.local"]}}"#
        )
        .unwrap();

        let config = RelayConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.listen, "127.0.0.1:8400");
        assert_eq!(config.password, "pw");
        assert_eq!(config.retries, 2);
        assert_eq!(config.bypass, vec!["*.local".to_string()]);
        assert!(config.validate().is_ok());
    }

    #[test]
    #[serial]
    fn test_missing_explicit_file_is_error() {
        let result = RelayConfig::load(Some(Path::new("/nonexistent/relay.json")));
        assert!(result.is_err());
    }
}
