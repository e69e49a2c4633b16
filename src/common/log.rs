//! Logging utilities
//!
//! Wraps `env_logger` initialization and provides [`SessionLogger`], which
//! appends per-session `key=value` fields (remote, local, dst, ...) to every
//! line it emits through the `log` facade.

use std::fmt;

/// Initialize the logging system
///
/// `RUST_LOG` takes precedence over `level` when set.
///
/// # Parameters
///
/// * `level` - Log level used when `RUST_LOG` is absent
pub fn init_logger(level: &str) {
    let env = env_logger::Env::default()
        .filter_or("RUST_LOG", level);

    // A second initialization (tests, embedding binaries) is not an error for us.
    let _ = env_logger::Builder::from_env(env).try_init();
}

/// Logger carrying session fields.
///
/// Cloning is cheap enough for the handful of fields a session carries; adding
/// a field returns a new logger so earlier holders keep their view.
#[derive(Debug, Clone, Default)]
pub struct SessionLogger {
    fields: Vec<(&'static str, String)>,
}

impl SessionLogger {
    /// Create a logger without fields
    pub fn new() -> Self {
        Self::default()
    }

    /// Return a logger with one more field
    pub fn with_field(&self, key: &'static str, value: impl fmt::Display) -> Self {
        let mut fields = self.fields.clone();
        fields.push((key, value.to_string()));
        Self { fields }
    }

    /// Value of a field, if present
    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .rev()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn error(&self, msg: impl fmt::Display) {
        ::log::error!("{} {}", msg, self);
    }

    pub fn info(&self, msg: impl fmt::Display) {
        ::log::info!("{} {}", msg, self);
    }

    pub fn debug(&self, msg: impl fmt::Display) {
        ::log::debug!("{} {}", msg, self);
    }
}

impl fmt::Display for SessionLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (key, value)) in self.fields.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{}={}", key, value)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logger() {
        // Only makes sure repeated initialization does not panic
        init_logger("debug");
        init_logger("info");
    }

    #[test]
    fn test_session_fields() {
        let base = SessionLogger::new().with_field("remote", "127.0.0.1:5000");
        let derived = base.with_field("dst", "example.com:80");

        assert_eq!(base.to_string(), "remote=127.0.0.1:5000");
        assert_eq!(derived.to_string(), "remote=127.0.0.1:5000 dst=example.com:80");
        assert_eq!(derived.field("dst"), Some("example.com:80"));
        assert_eq!(base.field("dst"), None);
    }
}
