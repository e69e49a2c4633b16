//! Handler registry
//!
//! Maps handler names to factories. The registry is built explicitly at
//! startup and passed to whoever needs to construct handlers, so there is no
//! process-wide registration.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use log::debug;

use crate::bypass::{Bypass, BypassSet};
use crate::chain::{DirectRouter, Router};
use crate::common::{RelayError, Result};
use crate::config::RelayConfig;

use super::handler::{Handler, SsHandler};
use super::udp::{SocketUdpRelay, UdpRelay};

/// Everything a factory needs to build a handler
#[derive(Clone)]
pub struct HandlerOptions {
    pub config: RelayConfig,
    /// Router override; a [`DirectRouter`] is built from the config otherwise
    pub router: Option<Arc<dyn Router>>,
    /// Bypass override; the config's rules are compiled otherwise
    pub bypass: Option<Arc<dyn Bypass>>,
    /// UDP relay override; a [`SocketUdpRelay`] is built otherwise
    pub udp_relay: Option<Arc<dyn UdpRelay>>,
}

impl HandlerOptions {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            router: None,
            bypass: None,
            udp_relay: None,
        }
    }

    pub fn with_router(mut self, router: Arc<dyn Router>) -> Self {
        self.router = Some(router);
        self
    }

    pub fn with_bypass(mut self, bypass: Arc<dyn Bypass>) -> Self {
        self.bypass = Some(bypass);
        self
    }

    pub fn with_udp_relay(mut self, udp_relay: Arc<dyn UdpRelay>) -> Self {
        self.udp_relay = Some(udp_relay);
        self
    }

    /// Configured or overridden bypass, `None` when there are no rules
    fn resolve_bypass(&self) -> Option<Arc<dyn Bypass>> {
        if let Some(bypass) = &self.bypass {
            return Some(bypass.clone());
        }
        let set = BypassSet::new(&self.config.bypass, self.config.bypass_whitelist);
        (!set.is_empty()).then(|| Arc::new(set) as Arc<dyn Bypass>)
    }
}

impl fmt::Debug for HandlerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerOptions")
            .field("handler", &self.config.handler)
            .field("router", &self.router.is_some())
            .field("bypass", &self.bypass.is_some())
            .field("udp_relay", &self.udp_relay.is_some())
            .finish()
    }
}

/// Handler constructor
pub type HandlerFactory = fn(HandlerOptions) -> Result<Arc<dyn Handler>>;

/// Name → factory map
#[derive(Default)]
pub struct HandlerRegistry {
    factories: BTreeMap<String, HandlerFactory>,
}

impl HandlerRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in handlers (`"ss"`)
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("ss", new_ss_handler);
        registry
    }

    /// Register `factory` under `name`, replacing any previous entry
    pub fn register(&mut self, name: impl Into<String>, factory: HandlerFactory) -> &mut Self {
        let name = name.into();
        debug!("Registering handler {}", name);
        self.factories.insert(name, factory);
        self
    }

    /// Build the handler registered under `name`
    pub fn build(&self, name: &str, options: HandlerOptions) -> Result<Arc<dyn Handler>> {
        let factory = self.factories.get(name).ok_or_else(|| {
            RelayError::Config(format!(
                "unknown handler '{}', available: {}",
                name,
                self.names().join(", ")
            ))
        })?;
        factory(options)
    }

    /// Registered names in sorted order
    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }
}

/// Factory for the Shadowsocks dispatcher
pub fn new_ss_handler(options: HandlerOptions) -> Result<Arc<dyn Handler>> {
    let config = &options.config;
    let md = config.to_metadata()?;
    let bypass = options.resolve_bypass();

    let router = options
        .router
        .clone()
        .unwrap_or_else(|| Arc::new(DirectRouter::new(config.connection_timeout())) as Arc<dyn Router>);

    let udp_relay = match options.udp_relay.clone() {
        Some(relay) => relay,
        None => {
            let mut relay = SocketUdpRelay::new(
                md.cipher.clone(),
                md.udp_buffer_size,
                config.udp_idle_timeout(),
            );
            if let Some(bypass) = &bypass {
                relay = relay.with_bypass(bypass.clone());
            }
            Arc::new(relay) as Arc<dyn UdpRelay>
        }
    };

    let mut handler = SsHandler::new(md, router, udp_relay);
    if let Some(bypass) = bypass {
        handler = handler.with_bypass(bypass);
    }
    debug!("Built handler {:?}", handler);
    Ok(Arc::new(handler))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RelayConfig {
        RelayConfig {
            password: "secret".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_default_registry() {
        let registry = HandlerRegistry::with_defaults();
        assert_eq!(registry.names(), vec!["ss"]);
        assert!(registry.build("ss", HandlerOptions::new(config())).is_ok());
    }

    #[test]
    fn test_unknown_handler() {
        let registry = HandlerRegistry::with_defaults();
        match registry.build("http", HandlerOptions::new(config())) {
            Err(RelayError::Config(msg)) => assert!(msg.contains("ss")),
            Err(other) => panic!("expected config error, got {}", other),
            Ok(_) => panic!("unknown handler was built"),
        }
        assert!(HandlerRegistry::new().names().is_empty());
    }

    #[test]
    fn test_register_custom_factory() {
        fn plain(options: HandlerOptions) -> Result<Arc<dyn Handler>> {
            let mut config = options.config.clone();
            config.method = "none".to_string();
            new_ss_handler(HandlerOptions { config, ..options })
        }

        let mut registry = HandlerRegistry::with_defaults();
        registry.register("plain", plain);
        assert_eq!(registry.names(), vec!["plain", "ss"]);
        assert!(registry
            .build("plain", HandlerOptions::new(RelayConfig::default()))
            .is_ok());
    }

    #[test]
    fn test_bad_cipher_fails_build() {
        let mut config = config();
        config.method = "rc4".to_string();
        assert!(matches!(
            HandlerRegistry::with_defaults().build("ss", HandlerOptions::new(config)),
            Err(RelayError::Config(_))
        ));
    }

    #[test]
    fn test_bypass_resolution() {
        let mut config = config();
        assert!(HandlerOptions::new(config.clone()).resolve_bypass().is_none());

        config.bypass = vec!["*.internal".to_string()];
        let bypass = HandlerOptions::new(config).resolve_bypass().unwrap();
        assert!(bypass.contains("db.internal:5432"));
    }
}
