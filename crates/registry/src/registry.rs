//! Service discovery: logical name → base URL.
//!
//! Lookup order: env var `<LOGICAL>_SERVICE_URL`, then the compiled default
//! map, then `UnknownService`. The map is built once and immutable after
//! process start.

use std::collections::HashMap;
use std::sync::OnceLock;

use thiserror::Error;

/// Logical services the platform knows about, each defaulting to
/// `http://<name>:8000` on the internal network.
const KNOWN_SERVICES: &[&str] = &[
    "auth",
    "company",
    "product",
    "inventory",
    "pos",
    "purchase",
    "hrms",
    "manufacturing",
    "accounting",
    "notification",
    "reporting",
    "promotion",
    "payment",
    "intelligence",
    "quality",
    "logistics",
    "asset",
    "customer",
];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("unknown service '{0}'")]
    UnknownService(String),
}

/// Immutable name → base URL map.
#[derive(Debug)]
pub struct ServiceRegistry {
    urls: HashMap<String, String>,
}

impl ServiceRegistry {
    /// Build the registry from compiled defaults plus env overrides.
    ///
    /// `INVENTORY_SERVICE_URL=http://10.0.0.7:9000` overrides the default for
    /// `inventory`; overrides are read exactly once, here.
    pub fn from_env() -> Self {
        let urls = KNOWN_SERVICES
            .iter()
            .map(|name| {
                let env_key = format!("{}_SERVICE_URL", name.to_uppercase());
                let url = std::env::var(&env_key)
                    .ok()
                    .filter(|v| !v.is_empty())
                    .unwrap_or_else(|| format!("http://{name}:8000"));
                (name.to_string(), url)
            })
            .collect();
        Self { urls }
    }

    /// Process-wide registry, initialized on first use.
    pub fn global() -> &'static ServiceRegistry {
        static GLOBAL: OnceLock<ServiceRegistry> = OnceLock::new();
        GLOBAL.get_or_init(ServiceRegistry::from_env)
    }

    /// Build a registry from an explicit map (tests).
    pub fn from_map(urls: HashMap<String, String>) -> Self {
        Self { urls }
    }

    /// Resolve a logical name to its base URL.
    pub fn resolve(&self, name: &str) -> Result<&str, RegistryError> {
        self.urls
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| RegistryError::UnknownService(name.to_string()))
    }

    /// Resolve to the service's API root (`<base>/api`).
    pub fn get_api_url(&self, name: &str) -> Result<String, RegistryError> {
        Ok(format!("{}/api", self.resolve(name)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compiled_defaults_cover_known_services() {
        let registry = ServiceRegistry::from_map(
            KNOWN_SERVICES
                .iter()
                .map(|n| (n.to_string(), format!("http://{n}:8000")))
                .collect(),
        );
        assert_eq!(registry.resolve("inventory").unwrap(), "http://inventory:8000");
        assert_eq!(
            registry.get_api_url("accounting").unwrap(),
            "http://accounting:8000/api"
        );
    }

    #[test]
    fn unknown_service_errors() {
        let registry = ServiceRegistry::from_map(HashMap::new());
        assert_eq!(
            registry.resolve("warp-drive"),
            Err(RegistryError::UnknownService("warp-drive".to_string()))
        );
    }

    #[test]
    fn override_wins_over_default() {
        let mut urls: HashMap<String, String> = KNOWN_SERVICES
            .iter()
            .map(|n| (n.to_string(), format!("http://{n}:8000")))
            .collect();
        urls.insert("pos".to_string(), "http://10.0.0.7:9000".to_string());
        let registry = ServiceRegistry::from_map(urls);
        assert_eq!(registry.resolve("pos").unwrap(), "http://10.0.0.7:9000");
    }
}
