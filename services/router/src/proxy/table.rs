//! Routing table: service identifier to backend address.
//!
//! The table is built once from configuration and never mutated. It is
//! shared across connection tasks behind an `Arc` without locking.
//!
//! - Exact identifier match only (no wildcards, no case folding)
//! - A fallback destination is always present
//! - Duplicate identifiers are rejected at construction

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::Deserialize;

use crate::error::ConfigError;

/// Backend address as written in configuration, before validation.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Endpoint {
    pub host: String,
    /// Kept wide so that out-of-range values surface as `ConfigError::InvalidPort`.
    pub port: i64,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: i64) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

/// A validated backend address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    pub host: String,
    pub port: u16,
}

impl Destination {
    fn from_endpoint(endpoint: &Endpoint, context: impl Fn() -> String) -> Result<Self, ConfigError> {
        if endpoint.host.trim().is_empty() {
            return Err(ConfigError::EmptyHost { context: context() });
        }

        let port = u16::try_from(endpoint.port)
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(|| ConfigError::InvalidPort {
                context: context(),
                port: endpoint.port,
            })?;

        Ok(Self {
            host: endpoint.host.clone(),
            port,
        })
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') && !self.host.starts_with('[') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// A single service route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRoute {
    pub identifier: String,
    pub destination: Destination,
}

/// Immutable identifier -> destination mapping with a fallback.
#[derive(Debug, Clone)]
pub struct RoutingTable {
    routes: HashMap<String, ServiceRoute>,
    fallback: Destination,
}

impl RoutingTable {
    /// Build a table from configured entries.
    ///
    /// Entries are taken in configuration order so that a duplicate is
    /// reported by name rather than silently overwritten.
    pub fn new(
        services: impl IntoIterator<Item = (String, Endpoint)>,
        fallback: Option<Endpoint>,
    ) -> Result<Self, ConfigError> {
        let fallback = fallback.ok_or(ConfigError::MissingFallback)?;
        let fallback = Destination::from_endpoint(&fallback, || "default_fallback".to_string())?;

        let mut routes = HashMap::new();
        for (identifier, endpoint) in services {
            if identifier.is_empty() {
                return Err(ConfigError::EmptyIdentifier);
            }
            if routes.contains_key(&identifier) {
                return Err(ConfigError::DuplicateIdentifier(identifier));
            }

            let destination =
                Destination::from_endpoint(&endpoint, || format!("service '{}'", identifier))?;
            routes.insert(
                identifier.clone(),
                ServiceRoute {
                    identifier,
                    destination,
                },
            );
        }

        Ok(Self { routes, fallback })
    }

    /// Resolve an identifier to a destination, falling back on a miss.
    pub fn resolve(&self, identifier: &str) -> &Destination {
        self.get(identifier)
            .map(|route| &route.destination)
            .unwrap_or(&self.fallback)
    }

    /// Look up an exact route.
    pub fn get(&self, identifier: &str) -> Option<&ServiceRoute> {
        if identifier.is_empty() {
            return None;
        }
        self.routes.get(identifier)
    }

    pub fn fallback(&self) -> &Destination {
        &self.fallback
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Configured identifiers, sorted.
    pub fn identifiers(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.routes.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}

/// Shared routing table reference.
pub type SharedRoutingTable = Arc<RoutingTable>;
