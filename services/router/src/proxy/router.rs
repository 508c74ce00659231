//! Routing decisions.
//!
//! Maps the outcome of key extraction onto a destination. This is a pure
//! lookup over the routing table: it never performs I/O and always yields
//! a destination, either the matched service or the fallback.

use std::fmt;

use tracing::debug;

use super::table::{Destination, RoutingTable};

/// Why a connection went to the fallback backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FallbackReason {
    /// No identifier could be extracted from the connection.
    NoIdentifier,
    /// An identifier was extracted but no route is configured for it.
    UnknownService(String),
}

impl fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FallbackReason::NoIdentifier => write!(f, "no service identifier"),
            FallbackReason::UnknownService(id) => write!(f, "no route for service '{}'", id),
        }
    }
}

/// Result of a routing decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingDecision {
    /// Identifier matched a configured service.
    Matched {
        service: String,
        destination: Destination,
    },
    /// Routed to the fallback backend.
    Fallback {
        reason: FallbackReason,
        destination: Destination,
    },
}

impl RoutingDecision {
    pub fn destination(&self) -> &Destination {
        match self {
            RoutingDecision::Matched { destination, .. } => destination,
            RoutingDecision::Fallback { destination, .. } => destination,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, RoutingDecision::Fallback { .. })
    }
}

impl RoutingTable {
    /// Decide where a connection goes given its (possibly absent) identifier.
    pub fn route(&self, identifier: Option<&str>) -> RoutingDecision {
        let Some(identifier) = identifier.filter(|id| !id.is_empty()) else {
            debug!(destination = %self.fallback(), "No identifier, using fallback");
            return RoutingDecision::Fallback {
                reason: FallbackReason::NoIdentifier,
                destination: self.fallback().clone(),
            };
        };

        match self.get(identifier) {
            Some(route) => {
                debug!(
                    service = %identifier,
                    destination = %route.destination,
                    "Route matched"
                );
                RoutingDecision::Matched {
                    service: route.identifier.clone(),
                    destination: route.destination.clone(),
                }
            }
            None => {
                debug!(
                    service = %identifier,
                    destination = %self.fallback(),
                    "Unknown service, using fallback"
                );
                RoutingDecision::Fallback {
                    reason: FallbackReason::UnknownService(identifier.to_string()),
                    destination: self.fallback().clone(),
                }
            }
        }
    }
}
