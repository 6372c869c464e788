//! Three-part routes and the compressed route dictionary.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use crate::protocol::message::Route;
use crate::types::{Error, Result};

/// Decoded `server.service.method` route.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct RouteInfo {
    pub server: String,
    pub service: String,
    pub method: String,
}

impl RouteInfo {
    /// Parse a dotted route. Exactly two separators, no empty segment.
    pub fn parse(route: &str) -> Result<Self> {
        let mut parts = route.split('.');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(server), Some(service), Some(method), None)
                if !server.is_empty() && !service.is_empty() && !method.is_empty() =>
            {
                Ok(Self {
                    server: server.to_string(),
                    service: service.to_string(),
                    method: method.to_string(),
                })
            }
            _ => Err(Error::validation(format!("invalid route '{}'", route))),
        }
    }
}

impl fmt::Display for RouteInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.server, self.service, self.method)
    }
}

/// Route code dictionary used to expand compressed inbound messages.
#[derive(Debug, Clone, Default)]
pub struct RouteDict {
    by_code: HashMap<u16, RouteInfo>,
}

impl RouteDict {
    /// Build from the configuration table, rejecting malformed routes.
    pub fn from_config(routes: &BTreeMap<u16, String>) -> Result<Self> {
        let mut dict = Self::default();
        for (&code, route) in routes {
            dict.insert(code, RouteInfo::parse(route)?);
        }
        Ok(dict)
    }

    pub fn insert(&mut self, code: u16, info: RouteInfo) {
        self.by_code.insert(code, info);
    }

    pub fn len(&self) -> usize {
        self.by_code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_code.is_empty()
    }

    /// Resolve a wire route into its three parts.
    pub fn resolve(&self, route: &Route) -> Result<RouteInfo> {
        match route {
            Route::Name(name) => RouteInfo::parse(name),
            Route::Code(code) => self
                .by_code
                .get(code)
                .cloned()
                .ok_or_else(|| Error::not_found(format!("route code {}", code))),
        }
    }
}
