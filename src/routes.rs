// SPDX-License-Identifier: Apache-2.0
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use tracing::{info, warn};
use url::Url;

use crate::auth::PermissionLevel;

/// Paths owned by the gateway itself; no backend service may shadow them.
pub const RESERVED_NAMES: &[&str] = &[
    "login", "logout", "health", "static", "oidc", "api", "realms", "resources",
];

/// One backend service reachable at `/<name>/...`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct RouteDescriptor {
    pub name: String,
    #[serde(rename = "url")]
    pub base_url: String,
    #[serde(default = "default_visible")]
    pub visible: bool,
    #[serde(default)]
    pub admin_only: bool,
    #[serde(default)]
    pub billing_or_admin_only: bool,
}

fn default_visible() -> bool {
    true
}

impl RouteDescriptor {
    /// Whether a user with the given permission may see and reach this route.
    pub fn accessible_to(&self, permission: PermissionLevel) -> bool {
        if self.admin_only && permission != PermissionLevel::Admin {
            return false;
        }
        if self.billing_or_admin_only
            && !matches!(permission, PermissionLevel::Admin | PermissionLevel::Billing)
        {
            return false;
        }
        true
    }

    /// Human readable label for navigation ("knowledgetree" -> "Knowledgetree").
    pub fn display_name(&self) -> String {
        let mut chars = self.name.chars();
        match chars.next() {
            Some(first) => first.to_uppercase().chain(chars).collect(),
            None => String::new(),
        }
    }
}

/// Shortcut path answered with a redirect, e.g. `/helpdesk` -> `/beacon/helpdesk`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct RouteAlias {
    pub path: String,
    pub target: String,
}

#[derive(Debug, Deserialize)]
struct RouteFile {
    #[serde(default)]
    service: Vec<RouteDescriptor>,
    #[serde(default)]
    alias: Vec<RouteAlias>,
}

#[derive(Debug, thiserror::Error)]
pub enum RouteConfigError {
    #[error("failed to read route file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse route file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid route '{name}': {reason}")]
    Invalid { name: String, reason: String },
}

/// Read-only mapping of service name to backend, in configured order.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: Vec<RouteDescriptor>,
    aliases: Vec<RouteAlias>,
}

impl RouteTable {
    /// Validate routes. `idp_prefix` is the identity-provider sub-path, whose
    /// first segment is reserved alongside [`RESERVED_NAMES`].
    pub fn new(
        routes: Vec<RouteDescriptor>,
        aliases: Vec<RouteAlias>,
        idp_prefix: &str,
    ) -> Result<Self, RouteConfigError> {
        let idp_segment = idp_prefix.trim_start_matches('/').split('/').next().unwrap_or("");
        let mut seen = HashSet::new();
        let mut routes = routes;
        for route in &mut routes {
            let invalid = |reason: &str| RouteConfigError::Invalid {
                name: route.name.clone(),
                reason: reason.to_string(),
            };
            if route.name.is_empty() || route.name.contains('/') {
                return Err(invalid("name must be a single non-empty path segment"));
            }
            if RESERVED_NAMES.contains(&route.name.as_str()) {
                return Err(invalid("name collides with a gateway path"));
            }
            if route.name == idp_segment {
                return Err(invalid("name collides with the identity provider prefix"));
            }
            if !seen.insert(route.name.clone()) {
                return Err(invalid("duplicate service name"));
            }
            match Url::parse(&route.base_url) {
                Ok(url) if matches!(url.scheme(), "http" | "https") => {}
                _ => return Err(invalid("url must be an absolute http(s) URL")),
            }
            route.base_url = route.base_url.trim_end_matches('/').to_string();
        }

        for alias in &aliases {
            if alias.path.is_empty() || alias.path.contains('/') || !alias.target.starts_with('/') {
                return Err(RouteConfigError::Invalid {
                    name: alias.path.clone(),
                    reason: "alias path must be one segment and target a local path".into(),
                });
            }
        }

        Ok(Self { routes, aliases })
    }

    /// Parse a TOML route file of `[[service]]` and `[[alias]]` tables.
    pub fn from_toml_str(text: &str, idp_prefix: &str) -> Result<Self, RouteConfigError> {
        let file: RouteFile = toml::from_str(text)?;
        Self::new(file.service, file.alias, idp_prefix)
    }

    pub fn load(path: impl AsRef<Path>, idp_prefix: &str) -> Result<Self, RouteConfigError> {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(text) => {
                let table = Self::from_toml_str(&text, idp_prefix)?;
                info!(path = %path.display(), services = table.routes.len(), "Loaded route table");
                Ok(table)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "Route file not found, no backend services will be reachable");
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn get(&self, name: &str) -> Option<&RouteDescriptor> {
        self.routes.iter().find(|r| r.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RouteDescriptor> {
        self.routes.iter()
    }

    pub fn alias(&self, path: &str) -> Option<&RouteAlias> {
        self.aliases.iter().find(|a| a.path == path)
    }

    /// Routes that belong in the navigation panel for this permission level.
    pub fn navigation_for(
        &self,
        permission: PermissionLevel,
    ) -> impl Iterator<Item = &RouteDescriptor> + '_ {
        self.routes
            .iter()
            .filter(move |r| r.visible && r.accessible_to(permission))
    }

    /// Landing route for `/`: the preferred one when reachable, else the first navigable one.
    pub fn landing_route(
        &self,
        preferred: Option<&str>,
        permission: PermissionLevel,
    ) -> Option<&RouteDescriptor> {
        preferred
            .and_then(|name| self.get(name))
            .filter(|r| r.visible && r.accessible_to(permission))
            .or_else(|| self.navigation_for(permission).next())
    }
}

/// Split `svc/rest/of/path` into the service name and the remaining path.
pub fn split_service_path(path: &str) -> (&str, &str) {
    let path = path.trim_start_matches('/');
    match path.find('/') {
        Some(idx) => (&path[..idx], &path[idx + 1..]),
        None => (path, ""),
    }
}
