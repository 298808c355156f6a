// SPDX-License-Identifier: Apache-2.0
use std::path::PathBuf;
use tracing::warn;

use crate::rate_limit::RateLimitConfig;

pub const ENV_PREFIX: &str = "MESHGATE_";

// Development fallback; at least 64 bytes as the cookie key requires
const DEFAULT_SESSION_KEY: &[u8] =
    b"meshgate_development_session_key_change_me_this_is_not_secure_enough_for_production_use";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(String),
    #[error("{name} is invalid: {reason}")]
    Invalid { name: String, reason: String },
}

/// Identity provider reached through the sub-path proxy and the OIDC flow.
#[derive(Debug, Clone)]
pub struct IdpConfig {
    /// Internal origin of the identity provider, e.g. `http://localhost:8080`
    pub backend_url: String,
    pub realm: String,
    pub client_id: String,
    pub client_secret: Option<String>,
    /// External sub-path the provider is served under, e.g. `/keycloak`
    pub prefix: String,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind: String,
    /// Externally visible origin; derived per request when unset.
    pub public_url: Option<String>,
    pub service_name: String,
    pub core_url: String,
    pub token_issuer: String,
    pub idp: IdpConfig,
    pub session_key: Vec<u8>,
    pub cookie_secure: bool,
    pub routes_file: PathBuf,
    pub preference_service: String,
    pub revocation_fail_open: bool,
    pub asset_version: String,
    pub rate_limit: RateLimitConfig,
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn absolute_url(name: &str, value: String) -> Result<String, ConfigError> {
    match url::Url::parse(&value) {
        Ok(u) if matches!(u.scheme(), "http" | "https") => {
            Ok(value.trim_end_matches('/').to_string())
        }
        _ => Err(ConfigError::Invalid {
            name: name.to_string(),
            reason: "expected an absolute http(s) URL".into(),
        }),
    }
}

struct Vars<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Vars<F> {
    fn get(&self, name: &str) -> Option<String> {
        (self.lookup)(&format!("{}{}", ENV_PREFIX, name)).filter(|v| !v.trim().is_empty())
    }

    fn or(&self, name: &str, default: &str) -> String {
        self.get(name).unwrap_or_else(|| default.to_string())
    }

    fn flag(&self, name: &str, default: bool) -> Result<bool, ConfigError> {
        match self.get(name) {
            None => Ok(default),
            Some(v) => parse_bool(&v).ok_or_else(|| ConfigError::Invalid {
                name: format!("{}{}", ENV_PREFIX, name),
                reason: format!("'{}' is not a boolean", v),
            }),
        }
    }
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build the configuration from an arbitrary variable source.
    pub fn from_lookup<F: Fn(&str) -> Option<String>>(lookup: F) -> Result<Self, ConfigError> {
        let vars = Vars { lookup };

        let core_url = vars
            .get("CORE_URL")
            .ok_or_else(|| ConfigError::Missing(format!("{}CORE_URL", ENV_PREFIX)))?;
        let core_url = absolute_url("MESHGATE_CORE_URL", core_url)?;
        let public_url = vars
            .get("PUBLIC_URL")
            .map(|u| absolute_url("MESHGATE_PUBLIC_URL", u))
            .transpose()?;

        let mut prefix = vars.or("IDP_PREFIX", "/keycloak");
        if !prefix.starts_with('/') {
            prefix.insert(0, '/');
        }
        let prefix = prefix.trim_end_matches('/').to_string();
        if prefix.is_empty() {
            return Err(ConfigError::Invalid {
                name: "MESHGATE_IDP_PREFIX".into(),
                reason: "must name a sub-path".into(),
            });
        }

        let idp = IdpConfig {
            backend_url: absolute_url(
                "MESHGATE_IDP_BACKEND_URL",
                vars.or("IDP_BACKEND_URL", "http://localhost:8080"),
            )?,
            realm: vars.or("IDP_REALM", "hivematrix"),
            client_id: vars.or("IDP_CLIENT_ID", "core-client"),
            client_secret: vars.get("IDP_CLIENT_SECRET"),
            prefix,
        };

        let session_key = match vars.get("SESSION_KEY") {
            Some(key) if key.len() >= 64 => key.into_bytes(),
            Some(_) => {
                return Err(ConfigError::Invalid {
                    name: "MESHGATE_SESSION_KEY".into(),
                    reason: "must be at least 64 bytes".into(),
                });
            }
            None => {
                warn!("No session key set in environment, using development default");
                DEFAULT_SESSION_KEY.to_vec()
            }
        };

        let rate_limit = RateLimitConfig {
            per_minute: match vars.get("RATE_LIMIT_PER_MINUTE") {
                None => crate::rate_limit::DEFAULT_PER_MINUTE,
                Some(v) => v.parse::<u32>().ok().filter(|n| *n > 0).ok_or_else(|| {
                    ConfigError::Invalid {
                        name: "MESHGATE_RATE_LIMIT_PER_MINUTE".into(),
                        reason: format!("'{}' is not a positive integer", v),
                    }
                })?,
            },
            enabled: vars.flag("RATE_LIMIT_ENABLED", true)?,
        };

        Ok(Self {
            bind: vars.or("BIND", "0.0.0.0:8000"),
            public_url,
            service_name: vars.or("SERVICE_NAME", "meshgate"),
            core_url,
            token_issuer: vars.or("TOKEN_ISSUER", "hivematrix-core"),
            idp,
            session_key,
            cookie_secure: vars.flag("COOKIE_SECURE", false)?,
            routes_file: PathBuf::from(vars.or("ROUTES_FILE", "config/services.toml")),
            preference_service: vars.or("PREFERENCE_SERVICE", "codex"),
            revocation_fail_open: vars.flag("REVOCATION_FAIL_OPEN", true)?,
            asset_version: vars.or("ASSET_VERSION", env!("CARGO_PKG_VERSION")),
            rate_limit,
        })
    }
}
