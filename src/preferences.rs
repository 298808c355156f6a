// SPDX-License-Identifier: Apache-2.0
use awc::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::GatewayError;
use crate::routes::RouteTable;
use crate::service_token::ServiceClient;

/// Seconds a looked-up preference is reused within one session
pub const PREFERENCE_CACHE_TTL: u64 = 300;
const PREFERENCE_LOOKUP_TIMEOUT: Duration = Duration::from_secs(2);

const COLOR_THEMES: &[&str] = &[
    "purple", "blue", "green", "orange", "gold", "red", "yellow", "matrix", "bee",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    #[default]
    Light,
    Dark,
}

impl Theme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Theme::Light => "light",
            Theme::Dark => "dark",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "light" => Some(Theme::Light),
            "dark" => Some(Theme::Dark),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThemePreference {
    pub theme: Theme,
    pub color_theme: String,
}

impl Default for ThemePreference {
    fn default() -> Self {
        Self {
            theme: Theme::Light,
            color_theme: "purple".to_string(),
        }
    }
}

impl ThemePreference {
    /// Accept only known theme values; anything else is rejected.
    pub fn parse(theme: &str, color_theme: &str) -> Option<Self> {
        let theme = Theme::parse(theme)?;
        COLOR_THEMES.contains(&color_theme).then(|| Self {
            theme,
            color_theme: color_theme.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cached<T> {
    pub value: T,
    pub cached_at: u64,
}

impl<T> Cached<T> {
    fn fresh(&self, now: u64) -> Option<&T> {
        (now.saturating_sub(self.cached_at) < PREFERENCE_CACHE_TTL).then_some(&self.value)
    }
}

/// Per-session cache of UI preferences, stored inside the session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PreferenceCache {
    #[serde(default)]
    pub theme: Option<Cached<ThemePreference>>,
    #[serde(default)]
    pub home_page: Option<Cached<String>>,
}

impl PreferenceCache {
    pub fn theme(&self, now: u64) -> Option<&ThemePreference> {
        self.theme.as_ref().and_then(|c| c.fresh(now))
    }

    pub fn home_page(&self, now: u64) -> Option<&str> {
        self.home_page
            .as_ref()
            .and_then(|c| c.fresh(now))
            .map(String::as_str)
    }

    pub fn store_theme(&mut self, value: ThemePreference, now: u64) {
        self.theme = Some(Cached { value, cached_at: now });
    }

    pub fn store_home_page(&mut self, value: String, now: u64) {
        self.home_page = Some(Cached { value, cached_at: now });
    }

    pub fn invalidate(&mut self) {
        self.theme = None;
        self.home_page = None;
    }
}

/// Where preferences come from on a cache miss.
#[allow(async_fn_in_trait)]
pub trait PreferenceSource {
    async fn fetch_theme(&self, email: &str) -> Result<ThemePreference, GatewayError>;
    async fn fetch_home_page(&self, email: &str) -> Result<String, GatewayError>;
}

#[derive(Deserialize)]
struct ThemeResponse {
    theme: Option<String>,
    color_theme: Option<String>,
}

#[derive(Deserialize)]
struct HomePageResponse {
    home_page: Option<String>,
}

/// Preference service reached through the route table with a service token.
pub struct HttpPreferenceSource<'a> {
    pub client: &'a Client,
    pub services: &'a ServiceClient,
    pub routes: &'a RouteTable,
    pub service: &'a str,
}

impl PreferenceSource for HttpPreferenceSource<'_> {
    async fn fetch_theme(&self, email: &str) -> Result<ThemePreference, GatewayError> {
        let body: ThemeResponse = self
            .services
            .get_json(
                self.client,
                self.routes,
                self.service,
                "/api/public/user/theme",
                &[("email", email)],
                PREFERENCE_LOOKUP_TIMEOUT,
            )
            .await?;
        let theme = body.theme.unwrap_or_else(|| "light".into());
        let color = body.color_theme.unwrap_or_else(|| "purple".into());
        ThemePreference::parse(&theme, &color).ok_or_else(|| {
            GatewayError::upstream(self.service, format!("unexpected theme {}/{}", theme, color))
        })
    }

    async fn fetch_home_page(&self, email: &str) -> Result<String, GatewayError> {
        let body: HomePageResponse = self
            .services
            .get_json(
                self.client,
                self.routes,
                self.service,
                "/api/public/user/home-page",
                &[("email", email)],
                PREFERENCE_LOOKUP_TIMEOUT,
            )
            .await?;
        body.home_page
            .filter(|p| !p.is_empty() && !p.contains('/'))
            .ok_or_else(|| GatewayError::upstream(self.service, "no home page in response"))
    }
}

/// Theme for this user: cached, else fetched, else defaults. Never fails.
pub async fn resolve_theme(
    cache: &mut PreferenceCache,
    source: &impl PreferenceSource,
    email: Option<&str>,
    now: u64,
) -> ThemePreference {
    let Some(email) = email else {
        return ThemePreference::default();
    };
    if let Some(cached) = cache.theme(now) {
        return cached.clone();
    }
    match source.fetch_theme(email).await {
        Ok(pref) => {
            debug!(theme = pref.theme.as_str(), color = %pref.color_theme, "Fetched theme preference");
            cache.store_theme(pref.clone(), now);
            pref
        }
        Err(e) => {
            warn!(error = %e, "Failed to fetch user theme, using defaults");
            ThemePreference::default()
        }
    }
}

/// Preferred landing service for this user, if one could be determined.
pub async fn resolve_home_page(
    cache: &mut PreferenceCache,
    source: &impl PreferenceSource,
    email: Option<&str>,
    now: u64,
) -> Option<String> {
    let email = email?;
    if let Some(cached) = cache.home_page(now) {
        return Some(cached.to_string());
    }
    match source.fetch_home_page(email).await {
        Ok(page) => {
            cache.store_home_page(page.clone(), now);
            Some(page)
        }
        Err(e) => {
            warn!(error = %e, "Failed to fetch user home page");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct CountingSource {
        theme_calls: Cell<usize>,
        home_calls: Cell<usize>,
        fail: bool,
    }

    impl CountingSource {
        fn new(fail: bool) -> Self {
            Self {
                theme_calls: Cell::new(0),
                home_calls: Cell::new(0),
                fail,
            }
        }
    }

    impl PreferenceSource for CountingSource {
        async fn fetch_theme(&self, _email: &str) -> Result<ThemePreference, GatewayError> {
            self.theme_calls.set(self.theme_calls.get() + 1);
            if self.fail {
                return Err(GatewayError::upstream("codex", "down"));
            }
            Ok(ThemePreference::parse("dark", "matrix").unwrap())
        }

        async fn fetch_home_page(&self, _email: &str) -> Result<String, GatewayError> {
            self.home_calls.set(self.home_calls.get() + 1);
            Ok("codex".into())
        }
    }

    #[actix_web::test]
    async fn second_lookup_within_ttl_uses_cache() {
        let source = CountingSource::new(false);
        let mut cache = PreferenceCache::default();

        let first = resolve_theme(&mut cache, &source, Some("a@b.c"), 1000).await;
        let second = resolve_theme(&mut cache, &source, Some("a@b.c"), 1000 + 299).await;
        assert_eq!(first, second);
        assert_eq!(first.theme, Theme::Dark);
        assert_eq!(source.theme_calls.get(), 1);

        resolve_theme(&mut cache, &source, Some("a@b.c"), 1000 + 300).await;
        assert_eq!(source.theme_calls.get(), 2);
    }

    #[actix_web::test]
    async fn invalidate_forces_next_lookup() {
        let source = CountingSource::new(false);
        let mut cache = PreferenceCache::default();

        resolve_home_page(&mut cache, &source, Some("a@b.c"), 10).await;
        resolve_home_page(&mut cache, &source, Some("a@b.c"), 11).await;
        assert_eq!(source.home_calls.get(), 1);

        cache.invalidate();
        assert_eq!(
            resolve_home_page(&mut cache, &source, Some("a@b.c"), 12).await.as_deref(),
            Some("codex")
        );
        assert_eq!(source.home_calls.get(), 2);
    }

    #[actix_web::test]
    async fn failures_fall_back_to_defaults_and_are_not_cached() {
        let source = CountingSource::new(true);
        let mut cache = PreferenceCache::default();

        let pref = resolve_theme(&mut cache, &source, Some("a@b.c"), 0).await;
        assert_eq!(pref, ThemePreference::default());
        assert!(cache.theme.is_none());

        resolve_theme(&mut cache, &source, Some("a@b.c"), 1).await;
        assert_eq!(source.theme_calls.get(), 2);
    }

    #[actix_web::test]
    async fn no_email_means_defaults_without_lookup() {
        let source = CountingSource::new(false);
        let mut cache = PreferenceCache::default();
        assert_eq!(
            resolve_theme(&mut cache, &source, None, 0).await,
            ThemePreference::default()
        );
        assert_eq!(source.theme_calls.get(), 0);
    }

    #[test]
    fn rejects_unknown_theme_values() {
        assert!(ThemePreference::parse("dark", "bee").is_some());
        assert!(ThemePreference::parse("neon", "bee").is_none());
        assert!(ThemePreference::parse("dark", "magenta").is_none());
    }
}
