// SPDX-License-Identifier: Apache-2.0
use actix_web::web::Bytes;
use lol_html::html_content::ContentType;
use lol_html::{element, HtmlRewriter, Settings};
use std::cell::Cell;
use std::fmt::Write;
use tracing::{debug, warn};

use crate::auth::PermissionLevel;
use crate::preferences::ThemePreference;
use crate::routes::RouteTable;

const SIDE_PANEL_SCRIPT: &str = include_str!("../static/js/side-panel.js");

// Applied before first paint so a collapsed panel does not flash open
const SIDEBAR_PRERENDER_SCRIPT: &str = "<script>(function(){if(localStorage.getItem('sidebar-collapsed')==='true'){document.documentElement.classList.add('sidebar-collapsed');}})();</script>";

// Last thing written into the body; its absence means the body never closed
const TAIL_MARKER: &str = "data-gateway-chrome=\"tail\"";

fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

/// Render the navigation panel for one user, routes in configured order.
///
/// The settings link and the theme toggle both target `preference_service`.
pub fn render_navigation(
    routes: &RouteTable,
    permission: PermissionLevel,
    current_service: &str,
    preference_service: &str,
) -> String {
    let settings = escape_html(preference_service);
    let mut html = format!(
        r#"<div class="side-panel" id="side-panel" data-settings-service="{settings}"><div class="side-panel__header"><button class="side-panel__toggle" id="sidebar-toggle" aria-label="Toggle sidebar"><svg viewBox="0 0 24 24"><line x1="3" y1="12" x2="21" y2="12"/><line x1="3" y1="6" x2="21" y2="6"/><line x1="3" y1="18" x2="21" y2="18"/></svg></button></div><nav class="side-panel__nav"><ul class="side-panel__list">"#,
    );

    for route in routes.navigation_for(permission) {
        let name = escape_html(&route.name);
        let label = escape_html(&route.display_name());
        let active = if route.name == current_service {
            " side-panel__item--active"
        } else {
            ""
        };
        let initial = label.chars().next().unwrap_or('?');
        let _ = write!(
            html,
            r#"<li class="side-panel__item{active}"><a href="/{name}/" class="side-panel__link" data-tooltip="Go to {label}"><span class="side-panel__icon">{initial}</span><span class="side-panel__label">{label}</span></a></li>"#,
        );
    }

    let _ = write!(
        html,
        r#"</ul></nav><div class="side-panel__footer"><a href="/{settings}/settings" class="side-panel__link" data-tooltip="Change theme and preferences"><span class="side-panel__label">Settings</span></a><a href="/logout" class="side-panel__link" data-tooltip="Sign out"><span class="side-panel__label">Logout</span></a><button class="theme-toggle" id="theme-toggle-btn" aria-label="Toggle theme"><span class="theme-toggle__track"><span class="theme-toggle__thumb"></span></span></button></div></div>"#,
    );
    html
}

/// One response's worth of chrome injection.
///
/// `apply` takes `self`, so a given rewrite can only ever run once.
pub struct HtmlRewrite<'a> {
    theme: ThemePreference,
    asset_version: &'a str,
    navigation: String,
}

impl<'a> HtmlRewrite<'a> {
    pub fn new(
        theme: ThemePreference,
        asset_version: &'a str,
        routes: &RouteTable,
        permission: PermissionLevel,
        current_service: &str,
        preference_service: &str,
    ) -> Self {
        Self {
            theme,
            asset_version,
            navigation: render_navigation(routes, permission, current_service, preference_service),
        }
    }

    /// Rewrite `body`; on any failure the original bytes come back untouched.
    pub fn apply(self, body: Bytes) -> Bytes {
        match self.rewrite(&body) {
            Ok(Some(out)) => Bytes::from(out),
            Ok(None) => {
                debug!("No complete <body> element, leaving HTML untouched");
                body
            }
            Err(e) => {
                warn!(error = %e, "HTML rewrite failed, returning original body");
                body
            }
        }
    }

    fn rewrite(&self, input: &[u8]) -> Result<Option<Vec<u8>>, lol_html::errors::RewritingError> {
        let version = escape_html(self.asset_version);
        let head_links = format!(
            r#"<link rel="stylesheet" href="/static/css/global.css?v={version}"><link rel="stylesheet" href="/static/css/side-panel.css?v={version}">{SIDEBAR_PRERENDER_SCRIPT}"#,
        );
        let body_open = format!(
            r#"<div class="gateway-layout">{}<div class="gateway-content">"#,
            self.navigation
        );
        let body_close = format!("</div></div><script {TAIL_MARKER}>{SIDE_PANEL_SCRIPT}</script>");
        let head_seen = Cell::new(false);
        let body_seen = Cell::new(false);

        let mut output = Vec::with_capacity(input.len() + body_open.len() + body_close.len());
        let mut rewriter = HtmlRewriter::new(
            Settings {
                element_content_handlers: vec![
                    element!("html:first-of-type", |el| {
                        el.set_attribute("data-theme", self.theme.theme.as_str())?;
                        el.set_attribute("data-color-theme", &self.theme.color_theme)?;
                        Ok(())
                    }),
                    // `<html>` and `<head>` are optional, so match anywhere and keep the first
                    element!("head", |el| {
                        if !head_seen.replace(true) {
                            el.append(&head_links, ContentType::Html);
                        }
                        Ok(())
                    }),
                    element!("body", |el| {
                        if body_seen.replace(true) {
                            return Ok(());
                        }
                        el.prepend(&body_open, ContentType::Html);
                        el.append(&body_close, ContentType::Html);
                        Ok(())
                    }),
                ],
                ..Settings::default()
            },
            |chunk: &[u8]| output.extend_from_slice(chunk),
        );
        rewriter.write(input)?;
        rewriter.end()?;

        if !body_seen.get() || !contains(&output, TAIL_MARKER.as_bytes()) {
            return Ok(None);
        }
        Ok(Some(output))
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}
