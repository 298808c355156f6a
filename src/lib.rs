// SPDX-License-Identifier: Apache-2.0
pub mod auth;
pub mod config;
pub mod error;
pub mod gateway;
pub mod idp_proxy;
pub mod issuer;
pub mod logging;
pub mod memory_session_store;
pub mod middleware;
pub mod oidc;
pub mod preferences;
pub mod proxy;
pub mod rate_limit;
pub mod rewrite;
pub mod routes;
pub mod service_token;
pub mod session;
