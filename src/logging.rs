// SPDX-License-Identifier: Apache-2.0
use std::env;
use tracing::subscriber::set_global_default;
use tracing_bunyan_formatter::{BunyanFormattingLayer, JsonStorageLayer};
use tracing_log::LogTracer;
use tracing_subscriber::{fmt::MakeWriter, layer::SubscriberExt, EnvFilter, Registry};

pub const LOG_FORMAT_ENV: &str = "MESHGATE_LOG_FORMAT";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Bunyan JSON lines, one per event
    Json,
    Console,
}

impl LogFormat {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "json" | "bunyan" => Some(LogFormat::Json),
            "console" | "pretty" => Some(LogFormat::Console),
            _ => None,
        }
    }

    /// Format from the environment; JSON unless asked otherwise.
    pub fn from_env() -> Self {
        env::var(LOG_FORMAT_ENV)
            .ok()
            .and_then(|v| Self::parse(&v))
            .unwrap_or(LogFormat::Json)
    }
}

fn env_filter(default: String) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Install the subscriber selected by `format`.
pub fn init(name: &str, format: LogFormat) {
    match format {
        LogFormat::Json => init_tracing(name, std::io::stdout),
        LogFormat::Console => init_console_tracing(name),
    }
}

/// Initialize the Bunyan (JSON) tracing subscriber
pub fn init_tracing<Sink>(name: &str, sink: Sink)
where
    Sink: for<'a> MakeWriter<'a> + Send + Sync + 'static,
{
    // Skip setting LogTracer if it's already been set
    let _ = LogTracer::init();

    let formatting_layer = BunyanFormattingLayer::new(name.into(), sink);
    let subscriber = Registry::default()
        .with(env_filter(format!("{}=info,actix_web=info", name)))
        .with(JsonStorageLayer)
        .with(formatting_layer);

    if set_global_default(subscriber).is_err() {
        eprintln!("tracing subscriber already installed");
        return;
    }
    tracing::info!("Tracing initialized with Bunyan formatter");
}

/// Initialize a more readable console logger for development
pub fn init_console_tracing(name: &str) {
    let _ = LogTracer::init();

    let subscriber = tracing_subscriber::fmt()
        .with_target(true)
        .with_level(true)
        .with_env_filter(env_filter(format!("{}=debug,actix_web=info", name)))
        .finish();

    if set_global_default(subscriber).is_err() {
        eprintln!("tracing subscriber already installed");
        return;
    }
    tracing::info!("Console tracing initialized");
}
