#![allow(clippy::expect_used)]

use serde::{Deserialize, Serialize};
use std::env;
use std::io;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Log output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LogFormat {
    /// Human-readable format (default for development)
    #[default]
    Pretty,
    /// Compact text format
    Compact,
    /// JSON format for log aggregation systems
    Json,
}

impl LogFormat {
    /// Parse log format from environment variable
    pub fn from_env() -> Self {
        Self::parse(&env::var("LOG_FORMAT").unwrap_or_default())
    }

    pub fn parse(value: &str) -> Self {
        match value.to_lowercase().as_str() {
            "json" => Self::Json,
            "compact" => Self::Compact,
            "pretty" => Self::Pretty,
            _ => Self::default(),
        }
    }
}

/// Configuration for structured logging
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log output format (pretty/compact/json)
    pub format: LogFormat,
    /// Service name (e.g., "lpr-detect")
    pub service_name: String,
    pub service_version: String,
    /// Environment (dev/staging/production)
    pub environment: String,
    /// Enable span events (enter/exit/close)
    pub enable_span_events: bool,
    /// Log to file in addition to the console
    pub log_to_file: bool,
    pub log_dir: Option<String>,
}

impl LogConfig {
    /// Create a new log configuration, reading overrides from the environment
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            format: LogFormat::from_env(),
            service_name: service_name.into(),
            service_version: env::var("SERVICE_VERSION")
                .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string()),
            environment: env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string()),
            enable_span_events: env::var("LOG_SPAN_EVENTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(false),
            log_to_file: env::var("LOG_TO_FILE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(false),
            log_dir: env::var("LOG_DIR").ok(),
        }
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.service_version = version.into();
        self
    }

    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = environment.into();
        self
    }

    pub fn with_span_events(mut self, enable: bool) -> Self {
        self.enable_span_events = enable;
        self
    }

    pub fn with_file_logging(mut self, log_dir: impl Into<String>) -> Self {
        self.log_to_file = true;
        self.log_dir = Some(log_dir.into());
        self
    }

    /// Directory for the rolling JSON log file, whatever the console format
    pub fn file_target(&self) -> Option<&str> {
        self.log_dir.as_deref().filter(|_| self.log_to_file)
    }

    fn span_events(&self) -> FmtSpan {
        if self.enable_span_events {
            FmtSpan::NEW | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        }
    }
}

/// Initialize structured logging with the given configuration.
///
/// Console output goes to stderr so stdout stays free for command output.
///
/// When file logging is enabled a daily JSON file is written next to the console
/// output in every format. The returned guard must be kept alive; dropping it flushes
/// and stops the background writer.
pub fn init_structured_logging(config: LogConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"))
        .add_directive("ort=warn".parse().expect("valid directive"));

    let span_events = config.span_events();
    let mut guard = None;

    let file_layer = config.file_target().map(|log_dir| {
        let file_name = format!("{}.log", config.service_name);
        let file_appender = tracing_appender::rolling::daily(log_dir, file_name);
        let (non_blocking, file_guard) = tracing_appender::non_blocking(file_appender);
        guard = Some(file_guard);
        fmt::layer()
            .json()
            .with_span_events(span_events.clone())
            .with_writer(non_blocking)
    });
    let registry = tracing_subscriber::registry().with(filter).with(file_layer);

    match config.format {
        LogFormat::Json => {
            let json_layer = fmt::layer()
                .json()
                .with_span_events(span_events)
                .with_current_span(true)
                .with_span_list(true)
                .with_target(true)
                .with_thread_ids(true)
                .with_thread_names(true)
                .with_writer(io::stderr);

            registry.with(json_layer).init();
        }
        LogFormat::Compact => {
            let compact_layer = fmt::layer()
                .compact()
                .with_span_events(span_events)
                .with_target(true)
                .with_thread_ids(false)
                .with_writer(io::stderr);

            registry.with(compact_layer).init();
        }
        LogFormat::Pretty => {
            let pretty_layer = fmt::layer()
                .pretty()
                .with_span_events(span_events)
                .with_target(true)
                .with_thread_ids(false)
                .with_line_number(true)
                .with_writer(io::stderr);

            registry.with(pretty_layer).init();
        }
    }

    tracing::info!(
        service.name = %config.service_name,
        service.version = %config.service_version,
        environment = %config.environment,
        format = ?config.format,
        file_logging = guard.is_some(),
        "structured logging initialized"
    );

    guard
}

/// Initialize logging with service name
pub fn init_with_service(service_name: impl Into<String>) -> Option<WorkerGuard> {
    init_structured_logging(LogConfig::new(service_name))
}
