//! Structured logging utilities for ohstore components.
//!
//! Every event carries a `component` field so a single `RUST_LOG` filter can
//! isolate driver traffic from header bookkeeping.
//!
//! # Usage
//!
//! ```ignore
//! use ohstore_config::{log_driver_debug, log_header_debug};
//!
//! log_driver_debug!("probe finished", must_align = true);
//! log_header_debug!("slot released", index = 3usize);
//! ```

/// Component identifiers for log filtering
pub struct Component;

impl Component {
    pub const DRIVER: &'static str = "DRIVER";
    pub const HEADER: &'static str = "HEADER";
    pub const SHARE: &'static str = "SHARE";
    pub const CACHE: &'static str = "CACHE";
}

/// Log levels for runtime configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

// === DRIVER logging macros ===

#[macro_export]
macro_rules! log_driver_warn {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::warn!(component = "DRIVER", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_driver_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = "DRIVER", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_driver_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "DRIVER", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_driver_trace {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::trace!(component = "DRIVER", $($key = $value,)* $msg)
    };
}

// === HEADER logging macros ===

#[macro_export]
macro_rules! log_header_warn {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::warn!(component = "HEADER", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_header_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "HEADER", $($key = $value,)* $msg)
    };
}

// === SHARE logging macros ===

#[macro_export]
macro_rules! log_share_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "SHARE", $($key = $value,)* $msg)
    };
}

// === CACHE logging macros ===

#[macro_export]
macro_rules! log_cache_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = "CACHE", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_cache_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "CACHE", $($key = $value,)* $msg)
    };
}

/// Initialize logging with the given level filter.
/// `RUST_LOG` takes precedence when set. Call this once at startup.
pub fn init_logging(level: LogLevel) {
    use tracing_subscriber::EnvFilter;

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_filter()));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
}
