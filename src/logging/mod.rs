//! Logging infrastructure - structured tracing throughout the runtime
//!
//! Design: uses `tracing` for structured, contextual logging with:
//! - Configurable log levels via environment
//! - Zero-cost when disabled
//! - Span-based performance tracking
//! - Console output, optionally mirrored to a rotating file

use once_cell::sync::OnceCell;
use std::io;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

mod macros;
pub use macros::*;

static LOGGER_INITIALIZED: OnceCell<()> = OnceCell::new();

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: Level,
    pub file_output: bool,
    pub log_path: Option<String>,
    pub json_format: bool,
    pub show_spans: bool,
    pub track_performance: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            file_output: false,
            log_path: None,
            json_format: false,
            show_spans: false,
            track_performance: cfg!(debug_assertions),
        }
    }
}

impl LogConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(level_str) = std::env::var("COROBOX_LOG_LEVEL") {
            config.level = match level_str.to_lowercase().as_str() {
                "trace" => Level::TRACE,
                "debug" => Level::DEBUG,
                "info" => Level::INFO,
                "warn" => Level::WARN,
                "error" => Level::ERROR,
                _ => Level::INFO,
            };
        }

        if let Ok(path) = std::env::var("COROBOX_LOG_FILE") {
            config.file_output = true;
            config.log_path = Some(path);
        }

        config.json_format = std::env::var("COROBOX_LOG_JSON").is_ok();
        config.show_spans = std::env::var("COROBOX_LOG_SPANS").is_ok();

        if let Ok(val) = std::env::var("COROBOX_LOG_PERF") {
            config.track_performance = val == "1" || val.to_lowercase() == "true";
        }

        config
    }

    /// High-performance config: error-only, no spans, no file output.
    pub fn performance() -> Self {
        Self {
            level: Level::ERROR,
            file_output: false,
            log_path: None,
            json_format: false,
            show_spans: false,
            track_performance: false,
        }
    }

    /// Verbose config for diagnosing collector/thread-registry issues.
    pub fn debug() -> Self {
        Self {
            level: Level::TRACE,
            file_output: true,
            log_path: Some("corobox.log".to_string()),
            json_format: false,
            show_spans: true,
            track_performance: true,
        }
    }
}

/// Initialize logging with the environment-derived configuration.
pub fn init() {
    init_with_config(LogConfig::from_env());
}

/// Initialize logging with a specific configuration. Idempotent: later
/// calls after the first are no-ops (matches `tracing_subscriber`'s
/// single global-default-subscriber rule).
pub fn init_with_config(config: LogConfig) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("corobox={}", config.level.as_str().to_lowercase()))
        });

        let span_events = if config.show_spans {
            FmtSpan::ENTER | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };

        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_writer(io::stdout)
                    .with_span_events(span_events)
                    .with_target(true)
                    .with_thread_ids(cfg!(debug_assertions))
                    .with_line_number(cfg!(debug_assertions)),
            )
            .init();
    });
}

pub fn is_initialized() -> bool {
    LOGGER_INITIALIZED.get().is_some()
}

// ============================================================================
// Domain-specific log helpers
// ============================================================================

#[inline]
pub fn log_allocation(size: usize, ptr: *const u8) {
    trace!(event = "allocation", size_bytes = size, address = ?ptr, "memory allocated");
}

#[inline]
pub fn log_deallocation(ptr: *const u8) {
    trace!(event = "deallocation", address = ?ptr, "memory deallocated");
}

pub fn log_thread_registered(thread_id: u64) {
    debug!(event = "thread_registered", thread_id, "mutator registered");
}

pub fn log_thread_unregistered(thread_id: u64) {
    debug!(event = "thread_unregistered", thread_id, "mutator unregistered");
}

/// World is about to stop for a safe-point operation (collection,
/// type-id merge, etc).
pub fn log_stw_begin(reason: &str, waiting_on: usize) {
    debug!(
        event = "stw_begin",
        reason,
        mutators_pending = waiting_on,
        "stopping the world"
    );
}

pub fn log_stw_end(reason: &str, duration_us: u64) {
    debug!(
        event = "stw_end",
        reason,
        duration_us,
        "world restarted"
    );
}

pub fn log_gc_start(generation: u32, candidate_count: usize) {
    info!(
        event = "gc_start",
        generation,
        candidates = candidate_count,
        "starting cycle collection"
    );
}

pub fn log_gc_complete(duration_us: u64, collected: usize, uncollectable: usize) {
    info!(
        event = "gc_complete",
        objects_collected = collected,
        uncollectable,
        duration_us,
        "cycle collection complete"
    );
}

pub fn log_gc_mark(marked: usize) {
    debug!(event = "gc_mark", objects_marked = marked, "reachability mark phase complete");
}

pub fn log_gc_sweep(swept: usize) {
    debug!(event = "gc_sweep", objects_swept = swept, "clear phase complete");
}

pub fn log_weakref_callback(ran_ok: bool) {
    if ran_ok {
        trace!(event = "weakref_callback", "weakref callback ran");
    } else {
        warn!(event = "weakref_callback_panicked", "weakref callback panicked, routed to unraisable hook");
    }
}

pub fn log_finalizer_run(resurrected: bool) {
    debug!(event = "finalizer_run", resurrected, "finalizer executed");
}

pub fn log_runtime_error(error: &str) {
    error!(event = "runtime_error", error, "runtime error occurred");
}

pub fn log_runtime_warning(warning: &str) {
    warn!(event = "runtime_warning", warning, "runtime warning");
}

pub fn log_runtime_init() {
    info!(event = "runtime_init", "corobox runtime initializing");
}

pub fn log_runtime_shutdown() {
    info!(event = "runtime_shutdown", "corobox runtime shutting down");
}

/// Performance tracking utilities.
pub mod perf {
    use std::time::Instant;
    use tracing::debug;

    #[must_use]
    pub fn track(operation: &str) -> PerformanceGuard {
        PerformanceGuard {
            operation: operation.to_string(),
            start: Instant::now(),
        }
    }

    pub struct PerformanceGuard {
        operation: String,
        start: Instant,
    }

    impl Drop for PerformanceGuard {
        fn drop(&mut self) {
            let elapsed = self.start.elapsed();
            debug!(
                operation = %self.operation,
                duration_us = elapsed.as_micros(),
                "operation completed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_creation() {
        let config = LogConfig::default();
        assert_eq!(config.level, Level::INFO);
        assert!(!config.file_output);

        let perf_config = LogConfig::performance();
        assert_eq!(perf_config.level, Level::ERROR);

        let debug_config = LogConfig::debug();
        assert_eq!(debug_config.level, Level::TRACE);
    }

    #[test]
    fn init_idempotent() {
        init();
        init();
        assert!(is_initialized());
    }
}
