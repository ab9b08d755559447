//! Runtime configuration - environment-driven tuning knobs
//!
//! Mirrors the teacher's `logging::LogConfig::from_env` pattern: a
//! plain struct populated once from environment variables at startup,
//! with conservative defaults for everything left unset.

use once_cell::sync::Lazy;
use std::env;
use std::time::Duration;

/// Tuning knobs read once at process startup. All have the nogil
/// defaults baked in so an unconfigured process behaves like upstream.
#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    /// Threshold growth percentage applied to the live-object count
    /// after a full collection (spec S4.7 epilogue).
    pub gc_scale_percent: u32,
    /// Minimum collection threshold regardless of scale (spec S4.7).
    pub gc_threshold_floor: u64,
    /// Optional diagnostic cap on how long `stop_the_world` waits for a
    /// mutator to park before logging a warning. `None` disables the
    /// check entirely (the default: stop-the-world never times out).
    pub stw_timeout: Option<Duration>,
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        Self {
            gc_scale_percent: env_u32("COROBOX_GC_SCALE", 125),
            gc_threshold_floor: env_u64("COROBOX_GC_THRESHOLD_FLOOR", 700),
            stw_timeout: env::var("COROBOX_STW_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_millis),
        }
    }

    pub fn default_config() -> Self {
        Self {
            gc_scale_percent: 125,
            gc_threshold_floor: 700,
            stw_timeout: None,
        }
    }
}

fn env_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

static CONFIG: Lazy<RuntimeConfig> = Lazy::new(RuntimeConfig::from_env);

/// The process-wide configuration, loaded from the environment on
/// first access.
pub fn runtime_config() -> &'static RuntimeConfig {
    &CONFIG
}
