//! Re-exports of the `tracing` macros used throughout the crate.
//!
//! The rest of the crate writes `crate::logging::{trace, debug, ...}`
//! rather than depending on `tracing` directly, so every call site goes
//! through one place if the backend ever changes.

pub use tracing::{debug, error, info, trace, warn};
