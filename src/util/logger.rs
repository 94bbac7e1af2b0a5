//! This module provides a built-in logger implementation.
//!
//! The built-in logger implementation uses the `env_logger` crate. It is
//! enabled by the Cargo feature "builtin_env_logger" which is enabled by
//! default. When enabled, it is initialized the first time a
//! [`crate::policy::collected_space::CollectedSpace`] is constructed, and
//! shows logs of level INFO or lower.
//!
//! Some embedders may wish to choose a different implementation or
//! register their own with the `log` crate. In such cases, disable the
//! Cargo feature "builtin_env_logger" and register an implementation
//! before constructing a `CollectedSpace`.

use log::debug;

/// Attempt to init an env_logger for tracegc. Does nothing if the
/// "builtin_env_logger" feature is disabled.
pub(crate) fn try_init() {
    cfg_if::cfg_if! {
        if #[cfg(feature = "builtin_env_logger")] {
            let result = env_logger::try_init_from_env(
                env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
            );

            match result {
                Ok(()) => {
                    debug!("tracegc initialized the logger.");
                }
                Err(e) => {
                    // `log::SetLoggerError` is only raised when a logger is already registered.
                    debug!("tracegc failed to initialize the built-in env_logger: {e}");
                }
            }
        } else {
            debug!("tracegc didn't initialize the built-in env_logger. The Cargo feature \"builtin_env_logger\" is not enabled.");
        }
    }
}
