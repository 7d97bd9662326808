//! This module is for logging.  vmprobe uses the `log` crate for logging.  The `log` crate is a
//! lightweight logging facade.  vmprobe, as a library, only logs messages via the `log` crate, but
//! leaves the implementation of the logger to its user.
//!
//! By default, the `builtin_env_logger` feature is enabled, in which case vmprobe will initialize
//! an `env_logger` when an inspector session is created, so that simple command-line tools can see
//! log messages without configuring any logger.  The user can disable this default feature to
//! remove the dependency and take control of logging.

/// Attempt to initialize a built-in env_logger if the `builtin_env_logger` feature is enabled.
/// When successful, it will show messages of Info level or lower by default, but it can be
/// overridden by the `RUST_LOG` environment variable.
///
/// It will fail if a logger has already been initialized.  In that case this function will do
/// nothing.
pub fn try_init() {
    cfg_if::cfg_if! {
        if #[cfg(feature = "builtin_env_logger")] {
            let result = env_logger::try_init_from_env(
                // By default, show info level logging.
                env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
            );
            if result.is_ok() {
                debug!("Initialized built-in env_logger.");
            }
        } else {
            trace!("The builtin_env_logger feature is disabled. Not initializing the built-in env_logger.");
        }
    }
}
