//! Thin facade over `slog` so the rest of the crate logs through a
//! single import. Components take `Into<Option<&Logger>>` and fall
//! back to a discard root when the embedding application supplies
//! nothing.

pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Logger};

use crate::support::{ErrorType, NetworkError, NetworkResult};
use sloggers::{Config, LoggerConfig};

/// Builds a logger from a `sloggers` TOML configuration string, e.g.
///
/// ```toml
/// type = "terminal"
/// level = "debug"
/// destination = "stderr"
/// ```
pub fn from_toml(config: &str) -> NetworkResult<Logger> {
    let config: LoggerConfig =
        serdeconv::from_toml_str(config).map_err(|_| NetworkError::Fatal(ErrorType::Config))?;

    config
        .build_logger()
        .map_err(|_| NetworkError::Fatal(ErrorType::Config))
}

/// A logger that drops everything.
#[inline]
pub fn null() -> Logger {
    Logger::root(Discard, o!())
}
