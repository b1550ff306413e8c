//! Structured error types. Fatal-at-startup conditions are typed; per-event
//! wire/protocol anomalies are logged and discarded in place, not
//! propagated as `Result` (see `engine.rs`).

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("basetopic must not be empty, system inoperable")]
    EmptyBaseTopic,
    #[error("no top-of-minute trigger configured, system inoperable")]
    NoTopOfMinuteSource,
}
