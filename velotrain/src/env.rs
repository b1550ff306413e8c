//! Environment sensor seam (temperature, humidity, pressure).
//!
//! The reference implementation reads a primary sensor source and falls
//! back to a secondary one when the primary is unavailable (`app._env` in
//! the original). Both sensor drivers are out-of-scope collaborators; this
//! module only defines the single `read()` call the engine needs.

use async_trait::async_trait;

pub type Environment = (f64, f64, f64);

#[async_trait]
pub trait EnvSource: Send + Sync {
    /// Returns the latest `(temperature, humidity, pressure)` reading if a
    /// sensor is currently connected and has fresh data.
    async fn read(&self) -> Option<Environment>;
}

/// No sensors attached; always reports unavailable.
#[derive(Debug, Default)]
pub struct NoEnv;

#[async_trait]
impl EnvSource for NoEnv {
    async fn read(&self) -> Option<Environment> {
        None
    }
}
