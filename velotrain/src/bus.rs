//! Pub/sub transport seam.
//!
//! The production transport client is an external collaborator (§1/§6):
//! this crate only needs a place to publish retained status/passing/replay
//! messages and to receive command topics. `Bus` is that seam; a real
//! deployment supplies an MQTT-backed implementation behind it.

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

#[async_trait]
pub trait Bus: Send + Sync {
    async fn publish_json(&self, topic: &str, obj: Value, retain: bool);
    async fn subscribe(&self, topic: &str);
}

/// Reference implementation used for standalone runs and tests: logs every
/// publish instead of shipping it anywhere.
#[derive(Debug, Default)]
pub struct LoggingBus;

#[async_trait]
impl Bus for LoggingBus {
    async fn publish_json(&self, topic: &str, obj: Value, retain: bool) {
        debug!(retain, topic, "publish {}", obj);
    }

    async fn subscribe(&self, topic: &str) {
        debug!(topic, "subscribe");
    }
}
