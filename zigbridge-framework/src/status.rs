//! Bridge status reporting.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use zigbridge_common::TopicBuilder;

use crate::Result;
use crate::bus::BusPublisher;

/// Bridge information document published on `<base>/bridge/info`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeInfo {
    /// Bridge name (e.g., "zigbee").
    pub bridge: String,
    /// Bridge version.
    pub version: String,
    /// Current status ("running", "offline", "error").
    pub status: String,
    /// When this bridge process started.
    pub started_at: DateTime<Utc>,
    /// Additional metadata (network parameters, device count).
    #[serde(flatten)]
    pub metadata: serde_json::Value,
}

impl BridgeInfo {
    fn with_status(
        bridge: impl Into<String>,
        version: impl Into<String>,
        status: &str,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            bridge: bridge.into(),
            version: version.into(),
            status: status.to_string(),
            started_at,
            metadata: serde_json::Value::Null,
        }
    }

    /// Create an info document with "running" state.
    pub fn running(bridge: impl Into<String>, version: impl Into<String>) -> Self {
        Self::with_status(bridge, version, "running", Utc::now())
    }

    /// Add metadata to the document.
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Publish this document, retained.
    pub fn publish(&self, bus: &dyn BusPublisher, topics: &TopicBuilder) -> Result<()> {
        let payload = serde_json::to_vec(self)?;
        bus.publish(&topics.bridge_info(), payload, true)
    }
}

/// Publishes the bridge info document on startup, shutdown, and on demand.
pub struct StatusPublisher {
    bus: Arc<dyn BusPublisher>,
    topics: TopicBuilder,
    bridge_name: String,
    version: String,
    started_at: DateTime<Utc>,
}

impl std::fmt::Debug for StatusPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusPublisher")
            .field("bridge", &self.bridge_name)
            .field("version", &self.version)
            .finish()
    }
}

impl StatusPublisher {
    /// Create a new status publisher.
    pub fn new(
        bus: Arc<dyn BusPublisher>,
        topics: TopicBuilder,
        bridge_name: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            bus,
            topics,
            bridge_name: bridge_name.into(),
            version: version.into(),
            started_at: Utc::now(),
        }
    }

    fn publish(&self, status: &str, metadata: serde_json::Value) -> Result<()> {
        BridgeInfo::with_status(&self.bridge_name, &self.version, status, self.started_at)
            .with_metadata(metadata)
            .publish(self.bus.as_ref(), &self.topics)
    }

    /// Publish "running" status with optional metadata.
    pub fn publish_running(&self, metadata: Option<serde_json::Value>) -> Result<()> {
        self.publish("running", metadata.unwrap_or(serde_json::Value::Null))
    }

    /// Publish "offline" status.
    pub fn publish_offline(&self) -> Result<()> {
        self.publish("offline", serde_json::Value::Null)
    }

    /// Publish "error" status.
    pub fn publish_error(&self, error: impl Into<String>) -> Result<()> {
        self.publish("error", serde_json::json!({ "error": error.into() }))
    }
}
