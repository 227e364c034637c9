//! Domain Events
//!
//! Immutable records of significant discovery occurrences, emitted to the
//! audit log. Serializable so a future publisher can ship them elsewhere.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

/// A significant occurrence in the discovery lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DiscoveryEvent {
    /// An agent report was applied to a device record.
    AgentReported {
        mac: String,
        timestamp: DateTime<Utc>,
    },

    /// A network observation attached a device to a switch port.
    NetworkAttached {
        mac: String,
        switch_name: String,
        port: String,
        timestamp: DateTime<Utc>,
    },

    /// A device's MAC disappeared from a switch's learned table.
    NetworkDetached {
        mac: String,
        switch_name: String,
        port: String,
        timestamp: DateTime<Utc>,
    },

    /// A fully discovered device was promoted to the inventory service.
    DevicePromoted {
        xname: String,
        mac: String,
        timestamp: DateTime<Utc>,
    },

    /// A topology poll produced a changed switch set.
    TopologyEpoch {
        switch_count: usize,
        timestamp: DateTime<Utc>,
    },

    /// A per-switch scan task started.
    ScanStarted {
        switch_name: String,
        timestamp: DateTime<Utc>,
    },

    /// A per-switch scan task observed cancellation and stopped.
    ScanStopped {
        switch_name: String,
        timestamp: DateTime<Utc>,
    },
}

impl DiscoveryEvent {
    /// Emit this event to the audit log.
    pub fn audit(&self) {
        match serde_json::to_string(self) {
            Ok(encoded) => info!(target: "riverscout::audit", event = %encoded),
            Err(e) => info!(target: "riverscout::audit", "unencodable event: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serializes_with_tag() {
        let event = DiscoveryEvent::DevicePromoted {
            xname: "x3000c0s28b0".to_string(),
            mac: "a4bf002b6eff".to_string(),
            timestamp: Utc::now(),
        };
        let encoded = serde_json::to_string(&event).unwrap();
        assert!(encoded.contains("\"type\":\"DevicePromoted\""));
        assert!(encoded.contains("a4bf002b6eff"));
    }
}
