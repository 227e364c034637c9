//! riverscout - Hardware Discovery Coordinator
//!
//! Correlates two independent observation channels into per-device
//! discovery records and promotes them to the central inventory service:
//!
//! ```text
//! Agent report (HTTP) ──┐
//!                       ├──▶ Reconciler ──▶ Inventory service
//! Switch scan (SNMP) ───┘
//! ```
//!
//! A device is promoted only once both channels agree it exists: the
//! on-box agent has reported in and collected credentials, and a
//! management switch has learned the device's MAC on one of its ports.
//!
//! # Modules
//!
//! - [`reconcile`] - per-device state machine merging the two channels
//! - [`supervisor`] - lifecycle manager for per-switch scan tasks
//! - [`snmp`] - switch drivers and the SNMP session seam
//! - [`fabric`] - direct Redfish discovery of fabric switch BMCs
//! - [`topology`] - layout-service client and change watchers
//! - [`inventory`] - inventory-service REST client
//! - [`http`] - management API (credentials, discovery, probes)
//! - [`storage`] - persistent discovery state behind a KV contract
//! - [`secrets`] / [`credentials`] - secret store and credential records
//! - [`domain`] - port traits and audit events
//! - [`error`] - error types
//! - [`metrics`] - Prometheus counters and exposition

pub mod addressing;
pub mod credentials;
pub mod domain;
pub mod error;
pub mod fabric;
pub mod health;
pub mod http;
pub mod inventory;
pub mod metrics;
pub mod reconcile;
pub mod secrets;
pub mod snmp;
pub mod storage;
pub mod supervisor;
pub mod topology;

// Re-export commonly used types
pub use credentials::{BmcCredentials, CredentialStore, DeviceCredStore};
pub use error::{Error, Result};
pub use reconcile::Reconciler;
pub use storage::{DeviceState, StateStore};
pub use supervisor::SwitchSupervisor;
pub use topology::TopologyClient;
