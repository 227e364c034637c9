//! Domain Ports (Port/Adapter Pattern)
//!
//! The reconciliation core depends on these abstractions; infrastructure
//! adapters ([`crate::topology`], [`crate::inventory`]) implement them.
//! Tests swap in in-memory implementations.

use async_trait::async_trait;

use crate::error::Result;

// =============================================================================
// Port-to-identity resolution
// =============================================================================

/// Resolves a switch/port attachment point to the stable identity (xname)
/// of the device on the other end.
///
/// Resolution is N-to-1: many ports resolve to one identity each, never
/// the reverse.
#[async_trait]
pub trait PortResolver: Send + Sync {
    /// Returns the xname of the device attached to `port` on `switch_name`.
    async fn resolve(&self, switch_name: &str, port: &str) -> Result<String>;
}

// =============================================================================
// Inventory boundary
// =============================================================================

/// The slice of the inventory service the reconciliation core talks to.
///
/// Credentials travel through the secret store, never through this
/// boundary; registration carries blank credential fields so the
/// inventory service pulls from the secret store itself.
#[async_trait]
pub trait InventoryBoundary: Send + Sync {
    /// Registers a fully discovered device. Returns true if the device
    /// ended up registered and enabled (freshly created or re-enabled).
    async fn notify_discovered(&self, xname: &str, mac: &str, ip_address: &str) -> Result<bool>;

    /// Returns the MAC address the inventory service currently records
    /// for an endpoint, or `None` if the endpoint is unknown.
    async fn recorded_mac(&self, xname: &str) -> Result<Option<String>>;
}

// =============================================================================
// Addressing boundary
// =============================================================================

/// Optional DNS/DHCP boundary notified when a device becomes ready.
/// Best-effort: failures are logged, never retried.
#[async_trait]
pub trait AddressingNotifier: Send + Sync {
    async fn notify_ready(&self, xname: &str, mac: &str, ip_address: &str) -> Result<()>;
}
