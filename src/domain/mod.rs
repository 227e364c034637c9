//! Domain layer: ports and events
//!
//! - [`ports`] - trait seams the reconciliation core depends on
//! - [`events`] - audit records for significant discovery occurrences

pub mod events;
pub mod ports;

pub use events::DiscoveryEvent;
pub use ports::{AddressingNotifier, InventoryBoundary, PortResolver};
