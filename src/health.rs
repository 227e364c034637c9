//! Shared health flags backing the readiness probe.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Readiness signals updated by the background watchers.
#[derive(Default)]
pub struct Health {
    topology_read: AtomicBool,
    fabric_list_read: AtomicBool,
}

impl Health {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Marks that at least one topology poll has succeeded.
    pub fn set_topology_read(&self) {
        self.topology_read.store(true, Ordering::Relaxed);
    }

    /// Whether the switch inventory has been read successfully yet.
    pub fn topology_read(&self) -> bool {
        self.topology_read.load(Ordering::Relaxed)
    }

    /// Marks that the fabric switch list has been read successfully.
    pub fn set_fabric_list_read(&self) {
        self.fabric_list_read.store(true, Ordering::Relaxed);
    }

    /// Whether the fabric switch list has been read successfully yet.
    pub fn fabric_list_read(&self) -> bool {
        self.fabric_list_read.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_latch_independently() {
        let health = Health::new();
        assert!(!health.topology_read());
        assert!(!health.fabric_list_read());

        health.set_topology_read();
        assert!(health.topology_read());
        assert!(!health.fabric_list_read());

        health.set_fabric_list_read();
        assert!(health.fabric_list_read());
    }
}
