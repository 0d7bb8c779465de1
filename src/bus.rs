// SPDX-License-Identifier: MPL-2.0

//! The bus-driver slice the interrupt engine needs: the platform handle
//! and the registry of shared legacy dispatchers.

use alloc::{sync::Arc, vec::Vec};

use log::debug;
use spin::Mutex;

use crate::{legacy::SharedLegacyIrqHandler, platform::PciePlatform};

/// Bus-level state shared by every device the engine manages.
pub struct PcieBusDriver {
    platform: Arc<dyn PciePlatform>,
    /// Registry of shared legacy handlers, keyed by system vector.
    /// Leaf mutex; may be taken while a device lock is held, never
    /// together with a dispatcher's list lock.
    legacy_irq_list: Mutex<Vec<Arc<SharedLegacyIrqHandler>>>,
}

impl PcieBusDriver {
    pub fn new(platform: Arc<dyn PciePlatform>) -> Arc<Self> {
        Arc::new(Self {
            platform,
            legacy_irq_list: Mutex::new(Vec::new()),
        })
    }

    /// Returns the platform interrupt facade.
    pub fn platform(&self) -> &Arc<dyn PciePlatform> {
        &self.platform
    }

    /// Returns the shared handler for a system vector, creating and
    /// registering it (masked) on first use.
    pub(crate) fn find_legacy_irq_handler(&self, vector: u32) -> Arc<SharedLegacyIrqHandler> {
        let mut list = self.legacy_irq_list.lock();

        if let Some(handler) = list.iter().find(|h| h.vector() == vector) {
            return handler.clone();
        }

        debug!("creating shared legacy IRQ handler for system vector {}", vector);
        let handler = SharedLegacyIrqHandler::new(vector, self.platform.clone());
        list.push(handler.clone());
        handler
    }

    /// Drops the registry's references to every shared legacy handler.
    ///
    /// Every device must already have been moved out of legacy mode;
    /// handlers with no remaining holders mask their vector and
    /// unregister from the platform as they go.
    pub fn shutdown_irqs(&self) {
        self.legacy_irq_list.lock().clear();
    }
}
