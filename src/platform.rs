// SPDX-License-Identifier: MPL-2.0

//! The seam between the interrupt engine and the platform's interrupt
//! controller driver.

use alloc::sync::Arc;

use crate::error::Result;

/// What a low-level dispatch pass tells the platform on return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerReturn {
    /// No runnable of interest was woken.
    NoReschedule,
    /// A higher-priority runnable exists; the platform should reschedule
    /// on the way out of the interrupt.
    Reschedule,
}

/// A handler installed at the platform interrupt controller.
///
/// Invoked in hard-IRQ context; implementations must not block and must
/// not acquire any mutex-class lock.
pub trait InterruptHandler: Send + Sync {
    fn handle_interrupt(&self) -> HandlerReturn;
}

/// A contiguous range of platform IRQs granted atomically for one MSI
/// configuration.
///
/// The block is owned by the platform allocator and exclusively lent to
/// one device; it goes back with [`PciePlatform::free_msi_block`].
#[derive(Debug, Clone)]
pub struct MsiBlock {
    /// Opaque allocator bookkeeping, round-tripped untouched.
    pub platform_ctx: u64,
    /// First system vector of the block.
    pub base_irq_id: u32,
    /// Number of vectors in the block.
    pub num_irqs: u32,
    /// Address the function must target with its message write.
    pub tgt_addr: u64,
    /// Data payload for vector 0 of the block; vector `i` sends
    /// `tgt_data + i`.
    pub tgt_data: u32,
}

/// The platform interrupt controller primitives the engine relies on.
///
/// `alloc_msi_block` and `free_msi_block` may block; every other
/// operation must be non-blocking and callable with IRQs disabled.
pub trait PciePlatform: Send + Sync {
    /// Returns true if the platform can deliver MSIs at all.
    fn supports_msi(&self) -> bool;

    /// Returns true if individual vectors of an MSI block can be masked
    /// at the interrupt controller.
    fn supports_msi_masking(&self) -> bool;

    /// Allocates a contiguous block of `requested_irqs` MSI-capable
    /// vectors.
    ///
    /// Fails with [`Error::NotEnoughResources`] if the platform cannot
    /// satisfy the request.
    ///
    /// [`Error::NotEnoughResources`]: crate::Error::NotEnoughResources
    fn alloc_msi_block(
        &self,
        requested_irqs: u32,
        can_target_64bit: bool,
        is_msix: bool,
    ) -> Result<MsiBlock>;

    /// Returns a block to the platform.
    ///
    /// Must drain: any in-flight invocation of a handler registered on a
    /// vector of this block has returned before this call does. The
    /// engine relies on this to tear down handler storage safely.
    fn free_msi_block(&self, block: MsiBlock);

    /// Installs (or with `None`, removes) the handler for one vector of
    /// an allocated block.
    fn register_msi_handler(
        &self,
        block: &MsiBlock,
        irq_id: u32,
        handler: Option<Arc<dyn InterruptHandler>>,
    );

    /// Masks or unmasks one vector of an allocated block at the
    /// controller. Must only be called when [`supports_msi_masking`]
    /// returns true.
    ///
    /// [`supports_msi_masking`]: Self::supports_msi_masking
    fn mask_unmask_msi(&self, block: &MsiBlock, irq_id: u32, mask: bool);

    /// Masks a system vector at the controller.
    fn mask_vector(&self, vector: u32);

    /// Unmasks a system vector at the controller.
    fn unmask_vector(&self, vector: u32);

    /// Installs (or with `None`, removes) the handler for a system
    /// vector. Used for the shared legacy INTx dispatchers.
    fn register_int_handler(&self, vector: u32, handler: Option<Arc<dyn InterruptHandler>>);
}
