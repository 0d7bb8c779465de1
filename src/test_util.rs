// SPDX-License-Identifier: MPL-2.0

//! Fakes for the two external seams: the platform interrupt controller
//! and config space. Both record enough to let tests assert on
//! register-write ordering and mask state.

use alloc::{collections::BTreeMap, sync::Arc, vec::Vec};

use spin::Mutex;

use crate::{
    bus::PcieBusDriver,
    cfg_space::PciConfigAccess,
    device::PcieDevice,
    device_info::PciDeviceLocation,
    error::{Error, Result},
    handler::IrqReturn,
    platform::{HandlerReturn, InterruptHandler, MsiBlock, PciePlatform},
};

/// Where the fake enumerator "found" the MSI capability.
pub(crate) const MSI_CAP_PTR: u16 = 0x50;

/// MSI capability shape to synthesize into a fake config space.
#[derive(Debug, Clone, Copy)]
pub(crate) struct MsiCfg {
    /// Multi-Message Capable encoding (log2 of the advertised maximum).
    pub mmc: u16,
    pub is_64bit: bool,
    pub has_pvm: bool,
}

/// A 256-byte config image with a write journal.
pub(crate) struct FakeConfigSpace {
    regs: Mutex<[u32; 64]>,
    writes: Mutex<Vec<(u16, u32)>>,
}

impl FakeConfigSpace {
    pub(crate) fn new(pin: u8) -> Self {
        let mut regs = [0u32; 64];
        // Vendor/device id, so the image does not read as empty.
        regs[0] = 0x5049_1AF4;
        // Interrupt pin lives in byte 1 of the 0x3C dword.
        regs[0x3C / 4] = (pin as u32) << 8;
        Self {
            regs: Mutex::new(regs),
            writes: Mutex::new(Vec::new()),
        }
    }

    /// Synthesizes an MSI capability at [`MSI_CAP_PTR`].
    pub(crate) fn with_msi(self, msi: MsiCfg) -> Self {
        let mut ctrl: u16 = msi.mmc << 1;
        if msi.is_64bit {
            ctrl |= 1 << 7;
        }
        if msi.has_pvm {
            ctrl |= 1 << 8;
        }
        {
            let mut regs = self.regs.lock();
            // Capability id 0x05, no next pointer, control in the
            // upper half.
            regs[MSI_CAP_PTR as usize / 4] = 0x0005 | ((ctrl as u32) << 16);
        }
        self
    }

    /// Sets or clears the status register's interrupt-status bit.
    pub(crate) fn set_interrupt_status(&self, asserted: bool) {
        let mut regs = self.regs.lock();
        let bit = 1u32 << (3 + 16);
        if asserted {
            regs[0x04 / 4] |= bit;
        } else {
            regs[0x04 / 4] &= !bit;
        }
    }

    pub(crate) fn int_disable_set(&self) -> bool {
        self.read16(0x04) & (1 << 10) != 0
    }

    pub(crate) fn msi_ctrl(&self) -> u16 {
        self.read16(MSI_CAP_PTR + 2)
    }

    pub(crate) fn msi_enabled(&self) -> bool {
        self.msi_ctrl() & 1 != 0
    }

    pub(crate) fn msi_mme(&self) -> u16 {
        (self.msi_ctrl() >> 4) & 0b111
    }

    pub(crate) fn msi_mask_bits(&self, is_64bit: bool) -> u32 {
        let offset = MSI_CAP_PTR + if is_64bit { 0x10 } else { 0x0C };
        self.read32(offset)
    }

    /// Returns the journal of dword writes (sub-dword writes appear as
    /// the read-modify-written dword).
    pub(crate) fn writes(&self) -> Vec<(u16, u32)> {
        self.writes.lock().clone()
    }

    pub(crate) fn clear_writes(&self) {
        self.writes.lock().clear();
    }
}

impl PciConfigAccess for FakeConfigSpace {
    fn read32(&self, offset: u16) -> u32 {
        assert_eq!(offset & 0b11, 0);
        self.regs.lock()[offset as usize / 4]
    }

    fn write32(&self, offset: u16, val: u32) {
        assert_eq!(offset & 0b11, 0);
        self.regs.lock()[offset as usize / 4] = val;
        self.writes.lock().push((offset, val));
    }
}

#[derive(Default)]
struct PlatformState {
    fail_next_alloc: bool,
    next_block_id: u64,
    live_blocks: Vec<MsiBlock>,
    freed_blocks: Vec<u64>,
    int_handlers: BTreeMap<u32, Arc<dyn InterruptHandler>>,
    /// true = masked. Vectors start masked.
    vector_masked: BTreeMap<u32, bool>,
    msi_handlers: BTreeMap<(u64, u32), Arc<dyn InterruptHandler>>,
    msi_masked: BTreeMap<(u64, u32), bool>,
    /// Journal of (block, irq_id, mask) calls.
    msi_mask_calls: Vec<(u64, u32, bool)>,
}

/// A platform facade that records everything.
pub(crate) struct FakePlatform {
    supports_msi: bool,
    supports_msi_masking: bool,
    state: Mutex<PlatformState>,
}

impl FakePlatform {
    pub(crate) fn new(supports_msi: bool, supports_msi_masking: bool) -> Arc<Self> {
        Arc::new(Self {
            supports_msi,
            supports_msi_masking,
            state: Mutex::new(PlatformState::default()),
        })
    }

    pub(crate) fn fail_next_alloc(&self) {
        self.state.lock().fail_next_alloc = true;
    }

    pub(crate) fn is_vector_masked(&self, vector: u32) -> bool {
        *self.state.lock().vector_masked.get(&vector).unwrap_or(&true)
    }

    pub(crate) fn has_int_handler(&self, vector: u32) -> bool {
        self.state.lock().int_handlers.contains_key(&vector)
    }

    /// Simulates the controller raising a system vector. Delivery
    /// ignores the mask state so tests can probe the spurious paths.
    pub(crate) fn deliver_vector(&self, vector: u32) -> Option<HandlerReturn> {
        let handler = self.state.lock().int_handlers.get(&vector).cloned();
        handler.map(|h| h.handle_interrupt())
    }

    pub(crate) fn last_block(&self) -> Option<MsiBlock> {
        self.state.lock().live_blocks.last().cloned()
    }

    pub(crate) fn live_block_count(&self) -> usize {
        self.state.lock().live_blocks.len()
    }

    pub(crate) fn freed_block_count(&self) -> usize {
        self.state.lock().freed_blocks.len()
    }

    pub(crate) fn msi_handler_count(&self) -> usize {
        self.state.lock().msi_handlers.len()
    }

    pub(crate) fn is_msi_masked(&self, block: &MsiBlock, irq_id: u32) -> bool {
        *self
            .state
            .lock()
            .msi_masked
            .get(&(block.platform_ctx, irq_id))
            .unwrap_or(&false)
    }

    pub(crate) fn msi_mask_calls(&self) -> Vec<(u64, u32, bool)> {
        self.state.lock().msi_mask_calls.clone()
    }

    /// Simulates the controller raising one vector of an MSI block.
    pub(crate) fn deliver_msi(&self, block: &MsiBlock, irq_id: u32) -> Option<HandlerReturn> {
        let handler = self
            .state
            .lock()
            .msi_handlers
            .get(&(block.platform_ctx, irq_id))
            .cloned();
        handler.map(|h| h.handle_interrupt())
    }
}

impl PciePlatform for FakePlatform {
    fn supports_msi(&self) -> bool {
        self.supports_msi
    }

    fn supports_msi_masking(&self) -> bool {
        self.supports_msi_masking
    }

    fn alloc_msi_block(
        &self,
        requested_irqs: u32,
        _can_target_64bit: bool,
        is_msix: bool,
    ) -> Result<MsiBlock> {
        assert!(!is_msix, "MSI-X blocks are not a thing yet");
        assert!(self.supports_msi);

        let mut state = self.state.lock();
        if state.fail_next_alloc {
            state.fail_next_alloc = false;
            return Err(Error::NotEnoughResources);
        }

        let id = state.next_block_id;
        state.next_block_id += 1;
        let block = MsiBlock {
            platform_ctx: id,
            base_irq_id: 0x30 + (id as u32) * 0x20,
            num_irqs: requested_irqs,
            tgt_addr: 0xFEE0_0000,
            tgt_data: 0x40 + (id as u32) * 0x20,
        };
        state.live_blocks.push(block.clone());
        Ok(block)
    }

    fn free_msi_block(&self, block: MsiBlock) {
        let mut state = self.state.lock();
        // The engine must have pulled every handler first; with no
        // handler left to run, the drain guarantee holds trivially.
        for irq_id in 0..block.num_irqs {
            assert!(!state
                .msi_handlers
                .contains_key(&(block.platform_ctx, irq_id)));
        }
        let pos = state
            .live_blocks
            .iter()
            .position(|b| b.platform_ctx == block.platform_ctx)
            .expect("freeing a block that was never allocated");
        state.live_blocks.remove(pos);
        state.freed_blocks.push(block.platform_ctx);
    }

    fn register_msi_handler(
        &self,
        block: &MsiBlock,
        irq_id: u32,
        handler: Option<Arc<dyn InterruptHandler>>,
    ) {
        assert!(irq_id < block.num_irqs);
        let mut state = self.state.lock();
        match handler {
            Some(handler) => {
                state
                    .msi_handlers
                    .insert((block.platform_ctx, irq_id), handler);
            }
            None => {
                state.msi_handlers.remove(&(block.platform_ctx, irq_id));
            }
        }
    }

    fn mask_unmask_msi(&self, block: &MsiBlock, irq_id: u32, mask: bool) {
        assert!(self.supports_msi_masking);
        let mut state = self.state.lock();
        state.msi_masked.insert((block.platform_ctx, irq_id), mask);
        state.msi_mask_calls.push((block.platform_ctx, irq_id, mask));
    }

    fn mask_vector(&self, vector: u32) {
        self.state.lock().vector_masked.insert(vector, true);
    }

    fn unmask_vector(&self, vector: u32) {
        self.state.lock().vector_masked.insert(vector, false);
    }

    fn register_int_handler(&self, vector: u32, handler: Option<Arc<dyn InterruptHandler>>) {
        let mut state = self.state.lock();
        match handler {
            Some(handler) => {
                state.int_handlers.insert(vector, handler);
            }
            None => {
                state.int_handlers.remove(&vector);
            }
        }
    }
}

/// Records handler invocations and returns a configurable value.
pub(crate) struct HandlerLog {
    calls: Mutex<Vec<(PciDeviceLocation, u32)>>,
    ret: Mutex<IrqReturn>,
}

impl HandlerLog {
    pub(crate) fn new(ret: IrqReturn) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            ret: Mutex::new(ret),
        })
    }

    /// Builds a closure suitable for `register_irq_handler`.
    pub(crate) fn hook(
        self: &Arc<Self>,
    ) -> impl Fn(&PcieDevice, u32) -> IrqReturn + Send + Sync + 'static {
        let log = self.clone();
        move |dev: &PcieDevice, irq_id: u32| -> IrqReturn {
            log.calls.lock().push((dev.location(), irq_id));
            *log.ret.lock()
        }
    }

    pub(crate) fn set_ret(&self, ret: IrqReturn) {
        *self.ret.lock() = ret;
    }

    pub(crate) fn calls(&self) -> Vec<(PciDeviceLocation, u32)> {
        self.calls.lock().clone()
    }

    pub(crate) fn count(&self) -> usize {
        self.calls.lock().len()
    }
}

/// One device wired up to a fake platform and config space.
pub(crate) struct TestEnv {
    pub(crate) platform: Arc<FakePlatform>,
    pub(crate) bus: Arc<PcieBusDriver>,
    pub(crate) cfg: Arc<FakeConfigSpace>,
    pub(crate) dev: Arc<PcieDevice>,
}

impl TestEnv {
    pub(crate) fn new(
        platform: Arc<FakePlatform>,
        pin: u8,
        vector: Option<u32>,
        msi: Option<MsiCfg>,
    ) -> Self {
        let bus = PcieBusDriver::new(platform.clone());
        let (cfg, dev) = build_device(
            &bus,
            PciDeviceLocation {
                bus: 0,
                device: 3,
                function: 0,
            },
            pin,
            vector,
            msi,
        );
        Self {
            platform,
            bus,
            cfg,
            dev,
        }
    }

    /// Adds another device on the same bus driver.
    pub(crate) fn attach_sibling(
        &self,
        device: u8,
        pin: u8,
        vector: Option<u32>,
        msi: Option<MsiCfg>,
    ) -> (Arc<FakeConfigSpace>, Arc<PcieDevice>) {
        build_device(
            &self.bus,
            PciDeviceLocation {
                bus: 0,
                device,
                function: 0,
            },
            pin,
            vector,
            msi,
        )
    }
}

fn build_device(
    bus: &Arc<PcieBusDriver>,
    location: PciDeviceLocation,
    pin: u8,
    vector: Option<u32>,
    msi: Option<MsiCfg>,
) -> (Arc<FakeConfigSpace>, Arc<PcieDevice>) {
    let mut cfg = FakeConfigSpace::new(pin);
    if let Some(msi) = msi {
        cfg = cfg.with_msi(msi);
    }
    let cfg = Arc::new(cfg);
    let dev = PcieDevice::new(
        bus,
        location,
        cfg.clone(),
        msi.map(|_| MSI_CAP_PTR),
        vector,
    )
    .expect("device construction failed");
    (cfg, dev)
}
