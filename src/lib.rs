// SPDX-License-Identifier: MPL-2.0

//! PCIe interrupt management.
//!
//! For every PCIe function this engine arbitrates between the interrupt
//! delivery disciplines the bus defines — pin-based legacy INTx, MSI,
//! and (reserved) MSI-X — on behalf of in-kernel device drivers. It
//! owns the per-vector masking state across both masking levels (the
//! function's config space and the platform interrupt controller),
//! multiplexes shared legacy vectors across devices, borrows contiguous
//! MSI vector blocks from the platform, and dispatches hardware
//! interrupts to driver-registered callbacks.
//!
//! The engine sits between two seams it does not own: configuration
//! space is reached through [`PciConfigAccess`], and the platform
//! interrupt controller through [`PciePlatform`]. Bus enumeration, BAR
//! handling and capability-list parsing live upstream of this crate;
//! devices arrive here already located and parsed.

#![no_std]
#![deny(unsafe_code)]

extern crate alloc;
#[cfg(test)]
extern crate std;

pub mod capability;
pub mod cfg_space;

mod bus;
mod device;
mod device_info;
mod error;
mod handler;
mod legacy;
mod msi;
mod platform;

#[cfg(test)]
mod test_util;

pub use self::{
    bus::PcieBusDriver,
    cfg_space::{Command, PciCommonCfgOffset, PciConfigAccess, Status},
    device::{PcieDevice, PcieIrqMode, PcieIrqModeCaps, PcieIrqModeInfo},
    device_info::PciDeviceLocation,
    error::{Error, Result},
    handler::{IrqHandlerFn, IrqReturn},
    platform::{HandlerReturn, InterruptHandler, MsiBlock, PciePlatform},
};
