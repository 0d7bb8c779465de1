// SPDX-License-Identifier: MPL-2.0

//! PCI capability structures consumed by the interrupt engine.
//!
//! Walking the capability list is the enumerator's job; the engine is
//! handed the offset of the MSI capability (if any) and owns the
//! registers inside it from then on.

pub mod msi;
