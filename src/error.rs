// SPDX-License-Identifier: MPL-2.0

/// The error type which is returned from the APIs of this crate.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Error {
    /// A caller-supplied argument is out of range or malformed.
    InvalidArgs,
    /// The operation is not permitted in the device's current state, or
    /// the device has been unplugged or disabled.
    BadState,
    /// The requested mode or masking operation is not supported by the
    /// device, the platform, or this implementation.
    NotSupported,
    /// A handler-table allocation failed.
    NoMemory,
    /// The platform refused to hand out the requested resources.
    NotEnoughResources,
    /// An invariant violation reached a supposedly-impossible branch.
    /// Callers should treat this as a bug in the interrupt engine.
    Internal,
}

pub type Result<T> = core::result::Result<T, Error>;
