#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[macro_use]
extern crate log;

pub use usb_if::err::*;
pub use usb_if::transfer::*;

#[macro_use]
mod _macros;

pub mod backend;
pub mod err;
mod osal;
mod queue;
mod sync;

pub use backend::Dci;
pub use backend::xhci::*;
pub use osal::Kernel;
pub use queue::TWaiter;
pub use sync::IrqMask;

define_int_type!(BusAddr, u64);

impl BusAddr {
    pub const fn offset(&self, bytes: u64) -> Self {
        Self(self.0 + bytes)
    }
}
