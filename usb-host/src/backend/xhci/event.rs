use dma_api::{DVec, Direction};
use mbarrier::rmb;
use xhci::ring::trb::event::Allowed;

use super::{
    ring::{Ring, RingKind},
    trb::TrbData,
};
use crate::{BusAddr, Kernel, err::*};

/// Event Ring Segment Table entry.
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct EventRingSte {
    pub addr: u64,
    pub size: u16,
    _reserved: [u8; 6],
}

/// Event ring plus its segment table.
pub struct EventRing {
    ring: Ring,
    ste: DVec<EventRingSte>,
}

unsafe impl Send for EventRing {}

impl EventRing {
    pub fn new(kernel: &dyn Kernel, segments: usize) -> Result<Self> {
        let ring = Ring::new(kernel, RingKind::Event, segments)?;
        let mut ste =
            DVec::zeros(segments, 64, Direction::Bidirectional).ok_or(USBError::NoMemory)?;

        for seg in 0..segments {
            let base = ring.segment_base(seg).ok_or(USBError::NoMemory)?;
            ste.set(
                seg,
                EventRingSte {
                    addr: base.raw(),
                    size: ring.segment_len() as _,
                    _reserved: [0; 6],
                },
            );
        }

        Ok(Self { ring, ste })
    }

    /// The event at the dequeue cursor, if software owns it. TRB types the
    /// `xhci` crate does not know come back as raw data so they can still be
    /// consumed.
    pub fn peek(&self) -> Option<core::result::Result<Allowed, TrbData>> {
        let cur = self.ring.dequeue_cursor();
        if self.ring.get(cur.slot).cycle_bit() != cur.cycle {
            return None;
        }
        // 看到新的 cycle 之后再读其余字段
        rmb();
        let data = self.ring.get(cur.slot);
        Some(data.event().ok_or(data))
    }

    pub fn advance(&mut self) {
        self.ring.dequeue_advance();
    }

    pub fn dequeue_addr(&self) -> BusAddr {
        self.ring.dequeue_addr()
    }

    /// Dequeue ERST Segment Index of the current dequeue pointer.
    pub fn desi(&self) -> u8 {
        (self.ring.dequeue_cursor().slot.seg & 0x7) as u8
    }

    /// ERDP value without the busy bit: dequeue pointer plus segment index.
    pub fn erdp(&self) -> u64 {
        (self.ring.dequeue_addr().raw() & !0xf) | self.desi() as u64
    }

    pub fn erstba(&self) -> u64 {
        self.ste.bus_addr()
    }

    pub fn len(&self) -> usize {
        self.ste.len()
    }

    pub fn ring(&self) -> &Ring {
        &self.ring
    }

    pub fn info(&self) -> EventRingInfo {
        EventRingInfo {
            erstz: self.len() as _,
            erdp: self.erdp(),
            erstba: self.erstba(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventRingInfo {
    pub erstz: u16,
    pub erdp: u64,
    pub erstba: u64,
}
