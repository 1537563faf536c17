use alloc::vec::Vec;

use dma_api::{DVec, Direction};
use mbarrier::wmb;
use xhci::ring::trb::{Link, transfer};

use super::trb::{RingTrb, TRB_SIZE, TrbData};
use crate::{BusAddr, Kernel, err::*};

pub const TRBS_PER_SEGMENT: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingKind {
    Command,
    Transfer,
    /// Produced by hardware; segments are chained through the ERST, not links.
    Event,
}

/// Position of a TRB: segment index and TRB index inside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlotRef {
    pub seg: usize,
    pub idx: usize,
}

/// A position together with the cycle state a TRB there must carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    pub slot: SlotRef,
    pub cycle: bool,
}

pub(crate) struct Segment {
    pub trbs: DVec<TrbData>,
    /// Link TRB of this segment carries Toggle Cycle.
    pub toggle: bool,
}

pub struct Ring {
    kind: RingKind,
    segs: Vec<Segment>,
    enqueue: Cursor,
    dequeue: Cursor,
}

unsafe impl Send for Ring {}

impl Ring {
    pub fn new(kernel: &dyn Kernel, kind: RingKind, segments: usize) -> Result<Self> {
        if segments == 0 {
            return Err(USBError::InvalidParameter);
        }
        let mut segs = Vec::with_capacity(segments);
        for i in 0..segments {
            let trbs = DVec::zeros(
                TRBS_PER_SEGMENT,
                kernel.page_size().max(64),
                Direction::Bidirectional,
            )
            .ok_or(USBError::NoMemory)?;
            segs.push(Segment {
                trbs,
                toggle: i == segments - 1,
            });
        }
        let mut ring = Self {
            kind,
            segs,
            enqueue: Cursor {
                slot: SlotRef { seg: 0, idx: 0 },
                cycle: true,
            },
            dequeue: Cursor {
                slot: SlotRef { seg: 0, idx: 0 },
                cycle: true,
            },
        };
        if kind != RingKind::Event {
            // Link TRB 的 cycle 初始为 0，入队经过时再交给硬件
            for i in 0..segments {
                let link = ring.link_trb(i, false).with_cycle(false);
                ring.segs[i].trbs.set(TRBS_PER_SEGMENT - 1, link);
            }
        }
        Ok(ring)
    }

    pub fn kind(&self) -> RingKind {
        self.kind
    }

    pub fn segment_count(&self) -> usize {
        self.segs.len()
    }

    pub fn segment_len(&self) -> usize {
        TRBS_PER_SEGMENT
    }

    pub fn segment_base(&self, seg: usize) -> Option<BusAddr> {
        self.segs.get(seg).map(|s| BusAddr::from(s.trbs.bus_addr()))
    }

    pub fn bus_addr(&self) -> BusAddr {
        self.slot_addr(SlotRef { seg: 0, idx: 0 })
    }

    /// Link TRB closing segment `seg`, cycle bit left clear.
    fn link_trb(&self, seg: usize, chain: bool) -> transfer::Allowed {
        let next = self.segs[(seg + 1) % self.segs.len()].trbs.bus_addr();
        let mut link = Link::new();
        link.set_ring_segment_pointer(next);
        if self.segs[seg].toggle {
            link.set_toggle_cycle();
        }
        if chain && !cfg!(feature = "link_chain_quirk") {
            link.set_chain_bit();
        }
        transfer::Allowed::Link(link)
    }

    /// Usable TRBs of the ring, link TRBs excluded.
    pub fn capacity(&self) -> usize {
        let per_seg = match self.kind {
            RingKind::Event => TRBS_PER_SEGMENT,
            _ => TRBS_PER_SEGMENT - 1,
        };
        self.segs.len() * per_seg
    }

    pub fn enqueue_cursor(&self) -> Cursor {
        self.enqueue
    }

    pub fn dequeue_cursor(&self) -> Cursor {
        self.dequeue
    }

    /// Producer cycle state.
    pub fn cycle(&self) -> bool {
        self.enqueue.cycle
    }

    pub fn is_empty(&self) -> bool {
        self.skip_links(self.enqueue.slot) == self.dequeue.slot
    }

    pub fn get(&self, slot: SlotRef) -> TrbData {
        self.segs[slot.seg].trbs.get(slot.idx).unwrap_or_default()
    }

    fn set(&mut self, slot: SlotRef, trb: TrbData) {
        self.segs[slot.seg].trbs.set(slot.idx, trb);
    }

    pub fn slot_addr(&self, slot: SlotRef) -> BusAddr {
        BusAddr::from(self.segs[slot.seg].trbs.bus_addr() + (slot.idx * TRB_SIZE) as u64)
    }

    pub fn enqueue_addr(&self) -> BusAddr {
        self.slot_addr(self.enqueue.slot)
    }

    pub fn dequeue_addr(&self) -> BusAddr {
        self.slot_addr(self.dequeue.slot)
    }

    /// Finds the TRB at `addr` in the segment list.
    pub fn locate(&self, addr: BusAddr) -> Option<SlotRef> {
        let addr = addr.raw();
        self.segs.iter().enumerate().find_map(|(seg, s)| {
            let base = s.trbs.bus_addr();
            let end = base + (s.trbs.len() * TRB_SIZE) as u64;
            if addr < base || addr >= end || (addr - base) % TRB_SIZE as u64 != 0 {
                return None;
            }
            Some(SlotRef {
                seg,
                idx: ((addr - base) / TRB_SIZE as u64) as usize,
            })
        })
    }

    fn is_link_slot(&self, slot: SlotRef) -> bool {
        self.kind != RingKind::Event && slot.idx == TRBS_PER_SEGMENT - 1
    }

    /// Next physical position, link TRBs included.
    pub fn next_slot(&self, slot: SlotRef) -> SlotRef {
        if slot.idx + 1 < TRBS_PER_SEGMENT {
            SlotRef {
                seg: slot.seg,
                idx: slot.idx + 1,
            }
        } else {
            SlotRef {
                seg: (slot.seg + 1) % self.segs.len(),
                idx: 0,
            }
        }
    }

    fn skip_links(&self, mut slot: SlotRef) -> SlotRef {
        while self.is_link_slot(slot) {
            slot = self.next_slot(slot);
        }
        slot
    }

    /// One consumer step. Transfer and command rings jump segments through
    /// their link TRBs; the event ring toggles cycle at the ERST wraparound.
    pub fn step(&self, cur: Cursor) -> Cursor {
        let mut slot = self.next_slot(cur.slot);
        let mut cycle = cur.cycle;
        match self.kind {
            RingKind::Event => {
                if slot.idx == 0 && slot.seg == 0 {
                    cycle = !cycle;
                }
            }
            _ => {
                while self.is_link_slot(slot) {
                    if self.segs[slot.seg].toggle {
                        cycle = !cycle;
                    }
                    slot = self.next_slot(slot);
                }
            }
        }
        Cursor { slot, cycle }
    }

    pub fn dequeue_advance(&mut self) {
        self.dequeue = self.step(self.dequeue);
        trace!("{:?} ring deq -> {:#x}", self.kind, self.dequeue_addr());
    }

    /// Cursor just after `last`, walking forward from the dequeue cursor.
    pub fn position_after(&self, last: SlotRef) -> Option<Cursor> {
        let mut cur = self.dequeue;
        for _ in 0..=self.segs.len() * TRBS_PER_SEGMENT {
            let at = cur.slot;
            cur = self.step(cur);
            if at == last {
                return Some(cur);
            }
        }
        None
    }

    /// Moves the dequeue cursor past `last`.
    pub fn advance_past(&mut self, last: SlotRef) {
        if let Some(cur) = self.position_after(last) {
            self.dequeue = cur;
        } else {
            warn!("{:?} ring: {:?} not ahead of dequeue", self.kind, last);
        }
    }

    pub fn set_dequeue(&mut self, cur: Cursor) {
        self.dequeue = cur;
    }

    /// Whether `n` TRBs fit while keeping one slot free, so that a full ring
    /// never looks empty.
    pub fn has_room(&self, n: usize) -> bool {
        let mut enq = self.skip_links(self.enqueue.slot);
        if enq == self.dequeue.slot {
            return n < self.capacity();
        }
        for _ in 0..=n {
            if enq == self.dequeue.slot {
                return false;
            }
            enq = self.skip_links(self.next_slot(enq));
        }
        true
    }

    /// Hands any link TRB the enqueue cursor is parked on to the hardware.
    fn hand_over_links(&mut self) {
        while self.is_link_slot(self.enqueue.slot) {
            self.give_link(false);
        }
    }

    fn give_link(&mut self, chain: bool) {
        let slot = self.enqueue.slot;
        let link = self.link_trb(slot.seg, chain).with_cycle(self.enqueue.cycle);
        wmb();
        self.set(slot, link);
        if self.segs[slot.seg].toggle {
            self.enqueue.cycle = !self.enqueue.cycle;
        }
        self.enqueue.slot = self.next_slot(slot);
    }

    /// Producer step after writing a TRB. A link TRB reached at the end of a
    /// TD stays parked unless more TRBs follow.
    fn inc_enqueue(&mut self, chain: bool, more_trbs_coming: bool) {
        self.enqueue.slot = self.next_slot(self.enqueue.slot);
        while self.is_link_slot(self.enqueue.slot) {
            if !chain && !more_trbs_coming {
                break;
            }
            self.give_link(chain);
        }
    }

    /// Writes `trbs` as one contiguous batch and returns their positions. The
    /// first TRB becomes hardware-owned only after the rest are written.
    pub fn enqueue<T: RingTrb>(&mut self, trbs: &[T]) -> Result<Vec<SlotRef>> {
        self.enqueue_batch(trbs, false)
    }

    /// Like [`Ring::enqueue`], with `more_trbs_coming` telling whether another
    /// batch follows before the doorbell.
    pub fn enqueue_batch<T: RingTrb>(
        &mut self,
        trbs: &[T],
        more_trbs_coming: bool,
    ) -> Result<Vec<SlotRef>> {
        if trbs.is_empty() {
            return Ok(Vec::new());
        }
        if self.kind == RingKind::Event {
            return Err(USBError::InvalidParameter);
        }
        if !self.has_room(trbs.len()) {
            return Err(USBError::InsufficientRingSpace);
        }
        self.hand_over_links();

        let first = self.enqueue;
        let mut slots = Vec::with_capacity(trbs.len());
        for (i, trb) in trbs.iter().enumerate() {
            let slot = self.enqueue.slot;
            // 第一个 TRB 先写反相 cycle，整批写完再交给硬件
            let cycle = if i == 0 {
                !self.enqueue.cycle
            } else {
                self.enqueue.cycle
            };
            self.set(slot, trb.with_cycle(cycle));
            trace!("[{:?}] >> {trb:X?} @{:#x}", self.kind, self.slot_addr(slot));
            slots.push(slot);
            let more = i + 1 < trbs.len() || more_trbs_coming;
            self.inc_enqueue(trb.chain(), more);
        }

        wmb();
        self.set(first.slot, trbs[0].with_cycle(first.cycle));
        Ok(slots)
    }

    /// Whether `slot` lies in the circular range `start..=end`.
    pub fn range_contains(&self, start: SlotRef, end: SlotRef, slot: SlotRef) -> bool {
        let total = self.segs.len() * TRBS_PER_SEGMENT;
        let ord = |s: SlotRef| s.seg * TRBS_PER_SEGMENT + s.idx;
        let span = (ord(end) + total - ord(start)) % total;
        let off = (ord(slot) + total - ord(start)) % total;
        off <= span
    }

    /// Sum of configured lengths over `from..to`, skipping no-op and link TRBs.
    pub fn sum_lengths(&self, from: SlotRef, to: SlotRef) -> usize {
        let mut sum = 0;
        let mut cur = from;
        for _ in 0..self.segs.len() * TRBS_PER_SEGMENT {
            if cur == to {
                break;
            }
            sum += self.get(cur).transfer_len();
            cur = self.next_slot(cur);
        }
        sum
    }

    /// Turns `first..=last` into no-ops in place. Cycle bits stay, link TRBs
    /// keep their pointers and only lose the chain bit.
    pub fn td_to_noop(&mut self, first: SlotRef, last: SlotRef) {
        let mut cur = first;
        loop {
            let trb = self.get(cur);
            let noop = if trb.is_link() {
                self.link_trb(cur.seg, false)
            } else {
                transfer::Allowed::Noop(transfer::Noop::new())
            };
            self.set(cur, noop.with_cycle(trb.cycle_bit()));
            trace!("noop @{:#x}", self.slot_addr(cur));
            if cur == last {
                break;
            }
            cur = self.next_slot(cur);
        }
    }
}
