//! TRB 存储
//!
//! 各类 TRB 的字段由 `xhci` crate 构造和解析，环上只保存原始的 4 个 dword。

use core::fmt;

use xhci::ring::trb::{command, event, transfer};

pub use xhci::ring::trb::event::CompletionCode;

use crate::BusAddr;

pub const TRB_LEN: usize = 4;
pub const TRB_SIZE: usize = size_of::<TrbData>();
/// A TRB buffer never crosses a 64 KiB boundary.
pub const TRB_MAX_BUFF_SHIFT: u32 = 16;
pub const TRB_MAX_BUFF_SIZE: usize = 1 << TRB_MAX_BUFF_SHIFT;
const TD_SIZE_MAX: u32 = 31;
/// Cycle bit, bit 0 of the control dword for every TRB type.
const CYCLE_BIT: u32 = 1;

/// Completion Code field as decoded by `xhci`. Codes without a variant
/// (reserved and vendor defined) come back as the raw byte.
pub type Completion = core::result::Result<CompletionCode, u8>;

/// Vendor defined information codes, reported on otherwise successful TDs.
pub fn is_vendor_info(code: Completion) -> bool {
    matches!(code, Err(224..=255))
}

/// Codes after which the host leaves the endpoint halted without a stall
/// handshake, so software has to reset it.
pub fn requires_manual_halt_cleanup(code: Completion) -> bool {
    matches!(
        code,
        Ok(CompletionCode::UsbTransactionError
            | CompletionCode::BabbleDetectedError
            | CompletionCode::SplitTransactionError
            | CompletionCode::TrbError)
    )
}

#[derive(Clone, Copy, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct TrbData([u32; TRB_LEN]);

impl TrbData {
    pub const fn from_raw(raw: [u32; TRB_LEN]) -> Self {
        Self(raw)
    }

    pub fn to_raw(&self) -> [u32; TRB_LEN] {
        self.0
    }

    pub fn cycle_bit(&self) -> bool {
        self.0[TRB_LEN - 1] & CYCLE_BIT != 0
    }

    pub fn transfer(&self) -> Option<transfer::Allowed> {
        transfer::Allowed::try_from(self.0).ok()
    }

    pub fn command(&self) -> Option<command::Allowed> {
        command::Allowed::try_from(self.0).ok()
    }

    pub fn event(&self) -> Option<event::Allowed> {
        event::Allowed::try_from(self.0).ok()
    }

    pub fn is_link(&self) -> bool {
        matches!(self.transfer(), Some(transfer::Allowed::Link(_)))
    }

    /// TRB Transfer Length of Normal, Isoch and Data Stage TRBs; 0 otherwise.
    pub fn transfer_len(&self) -> usize {
        match self.transfer() {
            Some(transfer::Allowed::Normal(t)) => t.trb_transfer_length() as usize,
            Some(transfer::Allowed::Isoch(t)) => t.trb_transfer_length() as usize,
            Some(transfer::Allowed::DataStage(t)) => t.trb_transfer_length() as usize,
            _ => 0,
        }
    }
}

impl fmt::Debug for TrbData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.transfer() {
            Some(trb) => write!(f, "{trb:?}"),
            None => write!(f, "TrbData({:08x?})", self.0),
        }
    }
}

impl From<command::Allowed> for TrbData {
    fn from(value: command::Allowed) -> Self {
        Self(value.into_raw())
    }
}

impl From<transfer::Allowed> for TrbData {
    fn from(value: transfer::Allowed) -> Self {
        Self(value.into_raw())
    }
}

/// A TRB a producer ring can carry.
pub trait RingTrb: Copy + fmt::Debug {
    fn with_cycle(self, cycle: bool) -> TrbData;

    fn chain(&self) -> bool;
}

impl RingTrb for transfer::Allowed {
    fn with_cycle(mut self, cycle: bool) -> TrbData {
        if cycle {
            self.set_cycle_bit();
        } else {
            self.clear_cycle_bit();
        }
        self.into()
    }

    fn chain(&self) -> bool {
        match self {
            transfer::Allowed::Normal(t) => t.chain_bit(),
            transfer::Allowed::DataStage(t) => t.chain_bit(),
            transfer::Allowed::StatusStage(t) => t.chain_bit(),
            transfer::Allowed::Isoch(t) => t.chain_bit(),
            transfer::Allowed::Link(t) => t.chain_bit(),
            transfer::Allowed::EventData(t) => t.chain_bit(),
            transfer::Allowed::Noop(t) => t.chain_bit(),
            transfer::Allowed::SetupStage(_) => false,
        }
    }
}

impl RingTrb for command::Allowed {
    fn with_cycle(mut self, cycle: bool) -> TrbData {
        if cycle {
            self.set_cycle_bit();
        } else {
            self.clear_cycle_bit();
        }
        self.into()
    }

    fn chain(&self) -> bool {
        false
    }
}

/// TD Size of a TRB: packets still to be sent after this one, capped at 31.
/// Always zero for the last TRB of a TD.
pub fn td_remainder(sent_after: usize, total: usize, max_packet: u16, last: bool) -> u8 {
    if last || max_packet == 0 {
        return 0;
    }
    let maxp = max_packet as usize;
    let total_packets = total.div_ceil(maxp);
    let remaining = total_packets.saturating_sub(sent_after / maxp);
    (remaining as u32).min(TD_SIZE_MAX) as u8
}

/// Length of the first chunk of a buffer, up to the next 64 KiB boundary.
pub fn first_chunk_len(addr: BusAddr, len: usize) -> usize {
    let to_boundary = TRB_MAX_BUFF_SIZE - (addr.raw() as usize & (TRB_MAX_BUFF_SIZE - 1));
    len.min(to_boundary)
}

/// Splits `[addr, addr + len)` at every 64 KiB boundary.
pub fn split_at_boundaries(addr: BusAddr, len: usize) -> impl Iterator<Item = (BusAddr, usize)> {
    let mut cur = addr.raw();
    let mut left = len;
    let mut first = true;
    core::iter::from_fn(move || {
        if left == 0 && !first {
            return None;
        }
        first = false;
        let chunk = first_chunk_len(cur.into(), left);
        let item = (BusAddr::from(cur), chunk);
        cur += chunk as u64;
        left -= chunk;
        Some(item)
    })
}

/// Transfer event fields the TD handlers work on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferEvent {
    pub trb_addr: BusAddr,
    /// Residual bytes not transferred, or the accumulated length for event data.
    pub length: usize,
    pub code: Completion,
    pub event_data: bool,
    pub dci: u8,
    pub slot_id: u8,
}

impl From<&event::TransferEvent> for TransferEvent {
    fn from(ev: &event::TransferEvent) -> Self {
        Self {
            trb_addr: ev.trb_pointer().into(),
            length: ev.trb_transfer_length() as usize,
            code: ev.completion_code(),
            event_data: ev.event_data(),
            dci: ev.endpoint_id(),
            slot_id: ev.slot_id(),
        }
    }
}

#[cfg(test)]
mod tests {
    use xhci::ring::trb::{Link, transfer::Normal};

    use super::*;

    #[test]
    fn cycle_is_set_last_by_the_ring() {
        let trb = transfer::Allowed::Normal(
            *Normal::new()
                .set_data_buffer_pointer(0x1234_5678_9abc_def0)
                .set_trb_transfer_length(512)
                .set_chain_bit(),
        );
        let data = trb.with_cycle(true);
        assert!(data.cycle_bit());
        assert_eq!(data.transfer_len(), 512);
        assert!(trb.chain());
        assert!(!trb.with_cycle(false).cycle_bit());
        assert_eq!(data.to_raw()[0], 0x9abc_def0);
    }

    #[test]
    fn link_is_recognised() {
        let mut link = Link::new();
        link.set_ring_segment_pointer(0x4000).set_toggle_cycle();
        let data = transfer::Allowed::Link(link).with_cycle(false);
        assert!(data.is_link());
        assert_eq!(data.transfer_len(), 0);
    }

    #[test]
    fn vendor_band_and_manual_halt() {
        assert!(is_vendor_info(Err(224)));
        assert!(is_vendor_info(Err(255)));
        assert!(!is_vendor_info(Err(223)));
        assert!(!is_vendor_info(Ok(CompletionCode::Success)));
        assert!(requires_manual_halt_cleanup(Ok(
            CompletionCode::UsbTransactionError
        )));
        assert!(!requires_manual_halt_cleanup(Ok(CompletionCode::StallError)));
    }

    #[test]
    fn td_remainder_caps_and_ends_at_zero() {
        assert_eq!(td_remainder(512, 4096, 512, false), 7);
        assert_eq!(td_remainder(4096, 4096, 512, true), 0);
        assert_eq!(td_remainder(0, 1 << 20, 512, false), 31);
    }

    #[test]
    fn boundary_split() {
        let chunks: alloc::vec::Vec<_> = split_at_boundaries(0xf000.into(), 70000).collect();
        assert_eq!(chunks[0], (BusAddr::from(0xf000), 0x1000));
        assert_eq!(chunks[1], (BusAddr::from(0x10000), 65536));
        assert_eq!(chunks[2].1, 70000 - 0x1000 - 65536);
        let empty: alloc::vec::Vec<_> = split_at_boundaries(0x2000.into(), 0).collect();
        assert_eq!(empty, [(BusAddr::from(0x2000), 0)]);
    }
}
