use alloc::vec::Vec;

use usb_if::{
    err::TransferError,
    transfer::{ControlSetup, Direction, EndpointType, IsoPacketResult, TransferCompletion},
};
use xhci::ring::trb::transfer::{self, Isoch, Normal};

use super::{
    endpoint::EndpointConfig,
    ring::{Ring, SlotRef},
    trb::{Completion, CompletionCode, TransferEvent, split_at_boundaries, td_remainder},
};
use crate::{BusAddr, err::*, queue::Finished};

/// Identifies one client request on an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestId(pub u64);

/// A DMA-mapped buffer the controller reads or writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DmaRange {
    pub addr: BusAddr,
    pub len: usize,
}

impl DmaRange {
    pub fn new(addr: impl Into<BusAddr>, len: usize) -> Self {
        Self {
            addr: addr.into(),
            len,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TransferRequest {
    /// Present for control transfers only.
    pub setup: Option<ControlSetup>,
    /// Bulk/interrupt: scatter list of one TD. Isochronous: one range per
    /// packet. Control: at most one data stage buffer.
    pub buffers: Vec<DmaRange>,
    /// Terminate a transfer that is a multiple of max packet size with a
    /// zero-length packet.
    pub zero_packet: bool,
    /// Report a short transfer as [`TransferError::ShortPacket`].
    pub short_not_ok: bool,
}

impl TransferRequest {
    pub fn control(setup: ControlSetup, data: Option<DmaRange>) -> Self {
        Self {
            setup: Some(setup),
            buffers: data.into_iter().collect(),
            ..Default::default()
        }
    }

    pub fn bulk(buffer: DmaRange) -> Self {
        Self {
            buffers: alloc::vec![buffer],
            ..Default::default()
        }
    }

    pub fn scatter(buffers: Vec<DmaRange>) -> Self {
        Self {
            buffers,
            ..Default::default()
        }
    }

    pub fn isochronous(packets: Vec<DmaRange>) -> Self {
        Self {
            buffers: packets,
            ..Default::default()
        }
    }

    pub fn with_zero_packet(mut self) -> Self {
        self.zero_packet = true;
        self
    }

    pub fn with_short_not_ok(mut self) -> Self {
        self.short_not_ok = true;
        self
    }

    pub fn total_len(&self) -> usize {
        self.buffers.iter().map(|b| b.len).sum()
    }
}

/// TRBs of one TD, before they are written to a ring.
pub(crate) struct TdPlan {
    pub trbs: Vec<transfer::Allowed>,
    pub length: usize,
    pub packet: usize,
}

pub(crate) fn plan_tds(cfg: &EndpointConfig, req: &TransferRequest) -> Result<Vec<TdPlan>> {
    match cfg.kind {
        EndpointType::Control => Ok(alloc::vec![plan_control(cfg, req)?]),
        EndpointType::Bulk | EndpointType::Interrupt => {
            if req.setup.is_some() {
                return Err(USBError::InvalidParameter);
            }
            Ok(alloc::vec![plan_bulk(cfg, req)])
        }
        EndpointType::Isochronous => {
            if req.setup.is_some() || req.buffers.is_empty() {
                return Err(USBError::InvalidParameter);
            }
            Ok(req
                .buffers
                .iter()
                .enumerate()
                .map(|(packet, buf)| plan_isoch(cfg, *buf, packet))
                .collect())
        }
    }
}

fn chunks_of(buffers: &[DmaRange]) -> Vec<(BusAddr, usize)> {
    let mut chunks: Vec<_> = buffers
        .iter()
        .filter(|b| b.len > 0)
        .flat_map(|b| split_at_boundaries(b.addr, b.len))
        .collect();
    if chunks.is_empty() {
        let addr = buffers.first().map(|b| b.addr).unwrap_or_default();
        chunks.push((addr, 0));
    }
    chunks
}

/// Normal TRB for one chunk; IOC is left to the caller.
fn normal_trb(addr: BusAddr, len: usize, td_size: u8, isp: bool, chain: bool) -> Normal {
    let mut trb = Normal::new();
    trb.set_data_buffer_pointer(addr.raw())
        .set_trb_transfer_length(len as _)
        .set_td_size(td_size)
        .set_interrupter_target(0);
    if isp {
        trb.set_interrupt_on_short_packet();
    }
    if chain {
        trb.set_chain_bit();
    }
    trb
}

fn plan_bulk(cfg: &EndpointConfig, req: &TransferRequest) -> TdPlan {
    let total = req.total_len();
    let maxp = cfg.max_packet_size as usize;
    let chunks = chunks_of(&req.buffers);
    let zlp = req.zero_packet && total > 0 && maxp > 0 && total % maxp == 0;
    let count = chunks.len() + zlp as usize;
    let isp = cfg.direction.is_in();

    let mut trbs = Vec::with_capacity(count);
    let mut sent = 0;
    for (i, (addr, len)) in chunks.into_iter().enumerate() {
        sent += len;
        let last = i + 1 == count;
        let td_size = td_remainder(sent, total, cfg.max_packet_size, last);
        let mut trb = normal_trb(addr, len, td_size, isp, !last);
        if last {
            trb.set_interrupt_on_completion();
        }
        trbs.push(transfer::Allowed::Normal(trb));
    }
    if zlp {
        let mut trb = normal_trb(BusAddr::default(), 0, 0, isp, false);
        trb.set_interrupt_on_completion();
        trbs.push(transfer::Allowed::Normal(trb));
    }
    TdPlan {
        trbs,
        length: total,
        packet: 0,
    }
}

fn plan_isoch(cfg: &EndpointConfig, buf: DmaRange, packet: usize) -> TdPlan {
    let chunks = chunks_of(core::slice::from_ref(&buf));
    let count = chunks.len();
    let isp = cfg.direction.is_in();
    let mut trbs = Vec::with_capacity(count);
    let mut sent = 0;
    for (i, (addr, len)) in chunks.into_iter().enumerate() {
        sent += len;
        let last = i + 1 == count;
        let td_size = td_remainder(sent, buf.len, cfg.max_packet_size, last);
        if i == 0 {
            let mut trb = Isoch::new();
            trb.set_data_buffer_pointer(addr.raw())
                .set_trb_transfer_length(len as _)
                .set_td_size_or_tbc(td_size)
                .set_interrupter_target(0)
                .set_start_isoch_asap();
            if isp {
                trb.set_interrupt_on_short_packet();
            }
            if last {
                trb.set_interrupt_on_completion();
            } else {
                trb.set_chain_bit();
            }
            trbs.push(transfer::Allowed::Isoch(trb));
        } else {
            let mut trb = normal_trb(addr, len, td_size, isp, !last);
            if last {
                trb.set_interrupt_on_completion();
            }
            trbs.push(transfer::Allowed::Normal(trb));
        }
    }
    TdPlan {
        trbs,
        length: buf.len,
        packet,
    }
}

fn plan_control(cfg: &EndpointConfig, req: &TransferRequest) -> Result<TdPlan> {
    let setup = req.setup.ok_or(USBError::InvalidParameter)?;
    if req.buffers.len() > 1 {
        return Err(USBError::InvalidParameter);
    }
    let data = req.buffers.first().copied().filter(|b| b.len > 0);
    let data_len = data.map(|b| b.len).unwrap_or(0);
    if setup.length as usize != data_len {
        return Err(USBError::InvalidParameter);
    }
    let dir_in = setup.direction() == Direction::In;

    let mut stage = transfer::SetupStage::default();
    stage
        .set_request_type(setup.request_type)
        .set_request(setup.request)
        .set_value(setup.value)
        .set_index(setup.index)
        .set_length(setup.length)
        .set_transfer_type(match (data.is_some(), dir_in) {
            (false, _) => transfer::TransferType::No,
            (true, false) => transfer::TransferType::Out,
            (true, true) => transfer::TransferType::In,
        });
    let mut trbs: Vec<transfer::Allowed> = alloc::vec![stage.into()];

    if let Some(buf) = data {
        let chunks = chunks_of(core::slice::from_ref(&buf));
        let count = chunks.len();
        let mut sent = 0;
        for (i, (addr, len)) in chunks.into_iter().enumerate() {
            sent += len;
            let last = i + 1 == count;
            let td_size = td_remainder(sent, buf.len, cfg.max_packet_size, last);
            if i == 0 {
                let mut trb = transfer::DataStage::default();
                trb.set_data_buffer_pointer(addr.raw())
                    .set_trb_transfer_length(len as _)
                    .set_td_size(td_size)
                    .set_direction(if dir_in {
                        transfer::Direction::In
                    } else {
                        transfer::Direction::Out
                    });
                if dir_in {
                    trb.set_interrupt_on_short_packet();
                }
                if !last {
                    trb.set_chain_bit();
                }
                trbs.push(trb.into());
            } else {
                let trb = normal_trb(addr, len, td_size, dir_in, !last);
                trbs.push(transfer::Allowed::Normal(trb));
            }
        }
    }

    // Status 阶段方向与数据阶段相反；没有数据阶段时为 IN
    let mut status = transfer::StatusStage::default();
    status.set_interrupt_on_completion();
    if !(data.is_some() && dir_in) {
        status.set_direction();
    }
    trbs.push(status.into());

    Ok(TdPlan {
        trbs,
        length: data_len,
        packet: 0,
    })
}

/// A TD on an endpoint's transfer ring.
#[derive(Debug)]
pub(crate) struct Td {
    pub request: RequestId,
    /// Packet index inside an isochronous request.
    pub packet: usize,
    pub first: SlotRef,
    pub last: SlotRef,
    pub length: usize,
    pub actual: usize,
    /// Hardware reported a residue larger than what was queued.
    pub bad_length: bool,
    /// Bytes of a control data stage, seen before the status stage event.
    pub data_actual: Option<usize>,
    pub status: core::result::Result<(), TransferError>,
    pub short_not_ok: bool,
    pub cancelled: bool,
}

impl Td {
    pub fn new(request: RequestId, plan: &TdPlan, slots: &[SlotRef], short_not_ok: bool) -> Self {
        Self {
            request,
            packet: plan.packet,
            first: slots[0],
            last: slots[slots.len() - 1],
            length: plan.length,
            actual: 0,
            bad_length: false,
            data_actual: None,
            status: Ok(()),
            short_not_ok,
            cancelled: false,
        }
    }

    pub fn key(&self) -> (RequestId, usize) {
        (self.request, self.packet)
    }

    fn short_status(&self) -> core::result::Result<(), TransferError> {
        if self.short_not_ok {
            Err(TransferError::ShortPacket)
        } else {
            Ok(())
        }
    }

    /// Bytes moved by TRBs `from..at` plus the part of `at` that completed.
    fn walked_length(&mut self, ring: &Ring, from: SlotRef, at: SlotRef, ev: &TransferEvent) -> usize {
        let base = ring.sum_lengths(from, at);
        if ev.code == Ok(CompletionCode::StoppedLengthInvalid) {
            return base;
        }
        match ring.get(at).transfer_len().checked_sub(ev.length) {
            Some(done) => base + done,
            None => {
                self.bad_length = true;
                base
            }
        }
    }
}

/// What the endpoint does with the head TD after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TdAction {
    /// More events belong to this TD.
    Pending,
    /// The ring stopped inside this TD; the Stop Endpoint completion decides.
    Stopped,
    Complete,
}

pub(crate) fn is_stop(code: Completion) -> bool {
    matches!(
        code,
        Ok(CompletionCode::Stopped
            | CompletionCode::StoppedLengthInvalid
            | CompletionCode::StoppedShortPacket)
    )
}

pub(crate) fn process_bulk_td(
    ring: &Ring,
    td: &mut Td,
    ev: &TransferEvent,
    at: SlotRef,
) -> TdAction {
    td.status = match ev.code {
        Ok(CompletionCode::Success) if at != td.last || ev.length != 0 => {
            warn!("successful completion on short transfer @{:#x}", ev.trb_addr);
            td.short_status()
        }
        Ok(CompletionCode::ShortPacket) => td.short_status(),
        code => code.to_result(),
    };

    if at == td.last {
        if ev.length != 0 {
            match td.length.checked_sub(ev.length) {
                Some(actual) => td.actual = actual,
                None => td.bad_length = true,
            }
            if td.status.is_ok() && !is_stop(ev.code) {
                td.status = td.short_status();
            }
        } else {
            td.actual = td.length;
            if td.status == Err(TransferError::ShortPacket) {
                td.status = Ok(());
            }
        }
    } else {
        td.actual = td.walked_length(ring, td.first, at, ev);
    }

    if is_stop(ev.code) {
        TdAction::Stopped
    } else {
        TdAction::Complete
    }
}

pub(crate) fn process_ctrl_td(
    ring: &Ring,
    td: &mut Td,
    ev: &TransferEvent,
    at: SlotRef,
) -> TdAction {
    let data_start = ring.next_slot(td.first);
    match ev.code {
        Ok(CompletionCode::Success) if at != td.last => {
            warn!("success on control TRB without IOC @{:#x}", ev.trb_addr);
            td.status = Err(TransferError::Other(CompletionCode::Success as u8));
        }
        Ok(CompletionCode::Success) => td.status = Ok(()),
        Ok(CompletionCode::ShortPacket) => td.status = td.short_status(),
        code if is_stop(code) => {
            if at != td.first && at != td.last {
                td.actual = td.walked_length(ring, data_start, at, ev);
            }
            return TdAction::Stopped;
        }
        code @ Ok(CompletionCode::StallError) => {
            td.status = code.to_result();
            td.actual = if at != td.first && at != td.last {
                td.walked_length(ring, data_start, at, ev)
            } else {
                0
            };
            return TdAction::Complete;
        }
        code => td.status = code.to_result(),
    }

    if at != td.first {
        if at == td.last {
            match td.data_actual {
                Some(actual) => {
                    td.actual = actual;
                    if td.status.is_ok() && actual < td.length {
                        td.status = td.short_status();
                    }
                }
                None => td.actual = td.length,
            }
        } else {
            let actual = td.walked_length(ring, data_start, at, ev);
            td.data_actual = Some(actual);
            trace!("control data stage {actual} bytes, waiting for status stage");
            if matches!(
                ev.code,
                Ok(CompletionCode::ShortPacket | CompletionCode::Success)
            ) {
                return TdAction::Pending;
            }
            td.actual = actual;
        }
    }
    TdAction::Complete
}

pub(crate) fn process_isoc_td(
    ring: &Ring,
    td: &mut Td,
    ev: &TransferEvent,
    at: SlotRef,
) -> TdAction {
    let mut error_packet = false;
    td.status = match ev.code {
        Ok(CompletionCode::Success) if ev.length == 0 => Ok(()),
        Ok(CompletionCode::Success | CompletionCode::ShortPacket) => td.short_status(),
        Ok(CompletionCode::BandwidthOverrunError) => {
            error_packet = true;
            Err(TransferError::Bandwidth)
        }
        Ok(CompletionCode::IsochBufferOverrun | CompletionCode::BabbleDetectedError) => {
            error_packet = true;
            Err(TransferError::Overflow)
        }
        Ok(CompletionCode::IncompatibleDeviceError | CompletionCode::UsbTransactionError) => {
            error_packet = true;
            Err(TransferError::Transaction)
        }
        Ok(CompletionCode::StallError) => {
            error_packet = true;
            Err(TransferError::Stall)
        }
        Ok(CompletionCode::MissedServiceError) => {
            error_packet = true;
            Err(TransferError::MissedService)
        }
        code if is_stop(code) => Ok(()),
        code => code.to_result(),
    };

    if error_packet {
        td.actual = 0;
    } else if ev.code == Ok(CompletionCode::Success) && ev.length == 0 {
        td.actual = td.length;
    } else {
        td.actual = td.walked_length(ring, td.first, at, ev);
    }

    if is_stop(ev.code) {
        TdAction::Stopped
    } else {
        TdAction::Complete
    }
}

/// Completion state of a client request across its TDs.
pub(crate) struct Request {
    pub kind: EndpointType,
    pub total_tds: usize,
    pub done_tds: usize,
    pub actual: usize,
    pub status: core::result::Result<(), TransferError>,
    pub mismatch: bool,
    pub iso_packets: Vec<IsoPacketResult>,
    pub waiter: Option<Finished<TransferCompletion>>,
}

impl Request {
    pub fn new(kind: EndpointType, total_tds: usize, waiter: Finished<TransferCompletion>) -> Self {
        let iso_packets = if kind == EndpointType::Isochronous {
            alloc::vec![
                IsoPacketResult {
                    status: Ok(()),
                    actual_length: 0,
                };
                total_tds
            ]
        } else {
            Vec::new()
        };
        Self {
            kind,
            total_tds,
            done_tds: 0,
            actual: 0,
            status: Ok(()),
            mismatch: false,
            iso_packets,
            waiter: Some(waiter),
        }
    }

    /// Accounts one retired TD. Returns true once every TD has retired.
    pub fn record(
        &mut self,
        packet: usize,
        status: core::result::Result<(), TransferError>,
        actual: usize,
        mismatch: bool,
    ) -> bool {
        self.actual += actual;
        self.mismatch |= mismatch;
        if self.kind == EndpointType::Isochronous {
            if let Some(p) = self.iso_packets.get_mut(packet) {
                *p = IsoPacketResult {
                    status,
                    actual_length: actual,
                };
            }
            if matches!(
                status,
                Err(TransferError::Cancelled) | Err(TransferError::Shutdown)
            ) && self.status.is_ok()
            {
                self.status = status;
            }
        } else if status.is_err() && self.status.is_ok() {
            self.status = status;
        }
        self.done_tds += 1;
        self.done_tds >= self.total_tds
    }

    pub fn deliver(mut self) {
        let completion = TransferCompletion {
            status: self.status,
            actual_length: self.actual,
            length_mismatch: self.mismatch,
            iso_packets: core::mem::take(&mut self.iso_packets),
        };
        if let Some(waiter) = self.waiter.take() {
            waiter.set_finished(completion);
        }
    }
}
