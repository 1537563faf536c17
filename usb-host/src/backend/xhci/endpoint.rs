use alloc::{
    collections::{BTreeMap, VecDeque},
    vec::Vec,
};
use core::time::Duration;

use bitflags::bitflags;
use mbarrier::mb;
use usb_if::{
    err::TransferError,
    transfer::{Direction, EndpointType, TransferCompletion},
};

use super::{
    recovery::DeferredRecovery,
    reg::XhciRegisters,
    ring::{Cursor, Ring, RingKind},
    transfer::{Request, RequestId, Td, TdPlan},
};
use crate::{Dci, Kernel, err::*, queue::Finished};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EpFlags: u8 {
        /// Halted by a stall or a manual-halt error; Reset Endpoint queued.
        const HALTED = 1 << 0;
        const STOP_PENDING = 1 << 1;
        const SET_DEQ_PENDING = 1 << 2;
        /// Cancelled TDs were turned into no-ops by the last stop.
        const NOOP_REWRITTEN = 1 << 3;
    }
}

/// Recovery state of an endpoint, as seen from outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryState {
    Running,
    /// Waiting for the ring to quiesce: Stop Endpoint or Reset Endpoint
    /// outstanding.
    StopPending,
    /// Set TR Dequeue Pointer outstanding.
    DequeuePending,
    NoopRewritten,
}

impl From<EpFlags> for RecoveryState {
    fn from(flags: EpFlags) -> Self {
        if flags.intersects(EpFlags::HALTED | EpFlags::STOP_PENDING) {
            Self::StopPending
        } else if flags.contains(EpFlags::SET_DEQ_PENDING) {
            Self::DequeuePending
        } else if flags.contains(EpFlags::NOOP_REWRITTEN) {
            Self::NoopRewritten
        } else {
            Self::Running
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointConfig {
    pub kind: EndpointType,
    pub direction: Direction,
    pub max_packet_size: u16,
    pub stream_id: u16,
}

impl EndpointConfig {
    pub fn new(kind: EndpointType, direction: Direction, max_packet_size: u16) -> Self {
        Self {
            kind,
            direction,
            max_packet_size,
            stream_id: 0,
        }
    }

    pub fn control(max_packet_size: u16) -> Self {
        Self::new(EndpointType::Control, Direction::Out, max_packet_size)
    }

    pub fn with_stream(mut self, stream_id: u16) -> Self {
        self.stream_id = stream_id;
        self
    }
}

pub(crate) struct Endpoint {
    pub slot_id: u8,
    pub dci: Dci,
    pub config: EndpointConfig,
    pub ring: Ring,
    pub tds: VecDeque<Td>,
    pub requests: BTreeMap<RequestId, Request>,
    pub flags: EpFlags,
    /// TD the ring stopped in, reported by a Stopped transfer event.
    pub stopped: Option<(RequestId, usize)>,
    /// Where the dequeue lands once the queued Set TR Dequeue completes.
    pub pending_deq: Option<Cursor>,
    pub stop_deadline: Option<Duration>,
    /// Recovery commands waiting for command ring space.
    pub deferred: Option<DeferredRecovery>,
    /// A Missed Service Error was reported; skip TDs up to the next event.
    pub skip: bool,
}

impl Endpoint {
    pub fn new(
        kernel: &dyn Kernel,
        slot_id: u8,
        dci: Dci,
        config: EndpointConfig,
        segments: usize,
    ) -> Result<Self> {
        Ok(Self {
            slot_id,
            dci,
            config,
            ring: Ring::new(kernel, RingKind::Transfer, segments)?,
            tds: VecDeque::new(),
            requests: BTreeMap::new(),
            flags: EpFlags::empty(),
            stopped: None,
            pending_deq: None,
            stop_deadline: None,
            deferred: None,
            skip: false,
        })
    }

    pub fn recovery_state(&self) -> RecoveryState {
        self.flags.into()
    }

    /// Doorbells stay silent while recovery owns the ring.
    pub fn doorbell_allowed(&self) -> bool {
        !self
            .flags
            .intersects(EpFlags::HALTED | EpFlags::STOP_PENDING | EpFlags::SET_DEQ_PENDING)
    }

    pub fn ring_doorbell(&self, regs: &dyn XhciRegisters) -> bool {
        if !self.doorbell_allowed() {
            trace!(
                "slot {} dci {} doorbell held: {:?}",
                self.slot_id,
                self.dci.as_u8(),
                self.flags
            );
            return false;
        }
        mb();
        regs.ring_doorbell(self.slot_id, self.dci.as_u8(), self.config.stream_id);
        true
    }

    /// Resumes the ring after recovery if TDs are waiting.
    pub fn restart(&mut self, regs: &dyn XhciRegisters) {
        if !self.doorbell_allowed() {
            return;
        }
        self.flags.remove(EpFlags::NOOP_REWRITTEN);
        if !self.tds.is_empty() {
            self.ring_doorbell(regs);
        }
    }

    /// Room for all `plans` is checked before the first TRB is written.
    pub fn queue(
        &mut self,
        id: RequestId,
        plans: &[TdPlan],
        short_not_ok: bool,
        waiter: Finished<TransferCompletion>,
    ) -> Result {
        let total: usize = plans.iter().map(|p| p.trbs.len()).sum();
        if !self.ring.has_room(total) {
            return Err(USBError::InsufficientRingSpace);
        }
        for (i, plan) in plans.iter().enumerate() {
            let slots = self.ring.enqueue_batch(&plan.trbs, i + 1 < plans.len())?;
            self.tds.push_back(Td::new(id, plan, &slots, short_not_ok));
        }
        self.requests
            .insert(id, Request::new(self.config.kind, plans.len(), waiter));
        debug!(
            "slot {} dci {}: request {} queued as {} TD(s), {} TRBs",
            self.slot_id,
            self.dci.as_u8(),
            id.0,
            plans.len(),
            total
        );
        Ok(())
    }

    /// Hands a removed TD's result to its request, delivering the request
    /// once its last TD is in.
    pub fn retire(&mut self, td: Td, status: core::result::Result<(), TransferError>) {
        let (actual, mismatch) = if td.bad_length || td.actual > td.length {
            warn!(
                "slot {} dci {}: bad transfer length, {} of {} queued",
                self.slot_id,
                self.dci.as_u8(),
                td.actual,
                td.length
            );
            (0, true)
        } else {
            (td.actual, false)
        };
        let Some(req) = self.requests.get_mut(&td.request) else {
            warn!("TD of unknown request {}", td.request.0);
            return;
        };
        if req.record(td.packet, status, actual, mismatch) {
            if let Some(req) = self.requests.remove(&td.request) {
                trace!("request {} done", td.request.0);
                req.deliver();
            }
        }
    }

    /// Retires the head TD with its own recorded status.
    pub fn retire_head(&mut self) {
        if let Some(td) = self.tds.pop_front() {
            let status = td.status;
            self.retire(td, status);
        }
    }

    pub fn take_cancelled(&mut self) -> Vec<Td> {
        let (cancelled, kept): (Vec<Td>, Vec<Td>) = self.tds.drain(..).partition(|td| td.cancelled);
        self.tds = kept.into();
        cancelled
    }

    /// Fails every TD still on the endpoint.
    pub fn fail_all(&mut self, err: TransferError) {
        while let Some(td) = self.tds.pop_front() {
            self.retire(td, Err(err));
        }
        // 没有 TD 的请求也要交付
        for (_, mut req) in core::mem::take(&mut self.requests) {
            req.status = Err(err);
            req.deliver();
        }
    }
}
