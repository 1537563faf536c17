use alloc::{collections::BTreeMap, collections::VecDeque, sync::Arc, vec::Vec};
use core::time::Duration;

use mbarrier::mb;
use usb_if::{
    err::TransferError,
    transfer::{EndpointType, TransferCompletion},
};

use super::{
    cmd::{Command, CommandRing, CommandResult},
    context::{DeviceContextAccess, EndpointState},
    device::Device,
    endpoint::{Endpoint, EndpointConfig, RecoveryState},
    event::{EventRing, EventRingInfo},
    handler::EventHandler,
    port::PortChange,
    recovery,
    reg::XhciRegisters,
    transfer::{RequestId, TransferRequest, plan_tds},
};
use crate::{
    BusAddr, Dci, Kernel,
    err::*,
    queue::{Finished, TWaiter},
    sync::{IrqLock, IrqMask},
};

pub type TransferHandle = TWaiter<TransferCompletion>;
pub type CommandHandle = TWaiter<Result<CommandResult>>;

#[derive(Debug, Clone)]
pub struct XhciConfig {
    pub transfer_ring_segments: usize,
    pub command_ring_segments: usize,
    pub event_ring_segments: usize,
    /// Command TRBs kept free for commands that must not fail.
    pub reserved_command_trbs: usize,
    pub stop_endpoint_timeout: Duration,
    /// Consecutive desynchronization errors in the event handler after
    /// which the controller is declared dead.
    pub desync_limit: usize,
    pub interrupter: u16,
}

impl Default for XhciConfig {
    fn default() -> Self {
        Self {
            transfer_ring_segments: 2,
            command_ring_segments: 1,
            event_ring_segments: 1,
            reserved_command_trbs: 2,
            stop_endpoint_timeout: Duration::from_secs(5),
            desync_limit: 8,
            interrupter: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Running,
    /// Declared dead; outstanding work has been failed.
    Dying,
    Halted,
}

/// Notifications for the owning bus layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    PortChange(PortChange),
    DeviceNotification { slot_id: u8, kind: u8, data: u64 },
    ControllerDied(USBError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct XhciStats {
    pub events: usize,
    pub transfer_events: usize,
    pub command_completions: usize,
    pub port_changes: usize,
    pub device_notifications: usize,
    pub mfindex_wraps: usize,
    pub host_controller_events: usize,
    pub event_ring_full: usize,
    pub unknown_events: usize,
    pub errors: usize,
}

pub(crate) struct Inner {
    pub kernel: Arc<dyn Kernel>,
    pub regs: Arc<dyn XhciRegisters>,
    pub contexts: Arc<dyn DeviceContextAccess>,
    pub config: XhciConfig,
    pub cmd: CommandRing,
    pub event: EventRing,
    pub devices: BTreeMap<u8, Device>,
    pub state: ControllerState,
    pub initialized: bool,
    pub next_request: u64,
    pub bus_events: VecDeque<BusEvent>,
    pub stats: XhciStats,
    pub desync_run: usize,
}

impl Inner {
    fn check_running(&self) -> Result {
        if !self.initialized {
            return Err(USBError::NotInitialized);
        }
        match self.state {
            ControllerState::Running => Ok(()),
            _ => Err(USBError::ControllerDying),
        }
    }

    pub fn endpoint_mut(&mut self, slot_id: u8, dci: Dci) -> Result<&mut Endpoint> {
        self.devices
            .get_mut(&slot_id)
            .and_then(|d| d.endpoint_mut(dci))
            .ok_or(USBError::NotFound)
    }

    pub fn ring_command_doorbell(&self) {
        mb();
        self.regs.ring_doorbell(0, 0, 0);
    }

    /// Terminal: halts the controller and fails everything outstanding.
    pub fn die(&mut self, reason: USBError) {
        if self.state != ControllerState::Running {
            return;
        }
        error!("xhci: controller dying: {reason}");
        self.state = ControllerState::Dying;
        self.regs.set_interrupts(self.config.interrupter, false);
        let halted = self.regs.halt();

        for dev in self.devices.values_mut() {
            for ep in dev.endpoints_mut() {
                ep.fail_all(TransferError::Shutdown);
                ep.stop_deadline = None;
                ep.deferred = None;
            }
        }
        self.cmd.fail_all(USBError::ControllerDying);
        self.bus_events.push_back(BusEvent::ControllerDied(reason));
        if halted {
            self.state = ControllerState::Halted;
        }
    }
}

/// The ring engine. Cheap to clone; all clones share one lock.
#[derive(Clone)]
pub struct Xhci {
    inner: Arc<IrqLock<Inner>>,
}

impl Xhci {
    pub fn new(
        kernel: Arc<dyn Kernel>,
        regs: Arc<dyn XhciRegisters>,
        contexts: Arc<dyn DeviceContextAccess>,
        config: XhciConfig,
    ) -> Result<Self> {
        Self::new_with_irq_mask(kernel, regs, contexts, config, None)
    }

    /// Like [`Xhci::new`], masking the controller interrupt through `mask`
    /// whenever a submitting context holds the engine lock.
    pub fn new_with_irq_mask(
        kernel: Arc<dyn Kernel>,
        regs: Arc<dyn XhciRegisters>,
        contexts: Arc<dyn DeviceContextAccess>,
        config: XhciConfig,
        mask: Option<Arc<dyn IrqMask>>,
    ) -> Result<Self> {
        let cmd = CommandRing::new(
            kernel.as_ref(),
            config.command_ring_segments,
            config.reserved_command_trbs,
        )?;
        let event = EventRing::new(kernel.as_ref(), config.event_ring_segments)?;
        let inner = Inner {
            kernel,
            regs,
            contexts,
            config,
            cmd,
            event,
            devices: BTreeMap::new(),
            state: ControllerState::Running,
            initialized: false,
            next_request: 1,
            bus_events: VecDeque::new(),
            stats: XhciStats::default(),
            desync_run: 0,
        };
        Ok(Self {
            inner: Arc::new(IrqLock::new(inner, mask)),
        })
    }

    /// Programs the command and event rings and starts the controller. The
    /// device context base array must already be set up by the caller.
    pub fn init(&self) -> Result {
        let mut g = self.inner.lock();
        let intr = g.config.interrupter;
        let ring = g.cmd.ring();
        g.regs.set_command_ring(ring.bus_addr(), ring.cycle());
        let info = g.event.info();
        g.regs.setup_event_ring(intr, &info);
        g.regs.set_interrupts(intr, true);
        g.regs.run();
        g.initialized = true;
        info!(
            "xhci: command ring @{:#x}, event ring ERSTBA {:#x} ({} segment(s))",
            g.cmd.ring().bus_addr(),
            info.erstba,
            info.erstz
        );
        Ok(())
    }

    /// Allocates the transfer ring of an endpoint. Returns the TR Dequeue
    /// Pointer, DCS included, for its endpoint context.
    pub fn add_endpoint(&self, slot_id: u8, dci: Dci, config: EndpointConfig) -> Result<BusAddr> {
        if slot_id == 0 || dci.as_u8() == 0 || dci.as_u8() > 31 {
            return Err(USBError::InvalidParameter);
        }
        let mut g = self.inner.lock();
        let segments = g.config.transfer_ring_segments;
        let ep = Endpoint::new(g.kernel.as_ref(), slot_id, dci, config, segments)?;
        let deq = ep.ring.bus_addr().raw() | ep.ring.cycle() as u64;
        let dev = g
            .devices
            .entry(slot_id)
            .or_insert_with(|| Device::new(slot_id));
        if dev.endpoints.contains_key(&dci) {
            return Err(USBError::InvalidParameter);
        }
        dev.endpoints.insert(dci, ep);
        debug!("slot {} dci {}: ring @{deq:#x}", dev.slot_id, dci.as_u8());
        Ok(deq.into())
    }

    /// Drops an endpoint's ring, failing its requests as cancelled. The
    /// endpoint must already be stopped or deconfigured.
    pub fn remove_endpoint(&self, slot_id: u8, dci: Dci) -> Result {
        let mut g = self.inner.lock();
        let dev = g.devices.get_mut(&slot_id).ok_or(USBError::NotFound)?;
        let mut ep = dev.endpoints.remove(&dci).ok_or(USBError::NotFound)?;
        if dev.endpoints.is_empty() {
            g.devices.remove(&slot_id);
        }
        ep.fail_all(TransferError::Cancelled);
        Ok(())
    }

    pub fn submit_transfer(
        &self,
        slot_id: u8,
        dci: Dci,
        request: TransferRequest,
    ) -> Result<(RequestId, TransferHandle)> {
        let mut g = self.inner.lock();
        g.check_running()?;
        match g.contexts.endpoint_state(slot_id, dci) {
            None => return Err(USBError::NotFound),
            Some(EndpointState::Disabled) => return Err(USBError::EndpointDisabled),
            Some(EndpointState::Error) => {
                return Err(USBError::EndpointError);
            }
            // Halted 和 Stopped 照常入队，等恢复完成后再响门铃
            Some(_) => {}
        }

        let id = RequestId(g.next_request);
        let Inner { devices, regs, .. } = &mut *g;
        let ep = devices
            .get_mut(&slot_id)
            .and_then(|d| d.endpoint_mut(dci))
            .ok_or(USBError::NotFound)?;
        let plans = plan_tds(&ep.config, &request)?;
        let (tx, rx) = Finished::new();
        ep.queue(id, &plans, request.short_not_ok, tx)?;
        ep.ring_doorbell(regs.as_ref());
        g.next_request += 1;
        Ok((id, rx))
    }

    /// Cancels a request. Its TDs are given back as
    /// [`TransferError::Cancelled`] once the Stop Endpoint completes.
    pub fn cancel_transfer(&self, slot_id: u8, dci: Dci, id: RequestId) -> Result {
        let mut g = self.inner.lock();
        g.check_running()?;
        let deadline = g.kernel.now() + g.config.stop_endpoint_timeout;
        let Inner {
            devices, cmd, regs, ..
        } = &mut *g;
        let ep = devices
            .get_mut(&slot_id)
            .and_then(|d| d.endpoint_mut(dci))
            .ok_or(USBError::NotFound)?;
        if !ep.requests.contains_key(&id) {
            return Err(USBError::NotFound);
        }
        // Stop Endpoint 入队失败时 TD 保持原样
        recovery::request_stop(ep, cmd, regs.as_ref(), deadline)?;
        let mut marked = 0;
        for td in ep.tds.iter_mut().filter(|td| td.request == id) {
            td.cancelled = true;
            marked += 1;
        }
        debug!(
            "slot {slot_id} dci {}: cancelling request {} ({marked} TD(s))",
            dci.as_u8(),
            id.0
        );
        Ok(())
    }

    /// Queues a command for a caller. Stop Endpoint and Set TR Dequeue
    /// belong to endpoint recovery and are refused.
    pub fn submit_command(&self, command: Command) -> Result<CommandHandle> {
        if matches!(
            command,
            Command::StopEndpoint { .. } | Command::SetTrDequeue { .. }
        ) {
            return Err(USBError::InvalidParameter);
        }
        let mut g = self.inner.lock();
        g.check_running()?;
        let (tx, rx) = Finished::new();
        g.cmd.queue(command, false, Some(tx))?;
        g.ring_command_doorbell();
        Ok(rx)
    }

    pub fn create_event_handler(&self) -> EventHandler {
        EventHandler::new(self.inner.clone())
    }

    /// Declares the controller dead if a Stop Endpoint outlived its timeout.
    pub fn check_watchdog(&self) -> Result {
        let mut g = self.inner.lock();
        if g.state != ControllerState::Running {
            return Err(USBError::ControllerDying);
        }
        let now = g.kernel.now();
        let expired = g.devices.values().any(|d| {
            d.endpoints
                .values()
                .any(|ep| ep.stop_deadline.is_some_and(|t| t <= now))
        });
        if expired {
            error!("xhci: stop endpoint command timed out, assuming host is dead");
            g.die(USBError::Timeout);
            return Err(USBError::ControllerDying);
        }
        Ok(())
    }

    pub fn controller_state(&self) -> ControllerState {
        self.inner.lock().state
    }

    pub fn endpoint_state(&self, slot_id: u8, dci: Dci) -> Result<RecoveryState> {
        let mut g = self.inner.lock();
        Ok(g.endpoint_mut(slot_id, dci)?.recovery_state())
    }

    pub fn pending_tds(&self, slot_id: u8, dci: Dci) -> Result<usize> {
        let mut g = self.inner.lock();
        Ok(g.endpoint_mut(slot_id, dci)?.tds.len())
    }

    pub fn endpoint_kind(&self, slot_id: u8, dci: Dci) -> Result<EndpointType> {
        let mut g = self.inner.lock();
        Ok(g.endpoint_mut(slot_id, dci)?.config.kind)
    }

    pub fn take_bus_events(&self) -> Vec<BusEvent> {
        self.inner.lock().bus_events.drain(..).collect()
    }

    pub fn stats(&self) -> XhciStats {
        self.inner.lock().stats
    }

    pub fn event_ring_info(&self) -> EventRingInfo {
        self.inner.lock().event.info()
    }

    pub fn command_ring_addr(&self) -> BusAddr {
        self.inner.lock().cmd.ring().bus_addr()
    }

    pub fn pending_commands(&self) -> usize {
        self.inner.lock().cmd.pending_len()
    }
}
