//! 事件环处理
//!
//! 中断或轮询上下文调用 [`EventHandler::handle_event`]，一次把事件环取空。

use alloc::{sync::Arc, vec::Vec};

use usb_if::{err::TransferError, transfer::EndpointType};
use xhci::ring::trb::event::{self, Allowed};

use super::{
    cmd::Command,
    context::EndpointState,
    host::{BusEvent, ControllerState, Inner},
    port::PortChange,
    recovery,
    transfer::{TdAction, is_stop, process_bulk_td, process_ctrl_td, process_isoc_td},
    trb::{
        CompletionCode, TransferEvent, TrbData, is_vendor_info, requires_manual_halt_cleanup,
    },
};
use crate::{Dci, err::*, sync::IrqLock};

/// What one drain pass saw.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct DrainReport {
    pub events: usize,
    /// Errors raised while dispatching events, in ring order. The drain
    /// carries on past them unless the controller died.
    pub errors: Vec<USBError>,
}

pub struct EventHandler {
    inner: Arc<IrqLock<Inner>>,
}

impl EventHandler {
    pub(crate) fn new(inner: Arc<IrqLock<Inner>>) -> Self {
        Self { inner }
    }

    /// Drains the event ring to empty and acknowledges the interrupt.
    pub fn handle_event(&self) -> DrainReport {
        self.inner.lock_irq().drain()
    }
}

impl Inner {
    pub(crate) fn drain(&mut self) -> DrainReport {
        let mut report = DrainReport::default();
        if !self.initialized || self.state != ControllerState::Running {
            return report;
        }
        let intr = self.config.interrupter;

        if self.regs.host_system_error() {
            error!("xhci: host system error");
            report.errors.push(USBError::HostSystemError);
            self.die(USBError::HostSystemError);
            return report;
        }

        while let Some(event) = self.event.peek() {
            trace!("[EVENT] {event:?} @{:#x}", self.event.dequeue_addr());
            self.stats.events += 1;
            report.events += 1;

            let res = self.dispatch(event);
            self.event.advance();
            self.regs.write_erdp(intr, self.event.erdp(), false);

            match res {
                Ok(()) => self.desync_run = 0,
                Err(e) => {
                    self.stats.errors += 1;
                    if e.is_desync() {
                        self.desync_run += 1;
                        error!("event desync ({}/{}): {e}", self.desync_run, self.config.desync_limit);
                    } else {
                        self.desync_run = 0;
                        warn!("event: {e}");
                    }
                    report.errors.push(e.clone());
                    if self.desync_run >= self.config.desync_limit {
                        self.die(e);
                    }
                }
            }
            if self.state != ControllerState::Running {
                break;
            }
        }

        self.regs.write_erdp(intr, self.event.erdp(), true);
        self.regs.ack_interrupt(intr);
        report
    }

    fn dispatch(&mut self, event: core::result::Result<Allowed, TrbData>) -> Result {
        let event = match event {
            Ok(event) => event,
            Err(raw) => {
                self.stats.unknown_events += 1;
                debug!("unhandled event {raw:?}");
                return Ok(());
            }
        };
        match event {
            Allowed::TransferEvent(ev) => {
                self.stats.transfer_events += 1;
                self.handle_transfer_event(TransferEvent::from(&ev))
            }
            Allowed::CommandCompletion(ev) => {
                self.stats.command_completions += 1;
                let res = self.handle_command_completion(&ev);
                // 每完成一条命令就多出一个槽位
                let retried = self.retry_deferred_recovery();
                res.and(retried)
            }
            Allowed::PortStatusChange(ev) => {
                self.stats.port_changes += 1;
                let port_id = ev.port_id();
                let code = ev.completion_code();
                if code != Ok(CompletionCode::Success) {
                    warn!("port {port_id} change event with {code:?}");
                }
                self.handle_port_change(port_id);
                Ok(())
            }
            Allowed::DeviceNotification(ev) => {
                self.stats.device_notifications += 1;
                let (slot_id, kind, data) = (
                    ev.slot_id(),
                    ev.notification_type(),
                    ev.device_notification_data(),
                );
                debug!("slot {slot_id} device notification type {kind} data {data:#x}");
                self.bus_events.push_back(BusEvent::DeviceNotification {
                    slot_id,
                    kind,
                    data,
                });
                Ok(())
            }
            Allowed::MfindexWrap(_) => {
                self.stats.mfindex_wraps += 1;
                Ok(())
            }
            Allowed::HostController(ev) => {
                self.stats.host_controller_events += 1;
                let code = ev.completion_code();
                if code == Ok(CompletionCode::EventRingFullError) {
                    // 取空事件环后控制器才会继续投递
                    self.stats.event_ring_full += 1;
                    warn!("event ring full");
                } else {
                    warn!("host controller event {code:?}");
                }
                Ok(())
            }
            other => {
                self.stats.unknown_events += 1;
                debug!("unhandled event {other:?}");
                Ok(())
            }
        }
    }

    fn handle_port_change(&mut self, port_id: u8) {
        if port_id == 0 || port_id > self.regs.max_ports() {
            warn!("port change for invalid port {port_id}");
            return;
        }
        let status = self.regs.ack_port_changes(port_id);
        debug!(
            "port {port_id}: {:?} speed {} link {}",
            status.changes, status.speed, status.link_state
        );
        self.bus_events
            .push_back(BusEvent::PortChange(PortChange { port_id, status }));
    }

    /// Queues recovery commands that were held back by a full command ring,
    /// stopping at the first endpoint whose commands still do not fit.
    fn retry_deferred_recovery(&mut self) -> Result {
        let Inner { devices, cmd, regs, .. } = self;
        for ep in devices.values_mut().flat_map(|d| d.endpoints_mut()) {
            if !recovery::retry_deferred(ep, cmd, regs.as_ref())? {
                break;
            }
        }
        Ok(())
    }

    fn handle_command_completion(&mut self, ev: &event::CommandCompletion) -> Result {
        let Some((command, result)) = self.cmd.resolve(ev)? else {
            return Ok(());
        };
        let Some((slot_id, dci)) = command.endpoint() else {
            return Ok(());
        };
        let Inner { devices, cmd, regs, .. } = self;
        let Some(ep) = devices.get_mut(&slot_id).and_then(|d| d.endpoint_mut(dci)) else {
            debug!("{command:?} completed for a removed endpoint");
            return Ok(());
        };

        match command {
            Command::StopEndpoint { .. } => {
                // Context State Error: 端点已经停了，环同样可以改
                if !matches!(
                    result.code,
                    Ok(CompletionCode::Success | CompletionCode::ContextStateError)
                ) {
                    warn!(
                        "slot {slot_id} dci {}: stop endpoint failed: {:?}",
                        dci.as_u8(),
                        result.code
                    );
                }
                recovery::handle_stop_completion(ep, cmd, regs.as_ref())
            }
            Command::ResetEndpoint { .. } => {
                recovery::handle_reset_completion(ep, regs.as_ref(), result.code);
                Ok(())
            }
            Command::SetTrDequeue { .. } => {
                recovery::handle_set_deq_completion(ep, regs.as_ref(), result.code);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn handle_transfer_event(&mut self, mut ev: TransferEvent) -> Result {
        if is_vendor_info(ev.code) {
            trace!("vendor info code {:?} treated as success", ev.code);
            ev.code = Ok(CompletionCode::Success);
        }
        let dci = Dci::new(ev.dci);
        let Inner {
            devices,
            cmd,
            regs,
            contexts,
            ..
        } = self;
        let Some(ep) = devices
            .get_mut(&ev.slot_id)
            .and_then(|d| d.endpoint_mut(dci))
        else {
            error!(
                "transfer event for unknown slot {} dci {}",
                ev.slot_id, ev.dci
            );
            return Err(USBError::NotFound);
        };

        match ev.code {
            Ok(CompletionCode::RingUnderrun | CompletionCode::RingOverrun) => {
                debug!(
                    "slot {} dci {}: {:?}",
                    ev.slot_id, ev.dci, ev.code
                );
                return Ok(());
            }
            Ok(CompletionCode::MissedServiceError) => {
                ep.skip = true;
                debug!(
                    "slot {} dci {}: missed service, skipping TDs",
                    ev.slot_id, ev.dci
                );
                if ev.trb_addr.raw() == 0 {
                    return Ok(());
                }
            }
            _ => {}
        }
        if ev.event_data {
            warn!("event data TRB @{:#x} not queued by host", ev.trb_addr);
            return Ok(());
        }

        let at = ep.ring.locate(ev.trb_addr);

        if ep.skip {
            loop {
                let Some(td) = ep.tds.front() else {
                    ep.skip = false;
                    return Ok(());
                };
                if at.is_some_and(|at| ep.ring.range_contains(td.first, td.last, at)) {
                    ep.skip = false;
                    break;
                }
                let last = td.last;
                ep.ring.advance_past(last);
                if let Some(td) = ep.tds.pop_front() {
                    trace!("skipping TD of request {}", td.request.0);
                    ep.retire(td, Err(TransferError::MissedService));
                }
            }
        }

        let (idx, at) = if is_stop(ev.code) {
            // 停止事件可以落在任何一个 TD 上，也可能不在 TD 里
            let found = at.and_then(|at| {
                ep.tds
                    .iter()
                    .position(|td| ep.ring.range_contains(td.first, td.last, at))
                    .map(|i| (i, at))
            });
            match found {
                Some(found) => found,
                None => {
                    debug!(
                        "slot {} dci {}: stopped outside any TD @{:#x}",
                        ev.slot_id, ev.dci, ev.trb_addr
                    );
                    return Ok(());
                }
            }
        } else {
            let Some(td) = ep.tds.front() else {
                error!(
                    "slot {} dci {}: {:?} event @{:#x} with no TD queued",
                    ev.slot_id, ev.dci, ev.code, ev.trb_addr
                );
                return Err(USBError::NoPendingTd {
                    slot: ev.slot_id,
                    dci: ev.dci,
                });
            };
            match at.filter(|at| ep.ring.range_contains(td.first, td.last, *at)) {
                Some(at) => (0, at),
                None => {
                    error!(
                        "slot {} dci {}: event @{:#x} not part of the head TD",
                        ev.slot_id, ev.dci, ev.trb_addr
                    );
                    return Err(USBError::EventNotInTd {
                        slot: ev.slot_id,
                        dci: ev.dci,
                        addr: ev.trb_addr.raw(),
                    });
                }
            }
        };

        let kind = ep.config.kind;
        let ring = &ep.ring;
        let td = &mut ep.tds[idx];
        let action = match kind {
            EndpointType::Control => process_ctrl_td(ring, td, &ev, at),
            EndpointType::Isochronous => process_isoc_td(ring, td, &ev, at),
            EndpointType::Bulk | EndpointType::Interrupt => process_bulk_td(ring, td, &ev, at),
        };
        trace!(
            "slot {} dci {}: TD {:?} -> {action:?}",
            ev.slot_id, ev.dci, td.key()
        );

        match action {
            TdAction::Pending => Ok(()),
            TdAction::Stopped => {
                ep.stopped = Some(ep.tds[idx].key());
                Ok(())
            }
            TdAction::Complete => {
                let halted = ev.code == Ok(CompletionCode::StallError)
                    || (requires_manual_halt_cleanup(ev.code)
                        && (matches!(kind, EndpointType::Bulk | EndpointType::Interrupt)
                            || contexts.endpoint_state(ev.slot_id, dci)
                                == Some(EndpointState::Halted)));
                if halted {
                    let res = recovery::cleanup_halted_endpoint(ep, cmd, regs.as_ref());
                    ep.retire_head();
                    res
                } else {
                    let last = ep.tds[idx].last;
                    ep.ring.advance_past(last);
                    ep.retire_head();
                    Ok(())
                }
            }
        }
    }
}
