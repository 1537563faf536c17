//! 端点恢复
//!
//! Stall 和取消都先让端点停下来再改环：
//! Running -> StopPending -> (DequeuePending | NoopRewritten) -> Running。

use core::time::Duration;

use mbarrier::mb;
use usb_if::err::TransferError;

use super::{
    cmd::{Command, CommandRing},
    endpoint::{EpFlags, Endpoint},
    reg::XhciRegisters,
    ring::SlotRef,
    trb::{Completion, CompletionCode},
};
use crate::err::*;

fn ring_command_doorbell(regs: &dyn XhciRegisters) {
    mb();
    regs.ring_doorbell(0, 0, 0);
}

/// Recovery commands that did not fit on the command ring yet. The doorbell
/// stays held until they are queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DeferredRecovery {
    /// Reset Endpoint, then Set TR Dequeue past `last`.
    Reset { last: SlotRef },
    SetDequeue { last: SlotRef },
}

impl DeferredRecovery {
    fn commands(&self) -> usize {
        match self {
            DeferredRecovery::Reset { .. } => 2,
            DeferredRecovery::SetDequeue { .. } => 1,
        }
    }
}

/// Queues Set TR Dequeue Pointer to the TRB after `last`.
fn queue_set_dequeue(ep: &mut Endpoint, cmd: &mut CommandRing, last: SlotRef) -> Result {
    let Some(target) = ep.ring.position_after(last) else {
        error!(
            "slot {} dci {}: TD end not ahead of dequeue",
            ep.slot_id,
            ep.dci.as_u8()
        );
        return Err(USBError::NotFound);
    };
    cmd.queue(
        Command::SetTrDequeue {
            slot_id: ep.slot_id,
            dci: ep.dci,
            stream_id: ep.config.stream_id,
            dequeue: ep.ring.slot_addr(target.slot),
            cycle: target.cycle,
        },
        true,
        None,
    )?;
    ep.flags.insert(EpFlags::SET_DEQ_PENDING);
    ep.pending_deq = Some(target);
    debug!(
        "slot {} dci {}: set dequeue -> {:#x} cycle {}",
        ep.slot_id,
        ep.dci.as_u8(),
        ep.ring.slot_addr(target.slot),
        target.cycle
    );
    Ok(())
}

fn queue_reset(ep: &mut Endpoint, cmd: &mut CommandRing, last: SlotRef) -> Result {
    cmd.queue(
        Command::ResetEndpoint {
            slot_id: ep.slot_id,
            dci: ep.dci,
            preserve_transfer_state: false,
        },
        true,
        None,
    )?;
    queue_set_dequeue(ep, cmd, last)
}

/// Host-side halt cleanup for the head TD: Reset Endpoint, then move the
/// dequeue past the TD. Doorbells stay off until the Set TR Dequeue completes.
/// Without two free command slots the pair waits in `ep.deferred`.
pub(crate) fn cleanup_halted_endpoint(
    ep: &mut Endpoint,
    cmd: &mut CommandRing,
    regs: &dyn XhciRegisters,
) -> Result {
    let Some(td) = ep.tds.front() else {
        return Err(USBError::NoPendingTd {
            slot: ep.slot_id,
            dci: ep.dci.as_u8(),
        });
    };
    let (key, last) = (td.key(), td.last);
    warn!(
        "slot {} dci {}: halted, resetting endpoint",
        ep.slot_id,
        ep.dci.as_u8()
    );
    ep.flags.insert(EpFlags::HALTED);
    ep.stopped = Some(key);
    defer_or_queue(ep, cmd, regs, DeferredRecovery::Reset { last })
}

fn defer_or_queue(
    ep: &mut Endpoint,
    cmd: &mut CommandRing,
    regs: &dyn XhciRegisters,
    work: DeferredRecovery,
) -> Result {
    if !cmd.has_room(work.commands(), true) {
        warn!(
            "slot {} dci {}: command ring full, {work:?} deferred",
            ep.slot_id,
            ep.dci.as_u8()
        );
        if let DeferredRecovery::SetDequeue { .. } = work {
            ep.flags.insert(EpFlags::SET_DEQ_PENDING);
        }
        ep.deferred = Some(work);
        return Ok(());
    }
    match work {
        DeferredRecovery::Reset { last } => queue_reset(ep, cmd, last)?,
        DeferredRecovery::SetDequeue { last } => queue_set_dequeue(ep, cmd, last)?,
    }
    ring_command_doorbell(regs);
    Ok(())
}

/// Queues deferred recovery commands once they fit. Returns `false` while
/// the command ring is still too full.
pub(crate) fn retry_deferred(
    ep: &mut Endpoint,
    cmd: &mut CommandRing,
    regs: &dyn XhciRegisters,
) -> Result<bool> {
    let Some(work) = ep.deferred else {
        return Ok(true);
    };
    if !cmd.has_room(work.commands(), true) {
        return Ok(false);
    }
    ep.deferred = None;
    debug!(
        "slot {} dci {}: queueing deferred {work:?}",
        ep.slot_id,
        ep.dci.as_u8()
    );
    defer_or_queue(ep, cmd, regs, work)?;
    Ok(true)
}

/// Starts quiescing the endpoint so cancelled TDs can be taken off the ring.
/// A stop already in flight covers newly cancelled TDs too.
pub(crate) fn request_stop(
    ep: &mut Endpoint,
    cmd: &mut CommandRing,
    regs: &dyn XhciRegisters,
    deadline: Duration,
) -> Result {
    if ep.flags.contains(EpFlags::STOP_PENDING) {
        return Ok(());
    }
    cmd.queue(
        Command::StopEndpoint {
            slot_id: ep.slot_id,
            dci: ep.dci,
            suspend: false,
        },
        false,
        None,
    )?;
    ep.flags.insert(EpFlags::STOP_PENDING);
    ep.stop_deadline = Some(deadline);
    debug!(
        "slot {} dci {}: stop endpoint queued",
        ep.slot_id,
        ep.dci.as_u8()
    );
    ring_command_doorbell(regs);
    Ok(())
}

/// The ring is quiescent. Cancelled TDs the hardware stopped in are skipped
/// with Set TR Dequeue; the rest become no-ops in place.
pub(crate) fn handle_stop_completion(
    ep: &mut Endpoint,
    cmd: &mut CommandRing,
    regs: &dyn XhciRegisters,
) -> Result {
    ep.flags.remove(EpFlags::STOP_PENDING);
    ep.stop_deadline = None;

    let cancelled = ep.take_cancelled();
    if cancelled.is_empty() {
        ep.stopped = None;
        ep.restart(regs);
        return Ok(());
    }

    let mut skip_to = None;
    for td in &cancelled {
        if ep.stopped == Some(td.key()) {
            skip_to = Some(td.last);
        } else {
            ep.ring.td_to_noop(td.first, td.last);
            ep.flags.insert(EpFlags::NOOP_REWRITTEN);
        }
    }
    ep.stopped = None;

    let res = match skip_to {
        Some(last) => defer_or_queue(ep, cmd, regs, DeferredRecovery::SetDequeue { last }),
        None => {
            debug!(
                "slot {} dci {}: {} TD(s) rewritten as no-op",
                ep.slot_id,
                ep.dci.as_u8(),
                cancelled.len()
            );
            Ok(())
        }
    };
    if skip_to.is_none() {
        ep.restart(regs);
    }

    for td in cancelled {
        ep.retire(td, Err(TransferError::Cancelled));
    }
    res
}

pub(crate) fn handle_reset_completion(ep: &mut Endpoint, regs: &dyn XhciRegisters, code: Completion) {
    if code != Ok(CompletionCode::Success) {
        warn!(
            "slot {} dci {}: reset endpoint completed with {code:?}",
            ep.slot_id,
            ep.dci.as_u8()
        );
    }
    ep.flags.remove(EpFlags::HALTED);
    ep.restart(regs);
}

pub(crate) fn handle_set_deq_completion(
    ep: &mut Endpoint,
    regs: &dyn XhciRegisters,
    code: Completion,
) {
    let target = ep.pending_deq.take();
    match (code, target) {
        (Ok(CompletionCode::Success), Some(target)) => {
            ep.ring.set_dequeue(target);
            trace!(
                "slot {} dci {}: dequeue now {:#x}",
                ep.slot_id,
                ep.dci.as_u8(),
                ep.ring.dequeue_addr()
            );
        }
        (code, _) => {
            warn!(
                "slot {} dci {}: set dequeue failed: {code:?}",
                ep.slot_id,
                ep.dci.as_u8()
            );
        }
    }
    ep.flags.remove(EpFlags::SET_DEQ_PENDING);
    ep.stopped = None;
    ep.restart(regs);
}
