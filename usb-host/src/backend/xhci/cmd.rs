use alloc::collections::VecDeque;

use xhci::ring::trb::{command, event::CommandCompletion};

use super::{
    ring::{Ring, RingKind},
    trb::{Completion, CompletionCode},
};
use crate::{BusAddr, Dci, Kernel, err::*, queue::Finished};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    NoOp,
    EnableSlot {
        slot_type: u8,
    },
    DisableSlot {
        slot_id: u8,
    },
    AddressDevice {
        slot_id: u8,
        input_ctx: BusAddr,
        block_set_address: bool,
    },
    ConfigureEndpoint {
        slot_id: u8,
        input_ctx: BusAddr,
        deconfigure: bool,
    },
    EvaluateContext {
        slot_id: u8,
        input_ctx: BusAddr,
    },
    ResetEndpoint {
        slot_id: u8,
        dci: Dci,
        preserve_transfer_state: bool,
    },
    StopEndpoint {
        slot_id: u8,
        dci: Dci,
        suspend: bool,
    },
    SetTrDequeue {
        slot_id: u8,
        dci: Dci,
        stream_id: u16,
        dequeue: BusAddr,
        cycle: bool,
    },
    ResetDevice {
        slot_id: u8,
    },
}

impl Command {
    pub fn to_trb(&self) -> command::Allowed {
        match *self {
            Command::NoOp => command::Allowed::Noop(command::Noop::new()),
            Command::EnableSlot { slot_type } => {
                let mut trb = command::EnableSlot::new();
                trb.set_slot_type(slot_type);
                command::Allowed::EnableSlot(trb)
            }
            Command::DisableSlot { slot_id } => {
                let mut trb = command::DisableSlot::new();
                trb.set_slot_id(slot_id);
                command::Allowed::DisableSlot(trb)
            }
            Command::AddressDevice {
                slot_id,
                input_ctx,
                block_set_address,
            } => {
                let mut trb = command::AddressDevice::new();
                trb.set_input_context_pointer(input_ctx.raw())
                    .set_slot_id(slot_id);
                if block_set_address {
                    trb.set_block_set_address_request();
                }
                command::Allowed::AddressDevice(trb)
            }
            Command::ConfigureEndpoint {
                slot_id,
                input_ctx,
                deconfigure,
            } => {
                let mut trb = command::ConfigureEndpoint::new();
                trb.set_input_context_pointer(input_ctx.raw())
                    .set_slot_id(slot_id);
                if deconfigure {
                    trb.set_deconfigure();
                }
                command::Allowed::ConfigureEndpoint(trb)
            }
            Command::EvaluateContext { slot_id, input_ctx } => {
                let mut trb = command::EvaluateContext::new();
                trb.set_input_context_pointer(input_ctx.raw())
                    .set_slot_id(slot_id);
                command::Allowed::EvaluateContext(trb)
            }
            Command::ResetEndpoint {
                slot_id,
                dci,
                preserve_transfer_state,
            } => {
                let mut trb = command::ResetEndpoint::new();
                trb.set_endpoint_id(dci.as_u8()).set_slot_id(slot_id);
                if preserve_transfer_state {
                    trb.set_transfer_state_preserve();
                }
                command::Allowed::ResetEndpoint(trb)
            }
            Command::StopEndpoint {
                slot_id,
                dci,
                suspend,
            } => {
                let mut trb = command::StopEndpoint::new();
                trb.set_endpoint_id(dci.as_u8()).set_slot_id(slot_id);
                if suspend {
                    trb.set_suspend();
                }
                command::Allowed::StopEndpoint(trb)
            }
            Command::SetTrDequeue {
                slot_id,
                dci,
                stream_id,
                dequeue,
                cycle,
            } => {
                let mut trb = command::SetTrDequeuePointer::new();
                trb.set_new_tr_dequeue_pointer(dequeue.raw())
                    .set_stream_id(stream_id)
                    .set_endpoint_id(dci.as_u8())
                    .set_slot_id(slot_id);
                if cycle {
                    trb.set_dequeue_cycle_state();
                }
                command::Allowed::SetTrDequeuePointer(trb)
            }
            Command::ResetDevice { slot_id } => {
                let mut trb = command::ResetDevice::new();
                trb.set_slot_id(slot_id);
                command::Allowed::ResetDevice(trb)
            }
        }
    }

    /// Endpoint a recovery command targets.
    pub fn endpoint(&self) -> Option<(u8, Dci)> {
        match *self {
            Command::ResetEndpoint { slot_id, dci, .. }
            | Command::StopEndpoint { slot_id, dci, .. }
            | Command::SetTrDequeue { slot_id, dci, .. } => Some((slot_id, dci)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandResult {
    pub code: Completion,
    pub slot_id: u8,
    pub parameter: u32,
}

pub(crate) type CommandReply = Result<CommandResult>;

struct PendingCommand {
    addr: BusAddr,
    command: Command,
    waiter: Option<Finished<CommandReply>>,
}

/// The shared command ring and the commands still waiting for completion,
/// in submission order.
pub(crate) struct CommandRing {
    ring: Ring,
    pending: VecDeque<PendingCommand>,
    reserved: usize,
}

impl CommandRing {
    pub fn new(kernel: &dyn Kernel, segments: usize, reserved: usize) -> Result<Self> {
        Ok(Self {
            ring: Ring::new(kernel, RingKind::Command, segments)?,
            pending: VecDeque::new(),
            reserved,
        })
    }

    pub fn ring(&self) -> &Ring {
        &self.ring
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Whether `n` commands fit. Best-effort commands leave `reserved` slots
    /// for the ones that must not fail, such as recovery sequences.
    pub fn has_room(&self, n: usize, must_succeed: bool) -> bool {
        let needed = if must_succeed { n } else { n + self.reserved };
        self.ring.has_room(needed)
    }

    /// Writes one command TRB.
    pub fn queue(
        &mut self,
        command: Command,
        must_succeed: bool,
        waiter: Option<Finished<CommandReply>>,
    ) -> Result<BusAddr> {
        if !self.has_room(1, must_succeed) {
            warn!("command ring full, {command:?} not queued");
            return Err(USBError::InsufficientRingSpace);
        }
        let slots = self.ring.enqueue(&[command.to_trb()])?;
        let addr = self.ring.slot_addr(slots[0]);
        debug!("[CMD] {command:?} @{addr:#x}");
        self.pending.push_back(PendingCommand {
            addr,
            command,
            waiter,
        });
        Ok(addr)
    }

    /// Matches a completion against the command at the dequeue slot. On an
    /// address mismatch nothing changes. A Command Ring Stopped completion
    /// leaves the dequeue where it is and yields `None`.
    pub fn resolve(
        &mut self,
        event: &CommandCompletion,
    ) -> Result<Option<(Command, CommandResult)>> {
        let expected = self.ring.dequeue_addr();
        let got = BusAddr::from(event.command_trb_pointer());
        let code = event.completion_code();
        if got != expected {
            if self.pending.is_empty() {
                return Err(USBError::UnexpectedCompletion { addr: got.raw() });
            }
            return Err(USBError::CommandRingMismatch {
                expected: expected.raw(),
                got: got.raw(),
            });
        }
        if code == Ok(CompletionCode::CommandRingStopped) {
            debug!("command ring stopped @{expected:#x}");
            return Ok(None);
        }
        let Some(front) = self.pending.front() else {
            return Err(USBError::UnexpectedCompletion { addr: got.raw() });
        };
        if front.addr != expected {
            return Err(USBError::CommandRingMismatch {
                expected: front.addr.raw(),
                got: got.raw(),
            });
        }
        let Some(cmd) = self.pending.pop_front() else {
            return Ok(None);
        };
        self.ring.dequeue_advance();

        let result = CommandResult {
            code,
            slot_id: event.slot_id(),
            parameter: event.command_completion_parameter(),
        };
        debug!("[CMD] {:?} -> {code:?}", cmd.command);
        if let Some(waiter) = cmd.waiter {
            waiter.set_finished(match code {
                Ok(CompletionCode::Success) => Ok(result),
                Ok(code) => Err(USBError::CommandFailed(code as u8)),
                Err(raw) => Err(USBError::CommandFailed(raw)),
            });
        }
        Ok(Some((cmd.command, result)))
    }

    /// Fails every command still waiting.
    pub fn fail_all(&mut self, err: USBError) {
        for cmd in self.pending.drain(..) {
            if let Some(waiter) = cmd.waiter {
                waiter.set_finished(Err(err.clone()));
            }
        }
    }
}
