/// Per-TD failure reported by the controller for one transfer.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferError {
    #[error("Endpoint stalled")]
    Stall,
    #[error("Babble or buffer overrun")]
    Overflow,
    #[error("USB transaction error")]
    Transaction,
    #[error("TRB error")]
    InvalidTrb,
    #[error("Data buffer error")]
    DataBuffer,
    #[error("Bandwidth overrun")]
    Bandwidth,
    #[error("Short packet")]
    ShortPacket,
    #[error("Missed service interval")]
    MissedService,
    #[error("Cancelled")]
    Cancelled,
    #[error("Controller shut down")]
    Shutdown,
    #[error("Completion code {0}")]
    Other(u8),
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum USBError {
    #[error("Timeout")]
    Timeout,
    #[error("No memory available")]
    NoMemory,
    #[error("Transfer error: {0}")]
    TransferError(#[from] TransferError),
    #[error("Not initialized")]
    NotInitialized,
    #[error("Not found")]
    NotFound,
    #[error("Invalid parameter")]
    InvalidParameter,
    #[error("Insufficient ring space")]
    InsufficientRingSpace,
    #[error("Endpoint disabled")]
    EndpointDisabled,
    #[error("Endpoint in error state")]
    EndpointError,
    #[error("Command failed with completion code {0}")]
    CommandFailed(u8),
    #[error("Command completion for {got:#x}, expected {expected:#x}")]
    CommandRingMismatch { expected: u64, got: u64 },
    #[error("Command completion for {addr:#x} with no command pending")]
    UnexpectedCompletion { addr: u64 },
    #[error("Transfer event {addr:#x} outside any TD of slot {slot} dci {dci}")]
    EventNotInTd { slot: u8, dci: u8, addr: u64 },
    #[error("Transfer event on slot {slot} dci {dci} with no pending TD")]
    NoPendingTd { slot: u8, dci: u8 },
    #[error("Controller dying")]
    ControllerDying,
    #[error("Host system error")]
    HostSystemError,
}

impl USBError {
    /// Software and hardware no longer agree on ring or device state.
    pub fn is_desync(&self) -> bool {
        matches!(
            self,
            Self::NotFound
                | Self::CommandRingMismatch { .. }
                | Self::UnexpectedCompletion { .. }
                | Self::EventNotInTd { .. }
                | Self::NoPendingTd { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn desync_class() {
        assert!(USBError::CommandRingMismatch { expected: 0x10, got: 0x20 }.is_desync());
        assert!(USBError::NoPendingTd { slot: 1, dci: 3 }.is_desync());
        assert!(!USBError::InsufficientRingSpace.is_desync());
        assert!(!USBError::TransferError(TransferError::Stall).is_desync());
    }
}
