use alloc::vec::Vec;

use num_enum::{FromPrimitive, IntoPrimitive};

use crate::err::TransferError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Out,
    In,
}

impl Direction {
    pub fn from_address(addr: u8) -> Self {
        if addr & 0x80 != 0 { Self::In } else { Self::Out }
    }

    pub fn is_in(&self) -> bool {
        matches!(self, Self::In)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum EndpointType {
    #[num_enum(default)]
    Control = 0,
    Isochronous = 1,
    Bulk = 2,
    Interrupt = 3,
}

impl EndpointType {
    /// From the `bmAttributes` field of an endpoint descriptor.
    pub fn from_attributes(attributes: u8) -> Self {
        Self::from(attributes & 0x3)
    }
}

/// Raw 8-byte SETUP packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ControlSetup {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl ControlSetup {
    pub fn direction(&self) -> Direction {
        Direction::from_address(self.request_type)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IsoPacketResult {
    pub status: Result<(), TransferError>,
    pub actual_length: usize,
}

/// What a client request resolves to once every TD of it has retired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferCompletion {
    pub status: Result<(), TransferError>,
    pub actual_length: usize,
    /// Hardware reported more bytes than were requested; `actual_length` was clamped to zero.
    pub length_mismatch: bool,
    pub iso_packets: Vec<IsoPacketResult>,
}

impl TransferCompletion {
    pub fn into_result(self) -> Result<usize, TransferError> {
        self.status.map(|_| self.actual_length)
    }
}
