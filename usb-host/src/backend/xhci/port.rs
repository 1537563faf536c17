//! 端口状态
//!
//! Port Status Change 事件只需要连接状态、速率和变化位。

use bitflags::bitflags;

bitflags! {
    /// Change bits of PORTSC seen by one event.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PortChanges: u8 {
        /// Connect Status Change
        const CONNECT = 1 << 0;
        const ENABLE = 1 << 1;
        const WARM_RESET = 1 << 2;
        const OVER_CURRENT = 1 << 3;
        const RESET = 1 << 4;
        const LINK_STATE = 1 << 5;
        const CONFIG_ERROR = 1 << 6;
    }
}

/// A PORTSC snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PortStatus {
    pub connected: bool,
    pub enabled: bool,
    pub powered: bool,
    pub over_current: bool,
    /// Protocol speed ID.
    pub speed: u8,
    pub link_state: u8,
    pub changes: PortChanges,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortChange {
    /// 1-based port number.
    pub port_id: u8,
    pub status: PortStatus,
}

impl PortChange {
    pub fn connected(&self) -> bool {
        self.status.connected
    }

    pub fn connect_changed(&self) -> bool {
        self.status.changes.contains(PortChanges::CONNECT)
    }
}
