pub(crate) mod cmd;
mod context;
pub(crate) mod device;
mod endpoint;
mod event;
mod handler;
pub(crate) mod host;
mod port;
mod recovery;
pub mod reg;
pub mod ring;
mod transfer;
pub mod trb;

pub use cmd::{Command, CommandResult};
pub use context::{DeviceContextAccess, EndpointState};
pub use endpoint::{EndpointConfig, RecoveryState};
pub use event::{EventRing, EventRingInfo, EventRingSte};
pub use handler::{DrainReport, EventHandler};
pub use host::{
    BusEvent, CommandHandle, ControllerState, TransferHandle, Xhci, XhciConfig, XhciStats,
};
pub use port::{PortChange, PortChanges, PortStatus};
pub use reg::{MemMapper, MmioRegisters, XhciRegisters};
pub use ring::{Ring, RingKind, SlotRef};
pub use transfer::{DmaRange, RequestId, TransferRequest};
pub use trb::{Completion, CompletionCode, RingTrb, TrbData};
