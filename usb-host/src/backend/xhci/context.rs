pub use xhci::context::EndpointState;

use crate::Dci;

/// Read access to the externally owned output device contexts.
///
/// The contexts are written only by the controller, in response to Address
/// Device, Configure Endpoint and Evaluate Context commands.
pub trait DeviceContextAccess: Send + Sync {
    /// `None` when the slot or endpoint has no context.
    fn endpoint_state(&self, slot_id: u8, dci: Dci) -> Option<EndpointState>;
}
