use alloc::collections::BTreeMap;

use super::endpoint::Endpoint;
use crate::Dci;

/// Endpoints of one device slot.
pub(crate) struct Device {
    pub slot_id: u8,
    pub endpoints: BTreeMap<Dci, Endpoint>,
}

impl Device {
    pub fn new(slot_id: u8) -> Self {
        Self {
            slot_id,
            endpoints: BTreeMap::new(),
        }
    }

    pub fn endpoint_mut(&mut self, dci: Dci) -> Option<&mut Endpoint> {
        self.endpoints.get_mut(&dci)
    }

    pub fn endpoints_mut(&mut self) -> impl Iterator<Item = &mut Endpoint> {
        self.endpoints.values_mut()
    }
}
