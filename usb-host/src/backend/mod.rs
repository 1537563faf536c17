pub mod xhci;

define_int_type!(Dci, u8);

impl Dci {
    pub const CTRL: Self = Self(1);

    /// Device Context Index of a USB endpoint address (`0x81` -> 3).
    pub fn from_endpoint_address(addr: u8) -> Self {
        let num = addr & 0x0f;
        if num == 0 {
            return Self::CTRL;
        }
        let dir_in = (addr & 0x80 != 0) as u8;
        Self(num * 2 + dir_in)
    }

    pub fn as_u8(&self) -> u8 {
        self.0
    }

    pub fn as_usize(&self) -> usize {
        self.0 as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dci_from_address() {
        assert_eq!(Dci::from_endpoint_address(0x00), Dci::CTRL);
        assert_eq!(Dci::from_endpoint_address(0x80), Dci::CTRL);
        assert_eq!(Dci::from_endpoint_address(0x01).as_u8(), 2);
        assert_eq!(Dci::from_endpoint_address(0x81).as_u8(), 3);
        assert_eq!(Dci::from_endpoint_address(0x8f).as_u8(), 31);
    }
}
