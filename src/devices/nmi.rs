//! Port 0x61 NMI-acknowledge stub (spec.md §4.2).
//!
//! Real AT hardware wires port 0x61 to the PC speaker gate and a handful of
//! status bits; this VMM only implements the one behavior the boot protocol
//! actually depends on: an `IN` on this port during NMI handling must read
//! back 0x20 so the guest's NMI handler acknowledges and returns. Writes are
//! accepted and discarded.

use crate::devices::pio::PioDevice;
use crate::kvm::IoData;

pub const NMI_ACK_PORT: u16 = 0x61;
const NMI_ACK_VALUE: u8 = 0x20;

#[derive(Default)]
pub struct NmiAck;

impl NmiAck {
    pub fn new() -> Self {
        Self
    }
}

impl PioDevice for NmiAck {
    fn pio_in(&mut self, _port: u16, data: &mut IoData) {
        data.set(0, NMI_ACK_VALUE);
    }

    fn pio_out(&mut self, _port: u16, _data: &IoData) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_back_the_nmi_ack_value() {
        let mut device = NmiAck::new();
        let mut data = IoData::new(1);
        device.pio_in(NMI_ACK_PORT, &mut data);
        assert_eq!(data.as_slice(), &[0x20]);
    }
}
