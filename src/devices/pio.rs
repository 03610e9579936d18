//! Ordered port-I/O device registry (spec.md §4.3).
//!
//! Modeled on the teacher's `MmioBus` (`devices::mmio`), but for port I/O:
//! devices are tried in insertion order and the first whose interval
//! contains the port wins. Unmatched ports are a silent no-op — the guest
//! issues many speculative probes on legacy port space, and a bus with no
//! responder just doesn't answer.

use crate::kvm::{IoData, IoHandler};

/// A device behind the PIO registry.
///
/// Unlike `kvm::IoHandler`, this trait is scoped to a single device's own
/// port range rather than the whole 16-bit port space.
pub trait PioDevice {
    fn pio_in(&mut self, port: u16, data: &mut IoData);
    fn pio_out(&mut self, port: u16, data: &IoData);
}

struct Entry {
    start: u16,
    end: u16,
    device: Box<dyn PioDevice>,
}

/// Ordered interval list mapping `[start, end]` to a device (spec.md §4.3).
///
/// Intervals may overlap; registration order is dispatch priority.
pub struct PioBus {
    entries: Vec<Entry>,
}

impl PioBus {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    /// Registers `device` for the inclusive port range `[start, end]`.
    pub fn add(&mut self, start: u16, end: u16, device: Box<dyn PioDevice>) {
        self.entries.push(Entry { start, end, device });
    }

    fn find(&mut self, port: u16) -> Option<&mut Entry> {
        self.entries
            .iter_mut()
            .find(|e| port >= e.start && port <= e.end)
    }
}

impl Default for PioBus {
    fn default() -> Self {
        Self::new()
    }
}

impl IoHandler for PioBus {
    fn io_read(&mut self, port: u16, data: &mut IoData) {
        if let Some(entry) = self.find(port) {
            entry.device.pio_in(port, data);
        }
        // No match: no-op. `data` keeps whatever `IoData::new` zeroed it to.
    }

    fn io_write(&mut self, port: u16, data: &IoData) {
        if let Some(entry) = self.find(port) {
            entry.device.pio_out(port, data);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo(u8);

    impl PioDevice for Echo {
        fn pio_in(&mut self, _port: u16, data: &mut IoData) {
            data.set(0, self.0);
        }
        fn pio_out(&mut self, _port: u16, data: &IoData) {
            self.0 = data.as_slice()[0];
        }
    }

    #[test]
    fn dispatches_to_matching_device() {
        let mut bus = PioBus::new();
        bus.add(0x100, 0x100, Box::new(Echo(0xaa)));
        let mut data = IoData::new(1);
        bus.io_read(0x100, &mut data);
        assert_eq!(data.as_slice(), &[0xaa]);
    }

    #[test]
    fn unmatched_port_is_a_silent_noop() {
        let mut bus = PioBus::new();
        bus.add(0x100, 0x100, Box::new(Echo(0xaa)));
        let mut data = IoData::new(1);
        bus.io_read(0x200, &mut data);
        assert_eq!(data.as_slice(), &[0]);
        bus.io_write(0x200, &IoData::from_slice(&[0xff]));
    }

    #[test]
    fn first_registered_match_wins_on_overlap() {
        let mut bus = PioBus::new();
        bus.add(0x0, 0xffff, Box::new(Echo(1)));
        bus.add(0x100, 0x100, Box::new(Echo(2)));
        let mut data = IoData::new(1);
        bus.io_read(0x100, &mut data);
        assert_eq!(data.as_slice(), &[1]);
    }
}
