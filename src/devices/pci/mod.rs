//! PCI configuration-space mechanism #1 and the device list behind it
//! (spec.md §4.6).
//!
//! The guest talks to this bus through two 4-byte PIO windows:
//! `CONFIG_ADDRESS` (0xCF8) selects a bus/device/function/register, and
//! `CONFIG_DATA` (0xCFC) reads or writes the selected register. This bus
//! also owns the catch-all `[0x0000, 0xFFFF]` PIO range installed after
//! COM1 and PS/2 in the registry — every port not claimed by a more
//! specific device lands here and is routed to whichever PCI device
//! declares it as part of its BAR-mapped I/O window.
//!
//! Only bus 0, function 0 is recognized; device index is simply position in
//! `PciBus`'s device list. Index 0 is always the host bridge.

mod hostbridge;
mod virtio_net;

pub use hostbridge::HostBridge;
pub use virtio_net::VirtioNet;

use crate::devices::pio::PioDevice;
use crate::kvm::IoData;

pub const CONFIG_ADDRESS_PORT: u16 = 0xcf8;
pub const CONFIG_DATA_PORT: u16 = 0xcfc;

const HEADER_SIZE: u8 = 64;
const BAR0_OFFSET: u8 = 16;
const BAR_PROBE_VALUE: u32 = 0xffff_ffff;

/// Decoded `CONFIG_ADDRESS` register: `{offset:8, function:3, device:5,
/// bus:8, reserved:7, enable:1}`, packed into a plain `u32` (spec.md §3
/// glossary).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConfigAddress(u32);

impl ConfigAddress {
    fn enable(self) -> bool {
        self.0 & (1 << 31) != 0
    }

    fn bus(self) -> u8 {
        ((self.0 >> 16) & 0xff) as u8
    }

    fn device(self) -> u8 {
        ((self.0 >> 11) & 0x1f) as u8
    }

    fn function(self) -> u8 {
        ((self.0 >> 8) & 0x7) as u8
    }

    fn register_offset(self) -> u8 {
        (self.0 & 0xff) as u8
    }

    fn set_byte(&mut self, index: u16, value: u8) {
        let shift = index * 8;
        let mask = !(0xffu32 << shift);
        self.0 = (self.0 & mask) | ((value as u32) << shift);
    }

    fn byte(self, index: u16) -> u8 {
        ((self.0 >> (index * 8)) & 0xff) as u8
    }
}

/// PCI Type-0 configuration header, exactly 64 bytes (spec.md §3 glossary).
#[derive(Clone, Copy, Debug)]
#[repr(C, packed)]
pub struct Type0Header {
    pub vendor_id: u16,
    pub device_id: u16,
    pub command: u16,
    pub status: u16,
    pub revision_id: u8,
    pub prog_if: u8,
    pub subclass: u8,
    pub class_code: u8,
    pub cache_line_size: u8,
    pub latency_timer: u8,
    pub header_type: u8,
    pub bist: u8,
    pub bar: [u32; 6],
    pub cardbus_cis_ptr: u32,
    pub subsystem_vendor_id: u16,
    pub subsystem_id: u16,
    pub expansion_rom_base: u32,
    pub capabilities_pointer: u8,
    _reserved: [u8; 7],
    pub interrupt_line: u8,
    pub interrupt_pin: u8,
    pub min_grant: u8,
    pub max_latency: u8,
}

const _: () = assert!(std::mem::size_of::<Type0Header>() == 64);

/// Command register bit: I/O space decoding enabled.
pub const COMMAND_ENABLE_IO_SPACE: u16 = 1 << 0;
/// Status register bit: a capabilities list is present.
pub const STATUS_CAPABILITIES_LIST: u16 = 1 << 4;

/// Builds the I/O-space BAR encoding `{use_io_space:1, reserved:1,
/// address:30}` for a BAR pointing at `port`.
pub const fn io_bar(port: u32) -> u32 {
    (port & !0x3) | 0x1
}

impl Type0Header {
    pub fn new(vendor_id: u16, device_id: u16, class_code: u8, subclass: u8) -> Self {
        Self {
            vendor_id,
            device_id,
            command: 0,
            status: 0,
            revision_id: 0,
            prog_if: 0,
            subclass,
            class_code,
            cache_line_size: 0,
            latency_timer: 0,
            header_type: 0,
            bist: 0,
            bar: [0; 6],
            cardbus_cis_ptr: 0,
            subsystem_vendor_id: 0,
            subsystem_id: 0,
            expansion_rom_base: 0,
            capabilities_pointer: 0,
            _reserved: [0; 7],
            interrupt_line: 0,
            interrupt_pin: 0,
            min_grant: 0,
            max_latency: 0,
        }
    }

    fn as_bytes(&self) -> &[u8] {
        unsafe {
            std::slice::from_raw_parts((self as *const Self) as *const u8, std::mem::size_of::<Self>())
        }
    }

    fn as_bytes_mut(&mut self) -> &mut [u8] {
        unsafe {
            std::slice::from_raw_parts_mut((self as *mut Self) as *mut u8, std::mem::size_of::<Self>())
        }
    }
}

/// A device sitting on the PCI bus (spec.md §4.6 "Device capability").
pub trait PciDevice {
    /// Inclusive-exclusive `[start, end)` range of PIO ports this device's
    /// BARs occupy. Devices with no I/O BAR (the host bridge) return an
    /// empty range.
    fn io_range(&self) -> (u16, u16);

    fn configuration(&self) -> &Type0Header;
    fn configuration_mut(&mut self) -> &mut Type0Header;

    /// BAR-mapped I/O read, `port` already known to fall in `io_range()`.
    fn io_in(&mut self, port: u16, data: &mut IoData);
    /// BAR-mapped I/O write, `port` already known to fall in `io_range()`.
    fn io_out(&mut self, port: u16, data: &IoData);

    /// Configuration-space access for offsets at or beyond the 64-byte
    /// header (capability chain and anything past it). A no-op for devices
    /// with no capabilities, per spec.md's open question on non-header
    /// configuration writes.
    fn configuration_in(&mut self, _offset: u8, _data: &mut IoData) {}
    fn configuration_out(&mut self, _offset: u8, _data: &IoData) {}

    fn deinit(&mut self) {}
}

/// PCI bus 0: the `CONFIG_ADDRESS`/`CONFIG_DATA` mechanism plus the device
/// list and BAR-mapped catch-all routing.
pub struct PciBus {
    address: ConfigAddress,
    devices: Vec<Box<dyn PciDevice>>,
}

impl PciBus {
    pub fn new() -> Self {
        Self {
            address: ConfigAddress::default(),
            devices: Vec::new(),
        }
    }

    /// Appends a device; its index in this call order is its PCI device
    /// number (index 0 must be the host bridge).
    pub fn add_device(&mut self, device: Box<dyn PciDevice>) {
        self.devices.push(device);
    }

    fn selected_device(&mut self) -> Option<&mut Box<dyn PciDevice>> {
        if !self.address.enable() || self.address.bus() != 0 || self.address.function() != 0 {
            return None;
        }
        self.devices.get_mut(self.address.device() as usize)
    }

    fn config_read(&mut self, sub_offset: u8, width: usize, out: &mut IoData) {
        let offset = self.address.register_offset().wrapping_add(sub_offset);
        let Some(device) = self.selected_device() else {
            for i in 0..width {
                out.set(i, 0xff);
            }
            return;
        };

        if offset == BAR0_OFFSET && width == 4 {
            let bar = device.configuration().bar;
            if bar[0] == BAR_PROBE_VALUE {
                let (start, end) = device.io_range();
                let size = (end - start) as u32;
                out.set(0, size as u8);
                out.set(1, (size >> 8) as u8);
                out.set(2, (size >> 16) as u8);
                out.set(3, (size >> 24) as u8);
                return;
            }
        }

        if (offset as usize) + width <= HEADER_SIZE as usize {
            let header = device.configuration().as_bytes();
            for i in 0..width {
                out.set(i, header[offset as usize + i]);
            }
        } else {
            device.configuration_in(offset, out);
        }
    }

    fn config_write(&mut self, sub_offset: u8, width: usize, data: &IoData) {
        let offset = self.address.register_offset().wrapping_add(sub_offset);
        let Some(device) = self.selected_device() else {
            return;
        };

        if (offset as usize) + width <= HEADER_SIZE as usize {
            let header = device.configuration_mut().as_bytes_mut();
            let src = data.as_slice();
            for i in 0..width.min(src.len()) {
                header[offset as usize + i] = src[i];
            }
        } else {
            device.configuration_out(offset, data);
        }
    }
}

impl Default for PciBus {
    fn default() -> Self {
        Self::new()
    }
}

impl PioDevice for PciBus {
    fn pio_in(&mut self, port: u16, data: &mut IoData) {
        match port {
            CONFIG_ADDRESS_PORT..=0xcfb => {
                let value = self.address.byte(port - CONFIG_ADDRESS_PORT);
                data.set(0, value);
            }
            CONFIG_DATA_PORT..=0xcff => {
                self.config_read((port - CONFIG_DATA_PORT) as u8, data.len(), data)
            }
            _ => {
                if let Some(device) = self
                    .devices
                    .iter_mut()
                    .find(|d| in_range(d.io_range(), port))
                {
                    device.io_in(port, data);
                }
            }
        }
    }

    fn pio_out(&mut self, port: u16, data: &IoData) {
        match port {
            CONFIG_ADDRESS_PORT..=0xcfb => {
                if let Some(&value) = data.as_slice().first() {
                    self.address.set_byte(port - CONFIG_ADDRESS_PORT, value);
                }
            }
            CONFIG_DATA_PORT..=0xcff => {
                self.config_write((port - CONFIG_DATA_PORT) as u8, data.len(), data)
            }
            _ => {
                if let Some(device) = self
                    .devices
                    .iter_mut()
                    .find(|d| in_range(d.io_range(), port))
                {
                    device.io_out(port, data);
                }
            }
        }
    }
}

fn in_range((start, end): (u16, u16), port: u16) -> bool {
    end > start && port >= start && port < end
}

impl Drop for PciBus {
    fn drop(&mut self) {
        for device in &mut self.devices {
            device.deinit();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_address(bus: &mut PciBus, address: u32) {
        for i in 0..4u16 {
            let byte = ((address >> (i * 8)) & 0xff) as u8;
            bus.pio_out(CONFIG_ADDRESS_PORT + i, &IoData::from_slice(&[byte]));
        }
    }

    #[test]
    fn config_address_accumulates_byte_granular_writes() {
        let mut bus = PciBus::new();
        write_address(&mut bus, 0x8000_0800);
        assert_eq!(bus.address.0, 0x8000_0800);
        assert!(bus.address.enable());
        assert_eq!(bus.address.device(), 1);
    }

    #[test]
    fn out_of_range_device_reads_as_floating_bus() {
        let mut bus = PciBus::new();
        write_address(&mut bus, 0x8000_7800); // device 15, nothing registered
        let mut data = IoData::new(4);
        bus.pio_in(CONFIG_DATA_PORT, &mut data);
        assert_eq!(data.as_slice(), &[0xff, 0xff, 0xff, 0xff]);
    }

    #[test]
    fn disabled_address_reads_as_floating_bus() {
        let mut bus = PciBus::new();
        bus.add_device(Box::new(HostBridge::new()));
        write_address(&mut bus, 0x0000_0000); // enable bit clear
        let mut data = IoData::new(4);
        bus.pio_in(CONFIG_DATA_PORT, &mut data);
        assert_eq!(data.as_slice(), &[0xff, 0xff, 0xff, 0xff]);
    }

    #[test]
    fn header_read_returns_vendor_and_device_id() {
        let mut bus = PciBus::new();
        bus.add_device(Box::new(HostBridge::new()));
        write_address(&mut bus, 0x8000_0000); // device 0, offset 0
        let mut data = IoData::new(4);
        bus.pio_in(CONFIG_DATA_PORT, &mut data);
        assert_eq!(data.as_slice()[0], 0xe0);
        assert_eq!(data.as_slice()[1], 0x1a);
    }

    #[test]
    fn bar0_size_probe_round_trip() {
        let mut bus = PciBus::new();
        bus.add_device(Box::new(HostBridge::new()));
        bus.add_device(Box::new(VirtioNet::new()));
        write_address(&mut bus, 0x8000_0810); // device 1, offset 0x10 (BAR0)

        let mut data = IoData::new(4);
        bus.pio_in(CONFIG_DATA_PORT, &mut data);
        assert_eq!(u32::from_le_bytes(data.as_slice().try_into().unwrap()), io_bar(0x1000));

        bus.pio_out(CONFIG_DATA_PORT, &IoData::from_slice(&0xffff_ffffu32.to_le_bytes()));
        let mut probed = IoData::new(4);
        bus.pio_in(CONFIG_DATA_PORT, &mut probed);
        assert_eq!(u32::from_le_bytes(probed.as_slice().try_into().unwrap()), 0x100);

        bus.pio_out(CONFIG_DATA_PORT, &IoData::from_slice(&io_bar(0x1000).to_le_bytes()));
        let mut restored = IoData::new(4);
        bus.pio_in(CONFIG_DATA_PORT, &mut restored);
        assert_eq!(u32::from_le_bytes(restored.as_slice().try_into().unwrap()), io_bar(0x1000));
    }

    #[test]
    fn catch_all_routes_bar_mapped_port_to_owning_device() {
        let mut bus = PciBus::new();
        bus.add_device(Box::new(HostBridge::new()));
        bus.add_device(Box::new(VirtioNet::new()));
        let mut data = IoData::new(1);
        bus.pio_in(0x1000, &mut data); // device_feature_select low byte
        assert_eq!(data.as_slice(), &[0]);
    }
}
