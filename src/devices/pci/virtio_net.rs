//! virtio-net (modern) discovery/capability stub (spec.md §4.7).
//!
//! Advertises a non-transitional virtio-net PCI function with a three-entry
//! capability chain pointing into BAR0. No virtqueue processing happens
//! here — per spec.md's Non-goals, only the discovery surface is emulated;
//! writes into BAR0 are accepted and silently discarded.
//!
//! Capability layout grounded on the modern virtio-over-PCI transport shape
//! (`VirtioPciCap`/`VirtioPciNotifyCap`) used by cloud-hypervisor's
//! `vm-virtio` crate, simplified to the fields spec.md's capability chain
//! names.

use super::{io_bar, PciDevice, Type0Header, COMMAND_ENABLE_IO_SPACE, STATUS_CAPABILITIES_LIST};
use crate::kvm::IoData;

const VENDOR_ID: u16 = 0x1af4;
const DEVICE_ID: u16 = 0x1041;
const CLASS_NETWORK: u8 = 0x02;
const SUBCLASS_ETHERNET: u8 = 0x00;

const BAR0_PORT: u32 = 0x1000;
const BAR0_SIZE: u16 = 0x100;

const CAP_VNDR_VENDOR_SPECIFIC: u8 = 0x09;
const CFG_TYPE_COMMON: u8 = 1;
const CFG_TYPE_NOTIFY: u8 = 2;
const CFG_TYPE_ISR: u8 = 3;

const CAPABILITIES_POINTER: u8 = 64;
const CAP_ENTRY_SIZE: u8 = 16;

/// Virtio 1.0 common configuration structure, exposed read-only at BAR0
/// offset 0 (spec.md §4.7). Device logic never mutates these fields since
/// no virtqueue is actually processed.
#[derive(Clone, Copy, Debug, Default)]
#[repr(C, packed)]
pub struct VirtioPciCommonConfig {
    pub device_feature_select: u32,
    pub device_feature: u32,
    pub driver_feature_select: u32,
    pub driver_feature: u32,
    pub msix_config: u16,
    pub num_queues: u16,
    pub device_status: u8,
    pub config_generation: u8,
    pub queue_select: u16,
    pub queue_size: u16,
    pub queue_msix_vector: u16,
    pub queue_enable: u16,
    pub queue_notify_off: u16,
    pub queue_desc: u64,
    pub queue_avail: u64,
    pub queue_used: u64,
}

const COMMON_CONFIG_SIZE: u8 = std::mem::size_of::<VirtioPciCommonConfig>() as u8;
const _: () = assert!(COMMON_CONFIG_SIZE == 56);

/// One entry of the virtio PCI capability chain (spec.md §3 glossary).
#[derive(Clone, Copy, Default)]
#[repr(C, packed)]
struct VirtioPciCap {
    cap_vndr: u8,
    cap_next: u8,
    cap_len: u8,
    cfg_type: u8,
    bar: u8,
    _padding: [u8; 3],
    offset: u32,
    length: u32,
}

const _: () = assert!(std::mem::size_of::<VirtioPciCap>() == CAP_ENTRY_SIZE as usize);

impl VirtioPciCap {
    fn as_bytes(&self) -> &[u8] {
        unsafe {
            std::slice::from_raw_parts((self as *const Self) as *const u8, std::mem::size_of::<Self>())
        }
    }
}

pub struct VirtioNet {
    configuration: Type0Header,
    common_config: VirtioPciCommonConfig,
    capabilities: [VirtioPciCap; 3],
}

impl VirtioNet {
    pub fn new() -> Self {
        let mut configuration = Type0Header::new(VENDOR_ID, DEVICE_ID, CLASS_NETWORK, SUBCLASS_ETHERNET);
        configuration.command = COMMAND_ENABLE_IO_SPACE;
        configuration.status = STATUS_CAPABILITIES_LIST;
        let mut bar = configuration.bar;
        bar[0] = io_bar(BAR0_PORT);
        configuration.bar = bar;
        configuration.capabilities_pointer = CAPABILITIES_POINTER;

        let common = VirtioPciCap {
            cap_vndr: CAP_VNDR_VENDOR_SPECIFIC,
            cap_next: CAPABILITIES_POINTER + CAP_ENTRY_SIZE,
            cap_len: CAP_ENTRY_SIZE,
            cfg_type: CFG_TYPE_COMMON,
            bar: 0,
            _padding: [0; 3],
            offset: 0,
            length: COMMON_CONFIG_SIZE as u32,
        };
        let notify = VirtioPciCap {
            cap_vndr: CAP_VNDR_VENDOR_SPECIFIC,
            cap_next: CAPABILITIES_POINTER + 2 * CAP_ENTRY_SIZE,
            cap_len: CAP_ENTRY_SIZE,
            cfg_type: CFG_TYPE_NOTIFY,
            bar: 0,
            _padding: [0; 3],
            offset: COMMON_CONFIG_SIZE as u32,
            length: 4,
        };
        let isr = VirtioPciCap {
            cap_vndr: CAP_VNDR_VENDOR_SPECIFIC,
            cap_next: 0,
            cap_len: CAP_ENTRY_SIZE,
            cfg_type: CFG_TYPE_ISR,
            bar: 0,
            _padding: [0; 3],
            offset: COMMON_CONFIG_SIZE as u32,
            length: 1,
        };

        Self {
            configuration,
            common_config: VirtioPciCommonConfig {
                num_queues: 1,
                ..Default::default()
            },
            capabilities: [common, notify, isr],
        }
    }

    fn common_config_bytes(&self) -> &[u8] {
        unsafe {
            std::slice::from_raw_parts(
                (&self.common_config as *const VirtioPciCommonConfig) as *const u8,
                COMMON_CONFIG_SIZE as usize,
            )
        }
    }
}

impl Default for VirtioNet {
    fn default() -> Self {
        Self::new()
    }
}

impl PciDevice for VirtioNet {
    fn io_range(&self) -> (u16, u16) {
        (BAR0_PORT as u16, BAR0_PORT as u16 + BAR0_SIZE)
    }

    fn configuration(&self) -> &Type0Header {
        &self.configuration
    }

    fn configuration_mut(&mut self) -> &mut Type0Header {
        &mut self.configuration
    }

    fn io_in(&mut self, port: u16, data: &mut IoData) {
        let offset = (port - BAR0_PORT as u16) as usize;
        if offset + data.len() > COMMON_CONFIG_SIZE as usize {
            return;
        }
        let bytes = self.common_config_bytes();
        for i in 0..data.len() {
            data.set(i, bytes[offset + i]);
        }
    }

    fn io_out(&mut self, _port: u16, _data: &IoData) {
        // Accepted and discarded: no virtqueue processing (spec.md §4.7, Non-goals).
    }

    fn configuration_in(&mut self, offset: u8, data: &mut IoData) {
        for cap in &self.capabilities {
            let cap_offset = cap_offset_of(cap, &self.capabilities);
            if offset >= cap_offset && (offset as usize) + data.len() <= (cap_offset + CAP_ENTRY_SIZE) as usize {
                let bytes = cap.as_bytes();
                let start = (offset - cap_offset) as usize;
                for i in 0..data.len() {
                    data.set(i, bytes[start + i]);
                }
                return;
            }
        }
    }

    fn configuration_out(&mut self, _offset: u8, _data: &IoData) {
        // Capability descriptors are read-only discovery data; writes are a no-op.
    }
}

fn cap_offset_of(cap: &VirtioPciCap, capabilities: &[VirtioPciCap; 3]) -> u8 {
    let index = capabilities
        .iter()
        .position(|c| std::ptr::eq(c, cap))
        .unwrap_or(0);
    CAPABILITIES_POINTER + (index as u8) * CAP_ENTRY_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advertises_modern_virtio_net_identity() {
        let dev = VirtioNet::new();
        let vendor_id = dev.configuration.vendor_id;
        let device_id = dev.configuration.device_id;
        let command = dev.configuration.command;
        let status = dev.configuration.status;
        assert_eq!(vendor_id, VENDOR_ID);
        assert_eq!(device_id, DEVICE_ID);
        assert_eq!(command, COMMAND_ENABLE_IO_SPACE);
        assert_eq!(status, STATUS_CAPABILITIES_LIST);
    }

    #[test]
    fn bar0_points_at_io_space_window() {
        let dev = VirtioNet::new();
        let bar = dev.configuration.bar;
        assert_eq!(bar[0], io_bar(BAR0_PORT));
        assert_eq!(dev.io_range(), (0x1000, 0x1100));
    }

    #[test]
    fn capability_chain_terminates_at_isr() {
        let dev = VirtioNet::new();
        assert_eq!(dev.capabilities[0].cfg_type, CFG_TYPE_COMMON);
        assert_eq!(dev.capabilities[1].cfg_type, CFG_TYPE_NOTIFY);
        assert_eq!(dev.capabilities[2].cfg_type, CFG_TYPE_ISR);
        assert_eq!(dev.capabilities[2].cap_next, 0);
        assert_eq!(dev.capabilities[0].cap_next, CAPABILITIES_POINTER + CAP_ENTRY_SIZE);
    }

    #[test]
    fn reads_common_config_through_bar0() {
        let mut dev = VirtioNet::new();
        let mut data = IoData::new(2);
        dev.io_in(BAR0_PORT as u16 + 18, &mut data); // num_queues offset
        assert_eq!(data.as_slice(), &[1, 0]);
    }

    #[test]
    fn reads_outside_common_config_window_are_a_noop() {
        let mut dev = VirtioNet::new();
        let mut data = IoData::new(1);
        data.set(0, 0xaa);
        dev.io_in(BAR0_PORT as u16 + 200, &mut data);
        assert_eq!(data.as_slice(), &[0xaa]);
    }

    #[test]
    fn configuration_in_returns_capability_descriptor_bytes() {
        let mut dev = VirtioNet::new();
        let mut data = IoData::new(1);
        dev.configuration_in(CAPABILITIES_POINTER, &mut data);
        assert_eq!(data.as_slice(), &[CAP_VNDR_VENDOR_SPECIFIC]);
    }
}
