//! Device emulation for the VMM: the PIO registry and the legacy/PCI
//! devices behind it (spec.md §4.3–§4.7).

pub mod nmi;
pub mod pci;
pub mod pio;
pub mod ps2;
pub mod serial;

pub use nmi::NmiAck;
pub use pci::{HostBridge, PciBus, PciDevice, VirtioNet};
pub use pio::{PioBus, PioDevice};
pub use ps2::Ps2Controller;
pub use serial::Serial;

/// COM1 I/O port range, half-open `[start, end)` (spec.md §4.1 step 11).
pub const SERIAL_COM1_BASE: u16 = serial::COM1_BASE;
pub const SERIAL_COM1_END: u16 = serial::COM1_BASE + 8;

/// PS/2 controller I/O port range, inclusive (spec.md §4.1 step 11).
pub const PS2_PORT_START: u16 = ps2::PS2_PORT_DATA;
pub const PS2_PORT_END: u16 = ps2::PS2_PORT_STATUS_CMD;
