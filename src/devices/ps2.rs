//! i8042 PS/2 controller stub (spec.md §4.5).
//!
//! Linux probes the keyboard controller during boot even when no keyboard is
//! attached. This emulates just enough of the i8042 to satisfy that probe:
//! status byte reads, the "read configuration byte" / "write configuration
//! byte" commands (0x20/0x60), and a data port that always reads back
//! whatever was last written to it. No actual key events are ever produced.
//!
//! Reference: <https://wiki.osdev.org/%228042%22_PS/2_Controller>

use crate::devices::pio::PioDevice;
use crate::kvm::IoData;

/// Status/command port.
pub const PS2_PORT_STATUS_CMD: u16 = 0x64;

/// Data port.
pub const PS2_PORT_DATA: u16 = 0x60;

/// Status register bit: output buffer full (data port holds unread data).
/// This is the status register's only set bit by default.
const STATUS_OUTPUT_FULL: u8 = 0x01;

/// Configuration byte bit: system flag (POST passed). Set by default.
const CONFIG_SYSTEM_FLAG: u8 = 1 << 2;

const CMD_READ_CONFIG_BYTE: u8 = 0x20;
const CMD_WRITE_CONFIG_BYTE: u8 = 0x60;

/// Minimal i8042 controller: tracks the configuration byte and a one-byte
/// data register, nothing else.
pub struct Ps2Controller {
    config: u8,
    data: u8,
    pending_write_to_config: bool,
}

impl Ps2Controller {
    pub fn new() -> Self {
        Self {
            config: CONFIG_SYSTEM_FLAG,
            data: 0,
            pending_write_to_config: false,
        }
    }

    pub fn read(&mut self, port: u16) -> u8 {
        match port {
            PS2_PORT_DATA => self.data,
            PS2_PORT_STATUS_CMD => STATUS_OUTPUT_FULL,
            _ => 0,
        }
    }

    pub fn write(&mut self, port: u16, value: u8) {
        match port {
            PS2_PORT_STATUS_CMD => match value {
                CMD_READ_CONFIG_BYTE => self.data = self.config,
                CMD_WRITE_CONFIG_BYTE => self.pending_write_to_config = true,
                // Every other command (self-test, port enable/disable,
                // keyboard reset, ...) is a no-op: there is no real keyboard
                // behind this controller.
                _ => {}
            },
            PS2_PORT_DATA => {
                if self.pending_write_to_config {
                    self.config = value;
                    self.pending_write_to_config = false;
                } else {
                    self.data = value;
                }
            }
            _ => {}
        }
    }
}

impl Default for Ps2Controller {
    fn default() -> Self {
        Self::new()
    }
}

impl PioDevice for Ps2Controller {
    fn pio_in(&mut self, port: u16, data: &mut IoData) {
        data.set(0, self.read(port));
    }

    fn pio_out(&mut self, port: u16, data: &IoData) {
        if let Some(&value) = data.as_slice().first() {
            self.write(port, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_config_byte_command_stages_config_into_data_port() {
        let mut ps2 = Ps2Controller::new();
        ps2.config = 0x41;
        ps2.write(PS2_PORT_STATUS_CMD, CMD_READ_CONFIG_BYTE);
        assert_eq!(ps2.read(PS2_PORT_DATA), 0x41);
    }

    #[test]
    fn write_config_byte_command_routes_next_data_write_to_config() {
        let mut ps2 = Ps2Controller::new();
        ps2.write(PS2_PORT_STATUS_CMD, CMD_WRITE_CONFIG_BYTE);
        ps2.write(PS2_PORT_DATA, 0x65);
        assert_eq!(ps2.config, 0x65);
    }

    #[test]
    fn unknown_commands_are_a_noop() {
        let mut ps2 = Ps2Controller::new();
        let before = ps2.config;
        ps2.write(PS2_PORT_STATUS_CMD, 0xff);
        assert_eq!(ps2.config, before);
    }

    #[test]
    fn status_defaults_to_output_full_only() {
        let mut ps2 = Ps2Controller::new();
        assert_eq!(ps2.read(PS2_PORT_STATUS_CMD), STATUS_OUTPUT_FULL);
    }

    #[test]
    fn config_byte_defaults_to_system_flag_set() {
        let mut ps2 = Ps2Controller::new();
        ps2.write(PS2_PORT_STATUS_CMD, CMD_READ_CONFIG_BYTE);
        assert_eq!(ps2.read(PS2_PORT_DATA) & CONFIG_SYSTEM_FLAG, CONFIG_SYSTEM_FLAG);
    }
}
