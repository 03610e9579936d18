//! Raw-mode host TTY pump feeding bytes into the emulated UART (spec.md §4.8).
//!
//! Opens `/dev/tty`, puts it into raw(-ish) mode, and runs a background
//! thread that reads host keystrokes and hands them to
//! [`Serial::input`](crate::devices::Serial). Ctrl-C/Ctrl-Z are left
//! enabled (`ISIG` is not cleared) so the VMM process itself can still be
//! killed from the controlling terminal.
//!
//! Termios restoration runs on [`TtyPump::stop`], not just on `Drop`: the
//! background thread needs an explicit signal to stop polling before the
//! original settings are reapplied, so the orchestrator calls `stop`
//! directly on clean shutdown (HLT/SHUTDOWN) rather than relying on an
//! abandoned, detached thread.

use std::fs::{File, OpenOptions};
use std::os::fd::AsFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use nix::sys::termios::{self, InputFlags, LocalFlags, SetArg, Termios};
use thiserror::Error;

use crate::devices::Serial;

#[derive(Error, Debug)]
pub enum TtyError {
    #[error("failed to open /dev/tty: {0}")]
    Open(#[source] std::io::Error),

    #[error("failed to read termios state: {0}")]
    GetAttr(#[source] nix::Error),

    #[error("failed to apply termios state: {0}")]
    SetAttr(#[source] nix::Error),
}

const READ_CHUNK: usize = 256;
const RETRY_DELAY: Duration = Duration::from_millis(1);
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Owns the open `/dev/tty` handle and the background reader thread. Restores
/// the original termios state when stopped.
pub struct TtyPump {
    shutdown: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    tty: File,
    original: Termios,
}

impl TtyPump {
    /// Opens `/dev/tty`, switches it into raw input mode, and spawns the
    /// background reader thread feeding `uart`.
    pub fn start(uart: Serial) -> Result<Self, TtyError> {
        let tty = OpenOptions::new()
            .read(true)
            .write(false)
            .open("/dev/tty")
            .map_err(TtyError::Open)?;

        let original = termios::tcgetattr(tty.as_fd()).map_err(TtyError::GetAttr)?;
        let mut raw = original.clone();

        raw.local_flags
            .remove(LocalFlags::ECHO | LocalFlags::ICANON | LocalFlags::IEXTEN);
        raw.input_flags.remove(
            InputFlags::IXON | InputFlags::ICRNL | InputFlags::BRKINT | InputFlags::INPCK | InputFlags::ISTRIP,
        );
        raw.control_flags.remove(termios::ControlFlags::CSIZE);
        raw.control_flags.insert(termios::ControlFlags::CS8);
        raw.control_chars[termios::SpecialCharacterIndices::VMIN as usize] = 0;
        raw.control_chars[termios::SpecialCharacterIndices::VTIME as usize] = 0;

        termios::tcsetattr(tty.as_fd(), SetArg::TCSANOW, &raw).map_err(TtyError::SetAttr)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let reader_fd = tty.try_clone().map_err(TtyError::Open)?;
        let worker_shutdown = Arc::clone(&shutdown);
        let worker = std::thread::spawn(move || pump_loop(reader_fd, uart, worker_shutdown));

        Ok(Self {
            shutdown,
            worker: Some(worker),
            tty,
            original,
        })
    }

    /// Signals the background thread to stop, joins it, and restores the
    /// original termios state. Safe to call more than once.
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        let _ = termios::tcsetattr(self.tty.as_fd(), SetArg::TCSANOW, &self.original);
    }
}

impl Drop for TtyPump {
    fn drop(&mut self) {
        self.stop();
    }
}

fn pump_loop(mut tty: File, uart: Serial, shutdown: Arc<AtomicBool>) {
    use std::io::Read;

    let mut buf = [0u8; READ_CHUNK];
    while !shutdown.load(Ordering::Relaxed) {
        match tty.read(&mut buf) {
            Ok(0) => std::thread::sleep(POLL_INTERVAL),
            Ok(n) => {
                for &byte in &buf[..n] {
                    while uart.input(byte) == 0 {
                        if shutdown.load(Ordering::Relaxed) {
                            return;
                        }
                        std::thread::sleep(RETRY_DELAY);
                    }
                }
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(POLL_INTERVAL);
            }
            Err(_) => std::thread::sleep(POLL_INTERVAL),
        }
    }
}
