//! Serial link to the dongle.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use nix::sys::termios::{self, BaudRate, SetArg, SpecialCharacterIndices};
use tracing::{debug, trace, warn};

use super::packet::FrameAssembler;
use crate::error::BackendError;

/// USB ids of the BlueGiga BLED112.
pub const BLED112_VENDOR_ID: &str = "2458";
pub const BLED112_PRODUCT_ID: &str = "0001";

/// Frame oriented transport to a BGAPI device.
pub trait DongleLink: Send {
    fn send(&mut self, frame: &[u8]) -> Result<(), BackendError>;

    /// Next complete frame, or `None` once `timeout` passes without one.
    fn receive(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, BackendError>;
}

/// First `ttyACM*` device whose USB ids match the BLED112, looked up under
/// `sysfs_root` (normally `/sys`).
pub fn detect_dongle(sysfs_root: &Path) -> Option<PathBuf> {
    let entries = fs::read_dir(sysfs_root.join("class/tty")).ok()?;
    let mut candidates: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| name.starts_with("ttyACM"))
        .collect();
    candidates.sort();

    candidates.into_iter().find_map(|name| {
        let usb = sysfs_root.join("class/tty").join(&name).join("device/..");
        let id = |file: &str| fs::read_to_string(usb.join(file)).map(|s| s.trim().to_lowercase());
        match (id("idVendor"), id("idProduct")) {
            (Ok(vendor), Ok(product))
                if vendor == BLED112_VENDOR_ID && product == BLED112_PRODUCT_ID =>
            {
                debug!(tty = %name, "found BLED112");
                Some(PathBuf::from("/dev").join(name))
            }
            _ => None,
        }
    })
}

/// The dongle's CDC ACM tty in raw mode, read by a background thread.
pub struct TtyLink {
    port: File,
    frames: Receiver<Vec<u8>>,
    stop: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
}

impl TtyLink {
    pub fn open(path: &Path) -> Result<Self, BackendError> {
        let port = OpenOptions::new().read(true).write(true).open(path).map_err(|e| {
            BackendError::AdapterUnavailable(format!("cannot open {}: {}", path.display(), e))
        })?;
        configure_raw(&port)
            .map_err(|e| BackendError::wrap(format!("configuring {}", path.display()), e))?;

        let input = port.try_clone()?;
        let stop = Arc::new(AtomicBool::new(false));
        let (tx, frames) = mpsc::channel();
        let reader = {
            let stop = stop.clone();
            thread::Builder::new()
                .name("bgapi-reader".to_string())
                .spawn(move || read_frames(input, tx, stop))?
        };
        debug!(path = %path.display(), "opened BGAPI link");

        Ok(Self {
            port,
            frames,
            stop,
            reader: Some(reader),
        })
    }
}

impl DongleLink for TtyLink {
    fn send(&mut self, frame: &[u8]) -> Result<(), BackendError> {
        trace!(frame = ?frame, "bgapi send");
        self.port
            .write_all(frame)
            .and_then(|_| self.port.flush())
            .map_err(|e| BackendError::wrap("writing to dongle", e))
    }

    fn receive(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, BackendError> {
        match self.frames.recv_timeout(timeout) {
            Ok(frame) => Ok(Some(frame)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                Err(BackendError::failure("dongle reader stopped"))
            }
        }
    }
}

impl Drop for TtyLink {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }
}

fn configure_raw(port: &File) -> nix::Result<()> {
    let mut attrs = termios::tcgetattr(port)?;
    termios::cfmakeraw(&mut attrs);
    termios::cfsetspeed(&mut attrs, BaudRate::B115200)?;
    // reads return after 100ms without data so the reader can notice `stop`
    attrs.control_chars[SpecialCharacterIndices::VMIN as usize] = 0;
    attrs.control_chars[SpecialCharacterIndices::VTIME as usize] = 1;
    termios::tcsetattr(port, SetArg::TCSANOW, &attrs)
}

fn read_frames(mut input: File, tx: mpsc::Sender<Vec<u8>>, stop: Arc<AtomicBool>) {
    let mut assembler = FrameAssembler::new();
    let mut buf = [0u8; 256];
    while !stop.load(Ordering::Relaxed) {
        match input.read(&mut buf) {
            Ok(0) => continue,
            Ok(n) => {
                assembler.push(&buf[..n]);
                while let Some(frame) = assembler.next_frame() {
                    trace!(frame = ?frame, "bgapi receive");
                    if tx.send(frame).is_err() {
                        return;
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!(error = %e, "dongle read failed");
                return;
            }
        }
    }
}
