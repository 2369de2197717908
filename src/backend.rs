//! Blocking USB transfer backend.
//!
//! A [`Backend`] performs one vendor control transfer per call. The real
//! implementation drives a [`nusb::Device`]; tests substitute a scripted
//! simulator. Serialization of transfers (the pipe mutex) is the caller's
//! concern, not the backend's.

use std::time::Duration;

use log::debug;
use nusb::descriptors::language_id::US_ENGLISH;
use nusb::transfer::{ControlIn, ControlOut, ControlType, Recipient};
use nusb::MaybeFuture;

use crate::error::{Error, ErrorKind, Result};
use crate::protocol::SetupPacket;

/// OS-level timeout per control transfer, a safety net below the logical
/// request timeout.
pub(crate) const TRANSFER_TIMEOUT: Duration = Duration::from_secs(5);

/// A device handle capable of single blocking control transfers.
pub(crate) trait Backend: Send {
    /// Vendor control IN transfer; returns up to `setup.length` bytes.
    fn transfer_in(&mut self, setup: SetupPacket) -> Result<Vec<u8>>;

    /// Vendor control OUT transfer carrying `data` in the data stage.
    fn transfer_out(&mut self, setup: SetupPacket, data: &[u8]) -> Result<()>;

    /// Serial number read when the device was opened.
    fn serial_number(&self) -> Option<&str>;

    /// Release the handle. Idempotent; transfers after close fail with
    /// [`ErrorKind::State`].
    fn close(&mut self);
}

/// Creates the backend when a session opens.
pub(crate) type Opener = Box<dyn Fn() -> Result<Box<dyn Backend>> + Send + Sync>;

/// Per-device compatibility flags that alter transport behavior.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Quirks {
    /// The device cannot handle an OUT transfer with an empty data stage;
    /// send a single zero byte instead.
    pub control_out_transfers_require_data_stage: bool,
}

/// The control pipe of an open session.
///
/// The pipe permits one transfer at a time; all users go through the
/// surrounding mutex and hold it only for the duration of a single
/// transfer, never across a sleep.
pub(crate) struct Pipe {
    backend: Box<dyn Backend>,
    quirks: Quirks,
}

pub(crate) type SharedPipe = std::sync::Arc<std::sync::Mutex<Pipe>>;

impl Pipe {
    pub(crate) fn new(backend: Box<dyn Backend>, quirks: Quirks) -> Pipe {
        Pipe { backend, quirks }
    }

    pub(crate) fn transfer_in(&mut self, setup: SetupPacket) -> Result<Vec<u8>> {
        log::trace!("IN  {:02x?}", setup.to_bytes());
        self.backend.transfer_in(setup)
    }

    pub(crate) fn transfer_out(&mut self, setup: SetupPacket, data: &[u8]) -> Result<()> {
        log::trace!("OUT {:02x?}, {} data bytes", setup.to_bytes(), data.len());
        if data.is_empty() && self.quirks.control_out_transfers_require_data_stage {
            return self.backend.transfer_out(setup, &[0]);
        }
        self.backend.transfer_out(setup, data)
    }

    pub(crate) fn close(&mut self) {
        self.backend.close();
    }
}

/// [`Backend`] over a [`nusb::Device`].
///
/// ### Platform-specific notes
/// * Transfers go to the default control endpoint of the device as a whole,
///   which WinUSB does not support; this backend is for Linux, macOS and
///   Android.
pub(crate) struct NusbBackend {
    device: Option<nusb::Device>,
    serial_number: Option<String>,
}

impl NusbBackend {
    /// Open `info` and cache its serial number.
    pub(crate) fn open(info: &nusb::DeviceInfo) -> Result<NusbBackend> {
        let device = info.open().wait().map_err(|e| {
            let kind = if e.kind() == nusb::ErrorKind::PermissionDenied {
                ErrorKind::NotAllowed
            } else {
                ErrorKind::Usb
            };
            Error::with_source(kind, "unable to open USB device", e).log_error()
        })?;

        // The OS usually caches iSerialNumber; fall back to reading the
        // string descriptor from the device.
        let serial_number = match info.serial_number() {
            Some(s) => Some(s.to_owned()),
            None => read_serial_number(&device),
        };

        debug!(
            "opened device {:04x}:{:04x}, serial {:?}",
            info.vendor_id(),
            info.product_id(),
            serial_number
        );

        Ok(NusbBackend {
            device: Some(device),
            serial_number,
        })
    }

    fn device(&self) -> Result<&nusb::Device> {
        self.device
            .as_ref()
            .ok_or_else(|| Error::new(ErrorKind::State, "device is closed"))
    }
}

impl Backend for NusbBackend {
    fn transfer_in(&mut self, setup: SetupPacket) -> Result<Vec<u8>> {
        let device = self.device()?;
        let (control_type, recipient) = split_request_type(setup.request_type)?;
        device
            .control_in(
                ControlIn {
                    control_type,
                    recipient,
                    request: setup.request,
                    value: setup.value,
                    index: setup.index,
                    length: setup.length,
                },
                TRANSFER_TIMEOUT,
            )
            .wait()
            .map_err(|e| Error::with_source(ErrorKind::Usb, "IN control transfer failed", e))
    }

    fn transfer_out(&mut self, setup: SetupPacket, data: &[u8]) -> Result<()> {
        let device = self.device()?;
        let (control_type, recipient) = split_request_type(setup.request_type)?;
        device
            .control_out(
                ControlOut {
                    control_type,
                    recipient,
                    request: setup.request,
                    value: setup.value,
                    index: setup.index,
                    data,
                },
                TRANSFER_TIMEOUT,
            )
            .wait()
            .map_err(|e| Error::with_source(ErrorKind::Usb, "OUT control transfer failed", e))
    }

    fn serial_number(&self) -> Option<&str> {
        self.serial_number.as_deref()
    }

    fn close(&mut self) {
        self.device = None;
    }
}

fn read_serial_number(device: &nusb::Device) -> Option<String> {
    let index = device.device_descriptor().serial_number_string_index()?;
    device
        .get_string_descriptor(index, US_ENGLISH, TRANSFER_TIMEOUT)
        .wait()
        .ok()
}

/// Decompose `bmRequestType` into nusb's control type and recipient.
fn split_request_type(request_type: u8) -> Result<(ControlType, Recipient)> {
    let control_type = match (request_type >> 5) & 0x03 {
        0 => ControlType::Standard,
        1 => ControlType::Class,
        2 => ControlType::Vendor,
        _ => {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                format!("reserved control type in bmRequestType 0x{request_type:02x}"),
            ))
        }
    };
    let recipient = match request_type & 0x1f {
        0 => Recipient::Device,
        1 => Recipient::Interface,
        2 => Recipient::Endpoint,
        3 => Recipient::Other,
        _ => {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                format!("reserved recipient in bmRequestType 0x{request_type:02x}"),
            ))
        }
    };
    Ok((control_type, recipient))
}
