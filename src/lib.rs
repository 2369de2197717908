#![warn(missing_docs)]
//! Control Particle IoT devices over their vendor USB protocol.
//!
//! Particle devices running Device OS expose a control interface on the
//! default USB endpoint: typed, length-prefixed request/reply exchanges
//! (typically carrying Protobuf messages) plus low-level device-control
//! operations. This crate implements the host side of that protocol.
//!
//! ## Usage overview
//!
//! [`list_devices`] enumerates attached devices, recognized by the
//! Particle vendor id and the per-platform product ids from
//! [`platforms`]; the listing can be narrowed by platform, serial number
//! or raw USB ids. Enumeration returns unopened [`UsbDevice`] sessions;
//! call [`UsbDevice::open`] before use, or use [`open_device_by_id`] to
//! find and open a device by its id in one step.
//!
//! An open session accepts any number of concurrent logical requests
//! (bounded by an optional concurrency limit) from any thread. Internally
//! each request is an INIT / CHECK / SEND / RECV exchange of vendor
//! control transfers, multiplexed onto the device's one-transfer-at-a-time
//! control pipe and polled with a configurable backoff; see
//! [`protocol`] for the wire format. Requests carry a deadline
//! (process-wide default in [`config`]) and closing the session cancels
//! everything still in flight.
//!
//! ```no_run
//! use particle_usb::{open_device_by_id, OpenOptions, RequestOptions};
//! use std::time::Duration;
//!
//! # fn main() -> Result<(), particle_usb::Error> {
//! let device = open_device_by_id("e00fce68aabbccddeeff0011", OpenOptions::new())?;
//! let reply = device.send_raw_request(
//!     particle_usb::request_type::GET_SYSTEM_VERSION,
//!     &[],
//!     RequestOptions::new().timeout(Duration::from_secs(5)),
//! )?;
//! println!("Device OS version: {}", String::from_utf8_lossy(&reply.payload));
//! device.close(Default::default())?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Logging
//!
//! `particle-usb` uses the [`log`](https://docs.rs/log) crate. Failure
//! paths log at `warn` or `error`; wire activity is traced at `trace`.
//! Use a `log` backend like [`env_logger`](https://docs.rs/env_logger)
//! and enable output for this crate (for `env_logger`, set
//! `RUST_LOG=particle_usb=debug`).
//!
//! ## Platform support
//!
//! USB access is provided by [`nusb`](https://docs.rs/nusb) on the
//! default control endpoint of the device as a whole, which is supported
//! on Linux, macOS and Android.

mod backend;
pub mod config;
mod device;
mod enumeration;
mod error;
pub mod platforms;
pub mod protocol;
mod scheduler;

#[cfg(test)]
mod testing;

pub use backend::Quirks;
pub use device::{
    request_type, CloseOptions, OpenOptions, RequestOptions, TimeoutScope, UsbDevice,
};
pub use enumeration::{list_devices, open_device_by_id, DeviceFilter, ListOptions};
pub use error::{result_code, result_code_message, Error, ErrorKind, Result};
pub use protocol::Status;
pub use scheduler::{default_check_interval, Reply};
