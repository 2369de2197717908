use log::debug;
use nusb::MaybeFuture;

use crate::backend::{Backend, NusbBackend, Opener};
use crate::device::{OpenOptions, UsbDevice};
use crate::error::{Error, ErrorKind, Result};
use crate::platforms::{platform_for_usb_ids, Platform};

/// Predicate over a device's USB identity.
///
/// An unset field matches anything; a set `product_id` requires
/// `vendor_id` to be set as well. Serial-number matching is
/// case-insensitive.
#[derive(Debug, Default, Clone)]
pub struct DeviceFilter {
    vendor_id: Option<u16>,
    product_id: Option<u16>,
    serial_number: Option<String>,
}

impl DeviceFilter {
    /// A filter matching every device.
    pub fn new() -> DeviceFilter {
        DeviceFilter::default()
    }

    /// Match only this vendor id.
    pub fn vendor_id(mut self, vendor_id: u16) -> DeviceFilter {
        self.vendor_id = Some(vendor_id);
        self
    }

    /// Match only this product id. Requires [`vendor_id`]
    /// [`DeviceFilter::vendor_id`] to be set as well.
    pub fn product_id(mut self, product_id: u16) -> DeviceFilter {
        self.product_id = Some(product_id);
        self
    }

    /// Match only this serial number (case-insensitive).
    pub fn serial_number(mut self, serial_number: impl Into<String>) -> DeviceFilter {
        self.serial_number = Some(serial_number.into());
        self
    }

    fn validate(&self) -> Result<()> {
        if self.product_id.is_some() && self.vendor_id.is_none() {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                "a product id filter requires a vendor id",
            )
            .log_warn());
        }
        Ok(())
    }

    fn matches(&self, vendor_id: u16, product_id: u16, serial_number: Option<&str>) -> bool {
        if self.vendor_id.is_some_and(|v| v != vendor_id) {
            return false;
        }
        if self.product_id.is_some_and(|p| p != product_id) {
            return false;
        }
        if let Some(want) = &self.serial_number {
            let Some(serial) = serial_number else {
                return false;
            };
            if !serial.eq_ignore_ascii_case(want) {
                return false;
            }
        }
        true
    }
}

/// Options for [`list_devices`][crate::list_devices].
#[derive(Debug, Default, Clone)]
pub struct ListOptions {
    platforms: Vec<&'static Platform>,
    include_dfu: bool,
    filters: Vec<DeviceFilter>,
}

impl ListOptions {
    /// List every known platform, excluding DFU-mode devices.
    pub fn new() -> ListOptions {
        ListOptions::default()
    }

    /// Restrict the listing to `platform`; may be repeated.
    pub fn platform(mut self, platform: &'static Platform) -> ListOptions {
        self.platforms.push(platform);
        self
    }

    /// Also list devices that enumerated in DFU mode.
    pub fn include_dfu(mut self) -> ListOptions {
        self.include_dfu = true;
        self
    }

    /// Add a [`DeviceFilter`]; a device is listed if it matches at least
    /// one of the added filters.
    pub fn filter(mut self, filter: DeviceFilter) -> ListOptions {
        self.filters.push(filter);
        self
    }
}

/// List attached Particle devices matching `options`.
///
/// The returned sessions are not yet open. When a filter specifies a
/// serial number that the OS has not cached, the device is opened just
/// long enough to read it and closed again.
pub fn list_devices(options: ListOptions) -> Result<Vec<UsbDevice>> {
    for filter in &options.filters {
        filter.validate()?;
    }
    let infos = nusb::list_devices().wait().map_err(|e| {
        Error::with_source(ErrorKind::Usb, "unable to enumerate USB devices", e).log_error()
    })?;

    let mut devices = Vec::new();
    for info in infos {
        let vendor_id = info.vendor_id();
        let product_id = info.product_id();
        let Some((platform, dfu_mode)) = platform_for_usb_ids(vendor_id, product_id) else {
            continue;
        };
        if dfu_mode && !options.include_dfu {
            continue;
        }
        if !options.platforms.is_empty() && !options.platforms.iter().any(|p| p.id() == platform.id())
        {
            continue;
        }
        let mut serial_number = info.serial_number().map(str::to_owned);
        if !matches_filters(&options.filters, &info, &mut serial_number) {
            continue;
        }
        debug!(
            "found {} ({:04x}:{:04x}, dfu: {dfu_mode})",
            platform.name(),
            vendor_id,
            product_id
        );
        let opener: Opener =
            Box::new(move || Ok(Box::new(NusbBackend::open(&info)?) as Box<dyn Backend>));
        devices.push(UsbDevice::new(
            platform,
            dfu_mode,
            vendor_id,
            product_id,
            serial_number,
            opener,
        ));
    }
    Ok(devices)
}

/// Find the device with serial number `id`, open it and return it.
pub fn open_device_by_id(id: &str, options: OpenOptions) -> Result<UsbDevice> {
    let devices = list_devices(
        ListOptions::new()
            .include_dfu()
            .filter(DeviceFilter::new().serial_number(id)),
    )?;
    let Some(device) = devices.into_iter().next() else {
        return Err(Error::new(ErrorKind::NotFound, format!("device {id} not found")).log_warn());
    };
    device.open(options)?;
    Ok(device)
}

fn matches_filters(
    filters: &[DeviceFilter],
    info: &nusb::DeviceInfo,
    serial_number: &mut Option<String>,
) -> bool {
    if filters.is_empty() {
        return true;
    }
    let vendor_id = info.vendor_id();
    let product_id = info.product_id();
    // Serial filtering may require opening the device; read the serial
    // once and close again, never leaving the device open as a side
    // effect.
    if serial_number.is_none() && filters.iter().any(|f| f.serial_number.is_some()) {
        *serial_number = read_serial_number(info);
    }
    filters
        .iter()
        .any(|f| f.matches(vendor_id, product_id, serial_number.as_deref()))
}

fn read_serial_number(info: &nusb::DeviceInfo) -> Option<String> {
    let mut backend = NusbBackend::open(info).ok()?;
    let serial = backend.serial_number().map(str::to_owned);
    backend.close();
    serial
}
