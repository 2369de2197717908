use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::debug;
use protobuf::Message;

use crate::backend::{Opener, Pipe, Quirks, SharedPipe};
use crate::config;
use crate::error::{result_code, Error, ErrorKind, Result};
use crate::platforms::{Capability, Platform};
use crate::protocol::{SetupPacket, Status};
use crate::scheduler::{default_check_interval, CheckInterval, Reply, Scheduler};

/// Well-known vendor request types understood by Device OS.
///
/// Feature façades layer their own request vocabularies on top; these are
/// the device-control types shared by every platform.
pub mod request_type {
    #![allow(missing_docs)]

    pub const GET_DEVICE_ID: u16 = 20;
    pub const GET_SERIAL_NUMBER: u16 = 21;
    pub const GET_SYSTEM_VERSION: u16 = 30;
    pub const RESET: u16 = 40;
    pub const FACTORY_RESET: u16 = 41;
    pub const ENTER_DFU_MODE: u16 = 50;
    pub const ENTER_SAFE_MODE: u16 = 60;
    pub const START_LISTENING: u16 = 70;
    pub const STOP_LISTENING: u16 = 71;
    pub const MODULE_INFO: u16 = 90;
    pub const SET_CLAIM_CODE: u16 = 200;
    pub const IS_CLAIMED: u16 = 201;
}

/// Options for [`UsbDevice::open`].
#[derive(Default)]
pub struct OpenOptions {
    concurrency_limit: Option<usize>,
    check_interval: Option<CheckInterval>,
    quirks: Quirks,
}

impl OpenOptions {
    /// Options with no concurrency limit, the default polling backoff and
    /// no quirks.
    pub fn new() -> OpenOptions {
        OpenOptions::default()
    }

    /// Maximum number of logical requests in progress at once; further
    /// requests wait in the admission queue. Unbounded when unset.
    pub fn concurrency_limit(mut self, limit: usize) -> OpenOptions {
        self.concurrency_limit = Some(limit);
        self
    }

    /// Replace the CHECK polling backoff: the delay before poll number
    /// `attempt` (1-based).
    pub fn check_interval(
        mut self,
        interval: impl Fn(u32) -> Duration + Send + Sync + 'static,
    ) -> OpenOptions {
        self.check_interval = Some(Arc::new(interval));
        self
    }

    /// Compatibility quirks to apply to this device.
    pub fn quirks(mut self, quirks: Quirks) -> OpenOptions {
        self.quirks = quirks;
        self
    }
}

/// Options for [`UsbDevice::close`].
#[derive(Debug, Clone, Copy)]
pub struct CloseOptions {
    wait_for_pending: bool,
    timeout: Option<Duration>,
}

impl Default for CloseOptions {
    fn default() -> CloseOptions {
        CloseOptions {
            wait_for_pending: true,
            timeout: None,
        }
    }
}

impl CloseOptions {
    /// Wait for in-flight requests to finish before closing (the
    /// default), with no time bound.
    pub fn new() -> CloseOptions {
        CloseOptions::default()
    }

    /// Cancel in-flight requests instead of waiting for them.
    pub fn cancel_pending(mut self) -> CloseOptions {
        self.wait_for_pending = false;
        self
    }

    /// Bound the wait for in-flight requests; whatever is still pending
    /// when `timeout` elapses is cancelled and `close` reports
    /// [`ErrorKind::Timeout`].
    pub fn timeout(mut self, timeout: Duration) -> CloseOptions {
        self.timeout = Some(timeout);
        self
    }
}

/// Options for a single request.
#[derive(Debug, Default, Clone, Copy)]
pub struct RequestOptions {
    timeout: Option<Duration>,
}

impl RequestOptions {
    /// Options using the process-wide default timeout.
    pub fn new() -> RequestOptions {
        RequestOptions::default()
    }

    /// Deadline for this request, overriding
    /// [`config::request_timeout`][crate::config::request_timeout].
    pub fn timeout(mut self, timeout: Duration) -> RequestOptions {
        self.timeout = Some(timeout);
        self
    }
}

struct Session {
    pipe: SharedPipe,
    scheduler: Arc<Scheduler>,
}

/// A Particle device attached over USB.
///
/// Obtained from [`list_devices`][crate::list_devices] (not yet opened) or
/// [`open_device_by_id`][crate::open_device_by_id]. A `UsbDevice` can be
/// shared between threads; any number of logical requests may be in flight
/// concurrently, serialized internally onto the device's control pipe.
///
/// ### Example
///
/// ```no_run
/// use particle_usb::{list_devices, ListOptions, OpenOptions, RequestOptions};
///
/// # fn main() -> Result<(), particle_usb::Error> {
/// let device = list_devices(ListOptions::new())?
///     .into_iter()
///     .next()
///     .expect("no devices attached");
/// device.open(OpenOptions::new())?;
/// let reply = device.send_raw_request(
///     particle_usb::request_type::GET_SYSTEM_VERSION,
///     &[],
///     RequestOptions::new(),
/// )?;
/// println!("system version: {}", String::from_utf8_lossy(&reply.payload));
/// device.close(Default::default())?;
/// # Ok(())
/// # }
/// ```
pub struct UsbDevice {
    platform: &'static Platform,
    dfu_mode: bool,
    vendor_id: u16,
    product_id: u16,
    serial_number: Mutex<Option<String>>,
    opener: Opener,
    session: Mutex<Option<Session>>,
}

impl UsbDevice {
    pub(crate) fn new(
        platform: &'static Platform,
        dfu_mode: bool,
        vendor_id: u16,
        product_id: u16,
        serial_number: Option<String>,
        opener: Opener,
    ) -> UsbDevice {
        UsbDevice {
            platform,
            dfu_mode,
            vendor_id,
            product_id,
            serial_number: Mutex::new(serial_number),
            opener,
            session: Mutex::new(None),
        }
    }

    /// The device's platform.
    pub fn platform(&self) -> &'static Platform {
        self.platform
    }

    /// Whether the device enumerated in DFU mode. Service-protocol
    /// requests are unavailable in DFU mode.
    pub fn is_in_dfu_mode(&self) -> bool {
        self.dfu_mode
    }

    /// USB vendor id the device enumerated with.
    pub fn vendor_id(&self) -> u16 {
        self.vendor_id
    }

    /// USB product id the device enumerated with.
    pub fn product_id(&self) -> u16 {
        self.product_id
    }

    /// Serial number (the device id), if known. Known for certain once the
    /// device has been opened.
    pub fn serial_number(&self) -> Option<String> {
        self.serial_number.lock().unwrap().clone()
    }

    /// Whether the session is open and the device still present.
    pub fn is_open(&self) -> bool {
        match &*self.session.lock().unwrap() {
            Some(session) => !session.scheduler.is_dead(),
            None => false,
        }
    }

    /// Verify that the device can perform capability-specific operations.
    ///
    /// Fails with [`ErrorKind::State`] in DFU mode or when the platform's
    /// hardware lacks `capability`.
    pub fn check_capability(&self, capability: Capability) -> Result<()> {
        if self.dfu_mode {
            return Err(Error::new(
                ErrorKind::State,
                "feature is not available in DFU mode",
            ));
        }
        if !self.platform.has_capability(capability) {
            return Err(Error::new(
                ErrorKind::State,
                format!(
                    "{} hardware does not support {capability:?}",
                    self.platform.name()
                ),
            ));
        }
        Ok(())
    }

    /// Open the device.
    ///
    /// Acquires the USB handle, reads and caches the serial number, and
    /// starts the request scheduler. Fails with [`ErrorKind::State`] if the
    /// session is already open and [`ErrorKind::NotAllowed`] on a
    /// permission error.
    pub fn open(&self, options: OpenOptions) -> Result<()> {
        let mut session = self.session.lock().unwrap();
        if session.is_some() {
            return Err(Error::new(ErrorKind::State, "device is already open").log_warn());
        }
        let backend = (self.opener)()?;
        if let Some(serial) = backend.serial_number() {
            *self.serial_number.lock().unwrap() = Some(serial.to_owned());
        }
        let pipe: SharedPipe = Arc::new(Mutex::new(Pipe::new(backend, options.quirks)));
        let check_interval = options
            .check_interval
            .unwrap_or_else(|| Arc::new(default_check_interval));
        let scheduler = Arc::new(Scheduler::new(
            pipe.clone(),
            options.concurrency_limit,
            check_interval,
        ));
        *session = Some(Session { pipe, scheduler });
        Ok(())
    }

    /// Close the device.
    ///
    /// By default waits for in-flight requests to finish, then aborts
    /// everything still outstanding on the device (RESET with id 0) and
    /// releases the USB handle. Requests still pending when the
    /// [`CloseOptions`] wait ends are cancelled. Idempotent; new requests
    /// racing with `close` fail with [`ErrorKind::Cancelled`] or
    /// [`ErrorKind::State`].
    pub fn close(&self, options: CloseOptions) -> Result<()> {
        // Taking the session marks the device closed for every subsequent
        // operation; teardown then proceeds without the lock.
        let Some(session) = self.session.lock().unwrap().take() else {
            return Ok(());
        };
        let mut timed_out = false;
        if options.wait_for_pending {
            timed_out = !session.scheduler.wait_idle(options.timeout);
        }
        session.scheduler.shutdown();
        session.pipe.lock().unwrap().close();
        debug!("device session closed");
        if timed_out {
            return Err(Error::new(
                ErrorKind::Timeout,
                "pending requests did not finish before the close timeout",
            )
            .log_warn());
        }
        Ok(())
    }

    /// Cancel every queued and in-flight request.
    ///
    /// Their callers fail with [`ErrorKind::Cancelled`]. The session stays
    /// open. No-op on a closed session.
    pub fn cancel_all_requests(&self) {
        let scheduler = {
            let session = self.session.lock().unwrap();
            session.as_ref().map(|s| s.scheduler.clone())
        };
        if let Some(scheduler) = scheduler {
            scheduler.cancel_all();
        }
    }

    /// Send a protobuf request and decode the protobuf reply.
    ///
    /// `message` is encoded as the outbound payload (`None` sends an empty
    /// payload). A non-OK terminal status or a non-zero result code fails
    /// with [`ErrorKind::Request`]; use
    /// [`send_raw_request`][`UsbDevice::send_raw_request`] for probes that
    /// treat those as normal outcomes. An empty reply payload decodes to a
    /// default-initialized `R`.
    pub fn send_request<M: Message, R: Message>(
        &self,
        request_type: u16,
        message: Option<&M>,
        options: RequestOptions,
    ) -> Result<R> {
        let payload = match message {
            Some(message) => message.write_to_bytes().map_err(|e| {
                Error::with_source(ErrorKind::Internal, "failed to encode request message", e)
                    .log_error()
            })?,
            None => Vec::new(),
        };
        let reply = self.submit_and_wait(request_type, payload, options.timeout)?;
        let code = reply_result_code(&reply);
        if code != result_code::OK {
            return Err(Error::from_result_code(code).log_warn());
        }
        R::parse_from_bytes(&reply.payload).map_err(|e| {
            Error::with_source(ErrorKind::Protocol, "failed to decode reply message", e)
                .log_warn()
        })
    }

    /// Send a request with a raw payload and return the raw reply record.
    ///
    /// Unlike [`send_request`][`UsbDevice::send_request`] this does not
    /// inspect the terminal status or result code: a reply with e.g. a
    /// `NOT_FOUND` status is returned as-is.
    pub fn send_raw_request(
        &self,
        request_type: u16,
        payload: &[u8],
        options: RequestOptions,
    ) -> Result<Reply> {
        self.submit_and_wait(request_type, payload.to_vec(), options.timeout)
    }

    /// Run `f` against a scope whose requests and delays all share one
    /// deadline.
    ///
    /// The scope's operations fail with [`ErrorKind::Timeout`] once the
    /// deadline fires, aborting the closure at its next suspension point.
    pub fn with_timeout<T>(
        &self,
        timeout: Duration,
        f: impl FnOnce(&TimeoutScope<'_>) -> Result<T>,
    ) -> Result<T> {
        let scope = TimeoutScope {
            device: self,
            deadline: Instant::now() + timeout,
        };
        f(&scope)
    }

    /// Vendor control IN transfer, bypassing the service layer.
    ///
    /// Serialized on the same pipe as service requests. Used by
    /// collaborators that talk to fixed vendor endpoints directly (e.g.
    /// the forceful cloud-disconnect shortcut).
    pub fn transfer_in(&self, setup: SetupPacket) -> Result<Vec<u8>> {
        let pipe = self.checked_pipe()?;
        let mut pipe = pipe.lock().unwrap();
        pipe.transfer_in(setup)
    }

    /// Vendor control OUT transfer, bypassing the service layer.
    pub fn transfer_out(&self, setup: SetupPacket, data: &[u8]) -> Result<()> {
        let pipe = self.checked_pipe()?;
        let mut pipe = pipe.lock().unwrap();
        pipe.transfer_out(setup, data)
    }

    fn checked_pipe(&self) -> Result<SharedPipe> {
        let session = self.session.lock().unwrap();
        match session.as_ref() {
            Some(session) => Ok(session.pipe.clone()),
            None => Err(Error::new(ErrorKind::State, "device is not open").log_warn()),
        }
    }

    fn submit_and_wait(
        &self,
        request_type: u16,
        payload: Vec<u8>,
        timeout: Option<Duration>,
    ) -> Result<Reply> {
        if self.dfu_mode {
            return Err(Error::new(
                ErrorKind::State,
                "requests are not available in DFU mode",
            )
            .log_warn());
        }
        if payload.len() > u16::MAX as usize {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                format!("request payload of {} bytes is too large", payload.len()),
            )
            .log_warn());
        }
        let scheduler = {
            let session = self.session.lock().unwrap();
            match session.as_ref() {
                Some(session) => session.scheduler.clone(),
                None => return Err(Error::new(ErrorKind::State, "device is not open").log_warn()),
            }
        };
        if scheduler.is_dead() {
            // The scheduler lost the device; finish closing on its behalf.
            self.close_defunct();
            return Err(Error::new(ErrorKind::State, "device is no longer available").log_warn());
        }
        let deadline = Instant::now() + timeout.unwrap_or_else(config::request_timeout);
        let completion = scheduler.submit(request_type, payload, deadline);
        completion.wait(deadline)
    }

    fn close_defunct(&self) {
        if let Some(session) = self.session.lock().unwrap().take() {
            session.scheduler.shutdown();
            session.pipe.lock().unwrap().close();
        }
    }
}

impl Drop for UsbDevice {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.session.lock() {
            if let Some(session) = guard.take() {
                session.scheduler.shutdown();
                session.pipe.lock().unwrap().close();
            }
        }
    }
}

impl std::fmt::Debug for UsbDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsbDevice")
            .field("platform", &self.platform.name())
            .field("dfu_mode", &self.dfu_mode)
            .field("vendor_id", &format_args!("0x{:04X}", self.vendor_id))
            .field("product_id", &format_args!("0x{:04X}", self.product_id))
            .field("serial_number", &self.serial_number())
            .field("open", &self.is_open())
            .finish()
    }
}

/// Map a terminal reply to the firmware result code the caller should see.
///
/// An explicit non-zero result code wins; absent one, a non-OK status maps
/// to its firmware code equivalent.
fn reply_result_code(reply: &Reply) -> i32 {
    match reply.result {
        Some(code) if code != 0 => code,
        _ => match reply.status {
            Status::Ok => result_code::OK,
            Status::Busy => result_code::BUSY,
            Status::NoMemory => result_code::NO_MEMORY,
            Status::NotFound => result_code::NOT_FOUND,
            // The scheduler never surfaces PENDING as terminal.
            Status::Error | Status::Pending => result_code::ERROR,
        },
    }
}

/// Borrow of an open session plus a deadline, handed to
/// [`UsbDevice::with_timeout`] closures.
pub struct TimeoutScope<'a> {
    device: &'a UsbDevice,
    deadline: Instant,
}

impl TimeoutScope<'_> {
    fn remaining(&self) -> Result<Duration> {
        let now = Instant::now();
        if now >= self.deadline {
            return Err(Error::new(ErrorKind::Timeout, "operation timed out"));
        }
        Ok(self.deadline - now)
    }

    /// As [`UsbDevice::send_request`], bounded by the scope deadline.
    pub fn send_request<M: Message, R: Message>(
        &self,
        request_type: u16,
        message: Option<&M>,
    ) -> Result<R> {
        let timeout = self.remaining()?;
        self.device
            .send_request(request_type, message, RequestOptions::new().timeout(timeout))
    }

    /// As [`UsbDevice::send_raw_request`], bounded by the scope deadline.
    pub fn send_raw_request(&self, request_type: u16, payload: &[u8]) -> Result<Reply> {
        let timeout = self.remaining()?;
        self.device
            .send_raw_request(request_type, payload, RequestOptions::new().timeout(timeout))
    }

    /// Sleep for `duration`, clipped to the scope deadline; fails with
    /// [`ErrorKind::Timeout`] if the deadline fires first.
    pub fn delay(&self, duration: Duration) -> Result<()> {
        let remaining = self.remaining()?;
        std::thread::sleep(duration.min(remaining));
        if duration >= remaining {
            return Err(Error::new(ErrorKind::Timeout, "operation timed out"));
        }
        Ok(())
    }
}
