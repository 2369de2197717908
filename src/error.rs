use std::fmt::Display;

/// Error returned from `particle-usb` operations.
///
/// Carries a category ([`ErrorKind`]), a human-readable message, and
/// optionally the underlying error that caused it.
#[derive(Debug)]
pub struct Error {
    pub(crate) kind: ErrorKind,
    pub(crate) message: String,
    pub(crate) source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub(crate) fn with_source(
        kind: ErrorKind,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Error for a completed request whose result code indicates failure.
    ///
    /// The message is derived from the firmware's `system_error_t` table.
    pub(crate) fn from_result_code(code: i32) -> Self {
        Self::new(
            ErrorKind::Request { code },
            format!("request failed: {} ({})", result_code_message(code), code),
        )
    }

    #[track_caller]
    pub(crate) fn log_error(self) -> Self {
        log::error!("{}", self);
        self
    }

    #[track_caller]
    pub(crate) fn log_warn(self) -> Self {
        log::warn!("{}", self);
        self
    }

    /// Get the error kind.
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    /// Firmware result code, if this error came from a completed request.
    pub fn result_code(&self) -> Option<i32> {
        match self.kind {
            ErrorKind::Request { code } => Some(code),
            _ => None,
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(source) = &self.source {
            write!(f, ": {}", source)?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|s| s as &(dyn std::error::Error + 'static))
    }
}

/// General category of error as part of an [`Error`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// An underlying USB transfer failed.
    Usb,

    /// Permission denied opening the device.
    NotAllowed,

    /// Service reply was malformed or missing a required field.
    Protocol,

    /// Device could not allocate memory for the request.
    Memory,

    /// Per-request deadline or session-close timeout elapsed.
    Timeout,

    /// Request was cancelled, normally because the session was closed.
    Cancelled,

    /// Operation performed in the wrong lifecycle state, e.g. on a closed
    /// session or a feature unavailable in DFU mode.
    State,

    /// Enumeration or a subsidiary lookup returned nothing.
    NotFound,

    /// An argument failed validation before reaching the device.
    InvalidArgument,

    /// The request completed but its result code indicates failure.
    Request {
        /// Firmware result code (one of the `result_code` constants).
        code: i32,
    },

    /// Internal assertion failure.
    Internal,
}

/// A `Result` with this crate's [`Error`] type.
pub type Result<T> = std::result::Result<T, Error>;

/// Result codes reported by device firmware (`system_error_t`).
///
/// `OK` is zero; all failure codes are negative.
pub mod result_code {
    #![allow(missing_docs)]

    pub const OK: i32 = 0;
    pub const ERROR: i32 = -100;
    pub const BUSY: i32 = -110;
    pub const NOT_SUPPORTED: i32 = -120;
    pub const NOT_ALLOWED: i32 = -130;
    pub const CANCELLED: i32 = -140;
    pub const ABORTED: i32 = -150;
    pub const TIMEOUT: i32 = -160;
    pub const NOT_FOUND: i32 = -170;
    pub const ALREADY_EXISTS: i32 = -180;
    pub const TOO_LARGE: i32 = -190;
    pub const LIMIT_EXCEEDED: i32 = -200;
    pub const INVALID_STATE: i32 = -210;
    pub const IO: i32 = -220;
    pub const NETWORK: i32 = -230;
    pub const PROTOCOL: i32 = -240;
    pub const INTERNAL: i32 = -250;
    pub const NO_MEMORY: i32 = -260;
    pub const INVALID_ARGUMENT: i32 = -270;
    pub const BAD_DATA: i32 = -280;
    pub const OUT_OF_RANGE: i32 = -290;
}

/// Human-readable message for a firmware result code.
pub fn result_code_message(code: i32) -> &'static str {
    use result_code::*;
    match code {
        OK => "operation succeeded",
        ERROR => "unknown error",
        BUSY => "resource busy",
        NOT_SUPPORTED => "not supported",
        NOT_ALLOWED => "not allowed",
        CANCELLED => "operation cancelled",
        ABORTED => "operation aborted",
        TIMEOUT => "timeout error",
        NOT_FOUND => "not found",
        ALREADY_EXISTS => "already exists",
        TOO_LARGE => "data too large",
        LIMIT_EXCEEDED => "limit exceeded",
        INVALID_STATE => "invalid state",
        IO => "input/output error",
        NETWORK => "network error",
        PROTOCOL => "protocol error",
        INTERNAL => "internal error",
        NO_MEMORY => "memory allocation error",
        INVALID_ARGUMENT => "invalid argument",
        BAD_DATA => "invalid data format",
        OUT_OF_RANGE => "value out of range",
        _ => "unknown error code",
    }
}
