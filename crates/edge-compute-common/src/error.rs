//! Error types for edge-compute.
//!
//! This module defines a hierarchy of error types using `thiserror`:
//! - [`RuntimeError`]: Process-level errors (configuration, dispatch, I/O)
//! - [`HostError`]: A host call failed with a [`HostErrorCode`]
//! - [`SendError`]: An outbound send failed, with a [`SendErrorDetail`]
//! - [`ScriptError`]: Errors visible to guest code, carrying a stable [`ReasonCode`]

use std::fmt;
use std::io;

use thiserror::Error;

/// Top-level runtime errors.
///
/// These represent failures of the process serving exchanges, as opposed
/// to [`ScriptError`]s, which are delivered to guest code.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// Invalid configuration was provided.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        /// Description of the configuration error.
        reason: String,
    },

    /// A host call failed outside of any guest-visible operation.
    #[error("Host call failed: {0}")]
    Host(#[from] HostError),

    /// The exchange could not be dispatched.
    #[error("Dispatch failed: {reason}")]
    Dispatch {
        /// Description of the dispatch failure.
        reason: String,
    },

    /// A guest error escaped to the process level.
    #[error("Script error: {0}")]
    Script(#[from] ScriptError),

    /// The requested backend is not registered.
    #[error("Backend not found: {name}")]
    BackendNotFound {
        /// Name of the backend.
        name: String,
    },

    /// The requested service is not registered.
    #[error("Service not found: {service_id}")]
    ServiceNotFound {
        /// Identifier of the service.
        service_id: String,
    },

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl RuntimeError {
    /// Create a new `InvalidConfig` error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Create a new `Dispatch` error.
    pub fn dispatch(reason: impl Into<String>) -> Self {
        Self::Dispatch {
            reason: reason.into(),
        }
    }

    /// Create a new `BackendNotFound` error.
    pub fn backend_not_found(name: impl Into<String>) -> Self {
        Self::BackendNotFound { name: name.into() }
    }

    /// Create a new `ServiceNotFound` error.
    pub fn service_not_found(service_id: impl Into<String>) -> Self {
        Self::ServiceNotFound {
            service_id: service_id.into(),
        }
    }

    /// Returns `true` if this error indicates a missing backend or service.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::BackendNotFound { .. } | Self::ServiceNotFound { .. }
        )
    }
}

/// Status codes returned by host calls.
///
/// The numeric values are part of the host-call ABI and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum HostErrorCode {
    Unknown = 0,
    Generic = 1,
    InvalidArgument = 2,
    BadHandle = 3,
    BufferLength = 4,
    Unsupported = 5,
    BadAlignment = 6,
    HttpInvalid = 7,
    HttpUser = 8,
    HttpIncomplete = 9,
    OptionalNone = 10,
    HttpHeadTooLarge = 11,
    HttpInvalidStatus = 12,
    LimitExceeded = 13,
}

impl HostErrorCode {
    /// Map a raw ABI status to a code. Unrecognized values map to `Unknown`.
    pub const fn from_raw(raw: u32) -> Self {
        match raw {
            1 => Self::Generic,
            2 => Self::InvalidArgument,
            3 => Self::BadHandle,
            4 => Self::BufferLength,
            5 => Self::Unsupported,
            6 => Self::BadAlignment,
            7 => Self::HttpInvalid,
            8 => Self::HttpUser,
            9 => Self::HttpIncomplete,
            10 => Self::OptionalNone,
            11 => Self::HttpHeadTooLarge,
            12 => Self::HttpInvalidStatus,
            13 => Self::LimitExceeded,
            _ => Self::Unknown,
        }
    }

    /// Raw ABI value of this code.
    pub const fn as_raw(self) -> u32 {
        self as u32
    }

    /// Human-readable description reported to guest code.
    pub const fn description(self) -> &'static str {
        match self {
            Self::Unknown => "Unknown error value. It should be an error to get this value.",
            Self::Generic => {
                "Generic error value. This means that some unexpected error occurred during a hostcall."
            }
            Self::InvalidArgument => "Invalid argument.",
            Self::BadHandle => {
                "Invalid handle. Thrown when a request, response, cache entry, or body handle is not valid."
            }
            Self::BufferLength => "Buffer length error. Buffer is too long.",
            Self::Unsupported => {
                "Unsupported operation error. This error is thrown when some operation cannot be performed, because it is not supported."
            }
            Self::BadAlignment => {
                "Alignment error. This is thrown when a pointer does not point to a properly aligned slice of memory."
            }
            Self::HttpInvalid => {
                "HTTP parse error. This can be thrown when a method, URI, header, or status is not valid."
            }
            Self::HttpUser => {
                "HTTP user error. This is thrown in cases where user code caused an HTTP error."
            }
            Self::HttpIncomplete => "HTTP incomplete message error. A stream ended unexpectedly.",
            Self::OptionalNone => {
                "A `None` error. This status code is used to indicate when an optional value did not exist, as opposed to an empty value."
            }
            Self::HttpHeadTooLarge => {
                "HTTP head too large error. This error will be thrown when the message head is too large."
            }
            Self::HttpInvalidStatus => {
                "HTTP invalid status error. This error will be thrown when the HTTP message contains an invalid status code."
            }
            Self::LimitExceeded => {
                "Limit exceeded error. This error will be thrown when an attempt to allocate a resource has exceeded the maximum number of resources permitted."
            }
        }
    }
}

/// A failed host call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{operation}: {}", .code.description())]
pub struct HostError {
    /// Name of the host call that failed.
    pub operation: &'static str,
    /// Status returned by the host.
    pub code: HostErrorCode,
}

impl HostError {
    pub const fn new(operation: &'static str, code: HostErrorCode) -> Self {
        Self { operation, code }
    }

    pub const fn generic(operation: &'static str) -> Self {
        Self::new(operation, HostErrorCode::Generic)
    }

    pub const fn invalid_argument(operation: &'static str) -> Self {
        Self::new(operation, HostErrorCode::InvalidArgument)
    }

    pub const fn bad_handle(operation: &'static str) -> Self {
        Self::new(operation, HostErrorCode::BadHandle)
    }

    pub const fn unsupported(operation: &'static str) -> Self {
        Self::new(operation, HostErrorCode::Unsupported)
    }

    pub const fn optional_none(operation: &'static str) -> Self {
        Self::new(operation, HostErrorCode::OptionalNone)
    }

    pub const fn limit_exceeded(operation: &'static str) -> Self {
        Self::new(operation, HostErrorCode::LimitExceeded)
    }

    pub fn is_generic(&self) -> bool {
        self.code == HostErrorCode::Generic
    }

    pub fn is_invalid_argument(&self) -> bool {
        self.code == HostErrorCode::InvalidArgument
    }

    pub fn is_bad_handle(&self) -> bool {
        self.code == HostErrorCode::BadHandle
    }

    pub fn is_optional_none(&self) -> bool {
        self.code == HostErrorCode::OptionalNone
    }

    pub fn is_limit_exceeded(&self) -> bool {
        self.code == HostErrorCode::LimitExceeded
    }
}

/// Why an outbound send failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SendErrorDetail {
    /// The detail was never populated by the host.
    Uninitialized,
    DnsTimeout,
    DnsError,
    DestinationNotFound,
    DestinationUnavailable,
    DestinationIpUnroutable,
    ConnectionRefused,
    ConnectionTerminated,
    ConnectionTimeout,
    ConnectionLimitReached,
    TlsCertificateError,
    TlsConfigurationError,
    HttpIncompleteResponse,
    HttpResponseHeaderSectionTooLarge,
    HttpResponseBodyTooLarge,
    HttpResponseTimeout,
    HttpResponseStatusInvalid,
    HttpUpgradeFailed,
    HttpProtocolError,
    HttpRequestCacheKeyInvalid,
    HttpRequestUriInvalid,
    InternalError,
    TlsAlertReceived,
    TlsProtocolError,
}

impl SendErrorDetail {
    /// Message delivered to guest code.
    pub const fn message(self) -> &'static str {
        match self {
            Self::Uninitialized | Self::InternalError => {
                "NetworkError when attempting to fetch resource."
            }
            Self::DnsTimeout => "DNS timeout",
            Self::DnsError => "DNS error",
            Self::DestinationNotFound => "Destination not found",
            Self::DestinationUnavailable => "Destination unavailable",
            Self::DestinationIpUnroutable => "Destination IP unroutable",
            Self::ConnectionRefused => "Connection refused",
            Self::ConnectionTerminated => "Connection terminated",
            Self::ConnectionTimeout => "Connection timeout",
            Self::ConnectionLimitReached => "Connection limit reached",
            Self::TlsCertificateError => "TLS certificate error",
            Self::TlsConfigurationError => "TLS configuration error",
            Self::HttpIncompleteResponse => "Incomplete HTTP response",
            Self::HttpResponseHeaderSectionTooLarge => "HTTP response header section too large",
            Self::HttpResponseBodyTooLarge => "HTTP response body too large",
            Self::HttpResponseTimeout => "HTTP response timeout",
            Self::HttpResponseStatusInvalid => "HTTP response status invalid",
            Self::HttpUpgradeFailed => "HTTP upgrade failed",
            Self::HttpProtocolError => "HTTP protocol error",
            Self::HttpRequestCacheKeyInvalid => "HTTP request cache key invalid",
            Self::HttpRequestUriInvalid => "HTTP request URI invalid",
            Self::TlsAlertReceived => "TLS alert received",
            Self::TlsProtocolError => "TLS protocol error",
        }
    }
}

/// An outbound send failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    /// The host rejected the call itself.
    #[error(transparent)]
    Host(#[from] HostError),

    /// The backend could not be reached or answered badly.
    #[error("{}", .0.message())]
    Network(SendErrorDetail),
}

/// Stable reason codes carried by host-originated [`ScriptError`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReasonCode {
    Unknown,
    GenericError,
    InvalidArgument,
    BadHandle,
    BufferLength,
    Unsupported,
    BadAlignment,
    HttpInvalid,
    HttpUser,
    HttpIncomplete,
    OptionalNone,
    HttpHeadTooLarge,
    HttpInvalidStatus,
    LimitExceeded,
    BackendDoesNotExist,
    NetworkError,
}

impl ReasonCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "Unknown",
            Self::GenericError => "GenericError",
            Self::InvalidArgument => "InvalidArgument",
            Self::BadHandle => "BadHandle",
            Self::BufferLength => "BufferLength",
            Self::Unsupported => "Unsupported",
            Self::BadAlignment => "BadAlignment",
            Self::HttpInvalid => "HttpInvalid",
            Self::HttpUser => "HttpUser",
            Self::HttpIncomplete => "HttpIncomplete",
            Self::OptionalNone => "OptionalNone",
            Self::HttpHeadTooLarge => "HttpHeadTooLarge",
            Self::HttpInvalidStatus => "HttpInvalidStatus",
            Self::LimitExceeded => "LimitExceeded",
            Self::BackendDoesNotExist => "BackendDoesNotExist",
            Self::NetworkError => "NetworkError",
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<HostErrorCode> for ReasonCode {
    fn from(code: HostErrorCode) -> Self {
        match code {
            HostErrorCode::Unknown => Self::Unknown,
            HostErrorCode::Generic => Self::GenericError,
            HostErrorCode::InvalidArgument => Self::InvalidArgument,
            HostErrorCode::BadHandle => Self::BadHandle,
            HostErrorCode::BufferLength => Self::BufferLength,
            HostErrorCode::Unsupported => Self::Unsupported,
            HostErrorCode::BadAlignment => Self::BadAlignment,
            HostErrorCode::HttpInvalid => Self::HttpInvalid,
            HostErrorCode::HttpUser => Self::HttpUser,
            HostErrorCode::HttpIncomplete => Self::HttpIncomplete,
            HostErrorCode::OptionalNone => Self::OptionalNone,
            HostErrorCode::HttpHeadTooLarge => Self::HttpHeadTooLarge,
            HostErrorCode::HttpInvalidStatus => Self::HttpInvalidStatus,
            HostErrorCode::LimitExceeded => Self::LimitExceeded,
        }
    }
}

/// An error delivered to guest code, either thrown synchronously or as the
/// rejection value of a promise.
///
/// Cloneable so a stream-protocol error can be delivered to both ends of a
/// pipeline.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScriptError {
    /// Misuse of an API: reuse of a consumed body, respond called twice,
    /// malformed options.
    #[error("TypeError: {0}")]
    Type(String),

    /// A numeric argument was out of range.
    #[error("RangeError: {0}")]
    Range(String),

    /// A host call failed.
    #[error("{reason}: {message}")]
    Host {
        /// Stable code identifying the failure.
        reason: ReasonCode,
        /// Descriptive message.
        message: String,
    },

    /// A value raised by guest code itself.
    #[error("{0}")]
    Thrown(String),
}

impl ScriptError {
    pub fn type_error(message: impl Into<String>) -> Self {
        Self::Type(message.into())
    }

    pub fn range_error(message: impl Into<String>) -> Self {
        Self::Range(message.into())
    }

    pub fn host(reason: ReasonCode, message: impl Into<String>) -> Self {
        Self::Host {
            reason,
            message: message.into(),
        }
    }

    pub fn thrown(message: impl Into<String>) -> Self {
        Self::Thrown(message.into())
    }

    /// Error for a request aimed at a backend that is not registered.
    pub fn backend_does_not_exist(name: &str) -> Self {
        Self::host(
            ReasonCode::BackendDoesNotExist,
            format!("Requested backend named '{name}' does not exist"),
        )
    }

    /// The reason code, for host-originated errors.
    pub fn reason(&self) -> Option<ReasonCode> {
        match self {
            Self::Host { reason, .. } => Some(*reason),
            _ => None,
        }
    }

    /// The message without its kind prefix.
    pub fn message(&self) -> &str {
        match self {
            Self::Type(message) | Self::Range(message) | Self::Thrown(message) => message,
            Self::Host { message, .. } => message,
        }
    }

    pub fn is_type_error(&self) -> bool {
        matches!(self, Self::Type(_))
    }
}

impl From<HostError> for ScriptError {
    fn from(err: HostError) -> Self {
        Self::host(err.code.into(), err.to_string())
    }
}

impl From<SendError> for ScriptError {
    fn from(err: SendError) -> Self {
        match err {
            SendError::Host(host) => host.into(),
            SendError::Network(detail) => Self::host(ReasonCode::NetworkError, detail.message()),
        }
    }
}
