use std::error;
use std::fmt;

/// Coarse classification of everything that can go wrong, independent
/// of which backend produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// The operation requires an open connection or port and there is none.
    NotConnected,
    /// A parameter was rejected before touching the transport.
    InvalidArgument,
    /// The requested endpoint does not (or no longer does) exist.
    AddressNotAvailable,
    /// The requested endpoint or socket address is already taken.
    AddressInUse,
    /// The transport reported a read/write failure.
    Io,
    /// Malformed MIDI or packet data was encountered.
    BadMessage,
    /// A message exceeds what the transport or protocol can carry.
    MessageSize,
    /// The backend exists but does not implement this operation.
    OperationNotSupported,
    /// An allocation inside the driver failed.
    NotEnoughMemory,
    /// The function is not available on this platform at all.
    FunctionNotSupported,
}

impl ErrorCategory {
    fn description(self) -> &'static str {
        match self {
            ErrorCategory::NotConnected => "not connected",
            ErrorCategory::InvalidArgument => "invalid argument",
            ErrorCategory::AddressNotAvailable => "address not available",
            ErrorCategory::AddressInUse => "address in use",
            ErrorCategory::Io => "input/output error",
            ErrorCategory::BadMessage => "bad message",
            ErrorCategory::MessageSize => "message size",
            ErrorCategory::OperationNotSupported => "operation not supported",
            ErrorCategory::NotEnoughMemory => "not enough memory",
            ErrorCategory::FunctionNotSupported => "function not supported",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.description().fmt(f)
    }
}

/// Which native error namespace a preserved code belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorDomain {
    /// No native code; the category is all there is.
    Generic,
    /// POSIX errno.
    Errno,
    /// ALSA return codes (negated errno values).
    Alsa,
    /// JACK status flags.
    Jack,
    /// CoreMIDI OSStatus.
    CoreMidi,
    /// Windows multimedia MMRESULT.
    WinMm,
    /// Browser-side Web MIDI failures.
    WebMidi,
    /// Network transport codes.
    Net,
}

/// An error value carrying the generic category, the backend's native
/// code and a short static description of the failing operation.
///
/// Callers can match on [`Error::category`] for portable handling, or
/// inspect [`Error::code`]/[`Error::domain`] when they care about the
/// exact driver-level cause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Error {
    category: ErrorCategory,
    code: i32,
    domain: ErrorDomain,
    context: &'static str,
}

impl Error {
    pub fn new(category: ErrorCategory, context: &'static str) -> Error {
        Error { category, code: 0, domain: ErrorDomain::Generic, context }
    }

    pub fn with_code(
        category: ErrorCategory,
        domain: ErrorDomain,
        code: i32,
        context: &'static str,
    ) -> Error {
        Error { category, code, domain, context }
    }

    pub fn not_connected(context: &'static str) -> Error {
        Error::new(ErrorCategory::NotConnected, context)
    }

    pub fn invalid_argument(context: &'static str) -> Error {
        Error::new(ErrorCategory::InvalidArgument, context)
    }

    pub fn address_not_available(context: &'static str) -> Error {
        Error::new(ErrorCategory::AddressNotAvailable, context)
    }

    pub fn address_in_use(context: &'static str) -> Error {
        Error::new(ErrorCategory::AddressInUse, context)
    }

    pub fn io(context: &'static str) -> Error {
        Error::new(ErrorCategory::Io, context)
    }

    pub fn bad_message(context: &'static str) -> Error {
        Error::new(ErrorCategory::BadMessage, context)
    }

    pub fn message_size(context: &'static str) -> Error {
        Error::new(ErrorCategory::MessageSize, context)
    }

    pub fn operation_not_supported(context: &'static str) -> Error {
        Error::new(ErrorCategory::OperationNotSupported, context)
    }

    /// Maps an errno value (positive or negated) to a categorized error.
    pub fn from_errno(errno: i32, context: &'static str) -> Error {
        let code = errno.abs();
        let category = match code {
            2 /* ENOENT */ | 6 /* ENXIO */ | 19 /* ENODEV */ => ErrorCategory::AddressNotAvailable,
            16 /* EBUSY */ | 98 /* EADDRINUSE */ => ErrorCategory::AddressInUse,
            12 /* ENOMEM */ => ErrorCategory::NotEnoughMemory,
            22 /* EINVAL */ => ErrorCategory::InvalidArgument,
            _ => ErrorCategory::Io,
        };
        Error { category, code: errno, domain: ErrorDomain::Errno, context }
    }

    pub fn category(&self) -> ErrorCategory {
        self.category
    }

    /// The preserved native code, or 0 when [`ErrorDomain::Generic`].
    pub fn code(&self) -> i32 {
        self.code
    }

    pub fn domain(&self) -> ErrorDomain {
        self.domain
    }

    pub(crate) fn in_domain(mut self, domain: ErrorDomain) -> Error {
        self.domain = domain;
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.domain == ErrorDomain::Generic {
            write!(f, "{}: {}", self.context, self.category)
        } else {
            write!(
                f,
                "{}: {} ({:?} code {})",
                self.context, self.category, self.domain, self.code
            )
        }
    }
}

impl error::Error for Error {}

#[cfg(target_os = "linux")]
impl From<alsa::Error> for Error {
    fn from(e: alsa::Error) -> Error {
        Error::from_errno(e.errno(), "alsa").in_domain(ErrorDomain::Alsa)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_keeps_native_code() {
        let e = Error::from_errno(-19, "open rawmidi device");
        assert_eq!(e.category(), ErrorCategory::AddressNotAvailable);
        assert_eq!(e.code(), -19);
        assert_eq!(e.domain(), ErrorDomain::Errno);
    }

    #[test]
    fn display_mentions_context_and_category() {
        let e = Error::message_size("send datagram");
        let s = e.to_string();
        assert!(s.contains("send datagram"));
        assert!(s.contains("message size"));
    }
}
