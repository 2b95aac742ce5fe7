#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// A bounded wait expired with no response from the modem.
    Timeout,
    /// No baud rate answered the `AT` probe within the detection window.
    BaudDetection,
    /// The serial driver reported a write or configuration failure.
    Serial,
    /// The modem answered `ERROR`, or `+CME ERROR` with the given code.
    Command(i32),
    /// Malformed URL or URI handed to an endpoint.
    InvalidUrl,
    /// Caller-side precondition violation (unknown method, oversized payload).
    InvalidArgument,
    /// Operation requires a live connection.
    NotConnected,
    /// The modem-side slot reported a failure URC.
    ConnectionFailed,
    /// Line or frame could not be parsed.
    Parse,
    /// The receive path overflowed and the slot is no longer trustworthy.
    Overflow,
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::Timeout => write!(f, "timed out waiting for the modem"),
            Error::BaudDetection => write!(f, "baud rate detection failed"),
            Error::Serial => write!(f, "serial driver error"),
            Error::Command(0) => write!(f, "modem returned ERROR"),
            Error::Command(cme) => write!(f, "modem returned +CME ERROR: {}", cme),
            Error::InvalidUrl => write!(f, "invalid URL"),
            Error::InvalidArgument => write!(f, "invalid argument"),
            Error::NotConnected => write!(f, "not connected"),
            Error::ConnectionFailed => write!(f, "connection failed"),
            Error::Parse => write!(f, "parse error"),
            Error::Overflow => write!(f, "receive overflow"),
        }
    }
}

impl std::error::Error for Error {}
