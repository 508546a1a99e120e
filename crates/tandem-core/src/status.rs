//! Status model attached to every terminal call outcome.
//!
//! Numeric code values follow the standard gRPC table so that status frames
//! stay readable to anyone who knows that table.

use std::fmt;

/// Canonical status codes.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Code {
    /// The call completed successfully.
    Ok = 0,
    /// The caller cancelled the call before a terminal value was produced.
    Cancelled = 1,
    /// Uncategorized failure.
    Unknown = 2,
    /// The caller supplied input that violates a documented precondition.
    InvalidArgument = 3,
    /// The call's deadline elapsed before a terminal value was produced.
    DeadlineExceeded = 4,
    /// The named method or entity does not exist.
    NotFound = 5,
    /// Unexpected peer behavior or an internal invariant broke.
    Internal = 13,
    /// The connection is gone or cannot carry the call.
    Unavailable = 14,
}

impl Code {
    /// Convert from a u32 wire value.
    ///
    /// Values outside the known set map to `Unknown` rather than failing, so a
    /// newer peer can never make a call look successful.
    pub fn from_u32(val: u32) -> Self {
        match val {
            0 => Code::Ok,
            1 => Code::Cancelled,
            2 => Code::Unknown,
            3 => Code::InvalidArgument,
            4 => Code::DeadlineExceeded,
            5 => Code::NotFound,
            13 => Code::Internal,
            14 => Code::Unavailable,
            _ => Code::Unknown,
        }
    }

    /// Convert to u32 for wire transmission.
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Code::Ok => "OK",
            Code::Cancelled => "CANCELLED",
            Code::Unknown => "UNKNOWN",
            Code::InvalidArgument => "INVALID_ARGUMENT",
            Code::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Code::NotFound => "NOT_FOUND",
            Code::Internal => "INTERNAL",
            Code::Unavailable => "UNAVAILABLE",
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A status code plus a human-readable message.
///
/// Immutable once built. `Code::Ok` is the only success code.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Status {
    code: Code,
    message: String,
}

impl Status {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn ok() -> Self {
        Self::new(Code::Ok, "")
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(Code::Cancelled, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(Code::Unknown, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(Code::InvalidArgument, message)
    }

    pub fn deadline_exceeded(message: impl Into<String>) -> Self {
        Self::new(Code::DeadlineExceeded, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(Code::NotFound, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Code::Internal, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(Code::Unavailable, message)
    }

    pub fn code(&self) -> Code {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_ok(&self) -> bool {
        self.code == Code::Ok
    }

    /// Encode as `code: u32 LE | len: u32 LE | message bytes`.
    ///
    /// A message too long for the u32 prefix is cut at a char boundary.
    pub fn to_bytes(&self) -> Vec<u8> {
        let message = clamp_to_char_boundary(&self.message, MAX_WIRE_MESSAGE_LEN).as_bytes();
        let len = u32::try_from(message.len()).unwrap_or(u32::MAX);
        let mut bytes = Vec::with_capacity(8 + message.len());
        bytes.extend_from_slice(&self.code.as_u32().to_le_bytes());
        bytes.extend_from_slice(&len.to_le_bytes());
        bytes.extend_from_slice(&message[..len as usize]);
        bytes
    }

    /// Decode a status payload produced by [`Status::to_bytes`].
    ///
    /// A malformed payload is itself a peer failure, so it decodes to an
    /// `Internal` status instead of an error the caller might drop.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        if bytes.len() < 8 {
            return Status::internal(format!(
                "status payload too short: {} bytes",
                bytes.len()
            ));
        }
        let code = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let len = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
        let Some(message) = bytes.get(8..8 + len) else {
            return Status::internal(format!(
                "status message truncated: expected {} bytes, have {}",
                len,
                bytes.len() - 8
            ));
        };
        let code = Code::from_u32(code);
        if code == Code::Ok {
            // An error frame that claims success is a protocol violation.
            return Status::internal("peer sent an error frame with an OK code");
        }
        Status::new(code, String::from_utf8_lossy(message).into_owned())
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{}: {}", self.code, self.message)
        }
    }
}

impl std::error::Error for Status {}

/// The length prefix is a u32; longer messages are cut.
const MAX_WIRE_MESSAGE_LEN: usize = u32::MAX as usize;

/// The longest prefix of `s` that fits in `max` bytes without splitting a char.
fn clamp_to_char_boundary(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
