use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::fmt;

use crate::Status;

/// Encoding format identifier for message serialization.
///
/// Chosen per session and announced on every `OPEN` frame so the peer decodes
/// the call's messages with the same codec.
#[repr(u16)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Encoding {
    /// Postcard: compact binary format (default).
    #[default]
    Postcard = 1,
    /// JSON: human-readable format (for debugging/tooling).
    Json = 2,
}

impl Encoding {
    /// Encode a value with this encoding's codec.
    pub fn encode<T: Serialize>(self, val: &T) -> Result<Vec<u8>, CodecError> {
        match self {
            Encoding::Postcard => PostcardCodec::encode(val).map_err(CodecError::Postcard),
            Encoding::Json => JsonCodec::encode(val).map_err(CodecError::Json),
        }
    }

    /// Decode bytes with this encoding's codec.
    pub fn decode<T: DeserializeOwned>(self, buf: &[u8]) -> Result<T, CodecError> {
        match self {
            Encoding::Postcard => PostcardCodec::decode(buf).map_err(CodecError::Postcard),
            Encoding::Json => JsonCodec::decode(buf).map_err(CodecError::Json),
        }
    }

    /// Parse the configuration spelling (`postcard` / `json`).
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "postcard" => Some(Encoding::Postcard),
            "json" => Some(Encoding::Json),
            _ => None,
        }
    }
}

impl TryFrom<u16> for Encoding {
    type Error = UnknownEncoding;

    fn try_from(v: u16) -> Result<Self, Self::Error> {
        match v {
            1 => Ok(Encoding::Postcard),
            2 => Ok(Encoding::Json),
            _ => Err(UnknownEncoding(v)),
        }
    }
}

impl From<Encoding> for u16 {
    fn from(encoding: Encoding) -> u16 {
        encoding as u16
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Encoding::Postcard => write!(f, "postcard"),
            Encoding::Json => write!(f, "json"),
        }
    }
}

/// Error when converting from an unknown u16 encoding value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnknownEncoding(pub u16);

impl fmt::Display for UnknownEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown encoding: {}", self.0)
    }
}

impl std::error::Error for UnknownEncoding {}

/// Codec trait for message serialization.
///
/// Implementations provide encoding/decoding for specific serialization formats.
/// Each codec declares its encoding type and associated error types.
pub trait Codec {
    /// The encoding type this codec implements.
    const ENCODING: Encoding;

    /// Error type returned by encode operations.
    type EncodeError: std::error::Error;

    /// Error type returned by decode operations.
    type DecodeError: std::error::Error;

    /// Encode a value into bytes.
    fn encode<T: Serialize>(val: &T) -> Result<Vec<u8>, Self::EncodeError>;

    /// Decode bytes into a value.
    fn decode<T: DeserializeOwned>(buf: &[u8]) -> Result<T, Self::DecodeError>;
}

/// Postcard codec: compact binary format using postcard serialization.
pub struct PostcardCodec;

impl Codec for PostcardCodec {
    const ENCODING: Encoding = Encoding::Postcard;
    type EncodeError = postcard::Error;
    type DecodeError = postcard::Error;

    fn encode<T: Serialize>(val: &T) -> Result<Vec<u8>, Self::EncodeError> {
        postcard::to_allocvec(val)
    }

    fn decode<T: DeserializeOwned>(buf: &[u8]) -> Result<T, Self::DecodeError> {
        postcard::from_bytes(buf)
    }
}

/// JSON codec: human-readable format using serde_json.
///
/// Useful when the messages on a connection need to be inspected as text.
pub struct JsonCodec;

impl Codec for JsonCodec {
    const ENCODING: Encoding = Encoding::Json;
    type EncodeError = serde_json::Error;
    type DecodeError = serde_json::Error;

    fn encode<T: Serialize>(val: &T) -> Result<Vec<u8>, Self::EncodeError> {
        serde_json::to_vec(val)
    }

    fn decode<T: DeserializeOwned>(buf: &[u8]) -> Result<T, Self::DecodeError> {
        serde_json::from_slice(buf)
    }
}

/// Either codec's failure.
#[derive(Debug)]
pub enum CodecError {
    Postcard(postcard::Error),
    Json(serde_json::Error),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::Postcard(e) => write!(f, "postcard: {}", e),
            CodecError::Json(e) => write!(f, "json: {}", e),
        }
    }
}

impl std::error::Error for CodecError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CodecError::Postcard(e) => Some(e),
            CodecError::Json(e) => Some(e),
        }
    }
}

impl From<CodecError> for Status {
    fn from(err: CodecError) -> Self {
        Status::internal(format!("codec error: {}", err))
    }
}
