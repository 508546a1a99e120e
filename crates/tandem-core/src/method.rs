use std::fmt;

use serde::{Deserialize, Serialize};

/// Maximum method name length in bytes.
pub const MAX_METHOD_NAME_LEN: usize = 256;

/// RPC method kind (streaming semantics)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MethodKind {
    /// Unary RPC: single request, single response
    Unary = 0,
    /// Client streaming: multiple requests, single response
    ClientStreaming = 1,
    /// Server streaming: single request, multiple responses
    ServerStreaming = 2,
    /// Bidirectional streaming: multiple requests and responses
    Bidirectional = 3,
}

impl MethodKind {
    /// Convert from u32 wire value
    pub fn from_u32(val: u32) -> Option<Self> {
        match val {
            0 => Some(MethodKind::Unary),
            1 => Some(MethodKind::ClientStreaming),
            2 => Some(MethodKind::ServerStreaming),
            3 => Some(MethodKind::Bidirectional),
            _ => None,
        }
    }

    /// Convert to u32 for wire transmission
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Whether the caller sends more than one message.
    pub fn client_streams(self) -> bool {
        matches!(self, MethodKind::ClientStreaming | MethodKind::Bidirectional)
    }

    /// Whether the callee sends more than one message.
    pub fn server_streams(self) -> bool {
        matches!(self, MethodKind::ServerStreaming | MethodKind::Bidirectional)
    }
}

impl fmt::Display for MethodKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MethodKind::Unary => "unary",
            MethodKind::ClientStreaming => "client-streaming",
            MethodKind::ServerStreaming => "server-streaming",
            MethodKind::Bidirectional => "bidirectional",
        };
        f.write_str(name)
    }
}
