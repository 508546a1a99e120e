//! Frames: the envelope every message travels in.

use bitflags::bitflags;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{CallContext, Encoding, MethodKind, NO_DEADLINE, Status};

bitflags! {
    /// What a frame means for its channel.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct FrameFlags: u32 {
        /// Opens a call; payload is an encoded [`OpenCall`].
        const OPEN = 1 << 0;
        /// Carries one encoded message.
        const DATA = 1 << 1;
        /// Ends the sender's direction of the channel.
        const EOS = 1 << 2;
        /// Carries an encoded [`Status`]; always paired with `EOS`.
        const ERROR = 1 << 3;
        /// Asks the peer to abandon the call.
        const CANCEL = 1 << 4;
        /// Lets the peer send more `DATA` frames; payload is a u32 LE count.
        const CREDIT = 1 << 5;
    }
}

/// Size of an encoded [`FrameDesc`] in bytes.
pub const DESC_SIZE: usize = 24;

/// Fixed-size frame header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameDesc {
    /// Per-channel sequence number, for tracing only.
    pub msg_id: u64,
    pub channel_id: u32,
    pub flags: FrameFlags,
    /// Absolute deadline in unix nanoseconds, `NO_DEADLINE` if unbounded.
    /// Only meaningful on `OPEN` frames.
    pub deadline_ns: u64,
}

impl FrameDesc {
    pub fn new(channel_id: u32, msg_id: u64, flags: FrameFlags) -> Self {
        Self {
            msg_id,
            channel_id,
            flags,
            deadline_ns: NO_DEADLINE,
        }
    }

    pub fn to_bytes(&self) -> [u8; DESC_SIZE] {
        let mut out = [0u8; DESC_SIZE];
        out[0..8].copy_from_slice(&self.msg_id.to_le_bytes());
        out[8..12].copy_from_slice(&self.channel_id.to_le_bytes());
        out[12..16].copy_from_slice(&self.flags.bits().to_le_bytes());
        out[16..24].copy_from_slice(&self.deadline_ns.to_le_bytes());
        out
    }

    /// Decode a header. Unknown flag bits are dropped.
    pub fn from_bytes(bytes: &[u8; DESC_SIZE]) -> Self {
        let u64_at = |at: usize| {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&bytes[at..at + 8]);
            u64::from_le_bytes(buf)
        };
        let u32_at = |at: usize| {
            let mut buf = [0u8; 4];
            buf.copy_from_slice(&bytes[at..at + 4]);
            u32::from_le_bytes(buf)
        };
        Self {
            msg_id: u64_at(0),
            channel_id: u32_at(8),
            flags: FrameFlags::from_bits_truncate(u32_at(12)),
            deadline_ns: u64_at(16),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub desc: FrameDesc,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(desc: FrameDesc, payload: impl Into<Bytes>) -> Self {
        Self {
            desc,
            payload: payload.into(),
        }
    }

    /// Open `channel_id`, carrying the context's deadline on the header.
    pub fn open(channel_id: u32, open: &OpenCall, ctx: &CallContext) -> Result<Self, postcard::Error> {
        let payload = postcard::to_allocvec(open)?;
        let mut desc = FrameDesc::new(channel_id, 0, FrameFlags::OPEN);
        desc.deadline_ns = ctx.deadline_unix_nanos();
        Ok(Self::new(desc, payload))
    }

    pub fn data(channel_id: u32, msg_id: u64, payload: impl Into<Bytes>) -> Self {
        Self::new(FrameDesc::new(channel_id, msg_id, FrameFlags::DATA), payload)
    }

    /// A final message and end of direction in one frame.
    pub fn last_data(channel_id: u32, msg_id: u64, payload: impl Into<Bytes>) -> Self {
        Self::new(
            FrameDesc::new(channel_id, msg_id, FrameFlags::DATA | FrameFlags::EOS),
            payload,
        )
    }

    pub fn eos(channel_id: u32, msg_id: u64) -> Self {
        Self::new(FrameDesc::new(channel_id, msg_id, FrameFlags::EOS), Bytes::new())
    }

    pub fn error(channel_id: u32, msg_id: u64, status: &Status) -> Self {
        Self::new(
            FrameDesc::new(channel_id, msg_id, FrameFlags::ERROR | FrameFlags::EOS),
            status.to_bytes(),
        )
    }

    pub fn cancel(channel_id: u32, msg_id: u64) -> Self {
        Self::new(FrameDesc::new(channel_id, msg_id, FrameFlags::CANCEL), Bytes::new())
    }

    /// Grant the peer room for `messages` more `DATA` frames on `channel_id`.
    pub fn credit(channel_id: u32, msg_id: u64, messages: u32) -> Self {
        Self::new(
            FrameDesc::new(channel_id, msg_id, FrameFlags::CREDIT),
            messages.to_le_bytes().to_vec(),
        )
    }

    pub fn channel_id(&self) -> u32 {
        self.desc.channel_id
    }

    pub fn is_open(&self) -> bool {
        self.desc.flags.contains(FrameFlags::OPEN)
    }

    pub fn is_data(&self) -> bool {
        self.desc.flags.contains(FrameFlags::DATA)
    }

    pub fn is_eos(&self) -> bool {
        self.desc.flags.contains(FrameFlags::EOS)
    }

    pub fn is_error(&self) -> bool {
        self.desc.flags.contains(FrameFlags::ERROR)
    }

    pub fn is_cancel(&self) -> bool {
        self.desc.flags.contains(FrameFlags::CANCEL)
    }

    pub fn is_credit(&self) -> bool {
        self.desc.flags.contains(FrameFlags::CREDIT)
    }

    /// The grant carried by a `CREDIT` frame; `None` if the payload is not a u32.
    pub fn credit_grant(&self) -> Option<u32> {
        if !self.is_credit() {
            return None;
        }
        let bytes: [u8; 4] = self.payload.as_ref().try_into().ok()?;
        Some(u32::from_le_bytes(bytes))
    }

    /// The status carried by an `ERROR` frame.
    pub fn status(&self) -> Option<Status> {
        self.is_error().then(|| Status::from_bytes(&self.payload))
    }
}

/// Payload of an `OPEN` frame.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenCall {
    pub method: String,
    pub kind: MethodKind,
    pub encoding: Encoding,
    pub metadata: Vec<(String, String)>,
    /// `DATA` frames the opener accepts before it grants more.
    pub window: u32,
}

impl OpenCall {
    pub fn decode(payload: &[u8]) -> Result<Self, postcard::Error> {
        postcard::from_bytes(payload)
    }
}
