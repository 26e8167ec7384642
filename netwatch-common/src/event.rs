//! The fixed 40-byte record both kernel programs emit.
//!
//! ```text
//!  offset  size  field
//!       0     4  src_addr     (wire order)
//!       4     4  dst_addr     (wire order)
//!       8     2  src_port     (host order)
//!      10     2  dst_port     (host order)
//!      12     1  protocol
//!      13     3  _pad0        (zero)
//!      16     4  pkt_len
//!      20     4  action
//!      24     4  drop_reason
//!      28     4  _pad1        (zero)
//!      32     8  ktime_ns
//! ```
//!
//! Padding is spelled out as named fields so the verifier never sees an
//! uninitialised byte go out through the perf buffer.

use core::fmt;

use crate::cursor::Classified;

/// Origin discriminator stored in [`PacketEvent::action`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum Action {
    IngressPass = 2,
    DropObserved = 100,
}

impl Action {
    pub const fn code(self) -> u32 {
        self as u32
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Action::IngressPass => "pass",
            Action::DropObserved => "drop",
        }
    }
}

impl TryFrom<u32> for Action {
    type Error = DecodeError;

    fn try_from(code: u32) -> Result<Self, Self::Error> {
        match code {
            2 => Ok(Action::IngressPass),
            100 => Ok(Action::DropObserved),
            other => Err(DecodeError::UnknownAction(other)),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecodeError {
    Truncated { len: usize },
    UnknownAction(u32),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Truncated { len } => {
                write!(f, "event record too short: {} of {} bytes", len, PacketEvent::LEN)
            }
            DecodeError::UnknownAction(code) => write!(f, "unknown action code {}", code),
        }
    }
}

#[cfg(any(test, feature = "userspace"))]
impl std::error::Error for DecodeError {}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(C)]
pub struct PacketEvent {
    pub src_addr: u32,
    pub dst_addr: u32,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: u8,
    pub _pad0: [u8; 3],
    pub pkt_len: u32,
    pub action: u32,
    pub drop_reason: u32,
    pub _pad1: u32,
    pub ktime_ns: u64,
}

impl PacketEvent {
    pub const LEN: usize = 40;

    pub const fn zeroed() -> Self {
        PacketEvent {
            src_addr: 0,
            dst_addr: 0,
            src_port: 0,
            dst_port: 0,
            protocol: 0,
            _pad0: [0; 3],
            pkt_len: 0,
            action: 0,
            drop_reason: 0,
            _pad1: 0,
            ktime_ns: 0,
        }
    }

    /// Event for a packet seen at ingress. `pkt_len` is the IPv4 total-length
    /// the packet declares for itself.
    #[inline(always)]
    pub fn ingress(fields: &Classified, ktime_ns: u64) -> Self {
        let mut event = Self::with_fields(fields);
        event.pkt_len = fields.total_len as u32;
        event.action = Action::IngressPass.code();
        event.ktime_ns = ktime_ns;
        event
    }

    /// Event for a discarded buffer. `pkt_len` is the buffer's recorded
    /// length, not the header's claim.
    #[inline(always)]
    pub fn dropped(fields: &Classified, buffer_len: u32, reason: u32, ktime_ns: u64) -> Self {
        let mut event = Self::with_fields(fields);
        event.pkt_len = buffer_len;
        event.action = Action::DropObserved.code();
        event.drop_reason = reason;
        event.ktime_ns = ktime_ns;
        event
    }

    #[inline(always)]
    fn with_fields(fields: &Classified) -> Self {
        let mut event = Self::zeroed();
        event.src_addr = fields.src_addr;
        event.dst_addr = fields.dst_addr;
        event.src_port = fields.src_port;
        event.dst_port = fields.dst_port;
        event.protocol = fields.protocol;
        event
    }

    pub fn action(&self) -> Result<Action, DecodeError> {
        Action::try_from(self.action)
    }

    /// Source address as the four octets seen on the wire.
    pub fn src_octets(&self) -> [u8; 4] {
        self.src_addr.to_ne_bytes()
    }

    pub fn dst_octets(&self) -> [u8; 4] {
        self.dst_addr.to_ne_bytes()
    }

    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let mut out = [0u8; Self::LEN];
        out[0..4].copy_from_slice(&self.src_addr.to_ne_bytes());
        out[4..8].copy_from_slice(&self.dst_addr.to_ne_bytes());
        out[8..10].copy_from_slice(&self.src_port.to_ne_bytes());
        out[10..12].copy_from_slice(&self.dst_port.to_ne_bytes());
        out[12] = self.protocol;
        out[13..16].copy_from_slice(&self._pad0);
        out[16..20].copy_from_slice(&self.pkt_len.to_ne_bytes());
        out[20..24].copy_from_slice(&self.action.to_ne_bytes());
        out[24..28].copy_from_slice(&self.drop_reason.to_ne_bytes());
        out[28..32].copy_from_slice(&self._pad1.to_ne_bytes());
        out[32..40].copy_from_slice(&self.ktime_ns.to_ne_bytes());
        out
    }

    /// Decodes the first [`Self::LEN`] bytes of `buf`. Trailing bytes (perf
    /// records are padded to 8) are ignored.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, DecodeError> {
        let Some(buf) = buf.get(..Self::LEN) else {
            return Err(DecodeError::Truncated { len: buf.len() });
        };
        let u16_at = |at: usize| u16::from_ne_bytes([buf[at], buf[at + 1]]);
        let u32_at = |at: usize| u32::from_ne_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
        let mut ktime = [0u8; 8];
        ktime.copy_from_slice(&buf[32..40]);

        Ok(PacketEvent {
            src_addr: u32_at(0),
            dst_addr: u32_at(4),
            src_port: u16_at(8),
            dst_port: u16_at(10),
            protocol: buf[12],
            _pad0: [buf[13], buf[14], buf[15]],
            pkt_len: u32_at(16),
            action: u32_at(20),
            drop_reason: u32_at(24),
            _pad1: u32_at(28),
            ktime_ns: u64::from_ne_bytes(ktime),
        })
    }
}
