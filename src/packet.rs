//! Wire-format definitions for outgoing ICMPv6 requests.
//!
//! This module is responsible for:
//! - Writing the fixed IPv6 header in front of a caller-supplied ICMPv6
//!   message.
//! - Computing the ICMPv6 checksum over the message and the IPv6
//!   pseudo-header.
//! - Parsing inbound Echo Replies far enough to match them against a
//!   socket's affinity.
//!
//! No I/O and no locking happens here.
//!
//! # Wire format
//!
//! All multi-byte integers are **big-endian**.
//!
//! ```text
//!  0               1               2               3
//!  0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |Version| Traffic Class |              Flow Label               |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |         Payload Length        |  Next Header  |   Hop Limit   |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                 Source Address (16 bytes)                     |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |               Destination Address (16 bytes)                  |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |     Type      |     Code      |           Checksum            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |          Identifier           |        Sequence Number        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                        Payload ...                            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! The identifier/sequence word only exists for Echo messages.

use std::net::Ipv6Addr;

/// Byte length of the fixed IPv6 header.
pub const IPV6_HDRLEN: usize = 40;
/// Byte length of the generic ICMPv6 header (type, code, checksum).
pub const ICMPV6_HDRLEN: usize = 4;
/// Byte length of an ICMPv6 Echo header (generic header + id + seq).
pub const ECHO_HDRLEN: usize = 8;

/// IPv6 next-header value for ICMPv6.
pub const IP_PROTO_ICMP6: u8 = 58;
/// Hop limit written on every outgoing request.
pub const HOP_LIMIT: u8 = 255;

pub const ICMPV6_ECHO_REQUEST: u8 = 128;
pub const ICMPV6_ECHO_REPLY: u8 = 129;

// Byte offsets within the IPv6 header.
const OFF_VTC: usize = 0;
const OFF_TCF: usize = 1;
const OFF_FLOW: usize = 2;
const OFF_LEN: usize = 4;
const OFF_PROTO: usize = 6;
const OFF_HOPS: usize = 7;
const OFF_SRC: usize = 8;
const OFF_DST: usize = 24;

// Byte offsets within the ICMPv6 message.
const OFF_TYPE: usize = 0;
const OFF_CODE: usize = 1;
const OFF_CHKSUM: usize = 2;
const OFF_ID: usize = 4;
const OFF_SEQ: usize = 6;

// ---------------------------------------------------------------------------
// Echo header
// ---------------------------------------------------------------------------

/// The leading fields of an ICMPv6 Echo Request or Reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EchoHeader {
    pub kind: u8,
    pub code: u8,
    pub id: u16,
    pub seq: u16,
}

impl EchoHeader {
    /// Read the echo fields from the start of an ICMPv6 message.
    ///
    /// Returns `None` if the message is not an Echo Request/Reply or is too
    /// short to carry an identifier.
    pub fn peek(icmp: &[u8]) -> Option<Self> {
        if icmp.len() < ECHO_HDRLEN {
            return None;
        }
        let kind = icmp[OFF_TYPE];
        if kind != ICMPV6_ECHO_REQUEST && kind != ICMPV6_ECHO_REPLY {
            return None;
        }
        Some(Self {
            kind,
            code: icmp[OFF_CODE],
            id: u16::from_be_bytes([icmp[OFF_ID], icmp[OFF_ID + 1]]),
            seq: u16::from_be_bytes([icmp[OFF_SEQ], icmp[OFF_SEQ + 1]]),
        })
    }

    /// Serialise an echo header followed by `data` into a new buffer with a
    /// zero checksum.  The checksum is filled in when the packet is built.
    pub fn to_message(&self, data: &[u8]) -> Vec<u8> {
        let mut buf = vec![0u8; ECHO_HDRLEN + data.len()];
        buf[OFF_TYPE] = self.kind;
        buf[OFF_CODE] = self.code;
        buf[OFF_ID..OFF_ID + 2].copy_from_slice(&self.id.to_be_bytes());
        buf[OFF_SEQ..OFF_SEQ + 2].copy_from_slice(&self.seq.to_be_bytes());
        buf[ECHO_HDRLEN..].copy_from_slice(data);
        buf
    }

    pub fn is_request(&self) -> bool {
        self.kind == ICMPV6_ECHO_REQUEST
    }
}

// ---------------------------------------------------------------------------
// Request construction
// ---------------------------------------------------------------------------

/// Write an IPv6 header plus `icmp` into `buf` and checksum the message.
///
/// `buf` must start at the IPv6 header and hold at least
/// `IPV6_HDRLEN + icmp.len()` bytes.  Returns the number of bytes written,
/// which is the length handed to the link layer.
pub fn write_request(buf: &mut [u8], src: &Ipv6Addr, dst: &Ipv6Addr, icmp: &[u8]) -> usize {
    let total = IPV6_HDRLEN + icmp.len();
    debug_assert!(buf.len() >= total, "transmit buffer too small");
    let payload_len = icmp.len() as u16;

    buf[OFF_VTC] = 0x60; // version 6, traffic class (MS)
    buf[OFF_TCF] = 0;
    buf[OFF_FLOW..OFF_FLOW + 2].copy_from_slice(&[0, 0]);
    buf[OFF_LEN..OFF_LEN + 2].copy_from_slice(&payload_len.to_be_bytes());
    buf[OFF_PROTO] = IP_PROTO_ICMP6;
    buf[OFF_HOPS] = HOP_LIMIT;
    buf[OFF_SRC..OFF_SRC + 16].copy_from_slice(&src.octets());
    buf[OFF_DST..OFF_DST + 16].copy_from_slice(&dst.octets());

    let msg = &mut buf[IPV6_HDRLEN..total];
    msg.copy_from_slice(icmp);

    msg[OFF_CHKSUM..OFF_CHKSUM + 2].copy_from_slice(&0u16.to_be_bytes());
    let csum = finish_checksum(icmpv6_sum(src, dst, msg));
    msg[OFF_CHKSUM..OFF_CHKSUM + 2].copy_from_slice(&csum.to_be_bytes());

    total
}

/// Build the Echo Reply a peer would send for the Echo Request in `frame`
/// (which starts at the IPv6 header).  Addresses are swapped and identifier,
/// sequence and data are echoed back.
///
/// Returns `None` if `frame` is not an Echo Request.
pub fn echo_reply_for(frame: &[u8]) -> Option<Vec<u8>> {
    if frame.len() < IPV6_HDRLEN + ECHO_HDRLEN || frame[OFF_PROTO] != IP_PROTO_ICMP6 {
        return None;
    }
    let mut icmp = frame[IPV6_HDRLEN..].to_vec();
    if !EchoHeader::peek(&icmp)?.is_request() {
        return None;
    }
    icmp[OFF_TYPE] = ICMPV6_ECHO_REPLY;

    let src = ipv6_at(frame, OFF_SRC);
    let dst = ipv6_at(frame, OFF_DST);
    let mut reply = vec![0u8; frame.len()];
    write_request(&mut reply, &dst, &src, &icmp);
    Some(reply)
}

/// Complement a folded sum into the value stored on the wire.
///
/// Zero means "no checksum" in this protocol family, so a computed zero is
/// sent as all-ones.
#[inline]
pub fn finish_checksum(sum: u16) -> u16 {
    match !sum {
        0 => 0xffff,
        c => c,
    }
}

/// Folded one's-complement sum over the IPv6 pseudo-header and `icmp`.
///
/// This is the raw sum, not its complement.  A message whose stored checksum
/// is correct sums to `0xffff`.
pub fn icmpv6_sum(src: &Ipv6Addr, dst: &Ipv6Addr, icmp: &[u8]) -> u16 {
    let mut sum = 0u32;
    sum = accumulate(sum, &src.octets());
    sum = accumulate(sum, &dst.octets());
    sum = accumulate(sum, &(icmp.len() as u32).to_be_bytes());
    sum = accumulate(sum, &[0, 0, 0, IP_PROTO_ICMP6]);
    sum = accumulate(sum, icmp);
    fold(sum)
}

/// Add consecutive 16-bit big-endian words of `data` to `sum`.
fn accumulate(mut sum: u32, data: &[u8]) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for word in &mut chunks {
        sum += u32::from(u16::from_be_bytes([word[0], word[1]]));
    }
    // Odd trailing byte: pad with a zero byte on the right.
    if let [last] = chunks.remainder() {
        sum += u32::from(*last) << 8;
    }
    // Keep headroom for the next call.
    fold(sum) as u32
}

fn fold(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    sum as u16
}

// ---------------------------------------------------------------------------
// Inbound parsing
// ---------------------------------------------------------------------------

/// An inbound Echo Reply, borrowed from the received frame.
#[derive(Debug, PartialEq, Eq)]
pub struct EchoReply<'a> {
    pub src: Ipv6Addr,
    pub header: EchoHeader,
    /// The complete ICMPv6 message, header included.
    pub message: &'a [u8],
}

/// Parse an IPv6 packet carrying an ICMPv6 Echo Reply.
pub fn parse_echo_reply(packet: &[u8]) -> Result<EchoReply<'_>, PacketError> {
    if packet.len() < IPV6_HDRLEN + ECHO_HDRLEN {
        return Err(PacketError::BufferTooShort);
    }
    if packet[OFF_VTC] >> 4 != 6 || packet[OFF_PROTO] != IP_PROTO_ICMP6 {
        return Err(PacketError::NotIcmpv6);
    }
    let len = u16::from_be_bytes([packet[OFF_LEN], packet[OFF_LEN + 1]]) as usize;
    if packet.len() != IPV6_HDRLEN + len {
        return Err(PacketError::LengthMismatch);
    }

    let src = ipv6_at(packet, OFF_SRC);
    let dst = ipv6_at(packet, OFF_DST);
    let message = &packet[IPV6_HDRLEN..];
    if icmpv6_sum(&src, &dst, message) != 0xffff {
        return Err(PacketError::ChecksumFailed);
    }

    match EchoHeader::peek(message) {
        Some(header) if header.kind == ICMPV6_ECHO_REPLY => Ok(EchoReply {
            src,
            header,
            message,
        }),
        _ => Err(PacketError::NotEchoReply),
    }
}

fn ipv6_at(packet: &[u8], off: usize) -> Ipv6Addr {
    let mut octets = [0u8; 16];
    octets.copy_from_slice(&packet[off..off + 16]);
    Ipv6Addr::from(octets)
}

/// Errors that can arise when parsing an inbound packet.
#[derive(Debug, PartialEq, Eq)]
pub enum PacketError {
    /// Buffer shorter than the IPv6 + Echo headers.
    BufferTooShort,
    /// Not an IPv6 packet carrying ICMPv6.
    NotIcmpv6,
    /// Payload length field does not match the buffer.
    LengthMismatch,
    /// Checksum did not verify.
    ChecksumFailed,
    /// ICMPv6 message is not an Echo Reply.
    NotEchoReply,
}

impl std::fmt::Display for PacketError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PacketError::BufferTooShort => write!(f, "buffer too short for an echo reply"),
            PacketError::NotIcmpv6 => write!(f, "not an IPv6/ICMPv6 packet"),
            PacketError::LengthMismatch => {
                write!(f, "payload length field does not match remaining bytes")
            }
            PacketError::ChecksumFailed => write!(f, "checksum verification failed"),
            PacketError::NotEchoReply => write!(f, "not an echo reply"),
        }
    }
}

impl std::error::Error for PacketError {}
