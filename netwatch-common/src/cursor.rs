//! Bounds-checked header walk shared by both kernel programs.
//!
//! Every read goes through [`HeaderSource::load`], which either returns the
//! requested bytes or an error; nothing here indexes packet memory directly.
//! There are no loops: the only packet-controlled value feeding an offset is
//! the IPv4 header-length nibble, which is at most 60.

use core::fmt;

use crate::{ETH_P_IPV4, IPPROTO_TCP, IPPROTO_UDP};

pub const ETH_HDR_LEN: usize = 14;
pub const IPV4_MIN_HDR_LEN: usize = 20;

const ETH_TYPE_OFFSET: usize = 12;
const IPV4_TOT_LEN_OFFSET: usize = 2;
const IPV4_PROTO_OFFSET: usize = 9;
const IPV4_SADDR_OFFSET: usize = 12;
const IPV4_DADDR_OFFSET: usize = 16;

/// Why a packet or buffer produced no event. None of these ever reach the
/// hosting environment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClassifyError {
    ShortBuffer,
    UnsupportedLinkType,
    MalformedNetworkHeader,
    UnsupportedTransportProtocol,
    MissingBufferHandle,
    DeferredReadFailure,
    NotMonitored,
}

impl ClassifyError {
    pub const fn as_str(self) -> &'static str {
        match self {
            ClassifyError::ShortBuffer => "short buffer",
            ClassifyError::UnsupportedLinkType => "unsupported link type",
            ClassifyError::MalformedNetworkHeader => "malformed network header",
            ClassifyError::UnsupportedTransportProtocol => "unsupported transport protocol",
            ClassifyError::MissingBufferHandle => "missing buffer handle",
            ClassifyError::DeferredReadFailure => "deferred read failure",
            ClassifyError::NotMonitored => "interface not monitored",
        }
    }
}

impl fmt::Display for ClassifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(any(test, feature = "userspace"))]
impl std::error::Error for ClassifyError {}

/// A bounded window of header bytes.
pub trait HeaderSource {
    /// Returns the `N` bytes starting at `offset`, or an error when fewer
    /// than `N` bytes remain.
    fn load<const N: usize>(&self, offset: usize) -> Result<[u8; N], ClassifyError>;
}

/// [`HeaderSource`] over an in-memory slice.
#[derive(Clone, Copy, Debug)]
pub struct SliceWindow<'a>(pub &'a [u8]);

impl HeaderSource for SliceWindow<'_> {
    #[inline(always)]
    fn load<const N: usize>(&self, offset: usize) -> Result<[u8; N], ClassifyError> {
        let end = offset.checked_add(N).ok_or(ClassifyError::ShortBuffer)?;
        let bytes = self.0.get(offset..end).ok_or(ClassifyError::ShortBuffer)?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }
}

/// The fields an event is built from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Classified {
    /// Wire order.
    pub src_addr: u32,
    /// Wire order.
    pub dst_addr: u32,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: u8,
    /// IPv4 total-length, host order.
    pub total_len: u16,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Ipv4Summary {
    src_addr: u32,
    dst_addr: u32,
    protocol: u8,
    total_len: u16,
    header_len: usize,
}

/// Walks Ethernet, IPv4 and the transport ports of a raw frame starting at
/// offset 0.
#[inline(always)]
pub fn classify_frame<S: HeaderSource>(src: &S) -> Result<Classified, ClassifyError> {
    let eth: [u8; ETH_HDR_LEN] = src.load(0)?;
    let ether_type = u16::from_be_bytes([eth[ETH_TYPE_OFFSET], eth[ETH_TYPE_OFFSET + 1]]);
    if ether_type != ETH_P_IPV4 {
        return Err(ClassifyError::UnsupportedLinkType);
    }

    let ip = parse_ipv4(src, ETH_HDR_LEN)?;
    let (src_port, dst_port) = parse_ports(src, ETH_HDR_LEN + ip.header_len)?;
    Ok(ip.with_ports(src_port, dst_port))
}

/// Same as [`classify_frame`] from the network layer on, but trusts offsets
/// recorded by whoever owns the buffer instead of deriving the transport
/// offset from the header-length field.
#[inline(always)]
pub fn classify_at<S: HeaderSource>(
    src: &S,
    network_offset: usize,
    transport_offset: usize,
) -> Result<Classified, ClassifyError> {
    let ip = parse_ipv4(src, network_offset)?;
    let (src_port, dst_port) = parse_ports(src, transport_offset)?;
    Ok(ip.with_ports(src_port, dst_port))
}

#[inline(always)]
fn parse_ipv4<S: HeaderSource>(src: &S, offset: usize) -> Result<Ipv4Summary, ClassifyError> {
    let hdr: [u8; IPV4_MIN_HDR_LEN] = src.load(offset)?;

    let header_len = ((hdr[0] & 0x0f) as usize) * 4;
    if header_len < IPV4_MIN_HDR_LEN {
        return Err(ClassifyError::MalformedNetworkHeader);
    }

    let protocol = hdr[IPV4_PROTO_OFFSET];
    if protocol != IPPROTO_TCP && protocol != IPPROTO_UDP {
        return Err(ClassifyError::UnsupportedTransportProtocol);
    }

    let word = |at: usize| [hdr[at], hdr[at + 1], hdr[at + 2], hdr[at + 3]];
    Ok(Ipv4Summary {
        src_addr: u32::from_ne_bytes(word(IPV4_SADDR_OFFSET)),
        dst_addr: u32::from_ne_bytes(word(IPV4_DADDR_OFFSET)),
        protocol,
        total_len: u16::from_be_bytes([hdr[IPV4_TOT_LEN_OFFSET], hdr[IPV4_TOT_LEN_OFFSET + 1]]),
        header_len,
    })
}

// TCP and UDP both open with source port then destination port.
#[inline(always)]
fn parse_ports<S: HeaderSource>(src: &S, offset: usize) -> Result<(u16, u16), ClassifyError> {
    let ports: [u8; 4] = src.load(offset)?;
    Ok((
        u16::from_be_bytes([ports[0], ports[1]]),
        u16::from_be_bytes([ports[2], ports[3]]),
    ))
}

impl Ipv4Summary {
    #[inline(always)]
    fn with_ports(self, src_port: u16, dst_port: u16) -> Classified {
        Classified {
            src_addr: self.src_addr,
            dst_addr: self.dst_addr,
            src_port,
            dst_port,
            protocol: self.protocol,
            total_len: self.total_len,
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::Frame;
    use super::*;

    #[test]
    fn slice_window_bounds() {
        let data = [1u8, 2, 3, 4];
        let win = SliceWindow(&data);
        assert_eq!(win.load::<4>(0), Ok([1, 2, 3, 4]));
        assert_eq!(win.load::<2>(2), Ok([3, 4]));
        assert_eq!(win.load::<2>(3), Err(ClassifyError::ShortBuffer));
        assert_eq!(win.load::<1>(usize::MAX), Err(ClassifyError::ShortBuffer));
    }

    #[test]
    fn classifies_https_reply() {
        let bytes = Frame::https_reply().bytes();
        let fields = classify_frame(&SliceWindow(&bytes)).unwrap();
        assert_eq!(fields.src_addr.to_ne_bytes(), [10, 0, 0, 1]);
        assert_eq!(fields.dst_addr.to_ne_bytes(), [10, 0, 0, 2]);
        assert_eq!(fields.src_port, 443);
        assert_eq!(fields.dst_port, 51000);
        assert_eq!(fields.protocol, 6);
        assert_eq!(fields.total_len, 60);
    }

    #[test]
    fn honours_ip_options() {
        let mut frame = Frame::https_reply();
        frame.ihl = 15;
        frame.protocol = 17;
        let bytes = frame.bytes();
        let fields = classify_frame(&SliceWindow(&bytes)).unwrap();
        assert_eq!((fields.src_port, fields.dst_port), (443, 51000));
        assert_eq!(fields.protocol, 17);
    }

    #[test]
    fn rejects_non_ipv4_link_types() {
        for ether_type in [0x0806u16, 0x86dd, 0x8100, 0x0000, 0x0008] {
            let mut frame = Frame::https_reply();
            frame.ether_type = ether_type;
            let bytes = frame.bytes();
            assert_eq!(
                classify_frame(&SliceWindow(&bytes)),
                Err(ClassifyError::UnsupportedLinkType),
                "ether type {ether_type:#06x}"
            );
        }
    }

    #[test]
    fn every_short_header_length_is_malformed() {
        for ihl in 0..5 {
            let mut frame = Frame::https_reply();
            frame.ihl = ihl;
            let bytes = frame.bytes();
            assert_eq!(
                classify_frame(&SliceWindow(&bytes)),
                Err(ClassifyError::MalformedNetworkHeader),
                "ihl {ihl}"
            );
        }
    }

    #[test]
    fn only_tcp_and_udp_pass_dispatch() {
        for protocol in 0..=u8::MAX {
            let mut frame = Frame::https_reply();
            frame.protocol = protocol;
            let bytes = frame.bytes();
            let result = classify_frame(&SliceWindow(&bytes));
            if protocol == 6 || protocol == 17 {
                assert!(result.is_ok(), "protocol {protocol}");
            } else {
                assert_eq!(result, Err(ClassifyError::UnsupportedTransportProtocol));
            }
        }
    }

    #[test]
    fn every_truncation_is_rejected_without_panicking() {
        for ihl in 5..=15 {
            let mut frame = Frame::https_reply();
            frame.ihl = ihl;
            let bytes = frame.bytes();
            let min = frame.min_len();
            for len in 0..min {
                assert_eq!(
                    classify_frame(&SliceWindow(&bytes[..len])),
                    Err(ClassifyError::ShortBuffer),
                    "ihl {ihl} len {len}"
                );
            }
            assert!(classify_frame(&SliceWindow(&bytes[..min])).is_ok());
        }
    }

    #[test]
    fn recorded_offsets_are_trusted() {
        let frame = Frame::https_reply();
        let mut image = vec![0xaau8; 32];
        image.extend_from_slice(&frame.ip_bytes());
        // Transport offset deliberately points past the header-length hint.
        image.extend_from_slice(&[0x00, 0x35, 0x12, 0x34]);
        let transport = image.len() - 4;

        let fields = classify_at(&SliceWindow(&image), 32, transport).unwrap();
        assert_eq!((fields.src_port, fields.dst_port), (53, 0x1234));
        assert_eq!(fields.src_addr.to_ne_bytes(), [10, 0, 0, 1]);
    }

    #[test]
    fn recorded_offsets_out_of_range() {
        let ip = Frame::https_reply().ip_bytes();
        let win = SliceWindow(&ip);
        assert_eq!(classify_at(&win, ip.len(), 20), Err(ClassifyError::ShortBuffer));
        assert_eq!(classify_at(&win, 0, ip.len() - 3), Err(ClassifyError::ShortBuffer));
    }
}
