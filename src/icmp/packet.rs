use std::net::IpAddr;

use anyhow::{bail, Result};
use pnet::packet::icmp::{checksum, IcmpPacket};
use pnet::packet::ipv4::Ipv4Packet;

/// ICMP header size, identical for echo and error messages.
pub const ICMP_HEADER_SIZE: usize = 8;
/// IPv6 headers have no options and therefore a fixed size.
const IPV6_HEADER_SIZE: usize = 40;

pub(crate) const ECHO_REQUEST_V4: u8 = 8;
pub(crate) const ECHO_REPLY_V4: u8 = 0;
pub(crate) const TIME_EXCEEDED_V4: u8 = 11;
pub(crate) const DEST_UNREACHABLE_V4: u8 = 3;

pub(crate) const ECHO_REQUEST_V6: u8 = 128;
pub(crate) const ECHO_REPLY_V6: u8 = 129;
pub(crate) const TIME_EXCEEDED_V6: u8 = 3;
pub(crate) const DEST_UNREACHABLE_V6: u8 = 1;

/// Address family of a socket or parsed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    /// Family of an address. Mapped addresses count as v4; call [`unmap`]
    /// first if the caller wants the address itself normalized too.
    pub fn of(addr: IpAddr) -> Self {
        match unmap(addr) {
            IpAddr::V4(_) => Family::V4,
            IpAddr::V6(_) => Family::V6,
        }
    }

    pub fn matches(self, addr: IpAddr) -> bool {
        Family::of(addr) == self
    }

    /// The unspecified (wildcard) address of this family.
    pub fn unspecified(self) -> IpAddr {
        match self {
            Family::V4 => IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
            Family::V6 => IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED),
        }
    }
}

/// Turn an IPv4-mapped IPv6 address back into plain IPv4.
pub fn unmap(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => addr,
        },
        IpAddr::V4(_) => addr,
    }
}

/// Identifier and sequence number of an echo request or reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Echo {
    pub id: u16,
    pub seq: u16,
}

/// A received ICMP message, reduced to what the engines correlate on.
///
/// Time Exceeded and Destination Unreachable quote the first IP header
/// plus eight bytes of the packet that triggered them; `original` is the
/// echo request reconstructed from that quote, when it was one of ours
/// to begin with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcmpMessage {
    EchoReply(Echo),
    TimeExceeded { original: Option<Echo> },
    DestinationUnreachable { original: Option<Echo> },
    Other { icmp_type: u8, icmp_code: u8 },
}

/// Marshal an echo request for the given family.
///
/// The v4 checksum is computed here; for v6 the kernel fills it in on
/// send because it covers the pseudo-header, which we may not know while
/// bound to the unspecified address.
pub fn build_echo_request(family: Family, echo: Echo, payload: &[u8]) -> Vec<u8> {
    let mut buf = vec![0u8; ICMP_HEADER_SIZE + payload.len()];
    buf[0] = match family {
        Family::V4 => ECHO_REQUEST_V4,
        Family::V6 => ECHO_REQUEST_V6,
    };
    buf[1] = 0;
    buf[4..6].copy_from_slice(&echo.id.to_be_bytes());
    buf[6..8].copy_from_slice(&echo.seq.to_be_bytes());
    buf[8..].copy_from_slice(payload);

    if family == Family::V4 {
        let sum = checksum(&IcmpPacket::new(&buf).expect("buffer holds a full icmp header"));
        buf[2..4].copy_from_slice(&sum.to_be_bytes());
    }
    buf
}

/// Parse a received ICMP message starting at the ICMP header.
pub fn parse_message(family: Family, data: &[u8]) -> Result<IcmpMessage> {
    if data.len() < ICMP_HEADER_SIZE {
        bail!("truncated icmp message: {} bytes", data.len());
    }
    let icmp_type = data[0];
    let icmp_code = data[1];
    let body = &data[ICMP_HEADER_SIZE..];

    let msg = match (family, icmp_type) {
        (Family::V4, ECHO_REPLY_V4) | (Family::V6, ECHO_REPLY_V6) => {
            IcmpMessage::EchoReply(parse_echo_fields(data))
        }
        (Family::V4, TIME_EXCEEDED_V4) | (Family::V6, TIME_EXCEEDED_V6) => {
            IcmpMessage::TimeExceeded {
                original: parse_original_echo(family, body),
            }
        }
        (Family::V4, DEST_UNREACHABLE_V4) | (Family::V6, DEST_UNREACHABLE_V6) => {
            IcmpMessage::DestinationUnreachable {
                original: parse_original_echo(family, body),
            }
        }
        _ => IcmpMessage::Other {
            icmp_type,
            icmp_code,
        },
    };
    Ok(msg)
}

/// Strip the leading IPv4 header from a raw-socket datagram, honoring the
/// IHL field so IP options do not shift the ICMP payload.
pub(crate) fn strip_ipv4_header(data: &[u8]) -> Result<&[u8]> {
    let ip = Ipv4Packet::new(data).ok_or_else(|| anyhow::anyhow!("short ipv4 packet"))?;
    let header_len = usize::from(ip.get_header_length()) * 4;
    if header_len < 20 || data.len() < header_len {
        bail!("bad ipv4 header length {header_len}");
    }
    Ok(&data[header_len..])
}

/// Echo id/seq live at the same offsets in requests and replies.
fn parse_echo_fields(data: &[u8]) -> Echo {
    Echo {
        id: u16::from_be_bytes([data[4], data[5]]),
        seq: u16::from_be_bytes([data[6], data[7]]),
    }
}

/// Reconstruct the echo request quoted inside an error message body:
/// the offending packet's IP header (IHL-sized for v4, fixed 40 bytes
/// for v6) followed by its first eight bytes.
fn parse_original_echo(family: Family, body: &[u8]) -> Option<Echo> {
    let embedded = match family {
        Family::V4 => strip_ipv4_header(body).ok()?,
        Family::V6 => {
            if body.len() < IPV6_HEADER_SIZE {
                return None;
            }
            &body[IPV6_HEADER_SIZE..]
        }
    };
    if embedded.len() < ICMP_HEADER_SIZE {
        return None;
    }
    let expected = match family {
        Family::V4 => ECHO_REQUEST_V4,
        Family::V6 => ECHO_REQUEST_V6,
    };
    if embedded[0] != expected {
        // Quoted packet was not an echo request of ours.
        return None;
    }
    Some(parse_echo_fields(embedded))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_v4_echo_request() {
        let buf = build_echo_request(Family::V4, Echo { id: 0x1234, seq: 7 }, b"payload");
        assert_eq!(buf.len(), ICMP_HEADER_SIZE + 7);
        assert_eq!(buf[0], ECHO_REQUEST_V4);
        assert_eq!(buf[1], 0);
        assert_ne!(u16::from_be_bytes([buf[2], buf[3]]), 0, "checksum filled");
        assert_eq!(u16::from_be_bytes([buf[4], buf[5]]), 0x1234);
        assert_eq!(u16::from_be_bytes([buf[6], buf[7]]), 7);
    }

    #[test]
    fn build_v6_echo_request_leaves_checksum_to_kernel() {
        let buf = build_echo_request(Family::V6, Echo { id: 1, seq: 2 }, b"x");
        assert_eq!(buf[0], ECHO_REQUEST_V6);
        assert_eq!(u16::from_be_bytes([buf[2], buf[3]]), 0);
    }

    #[test]
    fn parse_echo_reply_v4() {
        let mut data = vec![0u8; 16];
        data[0] = ECHO_REPLY_V4;
        data[4..6].copy_from_slice(&0xbeefu16.to_be_bytes());
        data[6..8].copy_from_slice(&42u16.to_be_bytes());

        let msg = parse_message(Family::V4, &data).unwrap();
        assert_eq!(msg, IcmpMessage::EchoReply(Echo { id: 0xbeef, seq: 42 }));
    }

    #[test]
    fn parse_truncated_message_fails() {
        assert!(parse_message(Family::V4, &[0u8; 4]).is_err());
    }

    /// Build a v4 Time Exceeded quoting one of our echo requests.
    fn time_exceeded_v4(id: u16, seq: u16, embedded_type: u8) -> Vec<u8> {
        // 8 byte icmp error header + 20 byte quoted IP header + 8 quoted bytes
        let mut data = vec![0u8; 8 + 20 + 8];
        data[0] = TIME_EXCEEDED_V4;
        data[8] = 0x45; // version 4, IHL 5
        data[8 + 9] = 1; // protocol: icmp
        let quoted = &mut data[28..];
        quoted[0] = embedded_type;
        quoted[4..6].copy_from_slice(&id.to_be_bytes());
        quoted[6..8].copy_from_slice(&seq.to_be_bytes());
        data
    }

    #[test]
    fn parse_time_exceeded_v4_recovers_inner_echo() {
        let data = time_exceeded_v4(0x0a0b, 3, ECHO_REQUEST_V4);
        let msg = parse_message(Family::V4, &data).unwrap();
        assert_eq!(
            msg,
            IcmpMessage::TimeExceeded {
                original: Some(Echo { id: 0x0a0b, seq: 3 }),
            }
        );
    }

    #[test]
    fn parse_time_exceeded_v4_with_ip_options() {
        // IHL 6 shifts the quoted echo by four bytes.
        let mut data = vec![0u8; 8 + 24 + 8];
        data[0] = TIME_EXCEEDED_V4;
        data[8] = 0x46;
        data[8 + 9] = 1;
        let quoted = &mut data[8 + 24..];
        quoted[0] = ECHO_REQUEST_V4;
        quoted[4..6].copy_from_slice(&9u16.to_be_bytes());
        quoted[6..8].copy_from_slice(&11u16.to_be_bytes());

        let msg = parse_message(Family::V4, &data).unwrap();
        assert_eq!(
            msg,
            IcmpMessage::TimeExceeded {
                original: Some(Echo { id: 9, seq: 11 }),
            }
        );
    }

    #[test]
    fn parse_time_exceeded_ignores_non_echo_quote() {
        let data = time_exceeded_v4(1, 2, ECHO_REPLY_V4);
        let msg = parse_message(Family::V4, &data).unwrap();
        assert_eq!(msg, IcmpMessage::TimeExceeded { original: None });
    }

    #[test]
    fn parse_dest_unreachable_v6() {
        let mut data = vec![0u8; 8 + 40 + 8];
        data[0] = DEST_UNREACHABLE_V6;
        let quoted = &mut data[48..];
        quoted[0] = ECHO_REQUEST_V6;
        quoted[4..6].copy_from_slice(&5u16.to_be_bytes());
        quoted[6..8].copy_from_slice(&6u16.to_be_bytes());

        let msg = parse_message(Family::V6, &data).unwrap();
        assert_eq!(
            msg,
            IcmpMessage::DestinationUnreachable {
                original: Some(Echo { id: 5, seq: 6 }),
            }
        );
    }

    #[test]
    fn parse_unknown_type_is_other() {
        let mut data = vec![0u8; 8];
        data[0] = 13; // timestamp request
        data[1] = 0;
        let msg = parse_message(Family::V4, &data).unwrap();
        assert_eq!(
            msg,
            IcmpMessage::Other {
                icmp_type: 13,
                icmp_code: 0,
            }
        );
    }

    #[test]
    fn unmap_normalizes_mapped_addresses() {
        let mapped: IpAddr = "::ffff:192.0.2.1".parse().unwrap();
        assert_eq!(unmap(mapped), "192.0.2.1".parse::<IpAddr>().unwrap());
        assert_eq!(Family::of(mapped), Family::V4);

        let v6: IpAddr = "2001:db8::1".parse().unwrap();
        assert_eq!(unmap(v6), v6);
        assert_eq!(Family::of(v6), Family::V6);
    }
}
