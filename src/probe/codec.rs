use std::fmt;

use pnet::packet::icmp::destination_unreachable::DestinationUnreachablePacket;
use pnet::packet::icmp::{checksum, IcmpCode, IcmpPacket, IcmpTypes};
use pnet::packet::icmpv6::{Icmpv6Code, Icmpv6Packet, Icmpv6Types};
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::ipv6::Ipv6Packet;
use pnet::packet::{MutablePacket, Packet};

/// ICMP Echo header size (type, code, checksum, identifier, sequence)
pub const ICMP_HEADER_SIZE: usize = 8;

/// Fixed IPv6 header length (RFC 8200; no IHL equivalent)
const IPV6_HEADER_SIZE: usize = 40;

/// Identifier, sequence and data of an ICMP Echo message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Echo {
    pub ident: u16,
    pub seq: u16,
    pub payload: Vec<u8>,
}

/// Reason carried by a Destination Unreachable message, by address family
/// and ICMP code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unreachable {
    V4(u8),
    V6(u8),
}

impl fmt::Display for Unreachable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // RFC 792
            Unreachable::V4(code) => match code {
                0 => write!(f, "net unreachable"),
                1 => write!(f, "host unreachable"),
                2 => write!(f, "protocol unreachable"),
                3 => write!(f, "port unreachable"),
                4 => write!(f, "fragmentation needed"),
                5 => write!(f, "source route failed"),
                13 => write!(f, "communication administratively prohibited"),
                code => write!(f, "destination unreachable (code {code})"),
            },
            // RFC 4443
            Unreachable::V6(code) => match code {
                0 => write!(f, "no route to destination"),
                1 => write!(f, "communication administratively prohibited"),
                2 => write!(f, "beyond scope of source address"),
                3 => write!(f, "address unreachable"),
                4 => write!(f, "port unreachable"),
                code => write!(f, "destination unreachable (code {code})"),
            },
        }
    }
}

/// A successfully decoded inbound message. Everything else is dropped.
#[derive(Debug)]
pub enum Incoming {
    /// Echo Reply carrying our identifier/sequence.
    Reply(Echo),
    /// Destination Unreachable embedding one of our Echo Requests.
    Unreachable { echo: Echo, reason: Unreachable },
}

/// Build a marshalled ICMP Echo Request.
///
/// The IPv4 checksum is computed here; for ICMPv6 the kernel fills in the
/// pseudo-header checksum on egress, so the field is left zero.
pub fn build_echo_request(v6: bool, ident: u16, seq: u16, payload: &[u8]) -> Vec<u8> {
    let mut buffer = vec![0u8; ICMP_HEADER_SIZE + payload.len()];

    if v6 {
        use pnet::packet::icmpv6::echo_request::MutableEchoRequestPacket;

        let mut packet = MutableEchoRequestPacket::new(&mut buffer).unwrap();
        packet.set_icmpv6_type(Icmpv6Types::EchoRequest);
        packet.set_icmpv6_code(Icmpv6Code::new(0));
        packet.set_identifier(ident);
        packet.set_sequence_number(seq);
        packet.payload_mut().copy_from_slice(payload);
    } else {
        use pnet::packet::icmp::echo_request::MutableEchoRequestPacket;

        let mut packet = MutableEchoRequestPacket::new(&mut buffer).unwrap();
        packet.set_icmp_type(IcmpTypes::EchoRequest);
        packet.set_icmp_code(IcmpCode::new(0));
        packet.set_identifier(ident);
        packet.set_sequence_number(seq);
        packet.payload_mut().copy_from_slice(payload);

        let sum = checksum(&IcmpPacket::new(&buffer).unwrap());
        let mut packet = MutableEchoRequestPacket::new(&mut buffer).unwrap();
        packet.set_checksum(sum);
    }

    buffer
}

/// Strip the IP header from a raw IPv4 ICMP datagram.
///
/// Raw IPv4 sockets deliver the IP header with every read; datagram ICMP
/// sockets and IPv6 sockets deliver the ICMP message directly.
pub fn strip_ipv4_header(data: &[u8]) -> Option<&[u8]> {
    let ip = Ipv4Packet::new(data)?;
    let header_len = (ip.get_header_length() as usize) * 4;
    if header_len < Ipv4Packet::minimum_packet_size() || data.len() < header_len {
        return None;
    }
    Some(&data[header_len..])
}

/// Decode an inbound ICMP message.
///
/// Returns None for any type other than Echo Reply / Destination
/// Unreachable and for anything that does not parse.
pub fn parse_incoming(v6: bool, data: &[u8]) -> Option<Incoming> {
    if v6 {
        parse_incoming_v6(data)
    } else {
        parse_incoming_v4(data)
    }
}

fn parse_incoming_v4(data: &[u8]) -> Option<Incoming> {
    use pnet::packet::icmp::{echo_reply, echo_request};

    let header = IcmpPacket::new(data)?;

    match header.get_icmp_type() {
        IcmpTypes::EchoReply => {
            let reply = echo_reply::EchoReplyPacket::new(data)?;
            Some(Incoming::Reply(Echo {
                ident: reply.get_identifier(),
                seq: reply.get_sequence_number(),
                payload: reply.payload().to_vec(),
            }))
        }
        IcmpTypes::DestinationUnreachable => {
            let unreach = DestinationUnreachablePacket::new(data)?;
            let reason = Unreachable::V4(unreach.get_icmp_code().0);

            // The body embeds the offending IP header plus the leading bytes
            // of the original ICMP message.
            let embedded = unreach.payload();
            let ip = Ipv4Packet::new(embedded)?;
            let header_len = (ip.get_header_length() as usize) * 4;
            if embedded.len() < header_len + ICMP_HEADER_SIZE {
                return None;
            }

            let original = echo_request::EchoRequestPacket::new(&embedded[header_len..])?;
            if original.get_icmp_type() != IcmpTypes::EchoRequest {
                return None;
            }

            Some(Incoming::Unreachable {
                echo: Echo {
                    ident: original.get_identifier(),
                    seq: original.get_sequence_number(),
                    payload: Vec::new(),
                },
                reason,
            })
        }
        _ => None,
    }
}

fn parse_incoming_v6(data: &[u8]) -> Option<Incoming> {
    use pnet::packet::icmpv6::{echo_reply, echo_request};

    let header = Icmpv6Packet::new(data)?;

    match header.get_icmpv6_type() {
        Icmpv6Types::EchoReply => {
            let reply = echo_reply::EchoReplyPacket::new(data)?;
            Some(Incoming::Reply(Echo {
                ident: reply.get_identifier(),
                seq: reply.get_sequence_number(),
                payload: reply.payload().to_vec(),
            }))
        }
        Icmpv6Types::DestinationUnreachable => {
            let reason = Unreachable::V6(header.get_icmpv6_code().0);

            // ICMPv6 error layout: 4-byte header, 4 unused bytes, then the
            // embedded packet. Icmpv6Packet::payload() starts at the unused
            // bytes.
            let body = header.payload();
            if body.len() < 4 {
                return None;
            }
            let embedded = &body[4..];

            // Validate the fixed-size inner header before skipping it.
            Ipv6Packet::new(embedded)?;
            if embedded.len() < IPV6_HEADER_SIZE + ICMP_HEADER_SIZE {
                return None;
            }

            let original = echo_request::EchoRequestPacket::new(&embedded[IPV6_HEADER_SIZE..])?;
            if original.get_icmpv6_type() != Icmpv6Types::EchoRequest {
                return None;
            }

            Some(Incoming::Unreachable {
                echo: Echo {
                    ident: original.get_identifier(),
                    seq: original.get_sequence_number(),
                    payload: Vec::new(),
                },
                reason,
            })
        }
        _ => None,
    }
}
