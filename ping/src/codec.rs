//! ICMP Echo Request/Reply encoding and parsing.
//!
//! Everything that reads bytes in this module treats them as untrusted: a
//! malformed buffer produces a [`MalformedPacket`] error, never a panic.

use std::net::Ipv4Addr;

use etherparse::{
    IcmpEchoHeader, Icmpv4Header, Icmpv4Type, Ipv4Header, Ipv4HeaderSlice,
};
use tokio::time::Instant;

use crate::error::{EncodeError, MalformedPacket};

pub const ICMP_HEADER_LEN: usize = 8;
pub const IPPROTO_ICMP: u8 = 1;
pub const DEFAULT_TTL: u8 = 64;

const ICMP_ECHO_REPLY: u8 = 0;
const ICMP_ECHO_REQUEST: u8 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EchoKind {
    Request,
    Reply,
}

impl EchoKind {
    pub fn icmp_type(self) -> u8 {
        match self {
            EchoKind::Request => ICMP_ECHO_REQUEST,
            EchoKind::Reply => ICMP_ECHO_REPLY,
        }
    }
}

/// A well-formed ICMP echo message (header fields plus payload).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EchoPacket {
    pub kind: EchoKind,
    pub identifier: u16,
    pub sequence: u16,
    pub payload: Vec<u8>,
}

impl EchoPacket {
    pub fn request(identifier: u16, sequence: u16, payload: Vec<u8>) -> Self {
        EchoPacket {
            kind: EchoKind::Request,
            identifier,
            sequence,
            payload,
        }
    }

    /// The reply answering this message: same identifier, sequence and
    /// payload.
    pub fn reply(&self) -> Self {
        EchoPacket {
            kind: EchoKind::Reply,
            identifier: self.identifier,
            sequence: self.sequence,
            payload: self.payload.clone(),
        }
    }

    /// ICMP header plus payload, checksum filled in.
    pub fn encode(&self) -> Vec<u8> {
        let echo = IcmpEchoHeader {
            id: self.identifier,
            seq: self.sequence,
        };
        let icmp_type = match self.kind {
            EchoKind::Request => Icmpv4Type::EchoRequest(echo),
            EchoKind::Reply => Icmpv4Type::EchoReply(echo),
        };
        let header = Icmpv4Header::with_checksum(icmp_type, &self.payload);
        [header.to_bytes().as_slice(), self.payload.as_slice()].concat()
    }

    /// Encodes the message inside an IPv4 header carrying the given
    /// addresses, for sockets that send with `IP_HDRINCL`.
    pub fn encode_ipv4(
        &self,
        source: Ipv4Addr,
        destination: Ipv4Addr,
        ttl: u8,
    ) -> Result<Vec<u8>, EncodeError> {
        let icmp = self.encode();
        let len = u16::try_from(icmp.len())
            .ok()
            .filter(|len| usize::from(*len) + 20 <= usize::from(u16::MAX))
            .ok_or(EncodeError::TooLarge { len: icmp.len() })?;
        let header = Ipv4Header::new(
            len,
            ttl,
            IPPROTO_ICMP,
            source.octets(),
            destination.octets(),
        );
        let mut datagram = Vec::with_capacity(header.header_len() + icmp.len());
        header
            .write(&mut datagram)
            .map_err(|e| EncodeError::Header(format!("{:?}", e)))?;
        datagram.extend_from_slice(&icmp);
        Ok(datagram)
    }

    pub fn decode(bytes: &[u8]) -> Result<EchoPacket, MalformedPacket> {
        if bytes.len() < ICMP_HEADER_LEN {
            return Err(MalformedPacket::TooShort { len: bytes.len() });
        }
        if internet_checksum(bytes) != 0 {
            return Err(MalformedPacket::BadChecksum {
                found: u16::from_be_bytes([bytes[2], bytes[3]]),
            });
        }
        let (icmp_type, code) = (bytes[0], bytes[1]);
        if code != 0
            || (icmp_type != ICMP_ECHO_REQUEST && icmp_type != ICMP_ECHO_REPLY)
        {
            return Err(MalformedPacket::NotEcho { icmp_type, code });
        }

        let (header, payload) = Icmpv4Header::from_slice(bytes)
            .map_err(|_| MalformedPacket::TooShort { len: bytes.len() })?;
        let (kind, echo) = match header.icmp_type {
            Icmpv4Type::EchoRequest(echo) => (EchoKind::Request, echo),
            Icmpv4Type::EchoReply(echo) => (EchoKind::Reply, echo),
            _ => return Err(MalformedPacket::NotEcho { icmp_type, code }),
        };
        Ok(EchoPacket {
            kind,
            identifier: echo.id,
            sequence: echo.seq,
            payload: payload.to_vec(),
        })
    }
}

/// One's-complement sum of 16-bit big-endian words, complemented. An odd
/// trailing byte is padded with zero. Over a message that carries a correct
/// checksum the result is 0.
pub fn internet_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut words = data.chunks_exact(2);
    for word in &mut words {
        sum += u32::from(u16::from_be_bytes([word[0], word[1]]));
    }
    if let [last] = words.remainder() {
        sum += u32::from(*last) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// A datagram read off a raw socket, split into the IPv4 fields the engine
/// needs and the ICMP bytes that follow the header.
#[derive(Debug, Clone)]
pub struct RawPacket {
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
    pub ttl: u8,
    pub protocol: u8,
    pub icmp: Vec<u8>,
    pub received_at: Instant,
}

impl RawPacket {
    pub fn parse(
        datagram: &[u8],
        received_at: Instant,
    ) -> Result<RawPacket, MalformedPacket> {
        let header = Ipv4HeaderSlice::from_slice(datagram)
            .map_err(|e| MalformedPacket::BadIpHeader(format!("{:?}", e)))?;
        let header_len = header.slice().len();
        Ok(RawPacket {
            source: header.source_addr(),
            destination: header.destination_addr(),
            ttl: header.ttl(),
            protocol: header.protocol(),
            icmp: datagram[header_len..].to_vec(),
            received_at,
        })
    }

    pub fn is_icmp(&self) -> bool {
        self.protocol == IPPROTO_ICMP
    }

    pub fn echo(&self) -> Result<EchoPacket, MalformedPacket> {
        EchoPacket::decode(&self.icmp)
    }
}

/// An outstanding probe, owned by the client engine until it is answered or
/// times out.
#[derive(Debug, Clone)]
pub struct EchoRequest {
    pub identifier: u16,
    pub sequence: u16,
    pub destination: Ipv4Addr,
    pub sent_at: Instant,
}

/// A decoded echo reply together with where and when it arrived.
#[derive(Debug, Clone)]
pub struct EchoReply {
    pub identifier: u16,
    pub sequence: u16,
    pub source: Ipv4Addr,
    pub ttl: u8,
    pub size: usize,
    pub received_at: Instant,
}

impl EchoReply {
    /// Decodes `packet` as an echo reply. Echo requests are rejected as
    /// `NotEcho` since they can never answer a probe.
    pub fn from_packet(packet: &RawPacket) -> Result<EchoReply, MalformedPacket> {
        let echo = packet.echo()?;
        if echo.kind != EchoKind::Reply {
            return Err(MalformedPacket::NotEcho {
                icmp_type: echo.kind.icmp_type(),
                code: 0,
            });
        }
        Ok(EchoReply {
            identifier: echo.identifier,
            sequence: echo.sequence,
            source: packet.source,
            ttl: packet.ttl,
            size: packet.icmp.len(),
            received_at: packet.received_at,
        })
    }
}
