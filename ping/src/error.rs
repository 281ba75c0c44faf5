use std::io;

use thiserror::Error;

/// Why an inbound buffer was rejected by the codec. Never fatal: the
/// offending packet is dropped and processing continues.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MalformedPacket {
    #[error("{len} bytes is too short for an ICMP header")]
    TooShort { len: usize },
    #[error("checksum {found:#06x} does not validate")]
    BadChecksum { found: u16 },
    #[error("ICMP type {icmp_type} code {code} is not an echo message")]
    NotEcho { icmp_type: u8, code: u8 },
    #[error("invalid IPv4 header: {0}")]
    BadIpHeader(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EncodeError {
    #[error("{len} byte ICMP message does not fit in an IPv4 datagram")]
    TooLarge { len: usize },
    #[error("could not write IPv4 header: {0}")]
    Header(String),
}

#[derive(Debug, Error)]
pub enum TransportError {
    /// The process may not open raw sockets. Fatal to the transport, not to
    /// the process.
    #[error(
        "permission denied opening a raw ICMP socket (run as root, grant \
         CAP_NET_RAW, or use --simulate)"
    )]
    PermissionDenied(#[source] io::Error),
    #[error("no such interface `{0}`")]
    NoSuchInterface(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl TransportError {
    /// Maps a socket construction failure, keeping privilege problems
    /// distinguishable from everything else.
    pub fn from_open(err: io::Error, interface: Option<&str>) -> Self {
        match (err.kind(), interface) {
            (io::ErrorKind::PermissionDenied, _) => {
                TransportError::PermissionDenied(err)
            }
            (io::ErrorKind::NotFound, Some(iface)) => {
                TransportError::NoSuchInterface(iface.to_string())
            }
            _ => TransportError::Io(err),
        }
    }
}

/// Session-level failures. These abort a probe run or responder before any
/// result is produced.
#[derive(Debug, Error)]
pub enum PingError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("could not resolve host `{host}`")]
    UnresolvedHost {
        host: String,
        #[source]
        source: io::Error,
    },
    #[error("host `{0}` has no IPv4 address (IPv6 is not supported)")]
    NoIpv4Address(String),
    #[error("responder is already listening")]
    AlreadyListening,
}

impl PingError {
    pub fn is_permission_denied(&self) -> bool {
        matches!(
            self,
            PingError::Transport(TransportError::PermissionDenied(_))
        )
    }
}
