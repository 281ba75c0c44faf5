use std::{net::Ipv4Addr, time::Duration};

use async_trait::async_trait;
use common::{AsyncICMPSocket, ICMPSocket};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, trace};

use super::{PacketFilter, Transport};
use crate::{codec::RawPacket, error::TransportError};

const RECV_BUFFER_LEN: usize = 65536;

/// A raw `IPPROTO_ICMP` socket. The client flavour sends bare ICMP messages
/// and lets the kernel add the IP header; the responder flavour sends whole
/// IPv4 datagrams so it controls both addresses.
pub struct RawTransport {
    socket: AsyncICMPSocket,
    header_included: bool,
}

impl RawTransport {
    pub fn client(interface: Option<&str>) -> Result<Self, TransportError> {
        Self::open(interface, false)
    }

    pub fn responder(interface: Option<&str>) -> Result<Self, TransportError> {
        Self::open(interface, true)
    }

    fn open(
        interface: Option<&str>,
        header_included: bool,
    ) -> Result<Self, TransportError> {
        let socket = ICMPSocket::new(interface, header_included)
            .map_err(|e| TransportError::from_open(e, interface))?;
        debug!(?interface, header_included, "opened raw ICMP socket");
        Ok(RawTransport {
            socket: AsyncICMPSocket::new(socket)?,
            header_included,
        })
    }

    pub fn header_included(&self) -> bool {
        self.header_included
    }
}

#[async_trait]
impl Transport for RawTransport {
    async fn send(
        &self,
        packet: &[u8],
        destination: Ipv4Addr,
    ) -> Result<(), TransportError> {
        let sent = self.socket.send_to(packet, destination).await?;
        trace!(%destination, bytes = sent, "sent datagram");
        Ok(())
    }

    async fn receive_one(
        &self,
        filter: &dyn PacketFilter,
        timeout: Duration,
    ) -> Result<Option<RawPacket>, TransportError> {
        let deadline = deadline_after(timeout);
        let mut buf = vec![0u8; RECV_BUFFER_LEN];
        loop {
            let len = match timeout_at(deadline, self.socket.read(&mut buf)).await
            {
                Err(_elapsed) => return Ok(None),
                Ok(read) => read?,
            };
            let packet = match RawPacket::parse(&buf[..len], Instant::now()) {
                Ok(packet) => packet,
                Err(e) => {
                    trace!(error = %e, "dropping unparseable datagram");
                    continue;
                }
            };
            if packet.is_icmp() && filter(&packet) {
                return Ok(Some(packet));
            }
        }
    }
}

/// `now + timeout`, saturating far in the future for huge timeouts.
pub(crate) fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .unwrap_or_else(|| now + Duration::from_secs(60 * 60 * 24 * 365))
}
