//! Sending and receiving raw ICMP datagrams.
//!
//! [`Transport`] is the seam between the probe/responder engines and the
//! network. [`RawTransport`] talks to a raw socket, [`SimulatedTransport`]
//! answers every request itself with synthetic timing.

use std::{net::Ipv4Addr, time::Duration};

use async_trait::async_trait;

use crate::{codec::RawPacket, error::TransportError};

mod raw;
mod sim;

pub use raw::RawTransport;
pub use sim::SimulatedTransport;

/// Receive-side predicate. Only packets it accepts are returned.
pub trait PacketFilter: Fn(&RawPacket) -> bool + Send + Sync {}

impl<F> PacketFilter for F where F: Fn(&RawPacket) -> bool + Send + Sync {}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Transmits `packet` to `destination`. What `packet` holds (bare ICMP or
    /// a whole IPv4 datagram) depends on how the transport was opened.
    async fn send(
        &self,
        packet: &[u8],
        destination: Ipv4Addr,
    ) -> Result<(), TransportError>;

    /// Waits for the first ICMP packet accepted by `filter`. Returns
    /// `Ok(None)` once `timeout` has elapsed without one.
    async fn receive_one(
        &self,
        filter: &dyn PacketFilter,
        timeout: Duration,
    ) -> Result<Option<RawPacket>, TransportError>;
}
