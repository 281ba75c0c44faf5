//! In-memory transport for engine tests.

use std::{
    collections::VecDeque,
    io,
    net::Ipv4Addr,
    sync::Mutex,
    time::Duration,
};

use async_trait::async_trait;
use tokio::time::{sleep_until, Instant};

use crate::{
    codec::{EchoKind, EchoPacket, RawPacket, DEFAULT_TTL, IPPROTO_ICMP},
    error::TransportError,
    transport::{PacketFilter, Transport},
};

pub const LOCAL: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 1);

/// What happens to the next echo request sent through a [`MockTransport`].
#[derive(Debug, Clone)]
pub enum Plan {
    /// A matching reply arrives after the given delay.
    Reply(Duration),
    /// No reply at all.
    Silent,
    /// `send` itself fails.
    Fail,
    /// Arbitrary replies; `None` fields copy the request.
    Custom(Vec<ScriptedReply>),
}

#[derive(Debug, Clone)]
pub struct ScriptedReply {
    pub after: Duration,
    pub identifier: Option<u16>,
    pub sequence: Option<u16>,
}

#[derive(Debug, Clone)]
pub struct Sent {
    pub bytes: Vec<u8>,
    pub destination: Ipv4Addr,
    pub at: Instant,
}

/// Replies to requests according to a script and delivers injected packets
/// at their `received_at` instant. Timing follows the tokio clock, so tests
/// run with `start_paused = true`.
#[derive(Default)]
pub struct MockTransport {
    plans: Mutex<VecDeque<Plan>>,
    /// Sorted by `received_at`.
    inbound: Mutex<Vec<RawPacket>>,
    sent: Mutex<Vec<Sent>>,
}

impl MockTransport {
    pub fn scripted(plans: impl IntoIterator<Item = Plan>) -> Self {
        MockTransport {
            plans: Mutex::new(plans.into_iter().collect()),
            ..Default::default()
        }
    }

    pub fn inject(&self, packet: RawPacket) {
        let mut inbound = self.inbound.lock().unwrap();
        let at = inbound.partition_point(|p| p.received_at <= packet.received_at);
        inbound.insert(at, packet);
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    fn answer(&self, request: &EchoPacket, from: Ipv4Addr, reply: &ScriptedReply) {
        let echo = EchoPacket {
            kind: EchoKind::Reply,
            identifier: reply.identifier.unwrap_or(request.identifier),
            sequence: reply.sequence.unwrap_or(request.sequence),
            payload: request.payload.clone(),
        };
        self.inject(RawPacket {
            source: from,
            destination: LOCAL,
            ttl: DEFAULT_TTL,
            protocol: IPPROTO_ICMP,
            icmp: echo.encode(),
            received_at: Instant::now() + reply.after,
        });
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(
        &self,
        packet: &[u8],
        destination: Ipv4Addr,
    ) -> Result<(), TransportError> {
        let plan = self.plans.lock().unwrap().pop_front();
        if let Some(Plan::Fail) = plan {
            return Err(TransportError::Io(io::Error::new(
                io::ErrorKind::Other,
                "network is unreachable",
            )));
        }
        self.sent.lock().unwrap().push(Sent {
            bytes: packet.to_vec(),
            destination,
            at: Instant::now(),
        });

        let Ok(request) = EchoPacket::decode(packet) else {
            return Ok(());
        };
        match plan {
            Some(Plan::Reply(after)) => self.answer(
                &request,
                destination,
                &ScriptedReply {
                    after,
                    identifier: None,
                    sequence: None,
                },
            ),
            Some(Plan::Custom(replies)) => {
                for reply in &replies {
                    self.answer(&request, destination, reply);
                }
            }
            Some(Plan::Silent) | Some(Plan::Fail) | None => {}
        }
        Ok(())
    }

    async fn receive_one(
        &self,
        filter: &dyn PacketFilter,
        timeout: Duration,
    ) -> Result<Option<RawPacket>, TransportError> {
        let deadline = Instant::now() + timeout;
        loop {
            let next = self.inbound.lock().unwrap().first().map(|p| p.received_at);
            match next {
                Some(at) if at <= deadline => {
                    sleep_until(at).await;
                    let packet = {
                        let mut inbound = self.inbound.lock().unwrap();
                        match inbound.first() {
                            Some(p) if p.received_at <= Instant::now() => {
                                Some(inbound.remove(0))
                            }
                            _ => None,
                        }
                    };
                    if let Some(packet) = packet {
                        if filter(&packet) {
                            return Ok(Some(packet));
                        }
                    }
                }
                _ => {
                    sleep_until(deadline).await;
                    return Ok(None);
                }
            }
        }
    }
}
