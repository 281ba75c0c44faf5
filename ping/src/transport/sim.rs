use std::{collections::VecDeque, io, net::Ipv4Addr, ops::Range, time::Duration};

use async_trait::async_trait;
use rand::Rng;
use tokio::{
    sync::Mutex,
    time::{sleep, sleep_until, Instant},
};

use super::{raw::deadline_after, PacketFilter, Transport};
use crate::{
    codec::{EchoKind, EchoPacket, RawPacket, DEFAULT_TTL, IPPROTO_ICMP},
    error::TransportError,
};

pub const DEFAULT_SIMULATED_RTT_MS: Range<f64> = 10.0..120.0;
pub const DEFAULT_SIMULATED_JITTER_MS: Range<f64> = 5.0..30.0;

struct Pending {
    echo: EchoPacket,
    destination: Ipv4Addr,
    sent_at: Instant,
}

/// Answers every echo request itself, without touching the network.
///
/// Each reply reports a round trip drawn from `rtt_ms`; delivering it takes
/// that long plus a scheduling jitter drawn from `jitter_ms`.
pub struct SimulatedTransport {
    outstanding: Mutex<VecDeque<Pending>>,
    rtt_ms: Range<f64>,
    jitter_ms: Range<f64>,
}

impl Default for SimulatedTransport {
    fn default() -> Self {
        Self::new(DEFAULT_SIMULATED_RTT_MS, DEFAULT_SIMULATED_JITTER_MS)
    }
}

impl SimulatedTransport {
    pub fn new(rtt_ms: Range<f64>, jitter_ms: Range<f64>) -> Self {
        SimulatedTransport {
            outstanding: Mutex::new(VecDeque::new()),
            rtt_ms,
            jitter_ms,
        }
    }

    fn draw(&self) -> (Duration, Duration) {
        let mut rng = rand::thread_rng();
        let mut pick = |range: &Range<f64>| {
            let ms = if range.is_empty() {
                range.start
            } else {
                rng.gen_range(range.clone())
            };
            ms.max(0.0)
        };
        let rtt = pick(&self.rtt_ms);
        let jitter = pick(&self.jitter_ms);
        (
            Duration::from_secs_f64(rtt / 1e3),
            Duration::from_secs_f64(jitter / 1e3),
        )
    }
}

#[async_trait]
impl Transport for SimulatedTransport {
    async fn send(
        &self,
        packet: &[u8],
        destination: Ipv4Addr,
    ) -> Result<(), TransportError> {
        let echo = EchoPacket::decode(packet).map_err(|e| {
            TransportError::Io(io::Error::new(io::ErrorKind::InvalidInput, e))
        })?;
        if echo.kind == EchoKind::Request {
            self.outstanding.lock().await.push_back(Pending {
                echo,
                destination,
                sent_at: Instant::now(),
            });
        }
        Ok(())
    }

    async fn receive_one(
        &self,
        filter: &dyn PacketFilter,
        timeout: Duration,
    ) -> Result<Option<RawPacket>, TransportError> {
        let deadline = deadline_after(timeout);
        let pending = self.outstanding.lock().await.pop_front();
        let Some(pending) = pending else {
            sleep_until(deadline).await;
            return Ok(None);
        };

        let (rtt, jitter) = self.draw();
        let delivered_at = pending.sent_at + rtt + jitter;
        if delivered_at > deadline {
            sleep_until(deadline).await;
            return Ok(None);
        }
        sleep_until(delivered_at).await;

        let packet = RawPacket {
            source: pending.destination,
            destination: Ipv4Addr::UNSPECIFIED,
            ttl: DEFAULT_TTL,
            protocol: IPPROTO_ICMP,
            icmp: pending.echo.reply().encode(),
            received_at: pending.sent_at + rtt,
        };
        if filter(&packet) {
            Ok(Some(packet))
        } else {
            sleep(deadline.saturating_duration_since(Instant::now())).await;
            Ok(None)
        }
    }
}
