use std::{
    net::{IpAddr, Ipv4Addr},
    time::Duration,
};

use common::Statistics;
use serde::Serialize;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{
    codec::{EchoPacket, EchoReply, EchoRequest, RawPacket},
    error::PingError,
    observer::Observer,
    transport::Transport,
};

/// Probe count when driven from a script or the command line.
pub const DEFAULT_SCRIPTED_COUNT: u16 = 4;
/// Probe count for interactive front ends.
pub const DEFAULT_INTERACTIVE_COUNT: u16 = 10;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_PAYLOAD_LEN: usize = 56;

/// Which replies may answer the probe currently in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplyMatching {
    /// The first reply carrying our identifier wins, whatever its sequence.
    /// A late reply to an earlier probe can be credited to the current one.
    IdentifierOnly,
    /// Identifier and sequence number must both match.
    #[default]
    IdentifierAndSequence,
}

#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub count: u16,
    pub timeout: Duration,
    /// Pause between the end of one probe and the start of the next.
    pub interval: Option<Duration>,
    pub stop_on_reply: bool,
    pub payload_len: usize,
    pub matching: ReplyMatching,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        ProbeConfig {
            count: DEFAULT_SCRIPTED_COUNT,
            timeout: DEFAULT_TIMEOUT,
            interval: Some(DEFAULT_INTERVAL),
            stop_on_reply: false,
            payload_len: DEFAULT_PAYLOAD_LEN,
            matching: ReplyMatching::default(),
        }
    }
}

impl ProbeConfig {
    pub fn interactive() -> Self {
        ProbeConfig {
            count: DEFAULT_INTERACTIVE_COUNT,
            ..Default::default()
        }
    }
}

/// The outcome of one echo request.
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeResult {
    Replied {
        sequence: u16,
        round_trip: Duration,
        from: Ipv4Addr,
        /// ICMP header and payload, in bytes.
        size: usize,
        ttl: u8,
    },
    TimedOut {
        sequence: u16,
    },
}

impl ProbeResult {
    pub fn sequence(&self) -> u16 {
        match *self {
            ProbeResult::Replied { sequence, .. } => sequence,
            ProbeResult::TimedOut { sequence } => sequence,
        }
    }

    pub fn round_trip(&self) -> Option<Duration> {
        match *self {
            ProbeResult::Replied { round_trip, .. } => Some(round_trip),
            ProbeResult::TimedOut { .. } => None,
        }
    }

    pub fn rtt_ms(&self) -> Option<f64> {
        self.round_trip().map(millis)
    }

    pub fn is_reply(&self) -> bool {
        matches!(self, ProbeResult::Replied { .. })
    }
}

fn millis(duration: Duration) -> f64 {
    duration.as_nanos() as f64 / 1e6
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RttSummary {
    pub min_ms: f64,
    pub max_ms: f64,
    pub mean_ms: f64,
    pub stddev_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeSummary {
    pub sent: u32,
    pub received: u32,
    pub loss_percent: f64,
    /// Only present when at least one probe was answered.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rtt: Option<RttSummary>,
}

impl ProbeSummary {
    pub fn from_results(results: &[ProbeResult]) -> Self {
        let mut stats = Statistics::new();
        for rtt in results.iter().filter_map(ProbeResult::rtt_ms) {
            stats.update(rtt);
        }
        let sent = results.len() as u32;
        let received = stats.samples() as u32;
        let loss_percent = if sent == 0 {
            0.0
        } else {
            f64::from(sent - received) / f64::from(sent) * 100.0
        };
        let rtt = (received > 0).then(|| RttSummary {
            min_ms: stats.min(),
            max_ms: stats.max(),
            mean_ms: stats.mean(),
            stddev_ms: stats.standard_deviation(),
        });
        ProbeSummary {
            sent,
            received,
            loss_percent,
            rtt,
        }
    }

    pub fn lost(&self) -> u32 {
        self.sent - self.received
    }
}

/// Everything a finished session produced.
#[derive(Debug, Clone)]
pub struct ProbeRun {
    pub results: Vec<ProbeResult>,
    pub summary: ProbeSummary,
}

/// Resolves `host` to the IPv4 address that will be probed.
pub async fn resolve_target(host: &str) -> Result<Ipv4Addr, PingError> {
    if let Ok(addr) = host.parse::<IpAddr>() {
        return match addr {
            IpAddr::V4(addr) => Ok(addr),
            IpAddr::V6(_) => Err(PingError::NoIpv4Address(host.to_string())),
        };
    }
    let mut addrs = tokio::net::lookup_host((host, 0)).await.map_err(|source| {
        PingError::UnresolvedHost {
            host: host.to_string(),
            source,
        }
    })?;
    addrs
        .find_map(|addr| match addr.ip() {
            IpAddr::V4(addr) => Some(addr),
            IpAddr::V6(_) => None,
        })
        .ok_or_else(|| PingError::NoIpv4Address(host.to_string()))
}

/// Runs probe sessions over one transport. Probes are strictly serial: one
/// request is outstanding at a time.
pub struct Pinger<T> {
    transport: T,
    config: ProbeConfig,
    /// Identifier of ICMP packets (This is random by default)
    identifier: u16,
}

impl<T: Transport> Pinger<T> {
    pub fn new(transport: T, config: ProbeConfig) -> Self {
        Pinger {
            transport,
            config,
            identifier: rand::random::<u16>(),
        }
    }

    pub fn with_identifier(mut self, identifier: u16) -> Self {
        self.identifier = identifier;
        self
    }

    pub fn identifier(&self) -> u16 {
        self.identifier
    }

    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    /// Probes `target` up to `count` times and returns one result per
    /// request sent, in sequence order.
    ///
    /// `stop` is checked before every probe and interrupts the pause between
    /// probes. A probe already waiting for its reply runs to completion, so
    /// cancelling takes at most one probe timeout.
    pub async fn run_probe(
        &self,
        target: Ipv4Addr,
        stop: &CancellationToken,
        observer: &dyn Observer,
    ) -> Vec<ProbeResult> {
        let payload = payload_pattern(self.config.payload_len);
        let mut results = Vec::with_capacity(usize::from(self.config.count));

        for sequence in 0..self.config.count {
            if stop.is_cancelled() {
                debug!(sequence, "probe session cancelled");
                break;
            }

            let result = self.probe_once(target, sequence, &payload).await;
            observer.on_probe_result(&result);
            let replied = result.is_reply();
            results.push(result);

            if replied && self.config.stop_on_reply {
                debug!(sequence, "stopping after first reply");
                break;
            }
            if sequence + 1 == self.config.count {
                break;
            }
            if let Some(interval) = self.config.interval {
                tokio::select! {
                    _ = stop.cancelled() => {
                        debug!(sequence, "probe session cancelled");
                        break;
                    }
                    _ = sleep(interval) => {}
                }
            }
        }
        results
    }

    /// [`run_probe`](Self::run_probe) followed by the summary, which is also
    /// handed to the observer.
    pub async fn run(
        &self,
        target: Ipv4Addr,
        stop: &CancellationToken,
        observer: &dyn Observer,
    ) -> ProbeRun {
        let results = self.run_probe(target, stop, observer).await;
        let summary = ProbeSummary::from_results(&results);
        observer.on_probe_summary(&summary);
        ProbeRun { results, summary }
    }

    async fn probe_once(
        &self,
        target: Ipv4Addr,
        sequence: u16,
        payload: &[u8],
    ) -> ProbeResult {
        let packet =
            EchoPacket::request(self.identifier, sequence, payload.to_vec())
                .encode();
        let request = EchoRequest {
            identifier: self.identifier,
            sequence,
            destination: target,
            sent_at: Instant::now(),
        };
        if let Err(e) = self.transport.send(&packet, target).await {
            warn!(sequence, %target, error = %e, "failed to send echo request");
            return ProbeResult::TimedOut { sequence };
        }

        let identifier = request.identifier;
        let matching = self.config.matching;
        let accepts = move |packet: &RawPacket| match EchoReply::from_packet(packet)
        {
            Ok(reply) => {
                reply.identifier == identifier
                    && (matching == ReplyMatching::IdentifierOnly
                        || reply.sequence == sequence)
            }
            Err(e) => {
                trace!(from = %packet.source, error = %e, "ignoring packet");
                false
            }
        };

        let packet = match self
            .transport
            .receive_one(&accepts, self.config.timeout)
            .await
        {
            Ok(Some(packet)) => packet,
            Ok(None) => return ProbeResult::TimedOut { sequence },
            Err(e) => {
                warn!(sequence, error = %e, "failed to receive echo reply");
                return ProbeResult::TimedOut { sequence };
            }
        };
        match EchoReply::from_packet(&packet) {
            Ok(reply) => ProbeResult::Replied {
                sequence: request.sequence,
                round_trip: reply
                    .received_at
                    .saturating_duration_since(request.sent_at),
                from: reply.source,
                size: reply.size,
                ttl: reply.ttl,
            },
            Err(_) => ProbeResult::TimedOut { sequence },
        }
    }
}

fn payload_pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| i as u8).collect()
}
