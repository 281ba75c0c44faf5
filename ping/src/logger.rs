use common::Logging;
use ping::{
    client::ProbeResult,
    server::ResponderEvent,
};

#[derive(Debug, Logging, Clone, Default)]
pub struct PingResult {
    pub seq: u16,
    pub replied: bool,
    pub rtt: f64,
    pub ttl: u8,
    pub size: usize,
    pub src_addr: String,
    pub dst_addr: String,
}

impl PingResult {
    pub fn from_probe(result: &ProbeResult, dst_addr: &str) -> Self {
        match *result {
            ProbeResult::Replied {
                sequence,
                from,
                size,
                ttl,
                ..
            } => PingResult {
                seq: sequence,
                replied: true,
                rtt: result.rtt_ms().unwrap_or_default(),
                ttl,
                size,
                src_addr: from.to_string(),
                dst_addr: dst_addr.to_string(),
            },
            ProbeResult::TimedOut { sequence } => PingResult {
                seq: sequence,
                replied: false,
                dst_addr: dst_addr.to_string(),
                ..Default::default()
            },
        }
    }
}

#[derive(Debug, Logging, Clone, Default)]
pub struct EchoReplyResult {
    pub src_addr: String,
    pub identifier: u16,
    pub seq: u16,
    pub delay: f64,
}

impl From<&ResponderEvent> for EchoReplyResult {
    fn from(event: &ResponderEvent) -> Self {
        EchoReplyResult {
            src_addr: event.source.to_string(),
            identifier: event.identifier,
            seq: event.sequence,
            delay: event
                .delay
                .map(|d| d.as_secs_f64() * 1e3)
                .unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{net::Ipv4Addr, time::Duration};

    use super::*;

    #[test]
    fn probe_rows() {
        let replied = ProbeResult::Replied {
            sequence: 2,
            round_trip: Duration::from_micros(12_500),
            from: Ipv4Addr::new(10, 0, 0, 1),
            size: 64,
            ttl: 57,
        };
        let row = PingResult::from_probe(&replied, "10.0.0.1");
        assert_eq!(row.header(), "seq,replied,rtt,ttl,size,src_addr,dst_addr\n");
        assert_eq!(row.to_string(), "2,true,12.5,57,64,10.0.0.1,10.0.0.1\n");

        let lost = PingResult::from_probe(&ProbeResult::TimedOut { sequence: 3 }, "10.0.0.1");
        assert_eq!(lost.to_string(), "3,false,0,0,0,,10.0.0.1\n");
    }
}
