use std::net::Ipv4Addr;

use anyhow::Result;
use common::Logger;
use ping::{client::ProbeResult, observer::Event, ProbeSummary};
use tokio::sync::mpsc::UnboundedReceiver;

use crate::logger::{EchoReplyResult, PingResult};

/// Prints probe results as they arrive and the summary at the end, logging
/// every result to CSV when a logger is given. Returns once the engine side
/// of the channel is dropped.
pub async fn report_probes(
    mut events: UnboundedReceiver<Event>,
    target: Ipv4Addr,
    simulated: bool,
    json: bool,
    mut logger: Option<Logger<PingResult>>,
) -> Result<()> {
    let dst_addr = target.to_string();
    while let Some(event) = events.recv().await {
        match event {
            Event::Probe(result) => {
                println!("{}", format_probe(&result, simulated));
                if let Some(logger) = logger.as_mut() {
                    logger.log(&PingResult::from_probe(&result, &dst_addr)).await?;
                }
            }
            Event::Summary(summary) if json => {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            }
            Event::Summary(summary) => println!("{}", format_summary(&summary)),
            Event::Responder(_) => {}
        }
    }
    Ok(())
}

/// Prints one line per echo reply the responder sent.
pub async fn report_replies(
    mut events: UnboundedReceiver<Event>,
    mut logger: Option<Logger<EchoReplyResult>>,
) -> Result<()> {
    while let Some(event) = events.recv().await {
        if let Event::Responder(event) = event {
            let delay = event.delay.unwrap_or_default();
            println!(
                "Echo Reply sent to {} after {:.2}s delay",
                event.source,
                delay.as_secs_f64()
            );
            if let Some(logger) = logger.as_mut() {
                logger.log(&EchoReplyResult::from(&event)).await?;
            }
        }
    }
    Ok(())
}

pub fn format_probe(result: &ProbeResult, simulated: bool) -> String {
    match *result {
        ProbeResult::Replied {
            sequence,
            from,
            size,
            ttl,
            ..
        } => format!(
            "Reply from {}: bytes={} seq={} ttl={} time={:.2} ms{}",
            from,
            size,
            sequence,
            ttl,
            result.rtt_ms().unwrap_or_default(),
            if simulated { " (simulated)" } else { "" }
        ),
        ProbeResult::TimedOut { sequence } => {
            format!("Request timed out for seq={}", sequence)
        }
    }
}

pub fn format_summary(summary: &ProbeSummary) -> String {
    let mut out = format!(
        "\n--- Ping Statistics ---\nPackets: Sent = {}, Received = {}, Lost = {} \
         ({:.0}% loss)\n",
        summary.sent,
        summary.received,
        summary.lost(),
        summary.loss_percent
    );
    match &summary.rtt {
        Some(rtt) => out.push_str(&format!(
            "RTT (ms): min={:.2}, max={:.2}, avg={:.2}, mdev={:.2}",
            rtt.min_ms, rtt.max_ms, rtt.mean_ms, rtt.stddev_ms
        )),
        None => out.push_str("No replies received."),
    }
    out
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn probe_lines() {
        let replied = ProbeResult::Replied {
            sequence: 1,
            round_trip: Duration::from_micros(23_456),
            from: Ipv4Addr::new(8, 8, 8, 8),
            size: 64,
            ttl: 117,
        };
        assert_eq!(
            format_probe(&replied, false),
            "Reply from 8.8.8.8: bytes=64 seq=1 ttl=117 time=23.46 ms"
        );
        assert!(format_probe(&replied, true).ends_with("ms (simulated)"));
        assert_eq!(
            format_probe(&ProbeResult::TimedOut { sequence: 4 }, false),
            "Request timed out for seq=4"
        );
    }

    #[test]
    fn summary_block() {
        let results = [
            ProbeResult::Replied {
                sequence: 0,
                round_trip: Duration::from_millis(10),
                from: Ipv4Addr::LOCALHOST,
                size: 64,
                ttl: 64,
            },
            ProbeResult::TimedOut { sequence: 1 },
            ProbeResult::TimedOut { sequence: 2 },
        ];
        let text = format_summary(&ProbeSummary::from_results(&results));
        assert!(text.contains("Packets: Sent = 3, Received = 1, Lost = 2 (67% loss)"));
        assert!(text.contains("RTT (ms): min=10.00, max=10.00, avg=10.00"));

        let none = format_summary(&ProbeSummary::from_results(&results[1..]));
        assert!(none.ends_with("No replies received."));
    }
}
