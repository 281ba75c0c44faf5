use std::{mem, net::Ipv4Addr, ops::Range, sync::Arc, time::Duration};

use rand::Rng;
use tokio::{task::JoinHandle, time::sleep};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, trace, warn};

use crate::{
    codec::{EchoKind, RawPacket, DEFAULT_TTL},
    error::PingError,
    observer::Observer,
    transport::Transport,
};

pub const DEFAULT_DELAY_RANGE: Range<Duration> =
    Duration::ZERO..Duration::from_millis(500);

/// How long one listen call blocks before re-checking for a stop request.
const LISTEN_POLL: Duration = Duration::from_millis(250);
const RECEIVE_ERROR_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct ResponderConfig {
    /// Each reply is held back by a delay drawn uniformly from this range.
    /// `None` replies at once.
    pub delay: Option<Range<Duration>>,
    /// TTL of the IPv4 header carrying each reply.
    pub ttl: u8,
}

impl Default for ResponderConfig {
    fn default() -> Self {
        ResponderConfig {
            delay: Some(DEFAULT_DELAY_RANGE),
            ttl: DEFAULT_TTL,
        }
    }
}

/// Emitted once for every echo reply the responder sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponderEvent {
    pub source: Ipv4Addr,
    pub identifier: u16,
    pub sequence: u16,
    pub delay: Option<Duration>,
}

enum State {
    Stopped,
    Listening {
        cancel: CancellationToken,
        listener: JoinHandle<()>,
    },
}

/// Answers inbound echo requests until stopped. Every request is delayed
/// and answered in its own task, so a long delay never holds up the next
/// request.
pub struct Responder<T> {
    transport: Arc<T>,
    config: Arc<ResponderConfig>,
    observer: Arc<dyn Observer>,
    state: State,
    replies: TaskTracker,
}

impl<T: Transport + 'static> Responder<T> {
    pub fn new(
        transport: T,
        config: ResponderConfig,
        observer: Arc<dyn Observer>,
    ) -> Self {
        Responder {
            transport: Arc::new(transport),
            config: Arc::new(config),
            observer,
            state: State::Stopped,
            replies: TaskTracker::new(),
        }
    }

    pub fn is_listening(&self) -> bool {
        matches!(self.state, State::Listening { .. })
    }

    /// Starts the background listener.
    pub fn start(&mut self) -> Result<(), PingError> {
        if self.is_listening() {
            return Err(PingError::AlreadyListening);
        }
        let cancel = CancellationToken::new();
        self.replies.reopen();
        let listener = tokio::spawn(listen(
            self.transport.clone(),
            self.config.clone(),
            self.observer.clone(),
            cancel.clone(),
            self.replies.clone(),
        ));
        self.state = State::Listening { cancel, listener };
        info!(delay = ?self.config.delay, "ICMP responder listening");
        Ok(())
    }

    /// Stops the listener. Once this returns no further request is
    /// dispatched; replies already scheduled still go out (see
    /// [`wait_for_replies`](Self::wait_for_replies)). Does nothing when
    /// already stopped.
    pub async fn stop(&mut self) {
        let State::Listening { cancel, listener } =
            mem::replace(&mut self.state, State::Stopped)
        else {
            return;
        };
        cancel.cancel();
        if let Err(e) = listener.await {
            warn!(error = %e, "responder listener ended abnormally");
        }
        self.replies.close();
        info!(in_flight = self.replies.len(), "ICMP responder stopped");
    }

    /// Waits for every reply task to finish. Only returns after
    /// [`stop`](Self::stop).
    pub async fn wait_for_replies(&self) {
        self.replies.wait().await;
    }
}

impl<T> Drop for Responder<T> {
    fn drop(&mut self) {
        if let State::Listening { cancel, .. } = &self.state {
            cancel.cancel();
        }
    }
}

async fn listen<T: Transport + 'static>(
    transport: Arc<T>,
    config: Arc<ResponderConfig>,
    observer: Arc<dyn Observer>,
    cancel: CancellationToken,
    replies: TaskTracker,
) {
    let is_icmp = |packet: &RawPacket| packet.is_icmp();
    loop {
        let received = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            received = transport.receive_one(&is_icmp, LISTEN_POLL) => received,
        };
        if cancel.is_cancelled() {
            break;
        }
        match received {
            Ok(Some(packet)) => {
                handle_packet(packet, &transport, &config, &observer, &replies)
            }
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "failed to receive");
                sleep(RECEIVE_ERROR_BACKOFF).await;
            }
        }
    }
    debug!("responder listener exited");
}

fn handle_packet<T: Transport + 'static>(
    packet: RawPacket,
    transport: &Arc<T>,
    config: &Arc<ResponderConfig>,
    observer: &Arc<dyn Observer>,
    replies: &TaskTracker,
) {
    let request = match packet.echo() {
        Ok(echo) if echo.kind == EchoKind::Request => echo,
        Ok(_) => return,
        Err(e) => {
            trace!(from = %packet.source, error = %e, "ignoring packet");
            return;
        }
    };
    let delay = config.delay.as_ref().map(random_delay);

    let transport = transport.clone();
    let config = config.clone();
    let observer = observer.clone();
    replies.spawn(async move {
        if let Some(delay) = delay {
            sleep(delay).await;
        }
        let datagram = match request.reply().encode_ipv4(
            packet.destination,
            packet.source,
            config.ttl,
        ) {
            Ok(datagram) => datagram,
            Err(e) => {
                warn!(to = %packet.source, error = %e, "could not build reply");
                return;
            }
        };
        if let Err(e) = transport.send(&datagram, packet.source).await {
            warn!(to = %packet.source, error = %e, "failed to send echo reply");
            return;
        }
        info!(
            to = %packet.source,
            identifier = request.identifier,
            sequence = request.sequence,
            delay_ms = delay.map(|d| d.as_millis() as u64),
            "echo reply sent"
        );
        observer.on_responder_event(&ResponderEvent {
            source: packet.source,
            identifier: request.identifier,
            sequence: request.sequence,
            delay,
        });
    });
}

fn random_delay(range: &Range<Duration>) -> Duration {
    if range.is_empty() {
        range.start
    } else {
        rand::thread_rng().gen_range(range.clone())
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::Instant;

    use super::*;
    use crate::{
        codec::{EchoPacket, IPPROTO_ICMP},
        observer::{ChannelObserver, Event},
        testing::MockTransport,
    };

    const CLIENT: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
    const SERVER: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);

    fn request_at(identifier: u16, sequence: u16, at: Instant) -> RawPacket {
        let datagram = EchoPacket::request(identifier, sequence, vec![7; 12])
            .encode_ipv4(CLIENT, SERVER, 64)
            .unwrap();
        RawPacket::parse(&datagram, at).unwrap()
    }

    fn no_delay() -> ResponderConfig {
        ResponderConfig {
            delay: None,
            ..Default::default()
        }
    }

    async fn run_for(responder: &mut Responder<MockTransport>, how_long: Duration) {
        responder.start().unwrap();
        sleep(how_long).await;
        responder.stop().await;
        responder.wait_for_replies().await;
    }

    #[tokio::test(start_paused = true)]
    async fn replies_with_swapped_addresses() {
        let transport = MockTransport::default();
        transport.inject(request_at(77, 3, Instant::now() + Duration::from_millis(10)));
        let (observer, mut events) = ChannelObserver::new();
        let mut responder = Responder::new(transport, no_delay(), Arc::new(observer));

        run_for(&mut responder, Duration::from_millis(100)).await;

        let sent = responder.transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].destination, CLIENT);
        let reply = RawPacket::parse(&sent[0].bytes, Instant::now()).unwrap();
        assert_eq!(reply.protocol, IPPROTO_ICMP);
        assert_eq!((reply.source, reply.destination), (SERVER, CLIENT));
        let echo = reply.echo().unwrap();
        assert_eq!(echo.kind, EchoKind::Reply);
        assert_eq!((echo.identifier, echo.sequence), (77, 3));
        assert_eq!(echo.payload, vec![7; 12]);

        match events.try_recv() {
            Ok(Event::Responder(event)) => assert_eq!(
                event,
                ResponderEvent {
                    source: CLIENT,
                    identifier: 77,
                    sequence: 3,
                    delay: None,
                }
            ),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn ignores_everything_but_requests() {
        let transport = MockTransport::default();
        let at = Instant::now() + Duration::from_millis(5);
        let mut reply = request_at(1, 1, at);
        reply.icmp = EchoPacket::request(1, 1, Vec::new()).reply().encode();
        transport.inject(reply);
        let mut corrupt = request_at(2, 2, at);
        corrupt.icmp[6] ^= 0x01;
        transport.inject(corrupt);
        let mut truncated = request_at(3, 3, at);
        truncated.icmp.truncate(4);
        transport.inject(truncated);

        let mut responder = Responder::new(transport, no_delay(), Arc::new(()));
        run_for(&mut responder, Duration::from_millis(100)).await;

        assert!(responder.transport.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn delays_do_not_serialize() {
        let transport = MockTransport::default();
        let start = Instant::now();
        for seq in 0..4 {
            transport.inject(request_at(9, seq, start + Duration::from_millis(u64::from(seq))));
        }
        let config = ResponderConfig {
            delay: Some(Duration::from_millis(300)..Duration::from_millis(301)),
            ..Default::default()
        };
        let mut responder = Responder::new(transport, config, Arc::new(()));
        run_for(&mut responder, Duration::from_millis(1000)).await;

        let sent = responder.transport.sent();
        assert_eq!(sent.len(), 4);
        for sent in &sent {
            let elapsed = sent.at - start;
            assert!(elapsed >= Duration::from_millis(300), "{:?}", elapsed);
            assert!(elapsed < Duration::from_millis(400), "{:?}", elapsed);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_replies_finish_after_stop() {
        let transport = MockTransport::default();
        transport.inject(request_at(5, 0, Instant::now()));
        let config = ResponderConfig {
            delay: Some(Duration::from_millis(400)..Duration::from_millis(450)),
            ..Default::default()
        };
        let mut responder = Responder::new(transport, config, Arc::new(()));
        responder.start().unwrap();
        sleep(Duration::from_millis(50)).await;
        responder.stop().await;
        assert!(responder.transport.sent().is_empty());

        responder.wait_for_replies().await;
        assert_eq!(responder.transport.sent().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn nothing_dispatched_after_stop() {
        let transport = MockTransport::default();
        transport.inject(request_at(4, 0, Instant::now() + Duration::from_secs(1)));
        let mut responder = Responder::new(transport, no_delay(), Arc::new(()));

        run_for(&mut responder, Duration::from_millis(500)).await;
        sleep(Duration::from_secs(2)).await;

        assert!(!responder.is_listening());
        assert!(responder.transport.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn start_stop_lifecycle() {
        let mut responder =
            Responder::new(MockTransport::default(), no_delay(), Arc::new(()));
        responder.stop().await;
        assert!(!responder.is_listening());

        responder.start().unwrap();
        assert!(matches!(responder.start(), Err(PingError::AlreadyListening)));
        responder.stop().await;
        responder.stop().await;
        assert!(!responder.is_listening());

        responder.start().unwrap();
        assert!(responder.is_listening());
        responder.stop().await;
        responder.wait_for_replies().await;
    }

    #[test]
    fn random_delay_stays_in_range() {
        for _ in 0..100 {
            let delay = random_delay(&DEFAULT_DELAY_RANGE);
            assert!(delay < Duration::from_millis(500));
        }
        let empty = Duration::from_millis(5)..Duration::from_millis(5);
        assert_eq!(random_delay(&empty), Duration::from_millis(5));
    }
}
