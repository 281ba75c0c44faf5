//! Push notifications out of the engines.
//!
//! Observers are called inline from the engine, so an implementation must
//! return immediately. Anything slow (printing, file I/O, a GUI) should sit
//! behind a [`ChannelObserver`] and drain the channel in its own task.

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::{
    client::{ProbeResult, ProbeSummary},
    server::ResponderEvent,
};

pub trait Observer: Send + Sync {
    fn on_probe_result(&self, _result: &ProbeResult) {}
    fn on_probe_summary(&self, _summary: &ProbeSummary) {}
    fn on_responder_event(&self, _event: &ResponderEvent) {}
}

/// Observes nothing.
impl Observer for () {}

#[derive(Debug, Clone)]
pub enum Event {
    Probe(ProbeResult),
    Summary(ProbeSummary),
    Responder(ResponderEvent),
}

/// Buffers every notification in an unbounded channel. Sending never blocks;
/// events are dropped once the receiver is gone.
#[derive(Clone)]
pub struct ChannelObserver {
    tx: UnboundedSender<Event>,
}

impl ChannelObserver {
    pub fn new() -> (Self, UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ChannelObserver { tx }, rx)
    }

    fn push(&self, event: Event) {
        let _ = self.tx.send(event);
    }
}

impl Observer for ChannelObserver {
    fn on_probe_result(&self, result: &ProbeResult) {
        self.push(Event::Probe(result.clone()));
    }

    fn on_probe_summary(&self, summary: &ProbeSummary) {
        self.push(Event::Summary(summary.clone()));
    }

    fn on_responder_event(&self, event: &ResponderEvent) {
        self.push(Event::Responder(event.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_observer_survives_dropped_receiver() {
        let (observer, rx) = ChannelObserver::new();
        drop(rx);
        observer.on_probe_result(&ProbeResult::TimedOut { sequence: 0 });
    }

    #[test]
    fn channel_observer_keeps_order() {
        let (observer, mut rx) = ChannelObserver::new();
        for sequence in 0..3 {
            observer.on_probe_result(&ProbeResult::TimedOut { sequence });
        }
        for expected in 0..3 {
            match rx.try_recv() {
                Ok(Event::Probe(result)) => assert_eq!(result.sequence(), expected),
                other => panic!("unexpected {:?}", other),
            }
        }
    }
}
