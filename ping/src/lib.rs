//! ICMP echo probing and responding over raw sockets.
//!
//! [`client::Pinger`] sends a bounded series of echo requests and turns the
//! answers into [`client::ProbeResult`]s and a [`client::ProbeSummary`].
//! [`server::Responder`] answers echo requests, each after an optional random
//! delay. Both sit on a [`transport::Transport`]; use
//! [`transport::RawTransport`] for the network or
//! [`transport::SimulatedTransport`] to run without privileges.

pub mod client;
pub mod codec;
pub mod error;
pub mod observer;
pub mod server;
pub mod transport;

#[cfg(test)]
mod testing;

pub use client::{Pinger, ProbeConfig, ProbeResult, ProbeRun, ProbeSummary};
pub use error::{MalformedPacket, PingError, TransportError};
pub use observer::{ChannelObserver, Event, Observer};
pub use server::{Responder, ResponderConfig, ResponderEvent};
