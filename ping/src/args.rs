use clap::{Args, Parser, Subcommand};

use ping::client::{
    DEFAULT_PAYLOAD_LEN, DEFAULT_SCRIPTED_COUNT, DEFAULT_TIMEOUT,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Opts {
    #[command(subcommand)]
    pub mode: Modes,
}

#[derive(Subcommand, Debug)]
pub enum Modes {
    /// Send ICMP echo requests to a host and report round-trip times
    #[command(arg_required_else_help = true)]
    Client(ClientOpts),

    /// Answer ICMP echo requests until interrupted
    Server(ServerOpts),
}

#[derive(Args, Clone, Debug)]
pub struct CommonOpts {
    /// Interface to bind to
    #[arg(long, short)]
    pub iface: Option<String>,
    /// Write one CSV line per result to this file
    #[arg(long, short)]
    pub file: Option<String>,
}

#[derive(Args, Clone, Debug)]
pub struct ClientOpts {
    #[command(flatten)]
    pub common_opts: CommonOpts,
    /// Host name or IPv4 address to ping
    pub host: String,
    /// number of packets to send
    #[arg(long, short, default_value_t = DEFAULT_SCRIPTED_COUNT)]
    pub count: u16,
    /// seconds to wait for each reply
    #[arg(long, short, default_value_t = DEFAULT_TIMEOUT.as_secs_f64())]
    pub timeout: f64,
    /// seconds between packets (0 disables the pause)
    #[arg(long, default_value_t = 1.0)]
    pub interval: f64,
    /// length of the payload
    #[arg(long, short, default_value_t = DEFAULT_PAYLOAD_LEN)]
    pub len: usize,
    /// Stop as soon as one reply has been received
    #[arg(long)]
    pub stop_on_reply: bool,
    /// Do not touch the network; synthesize replies instead
    #[arg(long)]
    pub simulate: bool,
    /// Accept any reply carrying our identifier, even one answering an
    /// earlier sequence number
    #[arg(long)]
    pub match_identifier_only: bool,
    /// Print the summary as JSON instead of text
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Clone, Debug)]
pub struct ServerOpts {
    #[command(flatten)]
    pub common_opts: CommonOpts,
    /// Smallest random reply delay in milliseconds
    #[arg(long, default_value_t = 0)]
    pub min_delay: u64,
    /// Largest random reply delay in milliseconds (exclusive)
    #[arg(long, default_value_t = 500)]
    pub max_delay: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_defaults() {
        let opts = Opts::try_parse_from(["ping", "client", "example.com"]).unwrap();
        let Modes::Client(client) = opts.mode else {
            panic!("expected client mode");
        };
        assert_eq!(client.host, "example.com");
        assert_eq!(client.count, 4);
        assert_eq!(client.timeout, 2.0);
        assert_eq!(client.interval, 1.0);
        assert_eq!(client.len, 56);
        assert!(!client.stop_on_reply && !client.simulate);
    }

    #[test]
    fn server_delay_range() {
        let opts =
            Opts::try_parse_from(["ping", "server", "--max-delay", "50"]).unwrap();
        let Modes::Server(server) = opts.mode else {
            panic!("expected server mode");
        };
        assert_eq!((server.min_delay, server.max_delay), (0, 50));
    }

    #[test]
    fn negative_count_is_rejected() {
        assert!(Opts::try_parse_from(["ping", "client", "-c", "-1", "host"]).is_err());
    }
}
