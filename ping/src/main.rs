use std::{net::Ipv4Addr, sync::Arc, time::Duration};

use anyhow::{anyhow, bail, Result};
use clap::Parser;
use common::{interface_to_ipaddr, Logger};
use ping::{
    client::{resolve_target, ReplyMatching},
    transport::{RawTransport, SimulatedTransport, Transport},
    ChannelObserver, Pinger, ProbeConfig, ProbeRun, Responder, ResponderConfig,
};
use tokio::{signal, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::info;

mod args;
mod logger;
mod report;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .with_target(true)
        .init();

    let args = args::Opts::parse();
    match args.mode {
        args::Modes::Client(opts) => run_client(opts).await,
        args::Modes::Server(opts) => run_server(opts).await,
    }
}

fn seconds(value: f64, name: &str) -> Result<Duration> {
    Duration::try_from_secs_f64(value).map_err(|e| anyhow!("invalid --{}: {}", name, e))
}

async fn run_client(opts: args::ClientOpts) -> Result<()> {
    let config = ProbeConfig {
        count: opts.count,
        timeout: seconds(opts.timeout, "timeout")?,
        interval: match seconds(opts.interval, "interval")? {
            Duration::ZERO => None,
            interval => Some(interval),
        },
        stop_on_reply: opts.stop_on_reply,
        payload_len: opts.len,
        matching: if opts.match_identifier_only {
            ReplyMatching::IdentifierOnly
        } else {
            ReplyMatching::IdentifierAndSequence
        },
    };
    let target = resolve_target(&opts.host).await?;
    let iface = opts.common_opts.iface.as_deref();
    let logger = opts.common_opts.file.as_ref().map(Logger::new).transpose()?;

    let stop = CancellationToken::new();
    let (observer, events) = ChannelObserver::new();
    let mut session = if opts.simulate {
        spawn_session(
            Pinger::new(SimulatedTransport::default(), config),
            target,
            stop.clone(),
            observer,
        )
    } else {
        spawn_session(
            Pinger::new(RawTransport::client(iface)?, config),
            target,
            stop.clone(),
            observer,
        )
    };

    match iface.map(interface_to_ipaddr).transpose()? {
        Some(source) => println!(
            "Pinging {} [{}] from {} {} with {} bytes of data:",
            opts.host,
            target,
            source,
            iface.unwrap_or_default(),
            opts.len
        ),
        None => println!(
            "Pinging {} [{}] with {} bytes of data:",
            opts.host, target, opts.len
        ),
    }
    let reporter = tokio::spawn(report::report_probes(
        events,
        target,
        opts.simulate,
        opts.json,
        logger,
    ));

    let run = tokio::select! {
        run = &mut session => run?,
        _ = signal::ctrl_c() => {
            println!("\nUser interrupted (Ctrl+C). Stopping after the current probe.");
            stop.cancel();
            session.await?
        }
    };
    reporter.await??;
    info!(
        sent = run.summary.sent,
        received = run.summary.received,
        "probe session finished"
    );
    Ok(())
}

fn spawn_session<T: Transport + 'static>(
    pinger: Pinger<T>,
    target: Ipv4Addr,
    stop: CancellationToken,
    observer: ChannelObserver,
) -> JoinHandle<ProbeRun> {
    tokio::spawn(async move { pinger.run(target, &stop, &observer).await })
}

async fn run_server(opts: args::ServerOpts) -> Result<()> {
    if opts.min_delay > opts.max_delay {
        bail!(
            "--min-delay ({}) is larger than --max-delay ({})",
            opts.min_delay,
            opts.max_delay
        );
    }
    let transport = RawTransport::responder(opts.common_opts.iface.as_deref())?;
    let logger = opts.common_opts.file.as_ref().map(Logger::new).transpose()?;
    let config = ResponderConfig {
        delay: (opts.max_delay > 0).then(|| {
            Duration::from_millis(opts.min_delay)..Duration::from_millis(opts.max_delay)
        }),
        ..Default::default()
    };

    let (observer, events) = ChannelObserver::new();
    let reporter = tokio::spawn(report::report_replies(events, logger));
    let mut responder = Responder::new(transport, config, Arc::new(observer));
    responder.start()?;
    println!("ICMP Server running... Press Ctrl+C to stop.");

    signal::ctrl_c().await?;
    println!("\nStopping ICMP server...");
    responder.stop().await;
    responder.wait_for_replies().await;
    // Last observer handle; the reporter drains and exits.
    drop(responder);
    reporter.await??;
    println!("ICMP server stopped.");
    Ok(())
}
