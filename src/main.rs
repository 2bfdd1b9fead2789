//! Entry point for `ping6`.
//!
//! Sets up a stack with one simulated interface, runs its poll driver as a
//! tokio task and sends Echo Requests through an [`Icmpv6Socket`].  The
//! simulated link reflects every request it is handed as an Echo Reply, so
//! replies flow back through the normal inbound path.  `main.rs` owns only
//! process setup (logging, signal handling, argument parsing).

use std::net::{Ipv6Addr, SocketAddr, SocketAddrV6};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::Parser;
use rand::Rng;
use tokio::sync::watch;

use netstack_icmpv6::neighbor::NeighborTable;
use netstack_icmpv6::packet::{echo_reply_for, EchoHeader, ICMPV6_ECHO_REQUEST};
use netstack_icmpv6::{DeviceId, Error, Icmpv6Socket, NetDevice, NetStack, StackConfig};

/// Send ICMPv6 Echo Requests over a simulated poll-driven interface.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Destination address.
    #[arg(default_value = "fd00::2")]
    destination: Ipv6Addr,

    /// Number of requests to send.
    #[arg(short, long, default_value_t = 4)]
    count: u16,

    /// Payload bytes after the echo header.
    #[arg(short, long, default_value_t = 56)]
    size: usize,

    /// Send timeout in milliseconds (0 waits forever).
    #[arg(short = 'W', long, default_value_t = 2000)]
    timeout_ms: u64,

    /// Delay between requests in milliseconds.
    #[arg(short, long, default_value_t = 1000)]
    interval_ms: u64,

    /// Poll cycle period of the simulated interface in milliseconds.
    #[arg(long, default_value_t = 10)]
    poll_ms: u64,

    /// Address of the simulated interface.
    #[arg(long, default_value = "fd00::1")]
    addr: Ipv6Addr,

    /// On-link prefix length of the simulated interface.
    #[arg(long, default_value_t = 64)]
    prefix: u8,

    /// Link MTU of the simulated interface.
    #[arg(long, default_value_t = 1280)]
    mtu: usize,

    /// Treat the simulated interface as the default route.
    #[arg(long)]
    default_route: bool,

    /// Do not pre-populate the neighbor table with the destination.
    #[arg(long)]
    no_neighbor: bool,

    /// Stop draining the transmit buffer after the first frame, so later
    /// sends can only time out.
    #[arg(long)]
    stall: bool,

    /// Poll-bus callback slots.
    #[arg(long, default_value_t = StackConfig::default().max_callbacks)]
    max_callbacks: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise env_logger; set RUST_LOG to control verbosity.
    env_logger::init();

    let cli = Cli::parse();
    if cli.count == 0 {
        bail!("count must be at least 1");
    }

    let config = StackConfig {
        max_callbacks: cli.max_callbacks,
        ..StackConfig::default()
    };
    let neighbors = NeighborTable::new(config.neighbor_capacity, config.neighbor_ttl);
    if !cli.no_neighbor {
        let mut lladdr = [0u8; 6];
        rand::rng().fill(&mut lladdr[..]);
        lladdr[0] = (lladdr[0] & 0xfe) | 0x02; // locally administered unicast
        neighbors.add(cli.destination, lladdr);
    }

    let net = NetStack::builder()
        .config(config)
        .resolver(neighbors)
        .build();

    let mut dev = NetDevice::new("sim0", cli.addr, cli.prefix).with_mtu(cli.mtu);
    if cli.default_route {
        dev = dev.with_default_route();
    }
    let dev = net.add_device(dev);

    let (stop_tx, stop_rx) = watch::channel(false);
    let driver = tokio::spawn(drive(
        net.clone(),
        dev,
        Duration::from_millis(cli.poll_ms.max(1)),
        cli.stall,
        stop_rx,
    ));

    let outcome = run(&net, &cli).await;

    let _ = stop_tx.send(true);
    driver.await.context("poll driver panicked")?;

    let stats = net.stats();
    println!(
        "--- {} ping statistics ---\n{} transmitted, {} received, {} dropped",
        cli.destination, stats.icmpv6.sent, stats.icmpv6.recv, stats.icmpv6.drop
    );
    outcome
}

/// Poll driver for the simulated link: one poll cycle per tick, then hand
/// whatever was built to the "wire", which bounces requests straight back.
async fn drive(
    net: NetStack,
    dev: DeviceId,
    period: Duration,
    stall: bool,
    mut stop: watch::Receiver<bool>,
) {
    let mut tick = tokio::time::interval(period);
    let mut drained = 0u64;

    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = stop.changed() => break,
        }

        net.poll(dev);

        if stall && drained > 0 {
            continue;
        }
        let Some(frame) = net.take_tx_frame(dev) else {
            continue;
        };
        drained += 1;
        log::debug!("[driver] {} byte frame on the wire", frame.len());

        if let Some(reply) = echo_reply_for(&frame) {
            net.input(dev, &reply);
        }
    }
    log::debug!("[driver] stopped after {drained} frames");
}

async fn run(net: &NetStack, cli: &Cli) -> Result<()> {
    let mut sock = Icmpv6Socket::open(net);
    sock.set_send_timeout(Some(Duration::from_millis(cli.timeout_ms)));
    let to = SocketAddr::V6(SocketAddrV6::new(cli.destination, 0, 0, 0));

    let id: u16 = rand::rng().random();
    let mut payload = vec![0u8; cli.size];
    rand::rng().fill(&mut payload[..]);

    println!("PING {} {} data bytes (id {id:#06x})", cli.destination, cli.size);

    for seq in 0..cli.count {
        let msg = EchoHeader {
            kind: ICMPV6_ECHO_REQUEST,
            code: 0,
            id,
            seq,
        }
        .to_message(&payload);

        let intr = sock.interrupter();
        let started = Instant::now();
        let mut send = tokio::task::spawn_blocking(move || {
            let result = sock.send_to(msg, to);
            (sock, result)
        });

        let (returned, result) = tokio::select! {
            joined = &mut send => joined.context("send task panicked")?,
            _ = tokio::signal::ctrl_c() => {
                intr.interrupt();
                send.await.context("send task panicked")?
            }
        };
        sock = returned;

        match result {
            Ok(n) => {
                tokio::time::sleep(Duration::from_millis(cli.poll_ms.max(1) * 2)).await;
                let mut buf = [0u8; 1500];
                match sock.try_recv_from(&mut buf)? {
                    Some((len, from)) => println!(
                        "{len} bytes from {from}: icmp_seq={seq} time={:.2} ms",
                        started.elapsed().as_secs_f64() * 1000.0
                    ),
                    None => println!("sent {n} bytes, icmp_seq={seq}: no reply yet"),
                }
            }
            Err(Error::Interrupted) => {
                println!("interrupted");
                break;
            }
            Err(e) => println!("icmp_seq={seq}: {e} (errno {})", e.errno()),
        }

        if seq + 1 < cli.count {
            tokio::time::sleep(Duration::from_millis(cli.interval_ms)).await;
        }
    }

    sock.close();
    Ok(())
}
