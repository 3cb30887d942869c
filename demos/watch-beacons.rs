use std::{
    io,
    net::{Ipv4Addr, SocketAddr},
    time::Instant,
};

use ca_engine::{
    client::{BeaconHistory, BeaconUpdate},
    messages::{Direction, Message},
};
use clap::Parser;
use socket2::{Domain, Protocol, Type};
use tokio::net::UdpSocket;
use tracing::{debug, info, level_filters::LevelFilter, warn};

#[derive(Parser)]
struct Options {
    /// Port beacons are sent to
    #[clap(short, long, default_value_t = 5065)]
    port: u16,
    /// Show every beacon, not just anomalies
    #[clap(short, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn reusable_udp_socket(port: u16) -> io::Result<UdpSocket> {
    let socket = socket2::Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)).into())?;
    UdpSocket::from_std(socket.into())
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let opts = Options::parse();
    tracing_subscriber::fmt()
        .with_max_level(match opts.verbose {
            0 => LevelFilter::INFO,
            1.. => LevelFilter::DEBUG,
        })
        .init();

    let socket = match reusable_udp_socket(opts.port) {
        Ok(socket) => socket,
        Err(e) => {
            eprintln!("Could not listen on port {}: {e}", opts.port);
            std::process::exit(1);
        }
    };
    info!("Waiting for beacons on 0.0.0.0:{}", opts.port);

    let mut history = BeaconHistory::new();
    let mut buf = vec![0u8; 0xFFFF];
    while let Ok((size, sender)) = socket.recv_from(&mut buf).await {
        let messages = match Message::decode_datagram(&buf[..size], Direction::ToClient) {
            Ok(messages) => messages,
            Err(e) => {
                warn!("Could not decode datagram from {sender}: {e}");
                continue;
            }
        };
        for message in messages {
            let Message::RsrvIsUp(beacon) = message else {
                debug!("Ignoring non-beacon message from {sender}: {message:?}");
                continue;
            };
            let server = SocketAddr::new(
                beacon.server_ip.map(Into::into).unwrap_or(sender.ip()),
                beacon.server_port,
            );
            match history.update(server, beacon.beacon_id, Instant::now()) {
                BeaconUpdate::Anomaly(anomaly) => {
                    info!("{server} beacon {}: {anomaly:?}", beacon.beacon_id)
                }
                BeaconUpdate::Normal => debug!("{server} beacon {}", beacon.beacon_id),
                BeaconUpdate::Discarded => debug!("{server} beacon {} discarded", beacon.beacon_id),
            }
        }
    }
}
