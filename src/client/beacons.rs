//! Watching server beacons.
//!
//! Servers broadcast RSRV_IS_UP periodically, quickly after they start and then
//! at a steady rate. A change in a server's beacon rhythm (a first sighting, a
//! reboot, a network segment coming back) is an anomaly: names still being
//! searched for might now be resolvable, so the search engine retries them
//! straight away.

use std::{
    collections::HashMap,
    io::ErrorKind,
    net::{IpAddr, SocketAddr},
    time::{Duration, Instant},
};

use tokio::{net::UdpSocket, select, sync::mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{
    client::searcher::SearchCommand,
    messages::{Direction, Message},
};

/// Why a beacon was considered unusual
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BeaconAnomaly {
    /// Never heard from this server before
    FirstSighting,
    /// Second beacon; the period is now known
    PeriodEstablished,
    /// Beacons arriving much faster than usual, as after a reboot
    Shortened,
    /// Beacons were missed, e.g. a network segment was restored
    Lengthened { network_change: bool },
}

impl BeaconAnomaly {
    pub fn is_network_change(&self) -> bool {
        match self {
            BeaconAnomaly::FirstSighting => false,
            BeaconAnomaly::PeriodEstablished | BeaconAnomaly::Shortened => true,
            BeaconAnomaly::Lengthened { network_change } => *network_change,
        }
    }
}

#[derive(Debug)]
struct BeaconRecord {
    last_id: u32,
    last_arrival: Instant,
    average_period: Option<Duration>,
}

/// Beacon arrival history for every server seen
#[derive(Debug, Default)]
pub struct BeaconHistory {
    servers: HashMap<SocketAddr, BeaconRecord>,
}

/// Outcome of recording one beacon
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BeaconUpdate {
    /// Duplicate or out of sequence; ignore it
    Discarded,
    Normal,
    Anomaly(BeaconAnomaly),
}

impl BeaconHistory {
    pub fn new() -> Self {
        BeaconHistory::default()
    }

    pub fn update(&mut self, server: SocketAddr, beacon_id: u32, now: Instant) -> BeaconUpdate {
        let Some(record) = self.servers.get_mut(&server) else {
            self.servers.insert(
                server,
                BeaconRecord {
                    last_id: beacon_id,
                    last_arrival: now,
                    average_period: None,
                },
            );
            return BeaconUpdate::Anomaly(BeaconAnomaly::FirstSighting);
        };

        let advance = beacon_id.wrapping_sub(record.last_id);
        record.last_id = beacon_id;
        // Repeats, and near-repeats from redundant routes
        if advance == 0 || advance > u32::MAX - 256 || (2..4).contains(&advance) {
            return BeaconUpdate::Discarded;
        }

        let period = now.saturating_duration_since(record.last_arrival);
        record.last_arrival = now;
        let Some(average) = record.average_period else {
            record.average_period = Some(period);
            return BeaconUpdate::Anomaly(BeaconAnomaly::PeriodEstablished);
        };
        record.average_period = Some(period.mul_f64(0.125) + average.mul_f64(0.875));

        if period >= average.mul_f64(1.25) {
            BeaconUpdate::Anomaly(BeaconAnomaly::Lengthened {
                network_change: period >= average.mul_f64(3.25),
            })
        } else if period <= average.mul_f64(0.8) {
            BeaconUpdate::Anomaly(BeaconAnomaly::Shortened)
        } else {
            BeaconUpdate::Normal
        }
    }
}

/// Listen for beacons and feed them to the search engine
pub(crate) async fn watch_beacons(
    socket: UdpSocket,
    searcher: mpsc::UnboundedSender<SearchCommand>,
    stop: CancellationToken,
) {
    let mut history = BeaconHistory::new();
    let mut buf = vec![0u8; 0xFFFF];
    loop {
        let (size, sender) = select! {
            _ = stop.cancelled() => break,
            r = socket.recv_from(&mut buf) => match r {
                Ok(r) => r,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("Got unresumable error whilst watching beacons: {e:?}");
                    break;
                }
            },
        };
        let Ok(messages) = Message::decode_datagram(&buf[..size], Direction::ToClient) else {
            debug!("Ignoring unparseable datagram on beacon port from {sender}");
            continue;
        };
        for message in messages {
            let Message::RsrvIsUp(beacon) = message else {
                continue;
            };
            let server = SocketAddr::new(
                beacon.server_ip.map(IpAddr::V4).unwrap_or(sender.ip()),
                beacon.server_port,
            );
            trace!("Observed beacon {} from {server}", beacon.beacon_id);
            let anomaly = match history.update(server, beacon.beacon_id, Instant::now()) {
                BeaconUpdate::Discarded => continue,
                BeaconUpdate::Normal => None,
                BeaconUpdate::Anomaly(anomaly) => {
                    debug!("Beacon anomaly from {server}: {anomaly:?}");
                    Some(anomaly)
                }
            };
            if searcher
                .send(SearchCommand::Beacon { server, anomaly })
                .is_err()
            {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(start: Instant, seconds: f64) -> Instant {
        start + Duration::from_secs_f64(seconds)
    }

    #[test]
    fn steady_beacons_are_normal() {
        let server: SocketAddr = "10.0.0.1:5064".parse().unwrap();
        let mut history = BeaconHistory::new();
        let start = Instant::now();
        assert_eq!(
            history.update(server, 10, start),
            BeaconUpdate::Anomaly(BeaconAnomaly::FirstSighting)
        );
        assert_eq!(
            history.update(server, 11, at(start, 15.0)),
            BeaconUpdate::Anomaly(BeaconAnomaly::PeriodEstablished)
        );
        for n in 2..10 {
            assert_eq!(
                history.update(server, 10 + n, at(start, 15.0 * n as f64)),
                BeaconUpdate::Normal
            );
        }
    }

    #[test]
    fn duplicates_are_discarded() {
        let server: SocketAddr = "10.0.0.1:5064".parse().unwrap();
        let mut history = BeaconHistory::new();
        let start = Instant::now();
        history.update(server, 10, start);
        assert_eq!(history.update(server, 10, at(start, 1.0)), BeaconUpdate::Discarded);
        assert_eq!(history.update(server, 9, at(start, 1.0)), BeaconUpdate::Discarded);
        assert_eq!(history.update(server, 11, at(start, 1.0)), BeaconUpdate::Discarded);
        assert!(matches!(
            history.update(server, 12, at(start, 2.0)),
            BeaconUpdate::Anomaly(_)
        ));
    }

    #[test]
    fn reboots_and_outages_are_anomalies() {
        let server: SocketAddr = "10.0.0.1:5064".parse().unwrap();
        let mut history = BeaconHistory::new();
        let start = Instant::now();
        history.update(server, 1, start);
        history.update(server, 2, at(start, 10.0));
        assert_eq!(history.update(server, 3, at(start, 20.0)), BeaconUpdate::Normal);
        // A restarted server beacons quickly from a new sequence
        assert_eq!(
            history.update(server, 0x1000, at(start, 20.1)),
            BeaconUpdate::Anomaly(BeaconAnomaly::Shortened)
        );
        let mut history = BeaconHistory::new();
        history.update(server, 1, start);
        history.update(server, 2, at(start, 10.0));
        assert_eq!(
            history.update(server, 6, at(start, 60.0)),
            BeaconUpdate::Anomaly(BeaconAnomaly::Lengthened {
                network_change: true
            })
        );
    }
}
