//! Server UDP traffic: answering name searches and announcing with beacons.

use std::{io::ErrorKind, net::SocketAddr, sync::Arc, time::Duration};

use tokio::{net::UdpSocket, select};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{
    messages::{self, CA_MINOR_PROTOCOL_REVISION, Direction, Message},
    providers::Provider,
    utils::wrapping_inplace_add,
};

/// Largest reply datagram built
const MAX_REPLY_SIZE: usize = 1024;
/// Beacons start this far apart after startup and double up to the beacon period
const INITIAL_BEACON_INTERVAL: Duration = Duration::from_millis(20);

/// Build the replies to one search datagram.
///
/// Names the provider has get a SEARCH response pointing at
/// `connection_port`; unknown names get NOT_FOUND only when asked for one.
/// Every reply datagram starts with VERSION.
pub(crate) fn search_replies<P: Provider>(
    provider: &P,
    request: &[Message],
    connection_port: u16,
) -> Vec<Vec<u8>> {
    let answers: Vec<Message> = request
        .iter()
        .filter_map(|message| match message {
            Message::Search(search) if provider.provides(&search.channel_name) => {
                trace!("Answering search for {}", search.channel_name);
                Some(search.respond(None, connection_port).into())
            }
            Message::Search(search) if search.should_reply => Some(
                messages::NotFound {
                    search_id: search.search_id,
                    protocol_version: CA_MINOR_PROTOCOL_REVISION,
                }
                .into(),
            ),
            _ => None,
        })
        .collect();

    let version = Message::from(messages::Version::default()).encode();
    let mut datagrams: Vec<Vec<u8>> = Vec::new();
    for answer in &answers {
        let encoded = answer.encode();
        match datagrams.last_mut() {
            Some(datagram) if datagram.len() + encoded.len() <= MAX_REPLY_SIZE => {
                datagram.extend(encoded)
            }
            _ => {
                let mut datagram = version.clone();
                datagram.extend(encoded);
                datagrams.push(datagram);
            }
        }
    }
    datagrams
}

/// Answer searches arriving on `socket` until stopped
pub(crate) async fn answer_searches<P: Provider>(
    socket: UdpSocket,
    provider: Arc<P>,
    connection_port: u16,
    stop: CancellationToken,
) {
    let mut buf = vec![0u8; 0xFFFF];
    loop {
        let (size, sender) = select! {
            _ = stop.cancelled() => break,
            r = socket.recv_from(&mut buf) => match r {
                Ok(r) => r,
                Err(e) if matches!(e.kind(), ErrorKind::Interrupted | ErrorKind::ConnectionReset) => continue,
                Err(e) => {
                    warn!("Search socket failed, no longer answering searches: {e}");
                    break;
                }
            },
        };
        let request = match Message::decode_datagram(&buf[..size], Direction::ToServer) {
            Ok(request) => request,
            Err(e) => {
                debug!("Ignoring bad search datagram from {sender}: {e}");
                continue;
            }
        };
        for reply in search_replies(provider.as_ref(), &request, connection_port) {
            if let Err(e) = socket.send_to(&reply, sender).await {
                debug!("Could not reply to {sender}: {e}");
            }
        }
    }
}

/// Interval before the beacon after one sent `interval` after its predecessor
fn next_beacon_interval(interval: Duration, period: Duration) -> Duration {
    (interval * 2).min(period)
}

/// Announce this server on `destinations` until stopped
pub(crate) async fn emit_beacons(
    socket: UdpSocket,
    destinations: Vec<SocketAddr>,
    connection_port: u16,
    period: Duration,
    stop: CancellationToken,
) {
    if destinations.is_empty() {
        warn!("No beacon destinations, not sending beacons");
        return;
    }
    debug!("Sending beacons to {destinations:?}");
    let mut beacon_id = 0u32;
    let mut interval = INITIAL_BEACON_INTERVAL.min(period);
    loop {
        let beacon = Message::from(messages::RsrvIsUp {
            server_port: connection_port,
            beacon_id: wrapping_inplace_add(&mut beacon_id),
            server_ip: None,
            protocol_version: CA_MINOR_PROTOCOL_REVISION,
        })
        .encode();
        for destination in &destinations {
            if let Err(e) = socket.send_to(&beacon, destination).await {
                trace!("Could not send beacon to {destination}: {e}");
            }
        }
        select! {
            _ = stop.cancelled() => break,
            _ = tokio::time::sleep(interval) => (),
        }
        interval = next_beacon_interval(interval, period);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{messages::Search, providers::IntercomProvider};

    fn provider() -> IntercomProvider {
        let provider = IntercomProvider::new();
        provider.add_pv("HERE", 1i32).unwrap();
        provider
    }

    #[test]
    fn replies_only_for_known_names() {
        let mut wants_reply = Search::new(2, "ELSEWHERE");
        wants_reply.should_reply = true;
        let request: Vec<Message> = vec![
            messages::Version::default().into(),
            Search::new(1, "HERE").into(),
            Search::new(3, "NOWHERE").into(),
            wants_reply.into(),
        ];
        let replies = search_replies(&provider(), &request, 5064);
        assert_eq!(replies.len(), 1);
        let decoded = Message::decode_datagram(&replies[0], Direction::ToClient).unwrap();
        assert!(matches!(decoded[0], Message::Version(_)));
        let Message::SearchResponse(found) = &decoded[1] else {
            panic!("Expected a search response");
        };
        assert_eq!((found.search_id, found.port_number), (1, 5064));
        assert!(matches!(decoded[2], Message::NotFound(messages::NotFound { search_id: 2, .. })));
        assert_eq!(decoded.len(), 3);
    }

    #[test]
    fn nothing_to_say_sends_nothing() {
        let request: Vec<Message> = vec![Search::new(1, "NOWHERE").into()];
        assert!(search_replies(&provider(), &request, 5064).is_empty());
    }

    #[test]
    fn large_replies_are_split() {
        let provider = provider();
        let request: Vec<Message> = (0..200).map(|n| Search::new(n, "HERE").into()).collect();
        let replies = search_replies(&provider, &request, 5064);
        assert!(replies.len() > 1);
        let mut answered = 0;
        for reply in &replies {
            assert!(reply.len() <= MAX_REPLY_SIZE);
            let decoded = Message::decode_datagram(reply, Direction::ToClient).unwrap();
            assert!(matches!(decoded[0], Message::Version(_)));
            answered += decoded.len() - 1;
        }
        assert_eq!(answered, 200);
    }

    #[test]
    fn beacons_ramp_up_to_the_period() {
        let period = Duration::from_millis(200);
        let mut interval = INITIAL_BEACON_INTERVAL;
        let mut seen = vec![interval];
        for _ in 0..5 {
            interval = next_beacon_interval(interval, period);
            seen.push(interval);
        }
        let millis: Vec<u128> = seen.iter().map(|d| d.as_millis()).collect();
        assert_eq!(millis, vec![20, 40, 80, 160, 200, 200]);
    }

    #[tokio::test]
    async fn beacons_count_up() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let stop = CancellationToken::new();
        let task = tokio::spawn(emit_beacons(
            sender,
            vec![receiver.local_addr().unwrap()],
            1234,
            Duration::from_millis(50),
            stop.clone(),
        ));
        let mut buf = [0u8; 64];
        for expected in 0..3 {
            let size = receiver.recv(&mut buf).await.unwrap();
            let decoded = Message::decode_datagram(&buf[..size], Direction::ToClient).unwrap();
            let [Message::RsrvIsUp(beacon)] = decoded.as_slice() else {
                panic!("Expected a beacon");
            };
            assert_eq!((beacon.beacon_id, beacon.server_port), (expected, 1234));
        }
        stop.cancel();
        task.await.unwrap();
    }
}
