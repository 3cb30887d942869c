//! Name resolution over UDP.
//!
//! Names being searched for are batched into datagrams (a VERSION message then
//! one SEARCH per name) and retried with exponential backoff until a server
//! answers. A global quota caps how many datagrams go out per interval; names
//! that miss a window simply stay due. There is no "not found": a name keeps
//! being searched for until it resolves or every channel wanting it closes.

use std::{
    collections::{BTreeSet, HashMap},
    future,
    net::{IpAddr, SocketAddr},
    pin::Pin,
    sync::Weak,
    time::{Duration, Instant},
};

use tokio::{net::UdpSocket, select, sync::mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::{
    client::{ChannelId, beacons::BeaconAnomaly},
    config::ClientConfig,
    messages::{
        self, CA_MINIMUM_PROTOCOL_REVISION, CA_MINOR_PROTOCOL_REVISION, Direction, HEADER_SIZE,
        Message, SearchResponse,
    },
    utils::wrapping_inplace_add,
};

/// Earlier searches for a name that still accept a late reply
const ANSWERABLE_SEARCHES: usize = 2;

/// One channel's interest in a name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SearchHandle {
    pub name: String,
    pub channel: ChannelId,
}

pub(crate) enum SearchCommand {
    Search(SearchHandle),
    Cancel(SearchHandle),
    Beacon {
        server: SocketAddr,
        anomaly: Option<BeaconAnomaly>,
    },
}

/// A name found on a server
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Resolution {
    pub name: String,
    pub channels: Vec<ChannelId>,
    pub peer: SocketAddr,
    pub minor_version: u16,
}

/// Receives resolved names
pub(crate) trait SearchObserver: Send + Sync {
    fn on_search_reply(&self, resolution: Resolution);
}

#[derive(Debug)]
struct PendingName {
    channels: BTreeSet<ChannelId>,
    interval: Duration,
    next_search_at: Instant,
    search_ids: Vec<u32>,
}

/// Search bookkeeping, independent of any socket
#[derive(Debug)]
pub(crate) struct SearchState {
    initial_interval: Duration,
    max_interval: Duration,
    quota_interval: Duration,
    datagrams_per_interval: usize,
    max_datagram_size: usize,
    pending: HashMap<String, PendingName>,
    /// Search IDs of outstanding requests to the name
    in_flight: HashMap<u32, String>,
    next_search_id: u32,
    window_start: Instant,
    sent_in_window: usize,
    /// Where each name was last found
    last_resolved: HashMap<String, SocketAddr>,
}

impl SearchState {
    pub fn new(config: &ClientConfig, now: Instant) -> Self {
        SearchState {
            initial_interval: config.search_initial_interval,
            max_interval: config.max_search_period.max(config.search_initial_interval),
            quota_interval: config.search_quota_interval,
            datagrams_per_interval: config.search_datagrams_per_interval.max(1),
            max_datagram_size: config.max_datagram_size.max(HEADER_SIZE * 2),
            pending: HashMap::new(),
            in_flight: HashMap::new(),
            next_search_id: 0,
            window_start: now,
            sent_in_window: 0,
            last_resolved: HashMap::new(),
        }
    }

    /// Start searching for a name, or join the search already running for it
    pub fn search(&mut self, handle: SearchHandle, now: Instant) {
        let initial_interval = self.initial_interval;
        self.pending
            .entry(handle.name)
            .or_insert_with(|| PendingName {
                channels: BTreeSet::new(),
                interval: initial_interval,
                next_search_at: now,
                search_ids: Vec::new(),
            })
            .channels
            .insert(handle.channel);
    }

    pub fn cancel(&mut self, handle: &SearchHandle) {
        let Some(pending) = self.pending.get_mut(&handle.name) else {
            return;
        };
        pending.channels.remove(&handle.channel);
        if pending.channels.is_empty()
            && let Some(pending) = self.pending.remove(&handle.name)
        {
            for id in pending.search_ids {
                self.in_flight.remove(&id);
            }
        }
    }

    pub fn is_pending(&self, name: &str) -> bool {
        self.pending.contains_key(name)
    }

    /// When the next datagram could be due
    pub fn next_wakeup(&self) -> Option<Instant> {
        let earliest = self.pending.values().map(|p| p.next_search_at).min()?;
        if self.sent_in_window >= self.datagrams_per_interval {
            Some(earliest.max(self.window_start + self.quota_interval))
        } else {
            Some(earliest)
        }
    }

    /// Build the datagrams for every name now due, within the quota
    pub fn due_datagrams(&mut self, now: Instant) -> Vec<Vec<u8>> {
        if now.duration_since(self.window_start) >= self.quota_interval {
            self.window_start = now;
            self.sent_in_window = 0;
        }
        let mut due: Vec<_> = self
            .pending
            .iter()
            .filter(|(_, p)| p.next_search_at <= now)
            .map(|(name, p)| (p.next_search_at, name.clone()))
            .collect();
        due.sort();

        let version = Message::Version(messages::Version::default());
        let mut datagrams = Vec::new();
        let mut current: Vec<Message> = Vec::new();
        let mut current_size = 0;
        for (_, name) in due {
            let search = messages::Search::new(0, &name);
            let size = search.encoded_len();
            if current.is_empty() || current_size + size > self.max_datagram_size {
                if !current.is_empty() {
                    datagrams.push(Message::encode_all(&current));
                    current.clear();
                }
                if self.sent_in_window + datagrams.len() >= self.datagrams_per_interval {
                    break;
                }
                current.push(version.clone());
                current_size = HEADER_SIZE;
            }
            let search_id = wrapping_inplace_add(&mut self.next_search_id);
            let Some(pending) = self.pending.get_mut(&name) else {
                continue;
            };
            pending.search_ids.push(search_id);
            if pending.search_ids.len() > ANSWERABLE_SEARCHES {
                let expired = pending.search_ids.len() - ANSWERABLE_SEARCHES;
                for id in pending.search_ids.drain(..expired) {
                    self.in_flight.remove(&id);
                }
            }
            pending.next_search_at = now + pending.interval;
            pending.interval = (pending.interval * 2).min(self.max_interval);
            self.in_flight.insert(search_id, name.clone());
            trace!("Searching for {name} as search {search_id}");
            current.push(Message::Search(messages::Search {
                search_id,
                ..search
            }));
            current_size += size;
        }
        if current.len() > 1 {
            datagrams.push(Message::encode_all(&current));
        }
        self.sent_in_window += datagrams.len();
        datagrams
    }

    /// Handle a search reply. Replies with unknown ids are dropped.
    pub fn on_reply(
        &mut self,
        response: &SearchResponse,
        sender: SocketAddr,
        datagram_version: Option<u16>,
    ) -> Option<Resolution> {
        let Some(name) = self.in_flight.remove(&response.search_id) else {
            debug!("Received unrequested or duplicate search response");
            return None;
        };
        let pending = self.pending.remove(&name)?;
        for id in &pending.search_ids {
            self.in_flight.remove(id);
        }
        let peer = SocketAddr::new(
            response.server_ip.map(IpAddr::V4).unwrap_or(sender.ip()),
            response.port_number,
        );
        self.last_resolved.insert(name.clone(), peer);
        debug!("Found server for {name}: {peer}");
        Some(Resolution {
            name,
            channels: pending.channels.into_iter().collect(),
            peer,
            minor_version: response
                .protocol_version
                .or(datagram_version)
                .unwrap_or(CA_MINIMUM_PROTOCOL_REVISION),
        })
    }

    /// React to a beacon from `server`.
    ///
    /// Names last found on that server resolve immediately. On an anomaly,
    /// every other pending name has its backoff reset.
    pub fn on_beacon(
        &mut self,
        server: SocketAddr,
        anomaly: Option<BeaconAnomaly>,
        now: Instant,
    ) -> Vec<Resolution> {
        let names: Vec<String> = self
            .pending
            .keys()
            .filter(|name| self.last_resolved.get(*name) == Some(&server))
            .cloned()
            .collect();
        let mut resolutions = Vec::new();
        for name in names {
            let Some(pending) = self.pending.remove(&name) else {
                continue;
            };
            for id in &pending.search_ids {
                self.in_flight.remove(id);
            }
            debug!("Beacon from {server} resolves {name}");
            resolutions.push(Resolution {
                name,
                channels: pending.channels.into_iter().collect(),
                peer: server,
                minor_version: CA_MINOR_PROTOCOL_REVISION,
            });
        }
        if anomaly.is_some() {
            for pending in self.pending.values_mut() {
                pending.interval = self.initial_interval;
                pending.next_search_at = now;
            }
        }
        resolutions
    }
}

/// Wait until it's time for the next search datagram
fn next_attempt(state: &SearchState) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>> {
    match state.next_wakeup() {
        None => Box::pin(future::pending()),
        Some(instant) if instant <= Instant::now() => Box::pin(future::ready(())),
        Some(instant) => Box::pin(tokio::time::sleep_until(instant.into())),
    }
}

fn report(observer: &Weak<dyn SearchObserver>, resolutions: Vec<Resolution>) -> bool {
    let Some(observer) = observer.upgrade() else {
        return false;
    };
    for resolution in resolutions {
        observer.on_search_reply(resolution);
    }
    true
}

/// The search task: one per client context
pub(crate) async fn run_searcher(
    socket: UdpSocket,
    mut state: SearchState,
    addresses: Vec<SocketAddr>,
    mut commands: mpsc::UnboundedReceiver<SearchCommand>,
    observer: Weak<dyn SearchObserver>,
    stop: CancellationToken,
) {
    if addresses.is_empty() {
        warn!("No search addresses configured");
    }
    let mut buffer = vec![0u8; 0xFFFF];
    loop {
        let resolutions = select! {
            _ = stop.cancelled() => break,
            command = commands.recv() => match command {
                None => break,
                Some(SearchCommand::Search(handle)) => {
                    debug!("Searching for {} (channel {})", handle.name, handle.channel);
                    state.search(handle, Instant::now());
                    Vec::new()
                }
                Some(SearchCommand::Cancel(handle)) => {
                    state.cancel(&handle);
                    Vec::new()
                }
                Some(SearchCommand::Beacon { server, anomaly }) => {
                    state.on_beacon(server, anomaly, Instant::now())
                }
            },
            result = socket.recv_from(&mut buffer) => match result {
                Ok((size, sender)) => handle_datagram(&mut state, &buffer[..size], sender),
                Err(e) => {
                    error!("Error waiting for search responses: {e}");
                    Vec::new()
                }
            },
            _ = next_attempt(&state) => {
                for datagram in state.due_datagrams(Instant::now()) {
                    for addr in &addresses {
                        trace!("Sending search datagram to: {addr}");
                        if let Err(e) = socket.send_to(&datagram, addr).await {
                            warn!("Failed to send search to {addr}: {e}");
                        }
                    }
                }
                Vec::new()
            },
        };
        if !resolutions.is_empty() && !report(&observer, resolutions) {
            break;
        }
    }
    debug!("Search task finished");
}

fn handle_datagram(state: &mut SearchState, datagram: &[u8], sender: SocketAddr) -> Vec<Resolution> {
    let messages = match Message::decode_datagram(datagram, Direction::ToClient) {
        Ok(messages) => messages,
        Err(e) => {
            warn!("Received unparseable search response from {sender}: {e}");
            return Vec::new();
        }
    };
    let mut version = None;
    let mut resolutions = Vec::new();
    for message in messages {
        match message {
            Message::Version(v) => version = Some(v.protocol_version),
            Message::SearchResponse(response) => {
                resolutions.extend(state.on_reply(&response, sender, version))
            }
            Message::NotFound(msg) => {
                debug!("Server {sender} does not have search {}", msg.search_id)
            }
            m => debug!("Received unexpected message in search response: {m:?}"),
        }
    }
    resolutions
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    fn config() -> ClientConfig {
        ClientConfig::default()
    }

    fn handle(name: &str, channel: u32) -> SearchHandle {
        SearchHandle {
            name: name.to_string(),
            channel: ChannelId(channel),
        }
    }

    fn searches_in(datagram: &[u8]) -> Vec<messages::Search> {
        Message::decode_datagram(datagram, Direction::ToServer)
            .unwrap()
            .into_iter()
            .filter_map(|m| match m {
                Message::Search(s) => Some(s),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn duplicate_names_share_one_search() {
        let now = Instant::now();
        let mut state = SearchState::new(&config(), now);
        state.search(handle("A", 1), now);
        state.search(handle("A", 2), now);
        state.search(handle("B", 3), now);
        let datagrams = state.due_datagrams(now);
        assert_eq!(datagrams.len(), 1);
        let mut names: Vec<_> = searches_in(&datagrams[0])
            .into_iter()
            .map(|s| s.channel_name)
            .collect();
        names.sort();
        assert_eq!(names, vec!["A", "B"]);

        let search_id = searches_in(&datagrams[0])
            .into_iter()
            .find(|s| s.channel_name == "A")
            .unwrap()
            .search_id;
        let sender: SocketAddr = "10.1.1.1:5064".parse().unwrap();
        let reply = messages::Search::new(search_id, "A").respond(None, 5070);
        let resolution = state.on_reply(&reply, sender, None).unwrap();
        assert_eq!(resolution.channels, vec![ChannelId(1), ChannelId(2)]);
        assert_eq!(resolution.peer, "10.1.1.1:5070".parse().unwrap());
        // A second reply to the same search is ignored
        assert!(state.on_reply(&reply, sender, None).is_none());
        assert!(!state.is_pending("A"));
        assert!(state.is_pending("B"));
    }

    #[test]
    fn backoff_doubles_up_to_the_maximum() {
        let start = Instant::now();
        let config = ClientConfig {
            max_search_period: Duration::from_millis(100),
            ..config()
        };
        let mut state = SearchState::new(&config, start);
        state.search(handle("A", 1), start);
        let mut now = start;
        let mut gaps = Vec::new();
        for _ in 0..5 {
            assert_eq!(state.due_datagrams(now).len(), 1);
            let next = state.next_wakeup().unwrap();
            gaps.push(next - now);
            now = next;
        }
        assert_eq!(
            gaps,
            [32, 64, 100, 100, 100].map(Duration::from_millis).to_vec()
        );
    }

    #[test]
    fn retries_forget_old_search_ids() {
        let start = Instant::now();
        let config = ClientConfig {
            max_search_period: Duration::from_millis(100),
            ..config()
        };
        let mut state = SearchState::new(&config, start);
        state.search(handle("A", 1), start);
        state.search(handle("B", 2), start);
        let mut newest = None;
        for _ in 0..10_000 {
            let now = state.next_wakeup().unwrap();
            for datagram in state.due_datagrams(now) {
                for search in searches_in(&datagram) {
                    if search.channel_name == "A" {
                        newest = Some(search.search_id);
                    }
                }
            }
            assert!(state.in_flight.len() <= 2 * ANSWERABLE_SEARCHES);
        }
        for pending in state.pending.values() {
            assert!(pending.search_ids.len() <= ANSWERABLE_SEARCHES);
        }

        // The most recent search still resolves the name
        let newest = newest.unwrap();
        let sender: SocketAddr = "10.1.1.1:5064".parse().unwrap();
        let reply = messages::Search::new(newest, "A").respond(None, 5070);
        assert!(state.on_reply(&reply, sender, None).is_some());
        assert!(state.is_pending("B"));
        assert!(state.in_flight.values().all(|name| name == "B"));
    }

    #[test]
    fn quota_limits_datagrams_per_window() {
        let start = Instant::now();
        let config = ClientConfig {
            max_datagram_size: 48,
            search_datagrams_per_interval: 2,
            search_quota_interval: Duration::from_millis(100),
            ..config()
        };
        let mut state = SearchState::new(&config, start);
        for n in 0..10 {
            state.search(handle(&format!("NAME:{n}"), n), start);
        }
        // Each datagram holds one version and one search of 24 bytes
        let first = state.due_datagrams(start);
        assert_eq!(first.len(), 2);
        assert!(first.iter().all(|d| searches_in(d).len() == 1));
        // Nothing more until the window rolls over
        assert!(state.due_datagrams(start + Duration::from_millis(50)).is_empty());
        assert_eq!(
            state.next_wakeup(),
            Some(start + Duration::from_millis(100))
        );
        assert_eq!(
            state.due_datagrams(start + Duration::from_millis(100)).len(),
            2
        );
    }

    #[test]
    fn beacons_resolve_known_names() {
        let now = Instant::now();
        let mut state = SearchState::new(&config(), now);
        let server: SocketAddr = "10.1.1.1:5064".parse().unwrap();
        state.search(handle("A", 1), now);
        let datagrams = state.due_datagrams(now);
        let search_id = searches_in(&datagrams[0])[0].search_id;
        state.on_reply(
            &messages::Search::new(search_id, "A").respond(None, 5064),
            server,
            None,
        );

        // The channel is lost and searched for again
        state.search(handle("A", 1), now);
        state.search(handle("B", 2), now);
        let resolutions = state.on_beacon(server, None, now);
        assert_eq!(resolutions.len(), 1);
        assert_eq!(resolutions[0].name, "A");
        assert_eq!(resolutions[0].peer, server);
        assert!(state.is_pending("B"));
    }

    #[test]
    fn anomalies_reset_backoff() {
        let start = Instant::now();
        let mut state = SearchState::new(&config(), start);
        state.search(handle("A", 1), start);
        state.due_datagrams(start);
        let later = start + Duration::from_millis(500);
        state.due_datagrams(later);
        assert!(state.next_wakeup().unwrap() > later);
        state.on_beacon(
            "10.9.9.9:5064".parse().unwrap(),
            Some(BeaconAnomaly::FirstSighting),
            later,
        );
        assert_eq!(state.next_wakeup(), Some(later));
    }

    #[test]
    fn cancel_stops_searching() {
        let now = Instant::now();
        let mut state = SearchState::new(&config(), now);
        state.search(handle("A", 1), now);
        state.search(handle("A", 2), now);
        state.cancel(&handle("A", 1));
        assert!(state.is_pending("A"));
        state.cancel(&handle("A", 2));
        assert!(!state.is_pending("A"));
        assert!(state.next_wakeup().is_none());
    }

    struct Collect(Mutex<Vec<Resolution>>);
    impl SearchObserver for Collect {
        fn on_search_reply(&self, resolution: Resolution) {
            self.0.lock().unwrap().push(resolution);
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_search() {
        // Set up a receiver
        let incoming = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let responder_addr = incoming.local_addr().unwrap();
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let collector = Arc::new(Collect(Mutex::new(Vec::new())));
        let observer: Arc<dyn SearchObserver> = collector.clone();
        let stop = CancellationToken::new();
        let task = tokio::spawn(run_searcher(
            socket,
            SearchState::new(&config(), Instant::now()),
            vec![responder_addr],
            commands_rx,
            Arc::downgrade(&observer),
            stop.clone(),
        ));
        commands
            .send(SearchCommand::Search(handle("TEST", 7)))
            .ok()
            .unwrap();

        // Receive and validate this request
        let mut buffer = [0u8; 16384];
        let (size, source) = incoming.recv_from(&mut buffer).await.unwrap();
        let messages = Message::decode_datagram(&buffer[..size], Direction::ToServer).unwrap();
        assert_eq!(messages.len(), 2);
        assert!(matches!(messages[0], Message::Version(_)));
        let Message::Search(search_msg) = &messages[1] else {
            panic!("Didn't get a search message");
        };
        assert_eq!(search_msg.channel_name, "TEST");

        // Send a message back
        let reply = Message::SearchResponse(search_msg.respond(None, 6464));
        incoming.send_to(&reply.encode(), source).await.unwrap();

        for _ in 0..100 {
            if !collector.0.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let found = collector.0.lock().unwrap().clone();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].peer, "127.0.0.1:6464".parse().unwrap());
        assert_eq!(found[0].channels, vec![ChannelId(7)]);
        stop.cancel();
        task.await.unwrap();
    }
}
