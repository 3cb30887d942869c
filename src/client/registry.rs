//! Channels, the circuits they ride on, and their subscriptions.
//!
//! The registry is plain state behind the context's lock. Nothing here
//! performs I/O or runs application code: every operation returns an
//! [`Outbox`] of messages to send, searches to start and callbacks to invoke,
//! which the caller delivers once the lock is released.

use std::{
    collections::{BTreeMap, HashMap},
    net::SocketAddr,
    sync::{Arc, Weak},
};

use tokio::sync::watch;
use tracing::{debug, debug_span, warn};

use crate::{
    client::{
        ChannelId, ClientError, RequestKind, SubscriptionId,
        circuit::{Circuit, CircuitId, CircuitState},
        governor::DisconnectGovernor,
        searcher::{Resolution, SearchCommand, SearchHandle},
    },
    dbr::{Dbr, DbrBasicType, DbrCategory, DbrType},
    messages::{self, Access, CA_MINOR_PROTOCOL_REVISION, Message, MonitorMask},
    utils::wrapping_inplace_add,
};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    NeverSearched,
    Searching,
    Connected,
    Disconnected,
}

/// What the application knows about a connected channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInfo {
    pub id: ChannelId,
    pub name: String,
    pub native_type: DbrBasicType,
    pub native_count: u32,
    pub access: Access,
    pub server: SocketAddr,
}

/// Delivered to a channel's connection listener
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected(ChannelInfo),
    Disconnected,
    AccessRightsChanged(Access),
    /// The server refused to create the channel; it will be searched for again
    CreateFailed,
}

pub(crate) type ConnectionListener = Arc<dyn Fn(ConnectionEvent) + Send + Sync>;
pub(crate) type MonitorCallback = Arc<dyn Fn(Result<Dbr, ClientError>) + Send + Sync>;

struct Subscription {
    category: DbrCategory,
    /// `None` follows the channel's native type
    basic_type: Option<DbrBasicType>,
    count: u32,
    mask: MonitorMask,
    callback: MonitorCallback,
    /// The circuit this subscription's EVENT_ADD was last sent on
    installed_on: Option<CircuitId>,
}

impl Subscription {
    fn data_type(&self, native: DbrBasicType) -> DbrType {
        DbrType::new(self.basic_type.unwrap_or(native), self.category)
    }
}

struct Channel {
    name: String,
    state: watch::Sender<ConnectionState>,
    listener: Option<ConnectionListener>,
    native_type: Option<DbrBasicType>,
    native_count: u32,
    access: Access,
    /// Only set while connected
    server_id: Option<u32>,
    circuit: Option<Arc<Circuit>>,
    /// The circuit CREATE_CHAN was last sent on
    created_on: Option<CircuitId>,
    /// Whether the listener has been told about a connection it has not yet
    /// been told was lost
    reported_connected: bool,
    subscriptions: BTreeMap<SubscriptionId, Subscription>,
}

impl Channel {
    fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    fn info(&self, id: ChannelId) -> Option<ChannelInfo> {
        Some(ChannelInfo {
            id,
            name: self.name.clone(),
            native_type: self.native_type?,
            native_count: self.native_count,
            access: self.access,
            server: self.circuit.as_ref()?.peer(),
        })
    }

    /// The circuit, if the channel can be used on it right now
    fn live_circuit(&self) -> Option<(&Arc<Circuit>, u32, DbrBasicType)> {
        if self.connection_state() != ConnectionState::Connected {
            return None;
        }
        Some((self.circuit.as_ref()?, self.server_id?, self.native_type?))
    }
}

/// Everything an operation wants done once the registry lock is released
#[derive(Default)]
pub(crate) struct Outbox {
    pub sends: Vec<(Arc<Circuit>, Message)>,
    pub searches: Vec<SearchCommand>,
    pub notifications: Vec<(ConnectionListener, ConnectionEvent)>,
    pub events: Vec<(MonitorCallback, Result<Dbr, ClientError>)>,
    /// Circuits whose requests must all fail
    pub failed_circuits: Vec<CircuitId>,
    /// Channels whose requests must all fail
    pub failed_channels: Vec<(ChannelId, ChannelFailure)>,
    /// The governor went from idle to armed
    pub arm_governor: bool,
    /// Circuit references to drop outside the lock
    pub released: Vec<Arc<Circuit>>,
}

impl Outbox {
    fn send(&mut self, circuit: &Arc<Circuit>, message: impl Into<Message>) {
        self.sends.push((circuit.clone(), message.into()));
    }

    fn notify(&mut self, channel: &Channel, event: ConnectionEvent) {
        if let Some(listener) = &channel.listener {
            self.notifications.push((listener.clone(), event));
        }
    }
}

/// Why a channel's outstanding requests are being failed
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum ChannelFailure {
    Closed,
    Disconnected,
}

impl ChannelFailure {
    pub fn error(&self, kind: RequestKind, channel: &str) -> ClientError {
        match self {
            ChannelFailure::Closed => ClientError::ChannelClosed,
            ChannelFailure::Disconnected => ClientError::Disconnected {
                channel: channel.to_string(),
                kind,
            },
        }
    }
}

/// What a read or write needs to go out
pub(crate) struct RequestTarget {
    pub circuit: Arc<Circuit>,
    pub name: String,
    pub server_id: u32,
    pub native_type: DbrBasicType,
    pub native_count: u32,
}

pub(crate) struct Registry {
    next_channel_id: u32,
    next_subscription_id: u32,
    next_circuit_id: u64,
    channels: HashMap<ChannelId, Channel>,
    subscription_owners: HashMap<SubscriptionId, ChannelId>,
    /// At most one live circuit per peer
    circuits: HashMap<SocketAddr, Weak<Circuit>>,
    /// Channels closed while their CREATE_CHAN was in flight
    zombies: HashMap<(CircuitId, u32), Weak<Circuit>>,
    governor: DisconnectGovernor,
}

impl Registry {
    pub fn new(governor_batch: usize) -> Self {
        Registry {
            next_channel_id: 0,
            next_subscription_id: 0,
            next_circuit_id: 0,
            channels: HashMap::new(),
            subscription_owners: HashMap::new(),
            circuits: HashMap::new(),
            zombies: HashMap::new(),
            governor: DisconnectGovernor::new(governor_batch),
        }
    }

    fn handle(&self, id: ChannelId) -> Option<SearchHandle> {
        self.channels.get(&id).map(|c| SearchHandle {
            name: c.name.clone(),
            channel: id,
        })
    }

    /// Create a channel and start searching for it
    pub fn open(
        &mut self,
        name: &str,
        listener: Option<ConnectionListener>,
        outbox: &mut Outbox,
    ) -> ChannelId {
        let id = loop {
            let id = ChannelId(wrapping_inplace_add(&mut self.next_channel_id));
            if !self.channels.contains_key(&id) {
                break id;
            }
        };
        let (state, _) = watch::channel(ConnectionState::NeverSearched);
        let channel = Channel {
            name: name.to_string(),
            state,
            listener,
            native_type: None,
            native_count: 0,
            access: Access::default(),
            server_id: None,
            circuit: None,
            created_on: None,
            reported_connected: false,
            subscriptions: BTreeMap::new(),
        };
        channel.set_state(ConnectionState::Searching);
        debug!("Opening channel '{name}' as {id}");
        self.channels.insert(id, channel);
        outbox.searches.push(SearchCommand::Search(SearchHandle {
            name: name.to_string(),
            channel: id,
        }));
        id
    }

    /// Forget a channel, releasing whatever it holds on the server
    pub fn close(&mut self, id: ChannelId, outbox: &mut Outbox) -> bool {
        let Some(handle) = self.handle(id) else {
            return false;
        };
        let Some(mut channel) = self.channels.remove(&id) else {
            return false;
        };
        let _span = debug_span!("close", cid = id.0).entered();
        debug!("Closing channel '{}'", channel.name);
        self.governor.remove(id);
        for sub in channel.subscriptions.keys() {
            self.subscription_owners.remove(sub);
        }
        if channel.connection_state() == ConnectionState::Searching {
            outbox.searches.push(SearchCommand::Cancel(handle));
        }
        if let Some(circuit) = channel.circuit.take() {
            match (channel.server_id, channel.created_on) {
                (Some(server_id), _) => outbox.send(
                    &circuit,
                    messages::ClearChannel {
                        server_id,
                        client_id: id.0,
                    },
                ),
                (None, Some(created_on)) if created_on == circuit.id() => {
                    debug!("Channel closed with create in flight");
                    self.zombies
                        .insert((created_on, id.0), Arc::downgrade(&circuit));
                }
                _ => (),
            }
            outbox.released.push(circuit);
        }
        outbox.failed_channels.push((id, ChannelFailure::Closed));
        true
    }

    pub fn close_all(&mut self, outbox: &mut Outbox) {
        let ids: Vec<_> = self.channels.keys().copied().collect();
        for id in ids {
            self.close(id, outbox);
        }
    }

    pub fn state(&self, id: ChannelId) -> Option<ConnectionState> {
        self.channels.get(&id).map(Channel::connection_state)
    }

    pub fn watch_state(&self, id: ChannelId) -> Option<watch::Receiver<ConnectionState>> {
        self.channels.get(&id).map(|c| c.state.subscribe())
    }

    pub fn info(&self, id: ChannelId) -> Option<ChannelInfo> {
        let channel = self.channels.get(&id)?;
        if channel.connection_state() != ConnectionState::Connected {
            return None;
        }
        channel.info(id)
    }

    /// Where a request on this channel should go
    pub fn request_target(&self, id: ChannelId, needs: Access) -> Result<RequestTarget, ClientError> {
        let channel = self.channels.get(&id).ok_or(ClientError::ChannelClosed)?;
        let (circuit, server_id, native_type) = channel
            .live_circuit()
            .ok_or(ClientError::ChannelNotConnected)?;
        if needs.can_read() && !channel.access.can_read() {
            return Err(ClientError::NoReadAccess);
        }
        if needs.can_write() && !channel.access.can_write() {
            return Err(ClientError::NoWriteAccess);
        }
        Ok(RequestTarget {
            circuit: circuit.clone(),
            name: channel.name.clone(),
            server_id,
            native_type,
            native_count: channel.native_count,
        })
    }

    /// Add a subscription, installing it now if the channel is connected
    #[allow(clippy::too_many_arguments)]
    pub fn subscribe(
        &mut self,
        id: ChannelId,
        category: DbrCategory,
        basic_type: Option<DbrBasicType>,
        count: u32,
        mask: MonitorMask,
        callback: MonitorCallback,
        outbox: &mut Outbox,
    ) -> Result<SubscriptionId, ClientError> {
        if !self.channels.contains_key(&id) {
            return Err(ClientError::ChannelClosed);
        }
        let sub_id = loop {
            let sub_id = SubscriptionId(wrapping_inplace_add(&mut self.next_subscription_id));
            if !self.subscription_owners.contains_key(&sub_id) {
                break sub_id;
            }
        };
        let channel = self
            .channels
            .get_mut(&id)
            .ok_or(ClientError::ChannelClosed)?;
        let mut subscription = Subscription {
            category,
            basic_type,
            count,
            mask,
            callback,
            installed_on: None,
        };
        if let Some((circuit, server_id, native_type)) = channel.live_circuit() {
            outbox.send(
                circuit,
                messages::EventAdd {
                    data_type: subscription.data_type(native_type),
                    data_count: element_count(count, channel.native_count, circuit),
                    server_id,
                    subscription_id: sub_id.0,
                    mask,
                },
            );
            subscription.installed_on = Some(circuit.id());
        }
        channel.subscriptions.insert(sub_id, subscription);
        self.subscription_owners.insert(sub_id, id);
        Ok(sub_id)
    }

    /// Remove a subscription. Late events for it are discarded.
    pub fn unsubscribe(&mut self, id: SubscriptionId, outbox: &mut Outbox) -> bool {
        let Some(channel_id) = self.subscription_owners.remove(&id) else {
            return false;
        };
        let Some(channel) = self.channels.get_mut(&channel_id) else {
            return false;
        };
        let Some(subscription) = channel.subscriptions.remove(&id) else {
            return false;
        };
        if let Some((circuit, server_id, native_type)) = channel.live_circuit()
            && subscription.installed_on == Some(circuit.id())
        {
            outbox.send(
                circuit,
                messages::EventCancel {
                    data_type: subscription.data_type(native_type),
                    data_count: subscription.count,
                    server_id,
                    subscription_id: id.0,
                },
            );
        }
        true
    }

    /// A search found the server for some channels.
    ///
    /// `connect` starts a circuit when there is no usable one to the peer.
    pub fn on_search_reply(
        &mut self,
        resolution: Resolution,
        connect: &mut dyn FnMut(CircuitId, SocketAddr) -> Circuit,
        outbox: &mut Outbox,
    ) {
        let circuit = match self.circuits.get(&resolution.peer).and_then(Weak::upgrade) {
            Some(circuit)
                if matches!(
                    circuit.state(),
                    CircuitState::Connecting | CircuitState::Connected
                ) =>
            {
                circuit
            }
            _ => {
                let id = CircuitId(wrapping_inplace_add(&mut self.next_circuit_id));
                debug!("Starting circuit {id} to {}", resolution.peer);
                let circuit = Arc::new(connect(id, resolution.peer));
                self.circuits
                    .insert(resolution.peer, Arc::downgrade(&circuit));
                circuit
            }
        };
        let connected = circuit.state() == CircuitState::Connected;
        for id in resolution.channels {
            let Some(channel) = self.channels.get_mut(&id) else {
                continue;
            };
            if channel.circuit.is_some() || channel.connection_state() != ConnectionState::Searching {
                continue;
            }
            debug!("Channel '{}' found on {}", channel.name, resolution.peer);
            channel.circuit = Some(circuit.clone());
            if connected {
                outbox.send(&circuit, create_channel(id, &channel.name));
                channel.created_on = Some(circuit.id());
            }
        }
    }

    /// Send CREATE_CHAN for every attached channel not yet created on the circuit
    pub fn on_circuit_connected(&mut self, circuit_id: CircuitId, outbox: &mut Outbox) {
        for (id, channel) in self.channels.iter_mut() {
            let Some(circuit) = &channel.circuit else {
                continue;
            };
            if circuit.id() != circuit_id || channel.created_on == Some(circuit_id) {
                continue;
            }
            outbox.send(circuit, create_channel(*id, &channel.name));
            channel.created_on = Some(circuit_id);
        }
    }

    /// Detach everything from a dead circuit and queue it on the governor
    pub fn on_circuit_disconnected(&mut self, circuit_id: CircuitId, outbox: &mut Outbox) {
        self.circuits.retain(|_, weak| {
            weak.upgrade()
                .is_some_and(|c| c.id() != circuit_id)
        });
        self.zombies.retain(|(circuit, _), _| *circuit != circuit_id);
        let affected: Vec<ChannelId> = self
            .channels
            .iter()
            .filter(|(_, c)| c.circuit.as_ref().is_some_and(|c| c.id() == circuit_id))
            .map(|(id, _)| *id)
            .collect();
        debug!(
            "Circuit {circuit_id} lost, {} channels disconnected",
            affected.len()
        );
        for id in affected {
            self.disconnect_channel(id, outbox);
        }
        outbox.failed_circuits.push(circuit_id);
    }

    fn disconnect_channel(&mut self, id: ChannelId, outbox: &mut Outbox) {
        let Some(channel) = self.channels.get_mut(&id) else {
            return;
        };
        if let Some(circuit) = channel.circuit.take() {
            outbox.released.push(circuit);
        }
        channel.server_id = None;
        channel.created_on = None;
        for subscription in channel.subscriptions.values_mut() {
            subscription.installed_on = None;
        }
        channel.set_state(ConnectionState::Disconnected);
        if self.governor.enqueue(id) {
            outbox.arm_governor = true;
        }
    }

    /// Release the next batch of disconnected channels for searching
    pub fn release_disconnected(&mut self, outbox: &mut Outbox) -> bool {
        for id in self.governor.tick() {
            let Some(channel) = self.channels.get_mut(&id) else {
                continue;
            };
            if channel.connection_state() != ConnectionState::Disconnected
                || channel.circuit.is_some()
            {
                continue;
            }
            if channel.reported_connected {
                channel.reported_connected = false;
                outbox.notify(channel, ConnectionEvent::Disconnected);
            }
            channel.set_state(ConnectionState::Searching);
            outbox.searches.push(SearchCommand::Search(SearchHandle {
                name: channel.name.clone(),
                channel: id,
            }));
        }
        !self.governor.is_empty()
    }

    /// Handle a channel-level message from a circuit
    pub fn on_message(&mut self, circuit_id: CircuitId, message: Message, outbox: &mut Outbox) {
        match message {
            Message::CreateChannelResponse(msg) => self.on_created(circuit_id, msg, outbox),
            Message::CreateChannelFailure(msg) => {
                let id = ChannelId(msg.client_id);
                let Some(channel) = self.attached(id, circuit_id) else {
                    self.zombies.remove(&(circuit_id, msg.client_id));
                    debug!("Got channel failure message for an unknown channel {id}");
                    return;
                };
                warn!("Server could not create channel '{}'", channel.name);
                outbox.notify(channel, ConnectionEvent::CreateFailed);
                self.disconnect_channel(id, outbox);
            }
            Message::AccessRights(msg) => {
                let id = ChannelId(msg.client_id);
                let Some(channel) = self.attached_mut(id, circuit_id) else {
                    debug!("Got access rights for closed/uncreated channel {id}");
                    return;
                };
                let _span = debug_span!("handle_message", cid = msg.client_id).entered();
                debug!("Got AccessRights update: {}", msg.access_rights);
                channel.access = msg.access_rights;
                if channel.connection_state() == ConnectionState::Connected {
                    let event = ConnectionEvent::AccessRightsChanged(msg.access_rights);
                    outbox.notify(channel, event);
                }
            }
            Message::ServerDisconnect(msg) => {
                let id = ChannelId(msg.client_id);
                if self.attached(id, circuit_id).is_none() {
                    debug!("Server disconnected unknown channel {id}");
                    return;
                }
                debug!("Server disconnected channel {id}");
                self.disconnect_channel(id, outbox);
                outbox
                    .failed_channels
                    .push((id, ChannelFailure::Disconnected));
            }
            Message::EventAddResponse(msg) => self.on_event(circuit_id, msg, outbox),
            Message::ClearChannel(msg) => {
                debug!("Server confirmed clearing channel {}", msg.client_id)
            }
            msg => debug!("Got unhandled message from server: {msg:?}"),
        }
    }

    /// A subscription was refused by the server
    pub fn on_subscription_error(&mut self, id: SubscriptionId, error: ClientError, outbox: &mut Outbox) {
        let Some(channel) = self
            .subscription_owners
            .get(&id)
            .and_then(|c| self.channels.get(c))
        else {
            return;
        };
        if let Some(subscription) = channel.subscriptions.get(&id) {
            outbox.events.push((subscription.callback.clone(), Err(error)));
        }
    }

    fn attached(&self, id: ChannelId, circuit_id: CircuitId) -> Option<&Channel> {
        self.channels
            .get(&id)
            .filter(|c| c.circuit.as_ref().is_some_and(|c| c.id() == circuit_id))
    }

    fn attached_mut(&mut self, id: ChannelId, circuit_id: CircuitId) -> Option<&mut Channel> {
        self.channels
            .get_mut(&id)
            .filter(|c| c.circuit.as_ref().is_some_and(|c| c.id() == circuit_id))
    }

    fn on_created(
        &mut self,
        circuit_id: CircuitId,
        msg: messages::CreateChannelResponse,
        outbox: &mut Outbox,
    ) {
        let _span = debug_span!("handle_message", cid = msg.client_id).entered();
        if let Some(circuit) = self
            .zombies
            .remove(&(circuit_id, msg.client_id))
            .and_then(|w| w.upgrade())
        {
            debug!("Clearing channel closed before its creation completed");
            outbox.send(
                &circuit,
                messages::ClearChannel {
                    server_id: msg.server_id,
                    client_id: msg.client_id,
                },
            );
            return;
        }
        let id = ChannelId(msg.client_id);
        let Some(channel) = self.attached_mut(id, circuit_id) else {
            debug!("Got message for closed/uncreated channel: {msg:?}");
            return;
        };
        if channel.server_id.is_some() {
            debug!("Ignoring repeated create response");
            return;
        }
        channel.native_type = Some(msg.data_type);
        channel.native_count = msg.data_count;
        channel.server_id = Some(msg.server_id);
        channel.set_state(ConnectionState::Connected);
        channel.reported_connected = true;
        let Some(circuit) = channel.circuit.clone() else {
            return;
        };
        for (sub_id, subscription) in channel.subscriptions.iter_mut() {
            if subscription.installed_on == Some(circuit_id) {
                continue;
            }
            outbox.send(
                &circuit,
                messages::EventAdd {
                    data_type: subscription.data_type(msg.data_type),
                    data_count: element_count(subscription.count, msg.data_count, &circuit),
                    server_id: msg.server_id,
                    subscription_id: sub_id.0,
                    mask: subscription.mask,
                },
            );
            subscription.installed_on = Some(circuit_id);
        }
        if let Some(info) = channel.info(id) {
            debug!(
                "Channel '{}' connected: {} x {}",
                info.name, info.native_type, info.native_count
            );
            outbox.notify(channel, ConnectionEvent::Connected(info));
        }
    }

    fn on_event(&mut self, circuit_id: CircuitId, msg: messages::EventAddResponse, outbox: &mut Outbox) {
        let id = SubscriptionId(msg.subscription_id);
        let Some(channel) = self
            .subscription_owners
            .get(&id)
            .and_then(|c| self.channels.get(c))
        else {
            debug!("Discarding event for unknown subscription {id}");
            return;
        };
        let Some(subscription) = channel
            .subscriptions
            .get(&id)
            .filter(|s| s.installed_on == Some(circuit_id))
        else {
            debug!("Discarding event for subscription {id} from another circuit");
            return;
        };
        let result = if !msg.status.is_success() {
            Err(ClientError::ServerError {
                condition: msg.status,
                message: String::new(),
            })
        } else if msg.data.is_empty() {
            debug!("Subscription {id} ended by the server");
            return;
        } else {
            Dbr::from_bytes(msg.data_type, msg.data_count as usize, &msg.data)
                .map_err(|e| ClientError::InvalidResponse(e.to_string()))
        };
        outbox.events.push((subscription.callback.clone(), result));
    }
}

/// Servers before revision 13 cannot take zero to mean the native count
fn element_count(requested: u32, native_count: u32, circuit: &Circuit) -> u32 {
    if requested == 0 && circuit.minor_version() < 13 {
        native_count
    } else {
        requested
    }
}

fn create_channel(id: ChannelId, name: &str) -> messages::CreateChannel {
    messages::CreateChannel {
        client_id: id.0,
        protocol_version: CA_MINOR_PROTOCOL_REVISION as u32,
        channel_name: name.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    fn peer() -> SocketAddr {
        "127.0.0.1:5064".parse().unwrap()
    }

    fn detached(id: CircuitId, peer: SocketAddr) -> Circuit {
        Circuit::detached(id, peer, CircuitState::Connecting)
    }

    fn resolve(registry: &mut Registry, channels: Vec<ChannelId>) -> Arc<Circuit> {
        let mut outbox = Outbox::default();
        registry.on_search_reply(
            Resolution {
                name: "ignored".into(),
                channels,
                peer: peer(),
                minor_version: CA_MINOR_PROTOCOL_REVISION,
            },
            &mut detached,
            &mut outbox,
        );
        registry
            .circuits
            .get(&peer())
            .and_then(Weak::upgrade)
            .unwrap()
    }

    fn created(channel: ChannelId) -> Message {
        Message::CreateChannelResponse(messages::CreateChannelResponse {
            data_type: DbrBasicType::Double,
            data_count: 1,
            client_id: channel.0,
            server_id: 1000 + channel.0,
        })
    }

    fn messages_of(outbox: &Outbox) -> Vec<Message> {
        outbox.sends.iter().map(|(_, m)| m.clone()).collect()
    }

    fn ignore() -> MonitorCallback {
        Arc::new(|_| ())
    }

    #[test]
    fn subscriptions_are_replayed_once() {
        const K: usize = 5;
        const M: usize = 3;
        let mut registry = Registry::new(100);
        let mut outbox = Outbox::default();
        let channels: Vec<_> = (0..K)
            .map(|n| registry.open(&format!("PV:{n}"), None, &mut outbox))
            .collect();
        assert_eq!(outbox.searches.len(), K);
        for channel in &channels {
            for _ in 0..M {
                registry
                    .subscribe(
                        *channel,
                        DbrCategory::Time,
                        None,
                        0,
                        MonitorMask::default(),
                        ignore(),
                        &mut outbox,
                    )
                    .unwrap();
            }
        }
        // Nothing is connected yet
        assert!(outbox.sends.is_empty());

        let circuit = resolve(&mut registry, channels.clone());
        circuit.set_state(CircuitState::Connected);
        for _ in 0..2 {
            let mut outbox = Outbox::default();
            registry.on_circuit_connected(circuit.id(), &mut outbox);
            let creates = messages_of(&outbox)
                .into_iter()
                .filter(|m| matches!(m, Message::CreateChannel(_)))
                .count();
            // Only the first notification creates anything
            assert!(creates == K || creates == 0);
        }

        let mut event_adds = Vec::new();
        for _ in 0..2 {
            for channel in &channels {
                let mut outbox = Outbox::default();
                registry.on_message(circuit.id(), created(*channel), &mut outbox);
                event_adds.extend(messages_of(&outbox));
            }
        }
        assert_eq!(event_adds.len(), K * M);
        assert!(event_adds.iter().all(|m| match m {
            Message::EventAdd(add) =>
                add.data_type == DbrType::new(DbrBasicType::Double, DbrCategory::Time),
            _ => false,
        }));
        for channel in &channels {
            assert_eq!(registry.state(*channel), Some(ConnectionState::Connected));
        }
    }

    #[test]
    fn reconnect_replays_subscriptions_on_the_new_circuit() {
        const K: usize = 4;
        const M: usize = 3;
        let mut registry = Registry::new(100);
        let mut outbox = Outbox::default();
        let channels: Vec<_> = (0..K)
            .map(|n| registry.open(&format!("PV:{n}"), None, &mut outbox))
            .collect();
        for channel in &channels {
            for _ in 0..M {
                registry
                    .subscribe(
                        *channel,
                        DbrCategory::Basic,
                        None,
                        0,
                        MonitorMask::default(),
                        ignore(),
                        &mut outbox,
                    )
                    .unwrap();
            }
        }

        let first = resolve(&mut registry, channels.clone());
        first.set_state(CircuitState::Connected);
        let mut outbox = Outbox::default();
        registry.on_circuit_connected(first.id(), &mut outbox);
        for channel in &channels {
            registry.on_message(first.id(), created(*channel), &mut outbox);
        }
        let installed = messages_of(&outbox)
            .into_iter()
            .filter(|m| matches!(m, Message::EventAdd(_)))
            .count();
        assert_eq!(installed, K * M);

        first.set_state(CircuitState::Disconnected);
        let mut outbox = Outbox::default();
        registry.on_circuit_disconnected(first.id(), &mut outbox);
        assert_eq!(outbox.released.len(), K);
        let mut outbox = Outbox::default();
        assert!(!registry.release_disconnected(&mut outbox));
        assert_eq!(outbox.searches.len(), K);

        let second = resolve(&mut registry, channels.clone());
        assert_ne!(second.id(), first.id());
        second.set_state(CircuitState::Connected);
        let mut sends = Vec::new();
        let mut outbox = Outbox::default();
        registry.on_circuit_connected(second.id(), &mut outbox);
        sends.append(&mut outbox.sends);
        for channel in &channels {
            let mut outbox = Outbox::default();
            registry.on_message(second.id(), created(*channel), &mut outbox);
            // A late reply on the dead circuit must not install anything
            registry.on_message(first.id(), created(*channel), &mut outbox);
            sends.append(&mut outbox.sends);
        }

        assert!(sends.iter().all(|(circuit, _)| circuit.id() == second.id()));
        let replayed: Vec<_> = sends
            .iter()
            .filter_map(|(_, m)| match m {
                Message::EventAdd(add) => Some(add.subscription_id),
                _ => None,
            })
            .collect();
        assert_eq!(replayed.len(), K * M);
        let distinct: std::collections::BTreeSet<_> = replayed.iter().collect();
        assert_eq!(distinct.len(), K * M);
        for channel in &channels {
            assert_eq!(registry.state(*channel), Some(ConnectionState::Connected));
        }
    }

    #[test]
    fn disconnect_goes_through_the_governor() {
        let mut registry = Registry::new(2);
        let mut outbox = Outbox::default();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let listener: ConnectionListener = Arc::new(move |e| sink.lock().unwrap().push(e));
        let channels: Vec<_> = (0..3)
            .map(|n| registry.open(&format!("PV:{n}"), Some(listener.clone()), &mut outbox))
            .collect();
        let circuit = resolve(&mut registry, channels.clone());
        circuit.set_state(CircuitState::Connected);
        let mut outbox = Outbox::default();
        registry.on_circuit_connected(circuit.id(), &mut outbox);
        for channel in &channels {
            registry.on_message(circuit.id(), created(*channel), &mut outbox);
        }
        assert_eq!(outbox.notifications.len(), 3);

        let mut outbox = Outbox::default();
        registry.on_circuit_disconnected(circuit.id(), &mut outbox);
        assert!(outbox.arm_governor);
        assert_eq!(outbox.failed_circuits, vec![circuit.id()]);
        assert_eq!(outbox.released.len(), 3);
        // Listeners hear nothing until the governor releases the channel
        assert!(outbox.notifications.is_empty());
        for channel in &channels {
            assert_eq!(registry.state(*channel), Some(ConnectionState::Disconnected));
        }

        let mut outbox = Outbox::default();
        assert!(registry.release_disconnected(&mut outbox));
        assert_eq!(outbox.searches.len(), 2);
        assert_eq!(outbox.notifications.len(), 2);
        let mut outbox = Outbox::default();
        assert!(!registry.release_disconnected(&mut outbox));
        assert_eq!(outbox.searches.len(), 1);
        for channel in &channels {
            assert_eq!(registry.state(*channel), Some(ConnectionState::Searching));
        }
    }

    #[test]
    fn close_during_create_clears_the_server_channel() {
        let mut registry = Registry::new(100);
        let mut outbox = Outbox::default();
        let channel = registry.open("PV", None, &mut outbox);
        let circuit = resolve(&mut registry, vec![channel]);
        circuit.set_state(CircuitState::Connected);
        registry.on_circuit_connected(circuit.id(), &mut outbox);

        let mut outbox = Outbox::default();
        assert!(registry.close(channel, &mut outbox));
        assert!(outbox.sends.is_empty());
        assert_eq!(
            outbox.failed_channels,
            vec![(channel, ChannelFailure::Closed)]
        );

        let mut outbox = Outbox::default();
        registry.on_message(circuit.id(), created(channel), &mut outbox);
        assert_eq!(
            messages_of(&outbox),
            vec![Message::ClearChannel(messages::ClearChannel {
                server_id: 1000 + channel.0,
                client_id: channel.0,
            })]
        );
        assert_eq!(registry.state(channel), None);
    }

    #[test]
    fn create_failure_is_local_to_the_channel() {
        let mut registry = Registry::new(100);
        let mut outbox = Outbox::default();
        let good = registry.open("GOOD", None, &mut outbox);
        let bad = registry.open("BAD", None, &mut outbox);
        let circuit = resolve(&mut registry, vec![good, bad]);
        circuit.set_state(CircuitState::Connected);
        registry.on_circuit_connected(circuit.id(), &mut outbox);
        registry.on_message(circuit.id(), created(good), &mut outbox);

        let mut outbox = Outbox::default();
        registry.on_message(
            circuit.id(),
            Message::CreateChannelFailure(messages::CreateChannelFailure { client_id: bad.0 }),
            &mut outbox,
        );
        assert!(outbox.arm_governor);
        assert_eq!(registry.state(bad), Some(ConnectionState::Disconnected));
        assert_eq!(registry.state(good), Some(ConnectionState::Connected));
    }

    #[test]
    fn events_reach_the_subscriber_until_unsubscribed() {
        let mut registry = Registry::new(100);
        let mut outbox = Outbox::default();
        let channel = registry.open("PV", None, &mut outbox);
        let circuit = resolve(&mut registry, vec![channel]);
        circuit.set_state(CircuitState::Connected);
        registry.on_circuit_connected(circuit.id(), &mut outbox);
        registry.on_message(circuit.id(), created(channel), &mut outbox);
        let mut outbox = Outbox::default();
        let sub = registry
            .subscribe(
                channel,
                DbrCategory::Basic,
                None,
                1,
                MonitorMask::VALUE,
                ignore(),
                &mut outbox,
            )
            .unwrap();
        assert!(matches!(messages_of(&outbox)[0], Message::EventAdd(_)));

        let event = || {
            Message::EventAddResponse(messages::EventAddResponse {
                data_type: DbrType::new(DbrBasicType::Double, DbrCategory::Basic),
                data_count: 1,
                status: messages::ErrorCondition::Normal,
                subscription_id: sub.0,
                data: 4.5f64.to_be_bytes().to_vec(),
            })
        };
        let mut outbox = Outbox::default();
        registry.on_message(circuit.id(), event(), &mut outbox);
        assert_eq!(outbox.events.len(), 1);
        assert_eq!(
            outbox.events[0].1,
            Ok(Dbr::Basic(crate::dbr::DbrValue::Double(vec![4.5])))
        );

        let mut outbox = Outbox::default();
        assert!(registry.unsubscribe(sub, &mut outbox));
        assert!(matches!(messages_of(&outbox)[0], Message::EventCancel(_)));
        let mut outbox = Outbox::default();
        registry.on_message(circuit.id(), event(), &mut outbox);
        assert!(outbox.events.is_empty());
    }
}
