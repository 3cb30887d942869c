//! One client's TCP circuit, as seen from the server.
//!
//! Mirrors the client circuit: a receive task decodes requests and answers
//! them, a send task drains the circuit's queue. Subscription updates reach the
//! same queue from the [`EventDispatcher`] on whatever thread publishes.

use std::{collections::HashMap, net::SocketAddr, sync::Arc};

use thiserror::Error;
use tokio::{
    io::AsyncWriteExt,
    net::{TcpStream, tcp::OwnedWriteHalf},
    select,
};
use tokio_stream::StreamExt;
use tokio_util::{codec::FramedRead, sync::CancellationToken};
use tracing::{debug, error, trace, warn};

use crate::{
    dbr::{Dbr, DbrType},
    messages::{self, Access, CaCodec, DecodeError, Direction, ErrorCondition, Message},
    providers::Provider,
    server::{
        ServerShared,
        dispatcher::{EventSink, SubscriptionId, SubscriptionRequest},
    },
};

#[derive(Error, Debug)]
pub(crate) enum CircuitError {
    #[error("Client sent {0} before VERSION")]
    NoVersion(String),
    #[error("Client protocol version {0} is too old")]
    VersionMismatch(u16),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("Client closed the connection")]
    PeerClosed,
    #[error("Server stopping")]
    Stopped,
}

#[derive(Debug)]
struct Channel {
    name: String,
    client_id: u32,
    access: Access,
    /// Client subscription ids against their dispatcher registrations
    subscriptions: HashMap<u32, SubscriptionId>,
}

/// Per-connection state, owned by the receive task
struct ClientCircuit<P: Provider> {
    shared: Arc<ServerShared<P>>,
    sink: Arc<EventSink>,
    peer: SocketAddr,
    host_name: Option<String>,
    user_name: Option<String>,
    channels: HashMap<u32, Channel>,
    next_server_id: u32,
}

/// Serve one accepted connection until either side closes it
pub(crate) async fn serve_circuit<P: Provider>(
    stream: TcpStream,
    peer: SocketAddr,
    shared: Arc<ServerShared<P>>,
    stop: CancellationToken,
) {
    let _ = stream.set_nodelay(true);
    let (read, write) = stream.into_split();
    let mut framed = FramedRead::with_capacity(
        read,
        CaCodec::new(Direction::ToServer).with_max_payload(shared.config.max_array_bytes),
        16384usize,
    );
    let sink = Arc::new(EventSink::new(shared.config.queue_high_water));
    let dead = stop.child_token();
    let sender = tokio::spawn(send_loop(sink.clone(), write, dead.clone()));

    let mut circuit = ClientCircuit {
        shared,
        sink,
        peer,
        host_name: None,
        user_name: None,
        channels: HashMap::new(),
        next_server_id: 1,
    };
    let result = circuit.run(&mut framed, &dead).await;
    match &result {
        Err(CircuitError::PeerClosed) | Err(CircuitError::Stopped) => {
            debug!("Circuit to {peer} closed")
        }
        Err(e) => warn!("Closing circuit to {peer}: {e}"),
        Ok(()) => (),
    }
    circuit.release_all();
    // Let anything already queued go out before the socket closes
    circuit.sink.queue().close();
    if matches!(result, Err(CircuitError::Stopped)) {
        dead.cancel();
    }
    let _ = sender.await;
}

async fn send_loop(sink: Arc<EventSink>, mut write: OwnedWriteHalf, dead: CancellationToken) {
    while let Some(batch) = sink.queue().next_batch().await {
        for message in &batch {
            trace!("Sending {message:?}");
        }
        let bytes = Message::encode_all(&batch);
        select! {
            _ = dead.cancelled() => break,
            r = write.write_all(&bytes) => if let Err(e) = r {
                error!("Failed to write messages to client, aborting: {e}");
                break;
            }
        }
    }
    sink.queue().close();
    dead.cancel();
    let _ = write.shutdown().await;
}

impl<P: Provider> ClientCircuit<P> {
    async fn next_message(
        framed: &mut FramedRead<tokio::net::tcp::OwnedReadHalf, CaCodec>,
        dead: &CancellationToken,
    ) -> Result<Message, CircuitError> {
        select! {
            _ = dead.cancelled() => Err(CircuitError::Stopped),
            incoming = framed.next() => match incoming {
                Some(Ok(message)) => Ok(message),
                Some(Err(e)) => Err(e.into()),
                None => Err(CircuitError::PeerClosed),
            }
        }
    }

    async fn run(
        &mut self,
        framed: &mut FramedRead<tokio::net::tcp::OwnedReadHalf, CaCodec>,
        dead: &CancellationToken,
    ) -> Result<(), CircuitError> {
        let version = match Self::next_message(framed, dead).await? {
            Message::Version(version) => version,
            other => return Err(CircuitError::NoVersion(format!("{other:?}"))),
        };
        if !version.is_compatible() {
            return Err(CircuitError::VersionMismatch(version.protocol_version));
        }
        debug!("Client {} speaks protocol {}", self.peer, version.protocol_version);
        self.send(messages::Version::default());

        loop {
            let message = Self::next_message(framed, dead).await?;
            trace!("Received {message:?}");
            self.handle(message);
        }
    }

    fn send(&self, message: impl Into<Message>) {
        self.sink.queue().push(message.into());
    }

    fn handle(&mut self, message: Message) {
        match message {
            Message::Echo => self.send(Message::Echo),
            Message::Version(_) => debug!("Ignoring repeated VERSION"),
            Message::HostName(msg) => self.host_name = Some(msg.name),
            Message::ClientName(msg) => self.user_name = Some(msg.name),
            Message::CreateChannel(msg) => self.create_channel(msg),
            Message::ClearChannel(msg) => self.clear_channel(msg),
            Message::ReadNotify(msg) => self.read_notify(msg),
            Message::Write(ref msg) => {
                if let Err(condition) = self.write(msg.server_id, msg.data_type, msg.data_count, &msg.data) {
                    self.send_error(&message, msg.server_id, condition);
                }
            }
            Message::WriteNotify(msg) => {
                let status = self
                    .write(msg.server_id, msg.data_type, msg.data_count, &msg.data)
                    .err()
                    .unwrap_or(ErrorCondition::Normal);
                self.send(messages::WriteNotifyResponse {
                    data_type: msg.data_type,
                    data_count: msg.data_count,
                    status,
                    client_ioid: msg.client_ioid,
                });
            }
            Message::EventAdd(ref msg) => {
                if let Err(condition) = self.event_add(msg) {
                    self.send_error(&message, msg.server_id, condition);
                }
            }
            Message::EventCancel(msg) => self.event_cancel(msg),
            Message::EventsOff => self.sink.events_off(),
            Message::EventsOn => self.sink.events_on(),
            Message::Search(msg) => {
                // Circuit searches are answered only when the name is ours
                if self.shared.provider.provides(&msg.channel_name) {
                    self.send(msg.respond(None, self.shared.connection_port));
                }
            }
            msg => warn!("Ignoring unexpected message from client: {msg:?}"),
        }
    }

    fn send_error(&self, request: &Message, server_id: u32, condition: ErrorCondition) {
        let channel = self.channels.get(&server_id);
        self.send(messages::ECAError {
            client_id: channel.map_or(0, |c| c.client_id),
            condition,
            original_request: request.header(),
            error_message: channel.map(|c| c.name.clone()).unwrap_or_default(),
        });
    }

    fn create_channel(&mut self, msg: messages::CreateChannel) {
        let name = msg.channel_name;
        let provider = &self.shared.provider;
        let native = provider
            .provides(&name)
            .then(|| provider.read_value(&name, None))
            .transpose();
        let native = match native {
            Ok(Some(native)) => native,
            Ok(None) => {
                debug!("Refusing channel for unknown name {name}");
                self.send(messages::CreateChannelFailure {
                    client_id: msg.client_id,
                });
                return;
            }
            Err(e) => {
                warn!("Could not read {name} to create channel: {e}");
                self.send(messages::CreateChannelFailure {
                    client_id: msg.client_id,
                });
                return;
            }
        };
        let access = provider.access_rights(&name, self.user_name.as_deref(), self.host_name.as_deref());
        let server_id = self.next_server_id;
        self.next_server_id = self.next_server_id.wrapping_add(1);
        debug!(
            "Creating channel {server_id} to {name} for {}@{}: {access}",
            self.user_name.as_deref().unwrap_or("?"),
            self.host_name.as_deref().unwrap_or("?")
        );
        self.sink.queue().push_all([
            messages::AccessRights {
                client_id: msg.client_id,
                access_rights: access,
            }
            .into(),
            messages::CreateChannelResponse {
                data_type: native.data_type().basic_type,
                data_count: native.value().count() as u32,
                client_id: msg.client_id,
                server_id,
            }
            .into(),
        ]);
        self.channels.insert(
            server_id,
            Channel {
                name,
                client_id: msg.client_id,
                access,
                subscriptions: HashMap::new(),
            },
        );
    }

    fn clear_channel(&mut self, msg: messages::ClearChannel) {
        match self.channels.remove(&msg.server_id) {
            Some(channel) => {
                for id in channel.subscriptions.values() {
                    self.shared.dispatcher.cancel_subscription(*id);
                }
                debug!("Cleared channel {} to {}", msg.server_id, channel.name);
            }
            None => debug!("Clearing unknown channel {}", msg.server_id),
        }
        self.send(msg);
    }

    fn read_notify(&self, msg: messages::ReadNotify) {
        let rendered = self.channels.get(&msg.server_id).ok_or(ErrorCondition::BadChId).and_then(|channel| {
            if !channel.access.can_read() {
                return Err(ErrorCondition::NoRdAccess);
            }
            self.shared
                .provider
                .read_value(&channel.name, Some(msg.data_type))?
                .convert_to(msg.data_type)
        });
        let count = (msg.data_count > 0).then_some(msg.data_count as usize);
        let response = match rendered {
            Ok(value) => {
                let (elements, data) = value.to_bytes(count);
                msg.respond(elements as u32, data)
            }
            Err(status) => {
                let elements = count.unwrap_or(1);
                messages::ReadNotifyResponse {
                    status,
                    ..msg.respond(elements as u32, vec![0; msg.data_type.payload_size(elements)])
                }
            }
        };
        self.send(response);
    }

    fn write(
        &self,
        server_id: u32,
        data_type: DbrType,
        data_count: u32,
        data: &[u8],
    ) -> Result<(), ErrorCondition> {
        let channel = self.channels.get(&server_id).ok_or(ErrorCondition::BadChId)?;
        if !channel.access.can_write() {
            return Err(ErrorCondition::NoWtAccess);
        }
        let value = Dbr::from_bytes(data_type, data_count as usize, data).map_err(|e| {
            warn!("Undecodable write to {}: {e}", channel.name);
            ErrorCondition::BadCount
        })?;
        self.shared.provider.write_value(&channel.name, value)
    }

    fn event_add(&mut self, msg: &messages::EventAdd) -> Result<(), ErrorCondition> {
        let channel = self.channels.get_mut(&msg.server_id).ok_or(ErrorCondition::BadChId)?;
        if !channel.access.can_read() {
            return Err(ErrorCondition::NoRdAccess);
        }
        if msg.mask.is_empty() {
            return Err(ErrorCondition::BadMask);
        }
        let initial = self.shared.provider.read_value(&channel.name, Some(msg.data_type))?;
        let request = SubscriptionRequest {
            subscription_id: msg.subscription_id,
            data_type: msg.data_type,
            data_count: msg.data_count,
            mask: msg.mask,
        };
        let id = self.shared.dispatcher.register_subscription(
            &channel.name,
            request,
            self.shared.provider.filters(&channel.name),
            self.sink.clone(),
            initial,
        );
        if let Some(previous) = channel.subscriptions.insert(msg.subscription_id, id) {
            debug!("Client reused subscription id {}, replacing", msg.subscription_id);
            self.shared.dispatcher.cancel_subscription(previous);
        }
        Ok(())
    }

    fn event_cancel(&mut self, msg: messages::EventCancel) {
        let registration = self
            .channels
            .get_mut(&msg.server_id)
            .and_then(|c| c.subscriptions.remove(&msg.subscription_id));
        match registration {
            Some(id) => {
                self.shared.dispatcher.cancel_subscription(id);
                self.send(msg.confirmation());
            }
            None => debug!("Cancel for unknown subscription {}", msg.subscription_id),
        }
    }

    /// Drop every subscription this circuit holds
    fn release_all(&mut self) {
        for (_, channel) in self.channels.drain() {
            for id in channel.subscriptions.values() {
                self.shared.dispatcher.cancel_subscription(*id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::{io::AsyncReadExt, net::TcpListener};

    use super::*;
    use crate::{
        config::{BackpressurePolicy, ServerConfig},
        dbr::{DbrBasicType, DbrCategory, DbrValue},
        messages::MonitorMask,
        providers::{FieldLog, IntercomProvider, Provider},
        server::dispatcher::EventDispatcher,
    };

    struct Client {
        stream: TcpStream,
        buffer: Vec<u8>,
    }

    impl Client {
        async fn send(&mut self, messages: &[Message]) {
            self.stream.write_all(&Message::encode_all(messages)).await.unwrap();
        }

        async fn recv(&mut self) -> Message {
            loop {
                match Message::decode(&self.buffer, Direction::ToClient) {
                    Ok((used, message)) => {
                        self.buffer.drain(..used);
                        return message;
                    }
                    Err(DecodeError::ShortRead { .. }) => {
                        let mut chunk = [0u8; 1024];
                        let n = tokio::time::timeout(Duration::from_secs(5), self.stream.read(&mut chunk))
                            .await
                            .expect("Timed out waiting for server")
                            .unwrap();
                        assert!(n > 0, "Server closed the circuit");
                        self.buffer.extend_from_slice(&chunk[..n]);
                    }
                    Err(e) => panic!("Bad message from server: {e}"),
                }
            }
        }
    }

    async fn start(provider: IntercomProvider) -> (Client, Arc<ServerShared<IntercomProvider>>) {
        let dispatcher = EventDispatcher::new(BackpressurePolicy::LatestValueOnly);
        provider.attach(dispatcher.publisher());
        let shared = Arc::new(ServerShared {
            provider: Arc::new(provider),
            dispatcher,
            config: ServerConfig::default(),
            connection_port: 0,
        });
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        {
            let shared = shared.clone();
            tokio::spawn(async move {
                let (stream, peer) = listener.accept().await.unwrap();
                serve_circuit(stream, peer, shared, CancellationToken::new()).await;
            });
        }
        let mut client = Client {
            stream: TcpStream::connect(address).await.unwrap(),
            buffer: Vec::new(),
        };
        client.send(&[messages::Version::default().into()]).await;
        assert!(matches!(client.recv().await, Message::Version(_)));
        (client, shared)
    }

    async fn create(client: &mut Client, name: &str, client_id: u32) -> (Access, u32) {
        client
            .send(&[messages::CreateChannel {
                client_id,
                protocol_version: 13,
                channel_name: name.into(),
            }
            .into()])
            .await;
        let Message::AccessRights(access) = client.recv().await else {
            panic!("Expected access rights");
        };
        let Message::CreateChannelResponse(created) = client.recv().await else {
            panic!("Expected channel creation");
        };
        assert_eq!(created.client_id, client_id);
        (access.access_rights, created.server_id)
    }

    #[tokio::test]
    async fn create_read_and_write() {
        let provider = IntercomProvider::new();
        let pv = provider.add_pv("TEST", 42i32).unwrap();
        let (mut client, _shared) = start(provider).await;

        let (access, server_id) = create(&mut client, "TEST", 7).await;
        assert_eq!(access, Access::ReadWrite);

        client
            .send(&[messages::ReadNotify {
                data_type: DbrType::new(DbrBasicType::Double, DbrCategory::Basic),
                data_count: 0,
                server_id,
                client_ioid: 3,
            }
            .into()])
            .await;
        let Message::ReadNotifyResponse(read) = client.recv().await else {
            panic!("Expected read response");
        };
        assert_eq!(read.client_ioid, 3);
        assert_eq!(
            Dbr::from_bytes(read.data_type, read.data_count as usize, &read.data).unwrap(),
            Dbr::Basic(DbrValue::Double(vec![42.0]))
        );

        let (_, data) = DbrValue::from("12").encode(None);
        client
            .send(&[messages::WriteNotify {
                data_type: DbrType::new(DbrBasicType::String, DbrCategory::Basic),
                data_count: 1,
                server_id,
                client_ioid: 4,
                data,
            }
            .into()])
            .await;
        let Message::WriteNotifyResponse(written) = client.recv().await else {
            panic!("Expected write response");
        };
        assert_eq!(written.status, ErrorCondition::Normal);
        assert_eq!(pv.load(), 12);
    }

    #[tokio::test]
    async fn unknown_names_fail_creation() {
        let (mut client, _shared) = start(IntercomProvider::new()).await;
        client
            .send(&[messages::CreateChannel {
                client_id: 1,
                protocol_version: 13,
                channel_name: "MISSING".into(),
            }
            .into()])
            .await;
        assert_eq!(
            client.recv().await,
            messages::CreateChannelFailure { client_id: 1 }.into()
        );
        // The circuit stays up
        client.send(&[Message::Echo]).await;
        assert_eq!(client.recv().await, Message::Echo);
    }

    #[tokio::test]
    async fn refused_writes_report_errors() {
        let provider = IntercomProvider::new().with_rbv(true);
        provider.add_pv("TEST", 1i16).unwrap();
        let (mut client, _shared) = start(provider).await;
        let (access, server_id) = create(&mut client, "TEST_RBV", 2).await;
        assert_eq!(access, Access::Read);
        let (_, data) = DbrValue::Int(vec![5]).encode(None);
        let write = Message::from(messages::Write {
            data_type: DbrType::new(DbrBasicType::Int, DbrCategory::Basic),
            data_count: 1,
            server_id,
            client_ioid: 0,
            data,
        });
        client.send(std::slice::from_ref(&write)).await;
        let Message::ECAError(error) = client.recv().await else {
            panic!("Expected an error");
        };
        assert_eq!(error.condition, ErrorCondition::NoWtAccess);
        assert_eq!(error.client_id, 2);
        assert_eq!(error.original_request, write.header());
    }

    #[tokio::test]
    async fn subscriptions_follow_the_provider() {
        let provider = IntercomProvider::new();
        let pv = provider.add_pv("TEST", 1i32).unwrap();
        let (mut client, shared) = start(provider).await;
        let (_, server_id) = create(&mut client, "TEST", 1).await;
        let data_type = DbrType::new(DbrBasicType::Long, DbrCategory::Basic);
        client
            .send(&[messages::EventAdd {
                data_type,
                data_count: 1,
                server_id,
                subscription_id: 9,
                mask: MonitorMask::VALUE,
            }
            .into()])
            .await;
        let value_of = |message: Message| match message {
            Message::EventAddResponse(update) => {
                assert_eq!(update.subscription_id, 9);
                Dbr::from_bytes(update.data_type, update.data_count as usize, &update.data)
                    .unwrap()
                    .take_value()
            }
            other => panic!("Expected an update, got {other:?}"),
        };
        assert_eq!(value_of(client.recv().await), DbrValue::Long(vec![1]));
        pv.store(2);
        assert_eq!(value_of(client.recv().await), DbrValue::Long(vec![2]));
        // Only value changes were asked for
        shared
            .dispatcher
            .publish("TEST", FieldLog::new(Dbr::Basic(DbrValue::Long(vec![0])), MonitorMask::ALARM));

        client
            .send(&[messages::EventCancel {
                data_type,
                data_count: 1,
                server_id,
                subscription_id: 9,
            }
            .into()])
            .await;
        let Message::EventAddResponse(confirmation) = client.recv().await else {
            panic!("Expected cancel confirmation");
        };
        assert!(confirmation.data.is_empty());
        assert_eq!(shared.dispatcher.subscription_count(), 0);
    }

    #[tokio::test]
    async fn version_must_come_first() {
        let dispatcher = EventDispatcher::new(BackpressurePolicy::LatestValueOnly);
        let shared = Arc::new(ServerShared {
            provider: Arc::new(IntercomProvider::new()),
            dispatcher,
            config: ServerConfig::default(),
            connection_port: 0,
        });
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            serve_circuit(stream, peer, shared, CancellationToken::new()).await;
        });
        let mut stream = TcpStream::connect(address).await.unwrap();
        stream.write_all(&Message::Echo.encode()).await.unwrap();
        let mut buffer = Vec::new();
        // The server hangs up without answering
        stream.read_to_end(&mut buffer).await.unwrap();
        assert!(buffer.is_empty());
        server.await.unwrap();
    }
}
