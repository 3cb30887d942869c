//! A TCP virtual circuit to one server.
//!
//! Each circuit runs two tasks: one reads and decodes messages and hands them
//! to a [`CircuitObserver`], the other drains the circuit's [`SendQueue`]. The
//! application never writes to the socket directly, so nothing it calls can
//! block on the network.
//!
//! A circuit lives as long as something holds it. Dropping the last reference
//! flushes whatever is queued and closes the connection.

use std::{
    fmt,
    net::SocketAddr,
    sync::{
        Arc, Weak,
        atomic::{AtomicU16, Ordering},
    },
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::{
    io::AsyncWriteExt,
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    runtime::Handle,
    select,
};
use tokio_stream::StreamExt;
use tokio_util::{codec::FramedRead, sync::CancellationToken};
use tracing::{Instrument, debug, debug_span, error, trace, warn};

use crate::{
    config::ClientConfig,
    messages::{self, CaCodec, DecodeError, Direction, Message},
    queue::SendQueue,
};

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CircuitId(pub(crate) u64);

impl fmt::Display for CircuitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CircuitState {
    /// Not yet given a peer
    Unresolved,
    Connecting,
    Connected,
    /// The connection ended. Holders still see this until they let go.
    Disconnected,
    /// Released while connected; queued messages are being flushed
    ClearingPending,
    Destroyed,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    #[error("Could not connect: {0}")]
    ConnectFailed(String),
    #[error("Timed out connecting")]
    ConnectTimeout,
    #[error("Server protocol version {0} is too old")]
    VersionMismatch(u16),
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("I/O error: {0}")]
    Io(String),
    #[error("Server closed the connection")]
    PeerClosed,
    #[error("Server stopped answering echoes")]
    HeartbeatTimeout,
    #[error("Closed locally")]
    LocalClose,
}

/// Receives everything that happens on a circuit.
///
/// Called from the circuit's receive task, never with a circuit lock held.
pub(crate) trait CircuitObserver: Send + Sync {
    fn on_circuit_connected(&self, circuit: CircuitId);
    fn on_message(&self, circuit: CircuitId, message: Message);
    fn on_circuit_disconnected(&self, circuit: CircuitId, reason: DisconnectReason);
}

/// Timing and identity for a circuit, taken from [`ClientConfig`]
#[derive(Debug, Clone)]
pub(crate) struct CircuitSettings {
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
    pub heartbeat_timeout: Duration,
    pub max_payload: usize,
    pub client_name: String,
    pub host_name: String,
}

impl CircuitSettings {
    pub fn from_config(config: &ClientConfig) -> Self {
        // Work out what to call ourselves
        let client_name = config
            .client_name
            .clone()
            .unwrap_or_else(whoami::username);
        let host_name = config
            .host_name
            .clone()
            .or_else(|| whoami::fallible::hostname().ok())
            .unwrap_or_else(|| client_name.clone());
        CircuitSettings {
            connect_timeout: config.connect_timeout,
            idle_timeout: config.connection_timeout,
            heartbeat_timeout: config.heartbeat_timeout(),
            max_payload: config.max_array_bytes,
            client_name,
            host_name,
        }
    }
}

#[derive(Debug)]
struct CircuitShared {
    id: CircuitId,
    peer: SocketAddr,
    state: Mutex<CircuitState>,
    minor_version: AtomicU16,
    queue: SendQueue,
    /// Cancelled once either task decides the connection is finished
    dead: CancellationToken,
    reason: Mutex<Option<DisconnectReason>>,
}

impl CircuitShared {
    /// Record why the circuit ended. The first reason wins.
    fn fail(&self, reason: DisconnectReason) {
        let mut current = self.reason.lock();
        if current.is_none() {
            *current = Some(reason);
        }
        drop(current);
        self.dead.cancel();
    }
}

#[derive(Debug)]
pub(crate) struct Circuit {
    shared: Arc<CircuitShared>,
}

impl Circuit {
    fn new_shared(id: CircuitId, peer: SocketAddr, state: CircuitState) -> Arc<CircuitShared> {
        Arc::new(CircuitShared {
            id,
            peer,
            state: Mutex::new(state),
            minor_version: AtomicU16::new(0),
            queue: SendQueue::default(),
            dead: CancellationToken::new(),
            reason: Mutex::new(None),
        })
    }

    /// Start connecting to `peer`. Messages may be queued straight away; they
    /// go out once the version exchange completes.
    pub fn spawn(
        runtime: &Handle,
        id: CircuitId,
        peer: SocketAddr,
        settings: CircuitSettings,
        observer: Weak<dyn CircuitObserver>,
    ) -> Circuit {
        let shared = Self::new_shared(id, peer, CircuitState::Connecting);
        runtime.spawn(
            lifecycle(shared.clone(), settings, observer)
                .instrument(debug_span!("circuit", id = id.0, %peer)),
        );
        Circuit { shared }
    }

    pub fn id(&self) -> CircuitId {
        self.shared.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.shared.peer
    }

    pub fn state(&self) -> CircuitState {
        *self.shared.state.lock()
    }

    /// The server's protocol revision, once known
    pub fn minor_version(&self) -> u16 {
        self.shared.minor_version.load(Ordering::Relaxed)
    }

    /// Queue a message. Returns false if the circuit can no longer send.
    pub fn send(&self, message: Message) -> bool {
        self.shared.queue.push(message)
    }

    pub fn send_all(&self, messages: impl IntoIterator<Item = Message>) -> bool {
        self.shared.queue.push_all(messages)
    }

    /// Why the circuit ended, if it has
    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        self.shared.reason.lock().clone()
    }

    /// A circuit with no connection behind it, for exercising the registry
    #[cfg(test)]
    pub fn detached(id: CircuitId, peer: SocketAddr, state: CircuitState) -> Circuit {
        Circuit {
            shared: Self::new_shared(id, peer, state),
        }
    }

    #[cfg(test)]
    pub fn set_state(&self, state: CircuitState) {
        *self.shared.state.lock() = state;
    }

    /// Stop accepting messages, as happens when the circuit dies
    #[cfg(test)]
    pub fn close_queue(&self) {
        self.shared.queue.close();
    }

    /// Take everything queued so far
    #[cfg(test)]
    pub fn take_queued(&self) -> Vec<Message> {
        self.shared.queue.drain()
    }
}

impl Drop for Circuit {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        let previous = *state;
        *state = match previous {
            CircuitState::Disconnected | CircuitState::Destroyed => CircuitState::Destroyed,
            _ => CircuitState::ClearingPending,
        };
        drop(state);
        self.shared.queue.close();
        // Nothing queued before the handshake is worth waiting for
        if previous == CircuitState::Connecting {
            self.shared.fail(DisconnectReason::LocalClose);
        }
    }
}

/// Connect, then exchange versions and identify ourselves
async fn establish(
    shared: &CircuitShared,
    settings: &CircuitSettings,
) -> Result<(FramedRead<OwnedReadHalf, CaCodec>, OwnedWriteHalf), DisconnectReason> {
    let tcp = TcpStream::connect(shared.peer)
        .await
        .map_err(|e| DisconnectReason::ConnectFailed(e.to_string()))?;
    let _ = tcp.set_nodelay(true);
    let (read, mut write) = tcp.into_split();
    let mut framed = FramedRead::with_capacity(
        read,
        CaCodec::new(Direction::ToClient).with_max_payload(settings.max_payload),
        16384usize,
    );

    write
        .write_all(&Message::Version(messages::Version::default()).encode())
        .await
        .map_err(|e| DisconnectReason::Io(e.to_string()))?;
    let server_version = match framed.next().await {
        Some(Ok(Message::Version(version))) => version,
        Some(Ok(other)) => {
            return Err(DisconnectReason::ProtocolViolation(format!(
                "Expected VERSION, got {other:?}"
            )));
        }
        Some(Err(e)) => return Err(decode_failure(e)),
        None => return Err(DisconnectReason::PeerClosed),
    };
    if !server_version.is_compatible() {
        return Err(DisconnectReason::VersionMismatch(
            server_version.protocol_version,
        ));
    }
    shared
        .minor_version
        .store(server_version.protocol_version, Ordering::Relaxed);
    debug!("Done version exchange, sending identification messages");
    let identification = Message::encode_all(&[
        messages::HostName {
            name: settings.host_name.clone(),
        }
        .into(),
        messages::ClientName {
            name: settings.client_name.clone(),
        }
        .into(),
    ]);
    write
        .write_all(&identification)
        .await
        .map_err(|e| DisconnectReason::Io(e.to_string()))?;
    Ok((framed, write))
}

fn decode_failure(error: DecodeError) -> DisconnectReason {
    match error {
        DecodeError::Io(e) => DisconnectReason::Io(e.to_string()),
        e => DisconnectReason::ProtocolViolation(e.to_string()),
    }
}

async fn lifecycle(
    shared: Arc<CircuitShared>,
    settings: CircuitSettings,
    observer: Weak<dyn CircuitObserver>,
) {
    debug!("Connecting new circuit");
    let established = select! {
        _ = shared.dead.cancelled() => Err(DisconnectReason::LocalClose),
        r = tokio::time::timeout(settings.connect_timeout, establish(&shared, &settings)) => {
            r.unwrap_or(Err(DisconnectReason::ConnectTimeout))
        }
    };
    match established {
        Ok((framed, write)) => {
            {
                let mut state = shared.state.lock();
                if *state == CircuitState::Connecting {
                    *state = CircuitState::Connected;
                }
            }
            debug!("Circuit ready");
            tokio::spawn(send_loop(shared.clone(), write).in_current_span());
            if let Some(observer) = observer.upgrade() {
                observer.on_circuit_connected(shared.id);
            }
            receive_loop(&shared, framed, &settings, &observer).await;
        }
        Err(reason) => {
            warn!("Failed to establish circuit: {reason}");
            shared.fail(reason);
        }
    }

    shared.queue.close();
    {
        let mut state = shared.state.lock();
        *state = match *state {
            CircuitState::ClearingPending | CircuitState::Destroyed => CircuitState::Destroyed,
            _ => CircuitState::Disconnected,
        };
    }
    let reason = shared
        .reason
        .lock()
        .clone()
        .unwrap_or(DisconnectReason::LocalClose);
    debug!("Circuit finished: {reason}");
    if let Some(observer) = observer.upgrade() {
        observer.on_circuit_disconnected(shared.id, reason);
    }
}

async fn send_loop(shared: Arc<CircuitShared>, mut write: OwnedWriteHalf) {
    while let Some(batch) = shared.queue.next_batch().await {
        for message in &batch {
            trace!("Sending {message:?}");
        }
        let bytes = Message::encode_all(&batch);
        select! {
            _ = shared.dead.cancelled() => return,
            r = write.write_all(&bytes) => if let Err(e) = r {
                error!("Failed to write messages to io stream, aborting: {e}");
                shared.fail(DisconnectReason::Io(e.to_string()));
                return;
            }
        }
    }
    // The queue only closes once nothing holds the circuit
    let _ = write.shutdown().await;
    shared.fail(DisconnectReason::LocalClose);
}

async fn receive_loop(
    shared: &CircuitShared,
    mut framed: FramedRead<OwnedReadHalf, CaCodec>,
    settings: &CircuitSettings,
    observer: &Weak<dyn CircuitObserver>,
) {
    let mut last_received = Instant::now();
    let mut echo_sent_at: Option<Instant> = None;
    loop {
        let deadline = match echo_sent_at {
            None => last_received + settings.idle_timeout,
            Some(sent) => sent + settings.heartbeat_timeout,
        };
        select! {
            _ = shared.dead.cancelled() => break,
            incoming = framed.next() => match incoming {
                Some(Ok(message)) => {
                    last_received = Instant::now();
                    echo_sent_at = None;
                    trace!("Received message: {message:?}");
                    match message {
                        Message::Echo => (),
                        Message::Version(_) => {
                            warn!("Got unexpected VERSION message in normal circuit lifecycle.")
                        }
                        message => {
                            let Some(observer) = observer.upgrade() else {
                                shared.fail(DisconnectReason::LocalClose);
                                break;
                            };
                            observer.on_message(shared.id, message);
                        }
                    }
                }
                Some(Err(e)) => {
                    error!("Got error processing server message: {e}");
                    shared.fail(decode_failure(e));
                    break;
                }
                None => {
                    shared.fail(DisconnectReason::PeerClosed);
                    break;
                }
            },
            _ = tokio::time::sleep_until(deadline.into()) => {
                if echo_sent_at.is_none() {
                    trace!("Circuit idle, sending echo");
                    echo_sent_at = Some(Instant::now());
                    shared.queue.push(Message::Echo);
                } else {
                    error!("Received no reply from server, assuming connection dead");
                    shared.fail(DisconnectReason::HeartbeatTimeout);
                    break;
                }
            }
        }
    }
}
