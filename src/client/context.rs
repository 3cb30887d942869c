use std::{
    io,
    net::{Ipv4Addr, SocketAddr},
    sync::{Arc, Weak},
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use tokio::{
    runtime::Handle,
    select,
    sync::{Notify, mpsc, oneshot},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    client::{
        ChannelId, ClientError, RequestId, SubscriptionId,
        beacons::watch_beacons,
        circuit::{Circuit, CircuitId, CircuitObserver, CircuitSettings, DisconnectReason},
        registry::{
            ChannelInfo, ConnectionEvent, ConnectionState, MonitorCallback, Outbox, Registry,
            RequestTarget,
        },
        requests::{Completion, RequestKind, RequestTracker, Response},
        searcher::{Resolution, SearchCommand, SearchObserver, SearchState, run_searcher},
        subscription::Monitor,
    },
    config::ClientConfig,
    dbr::{Dbr, DbrCategory, DbrType, DbrValue},
    messages::{self, Access, ErrorCondition, Message, MonitorMask, command},
    utils::new_reusable_udp_socket,
};

pub(crate) struct ContextInner {
    config: ClientConfig,
    settings: CircuitSettings,
    runtime: Handle,
    registry: Mutex<Registry>,
    tracker: RequestTracker,
    searches: mpsc::UnboundedSender<SearchCommand>,
    governor_wake: Arc<Notify>,
    stop: CancellationToken,
    this: Weak<ContextInner>,
}

/// A Channel Access client.
///
/// Cheap to clone; all clones share the same channels and circuits. Background
/// tasks stop once the last clone is dropped or [`ClientContext::shutdown`] is
/// called.
#[derive(Clone)]
pub struct ClientContext {
    inner: Arc<ContextInner>,
}

impl ClientContext {
    /// Start a client configured from the environment
    pub async fn new() -> io::Result<ClientContext> {
        Self::with_config(ClientConfig::from_env()).await
    }

    pub async fn with_config(config: ClientConfig) -> io::Result<ClientContext> {
        let search_socket = new_reusable_udp_socket((Ipv4Addr::UNSPECIFIED, 0))?;
        let stop = CancellationToken::new();
        let (searches, searches_rx) = mpsc::unbounded_channel();
        let governor_wake = Arc::new(Notify::new());

        let inner = Arc::new_cyclic(|this| ContextInner {
            settings: CircuitSettings::from_config(&config),
            runtime: Handle::current(),
            registry: Mutex::new(Registry::new(config.governor_batch)),
            tracker: RequestTracker::new(),
            searches: searches.clone(),
            governor_wake: governor_wake.clone(),
            stop: stop.clone(),
            this: this.clone(),
            config: config.clone(),
        });

        let weak: Weak<ContextInner> = Arc::downgrade(&inner);
        let observer: Weak<dyn SearchObserver> = weak;
        tokio::spawn(run_searcher(
            search_socket,
            SearchState::new(&config, Instant::now()),
            config.search_addresses.clone(),
            searches_rx,
            observer,
            stop.child_token(),
        ));

        if let Some(port) = config.beacon_port {
            match new_reusable_udp_socket((Ipv4Addr::UNSPECIFIED, port)) {
                Ok(socket) => {
                    tokio::spawn(watch_beacons(socket, searches, stop.child_token()));
                }
                Err(err) => warn!(
                    "Failed to create beacon watcher on port {port}, will run without: {err:?}"
                ),
            }
        }

        tokio::spawn(run_governor(
            Arc::downgrade(&inner),
            governor_wake,
            config.governor_period,
            stop.child_token(),
        ));
        tokio::spawn(report_stale_requests(
            Arc::downgrade(&inner),
            config.stale_request_age,
            stop.child_token(),
        ));
        Ok(ClientContext { inner })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Create a channel and start searching for it
    pub fn open(&self, name: &str) -> ChannelId {
        self.inner.with_registry(|r, o| r.open(name, None, o))
    }

    /// As [`ClientContext::open`], calling `listener` on connection changes
    pub fn open_with_listener(
        &self,
        name: &str,
        listener: impl Fn(ConnectionEvent) + Send + Sync + 'static,
    ) -> ChannelId {
        self.inner
            .with_registry(|r, o| r.open(name, Some(Arc::new(listener)), o))
    }

    /// Close a channel. Its outstanding requests fail with
    /// [`ClientError::ChannelClosed`].
    pub fn close(&self, channel: ChannelId) -> bool {
        self.inner.with_registry(|r, o| r.close(channel, o))
    }

    pub fn state(&self, channel: ChannelId) -> Option<ConnectionState> {
        self.inner.registry.lock().state(channel)
    }

    /// Details of a connected channel
    pub fn info(&self, channel: ChannelId) -> Option<ChannelInfo> {
        self.inner.registry.lock().info(channel)
    }

    /// Read the current value, calling `callback` with the result.
    ///
    /// The value arrives as the channel's native type with the metadata of
    /// `category`.
    pub fn read(
        &self,
        channel: ChannelId,
        category: DbrCategory,
        callback: impl FnOnce(Result<Dbr, ClientError>) + Send + 'static,
    ) -> Result<RequestId, ClientError> {
        let completion: Completion = Box::new(move |result| {
            callback(result.and_then(|response| match response {
                Response::Read(dbr) => Ok(dbr),
                Response::Written => Err(ClientError::InvalidResponse(
                    "Write completion for a read".into(),
                )),
            }))
        });
        self.inner.issue(
            channel,
            Access::Read,
            RequestKind::Read,
            completion,
            |target, ioid| {
                messages::ReadNotify {
                    data_type: DbrType::new(target.native_type, category),
                    data_count: if target.circuit.minor_version() < 13 {
                        target.native_count
                    } else {
                        0
                    },
                    server_id: target.server_id,
                    client_ioid: ioid.0,
                }
                .into()
            },
        )
    }

    /// Write a value and be told when the server has processed it
    pub fn write(
        &self,
        channel: ChannelId,
        value: DbrValue,
        callback: impl FnOnce(Result<(), ClientError>) + Send + 'static,
    ) -> Result<RequestId, ClientError> {
        let completion: Completion = Box::new(move |result| callback(result.map(|_| ())));
        self.inner.issue(
            channel,
            Access::Write,
            RequestKind::Write,
            completion,
            |target, ioid| {
                let (data_count, data) = value.encode(None);
                messages::WriteNotify {
                    data_type: DbrType::new(value.basic_type(), DbrCategory::Basic),
                    data_count: data_count as u32,
                    server_id: target.server_id,
                    client_ioid: ioid.0,
                    data,
                }
                .into()
            },
        )
    }

    /// Write a value without asking for completion
    pub fn write_unacknowledged(&self, channel: ChannelId, value: DbrValue) -> Result<(), ClientError> {
        let target = self
            .inner
            .registry
            .lock()
            .request_target(channel, Access::Write)?;
        let (data_count, data) = value.encode(None);
        let sent = target.circuit.send(
            messages::Write {
                data_type: DbrType::new(value.basic_type(), DbrCategory::Basic),
                data_count: data_count as u32,
                server_id: target.server_id,
                client_ioid: 0,
                data,
            }
            .into(),
        );
        if sent {
            Ok(())
        } else {
            Err(ClientError::ChannelNotConnected)
        }
    }

    /// Forget an outstanding request. Its callback will not be called.
    pub fn cancel_request(&self, request: RequestId) -> bool {
        self.inner.tracker.cancel(request)
    }

    /// Receive updates for a channel through `callback`.
    ///
    /// The subscription survives disconnects and is reinstalled on reconnect.
    pub fn subscribe(
        &self,
        channel: ChannelId,
        category: DbrCategory,
        mask: MonitorMask,
        callback: impl Fn(Result<Dbr, ClientError>) + Send + Sync + 'static,
    ) -> Result<SubscriptionId, ClientError> {
        let callback: MonitorCallback = Arc::new(callback);
        self.inner
            .with_registry(|r, o| r.subscribe(channel, category, None, 0, mask, callback, o))
    }

    pub fn unsubscribe(&self, subscription: SubscriptionId) -> bool {
        self.inner.unsubscribe(subscription)
    }

    /// Wait up to `timeout` for a channel to connect
    pub async fn wait_connected(
        &self,
        channel: ChannelId,
        timeout: Duration,
    ) -> Result<ChannelInfo, ClientError> {
        let mut state = self
            .inner
            .registry
            .lock()
            .watch_state(channel)
            .ok_or(ClientError::ChannelClosed)?;
        tokio::time::timeout(
            timeout,
            state.wait_for(|s| *s == ConnectionState::Connected),
        )
        .await
        .map_err(|_| ClientError::Timeout)?
        .map_err(|_| ClientError::ChannelClosed)?;
        self.info(channel).ok_or(ClientError::ChannelNotConnected)
    }

    /// Read a channel's value with the metadata of `category`
    pub async fn get_dbr(&self, channel: ChannelId, category: DbrCategory) -> Result<Dbr, ClientError> {
        self.wait_connected(channel, self.inner.config.connect_timeout)
            .await?;
        let (tx, rx) = oneshot::channel();
        self.read(channel, category, move |result| {
            let _ = tx.send(result);
        })?;
        rx.await.map_err(|_| ClientError::ContextClosed)?
    }

    /// Read a channel's value as a native Rust type
    pub async fn get<T>(&self, channel: ChannelId) -> Result<T, ClientError>
    where
        T: TryFrom<DbrValue, Error = ErrorCondition>,
    {
        let dbr = self.get_dbr(channel, DbrCategory::Basic).await?;
        Ok(T::try_from(dbr.take_value())?)
    }

    /// Write a value and wait for the server to confirm it
    pub async fn put(&self, channel: ChannelId, value: impl Into<DbrValue>) -> Result<(), ClientError> {
        self.wait_connected(channel, self.inner.config.connect_timeout)
            .await?;
        let (tx, rx) = oneshot::channel();
        self.write(channel, value.into(), move |result| {
            let _ = tx.send(result);
        })?;
        rx.await.map_err(|_| ClientError::ContextClosed)?
    }

    /// Subscribe, receiving updates through the returned [`Monitor`]
    pub fn monitor(
        &self,
        channel: ChannelId,
        category: DbrCategory,
        mask: MonitorMask,
    ) -> Result<Monitor, ClientError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.subscribe(channel, category, mask, move |update| {
            let _ = tx.send(update);
        })?;
        Ok(Monitor::new(id, rx, self.inner.this.clone()))
    }

    /// Close every channel and stop the background tasks
    pub fn shutdown(&self) {
        debug!("Shutting down client context");
        self.inner.with_registry(|r, o| r.close_all(o));
        self.inner.stop.cancel();
    }
}

impl ContextInner {
    fn with_registry<T>(&self, f: impl FnOnce(&mut Registry, &mut Outbox) -> T) -> T {
        let mut outbox = Outbox::default();
        let result = f(&mut self.registry.lock(), &mut outbox);
        self.deliver(outbox);
        result
    }

    /// Carry out what the registry asked for, with no lock held
    fn deliver(&self, outbox: Outbox) {
        for (circuit, message) in outbox.sends {
            if !circuit.send(message) {
                debug!("Circuit {} closed before a message could be queued", circuit.id());
            }
        }
        for command in outbox.searches {
            if self.searches.send(command).is_err() {
                debug!("Search task has stopped");
            }
        }
        if outbox.arm_governor {
            self.governor_wake.notify_one();
        }
        for circuit in outbox.failed_circuits {
            let count = self.tracker.cancel_all(circuit);
            if count > 0 {
                debug!("Failed {count} requests on circuit {circuit}");
            }
        }
        for (channel, failure) in outbox.failed_channels {
            self.tracker
                .cancel_channel(channel, |kind, name| failure.error(kind, name));
        }
        for (listener, event) in outbox.notifications {
            listener(event);
        }
        for (callback, result) in outbox.events {
            callback(result);
        }
        drop(outbox.released);
    }

    fn issue(
        &self,
        channel: ChannelId,
        needs: Access,
        kind: RequestKind,
        completion: Completion,
        build: impl FnOnce(&RequestTarget, RequestId) -> Message,
    ) -> Result<RequestId, ClientError> {
        let target = self.registry.lock().request_target(channel, needs)?;
        let id = self
            .tracker
            .issue(target.circuit.id(), channel, &target.name, kind, completion);
        if !target.circuit.send(build(&target, id)) {
            // The caller hears about this through the return value only
            self.tracker.cancel(id);
            return Err(ClientError::Disconnected {
                channel: target.name.clone(),
                kind,
            });
        }
        Ok(id)
    }

    pub(crate) fn unsubscribe(&self, subscription: SubscriptionId) -> bool {
        self.with_registry(|r, o| r.unsubscribe(subscription, o))
    }

    fn release_disconnected(&self) -> bool {
        self.with_registry(|r, o| r.release_disconnected(o))
    }

    fn observer(&self) -> Weak<dyn CircuitObserver> {
        self.this.clone()
    }

    fn on_read_response(&self, msg: messages::ReadNotifyResponse) {
        let id = RequestId(msg.client_ioid);
        let Some(request) = self.tracker.take(id) else {
            debug!("Dropping read response for unknown request {id}");
            return;
        };
        let result = if !msg.status.is_success() {
            Err(ClientError::from(msg.status))
        } else if request.kind != RequestKind::Read {
            Err(ClientError::InvalidResponse(format!(
                "Read response for {} request {id}",
                request.kind
            )))
        } else {
            Dbr::from_bytes(msg.data_type, msg.data_count as usize, &msg.data)
                .map(Response::Read)
                .map_err(|e| ClientError::InvalidResponse(e.to_string()))
        };
        request.finish(result);
    }

    fn on_write_response(&self, msg: messages::WriteNotifyResponse) {
        let id = RequestId(msg.client_ioid);
        let Some(request) = self.tracker.take(id) else {
            debug!("Dropping write response for unknown request {id}");
            return;
        };
        let result = if request.kind != RequestKind::Write {
            Err(ClientError::InvalidResponse(format!(
                "Write response for {} request {id}",
                request.kind
            )))
        } else if !msg.status.is_success() {
            Err(ClientError::from(msg.status))
        } else {
            Ok(Response::Written)
        };
        request.finish(result);
    }

    fn on_error(&self, msg: messages::ECAError) {
        let original = msg.original_request;
        let error = ClientError::ServerError {
            condition: msg.condition,
            message: msg.error_message.clone(),
        };
        match original.command {
            command::READ_NOTIFY | command::WRITE_NOTIFY => {
                self.tracker
                    .complete(RequestId(original.parameter_2), Err(error));
            }
            command::EVENT_ADD => {
                let subscription = SubscriptionId(original.parameter_2);
                self.with_registry(|r, o| r.on_subscription_error(subscription, error, o));
            }
            _ => warn!(
                "Server reported error for command {}: {} ({})",
                original.command, msg.condition, msg.error_message
            ),
        }
    }
}

impl SearchObserver for ContextInner {
    fn on_search_reply(&self, resolution: Resolution) {
        if self.stop.is_cancelled() {
            return;
        }
        self.with_registry(|r, o| {
            let mut connect = |id: CircuitId, peer: SocketAddr| {
                Circuit::spawn(&self.runtime, id, peer, self.settings.clone(), self.observer())
            };
            r.on_search_reply(resolution, &mut connect, o)
        });
    }
}

impl CircuitObserver for ContextInner {
    fn on_circuit_connected(&self, circuit: CircuitId) {
        debug!("Circuit {circuit} connected");
        self.with_registry(|r, o| r.on_circuit_connected(circuit, o));
    }

    fn on_message(&self, circuit: CircuitId, message: Message) {
        match message {
            Message::ReadNotifyResponse(msg) => self.on_read_response(msg),
            Message::WriteNotifyResponse(msg) => self.on_write_response(msg),
            Message::ECAError(msg) => self.on_error(msg),
            message => self.with_registry(|r, o| r.on_message(circuit, message, o)),
        }
    }

    fn on_circuit_disconnected(&self, circuit: CircuitId, reason: DisconnectReason) {
        match reason {
            DisconnectReason::LocalClose => debug!("Circuit {circuit} closed"),
            reason => info!("Circuit {circuit} disconnected: {reason}"),
        }
        self.with_registry(|r, o| r.on_circuit_disconnected(circuit, o));
    }
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

/// Release disconnected channels a batch per period while any are queued
async fn run_governor(
    context: Weak<ContextInner>,
    wake: Arc<Notify>,
    period: Duration,
    stop: CancellationToken,
) {
    loop {
        select! {
            _ = stop.cancelled() => break,
            _ = wake.notified() => (),
        }
        loop {
            select! {
                _ = stop.cancelled() => return,
                _ = tokio::time::sleep(period) => (),
            }
            let Some(context) = context.upgrade() else {
                return;
            };
            if !context.release_disconnected() {
                break;
            }
        }
    }
}

async fn report_stale_requests(context: Weak<ContextInner>, age: Duration, stop: CancellationToken) {
    let mut interval = tokio::time::interval(age.max(Duration::from_secs(1)));
    loop {
        select! {
            _ = stop.cancelled() => break,
            _ = interval.tick() => (),
        }
        let Some(context) = context.upgrade() else {
            break;
        };
        for (id, kind, channel, waited) in context.tracker.stale(age) {
            warn!(
                "{kind} request {id} on '{channel}' has waited {:.1}s for a reply",
                waited.as_secs_f32()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    use super::*;
    use crate::{
        client::circuit::CircuitState,
        dbr::DbrBasicType,
        messages::CA_MINOR_PROTOCOL_REVISION,
    };

    async fn offline_client() -> ClientContext {
        let config = ClientConfig::default()
            .search_addresses(Vec::new())
            .beacon_port(None);
        ClientContext::with_config(config).await.unwrap()
    }

    /// Attach `channel` to a connected circuit with no I/O behind it
    fn attach(client: &ClientContext, channel: ChannelId) -> Arc<Circuit> {
        let mut registry = client.inner.registry.lock();
        let mut outbox = Outbox::default();
        registry.on_search_reply(
            Resolution {
                name: "TEST:PV".into(),
                channels: vec![channel],
                peer: "127.0.0.1:5064".parse().unwrap(),
                minor_version: CA_MINOR_PROTOCOL_REVISION,
            },
            &mut |id: CircuitId, peer: SocketAddr| {
                Circuit::detached(id, peer, CircuitState::Connected)
            },
            &mut outbox,
        );
        let circuit = outbox.sends[0].0.clone();
        registry.on_message(
            circuit.id(),
            messages::AccessRights {
                client_id: channel.0,
                access_rights: Access::ReadWrite,
            }
            .into(),
            &mut outbox,
        );
        registry.on_message(
            circuit.id(),
            messages::CreateChannelResponse {
                data_type: DbrBasicType::Double,
                data_count: 1,
                client_id: channel.0,
                server_id: 7,
            }
            .into(),
            &mut outbox,
        );
        circuit.take_queued();
        circuit
    }

    #[tokio::test]
    async fn closed_circuit_fails_the_request_without_callback() {
        let client = offline_client().await;
        let channel = client.open("TEST:PV");
        let circuit = attach(&client, channel);
        assert_eq!(client.state(channel), Some(ConnectionState::Connected));
        circuit.close_queue();

        let called = Arc::new(AtomicBool::new(false));
        let flag = called.clone();
        let result = client.read(channel, DbrCategory::Basic, move |_| {
            flag.store(true, std::sync::atomic::Ordering::SeqCst);
        });
        assert_eq!(
            result,
            Err(ClientError::Disconnected {
                channel: "TEST:PV".into(),
                kind: RequestKind::Read,
            })
        );
        assert!(!called.load(std::sync::atomic::Ordering::SeqCst));
        assert_eq!(client.inner.tracker.outstanding(), 0);

        let flag = called.clone();
        let result = client.write(channel, DbrValue::from(1.0f64), move |_| {
            flag.store(true, std::sync::atomic::Ordering::SeqCst);
        });
        assert!(matches!(result, Err(ClientError::Disconnected { .. })));
        assert!(!called.load(std::sync::atomic::Ordering::SeqCst));
        client.shutdown();
    }

    #[tokio::test]
    async fn write_responses_only_finish_writes() {
        let client = offline_client().await;
        let channel = client.open("TEST:PV");
        let circuit = attach(&client, channel);

        let results = Arc::new(Mutex::new(Vec::new()));
        let sink = results.clone();
        let read = client
            .read(channel, DbrCategory::Basic, move |result| {
                sink.lock().push(result.map(|_| ()));
            })
            .unwrap();
        let writes = Arc::new(AtomicUsize::new(0));
        let counter = writes.clone();
        let write = client
            .write(channel, DbrValue::from(2.0f64), move |result| {
                assert_eq!(result, Ok(()));
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            })
            .unwrap();

        // A failed write reply naming the read's ioid must not pass as its status
        client.inner.on_message(
            circuit.id(),
            messages::WriteNotifyResponse {
                data_type: DbrType::new(DbrBasicType::Double, DbrCategory::Basic),
                data_count: 1,
                status: ErrorCondition::PutFail,
                client_ioid: read.0,
            }
            .into(),
        );
        let results = results.lock().clone();
        assert_eq!(results.len(), 1);
        assert!(
            matches!(&results[0], Err(ClientError::InvalidResponse(_))),
            "Unexpected result {:?}",
            results[0]
        );

        client.inner.on_message(
            circuit.id(),
            messages::WriteNotifyResponse {
                data_type: DbrType::new(DbrBasicType::Double, DbrCategory::Basic),
                data_count: 1,
                status: ErrorCondition::Normal,
                client_ioid: write.0,
            }
            .into(),
        );
        assert_eq!(writes.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(client.inner.tracker.outstanding(), 0);
        client.shutdown();
    }
}
