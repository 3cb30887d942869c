//! Channel Access server.
//!
//! [`ServerBuilder`] binds the circuit listener and search socket, then runs
//! each part as its own task: the TCP accept loop, the UDP search responder and
//! the beacon emitter. Channel values come from a [`Provider`].

mod circuit;
mod datagram;
mod dispatcher;

use std::{io, net::Ipv4Addr, sync::Arc, time::Duration};

use tokio::{net::TcpListener, select, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, debug_span, info, warn};

pub use dispatcher::{EventDispatcher, EventPublisher, SubscriptionId};
#[cfg(test)]
pub(crate) use dispatcher::{EventSink, SubscriptionRequest};

use crate::{
    config::{BackpressurePolicy, ServerConfig},
    providers::Provider,
    utils::new_reusable_udp_socket,
};

/// State every circuit of one server shares
pub(crate) struct ServerShared<P: Provider> {
    pub provider: Arc<P>,
    pub dispatcher: EventDispatcher,
    pub config: ServerConfig,
    /// The port circuits were actually bound to
    pub connection_port: u16,
}

pub struct ServerBuilder<P: Provider> {
    provider: P,
    config: ServerConfig,
}

impl<P: Provider> ServerBuilder<P> {
    /// A server configured from the `EPICS_CA_*` / `EPICS_CAS_*` environment
    pub fn new(provider: P) -> Self {
        ServerBuilder {
            provider,
            config: ServerConfig::from_env(),
        }
    }

    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn connection_port(mut self, port: u16) -> Self {
        self.config.connection_port = port;
        self
    }

    pub fn search_port(mut self, port: u16) -> Self {
        self.config.search_port = port;
        self
    }

    pub fn beacon_port(mut self, port: u16) -> Self {
        self.config.beacon_port = port;
        self
    }

    pub fn beacons(mut self, enabled: bool) -> Self {
        self.config.beacons = enabled;
        self
    }

    pub fn beacon_period(mut self, period: Duration) -> Self {
        self.config.beacon_period = period;
        self
    }

    pub fn backpressure(mut self, policy: BackpressurePolicy) -> Self {
        self.config.backpressure = policy;
        self
    }

    /// Bind sockets and start serving
    pub async fn start(self) -> io::Result<ServerHandle> {
        let config = self.config;
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, config.connection_port)).await?;
        let connection_port = listener.local_addr()?.port();
        let search_socket = new_reusable_udp_socket((Ipv4Addr::UNSPECIFIED, config.search_port))?;
        let search_port = search_socket.local_addr()?.port();
        info!("Serving circuits on port {connection_port}, searches on port {search_port}");

        let dispatcher = EventDispatcher::new(config.backpressure);
        self.provider.attach(dispatcher.publisher());
        let shared = Arc::new(ServerShared {
            provider: Arc::new(self.provider),
            dispatcher,
            config,
            connection_port,
        });

        let stop = CancellationToken::new();
        let mut tasks = JoinSet::new();
        tasks.spawn(
            accept_circuits(listener, shared.clone(), stop.clone())
                .instrument(debug_span!("accept", port = connection_port)),
        );
        tasks.spawn(
            datagram::answer_searches(
                search_socket,
                shared.provider.clone(),
                connection_port,
                stop.clone(),
            )
            .instrument(debug_span!("search", port = search_port)),
        );
        if shared.config.beacons {
            let socket = new_reusable_udp_socket((Ipv4Addr::UNSPECIFIED, 0))?;
            tasks.spawn(datagram::emit_beacons(
                socket,
                shared.config.resolved_beacon_addresses(),
                connection_port,
                shared.config.beacon_period,
                stop.clone(),
            ));
        }

        Ok(ServerHandle {
            connection_port,
            search_port,
            publisher: shared.dispatcher.publisher(),
            stop,
            tasks,
        })
    }
}

async fn accept_circuits<P: Provider>(
    listener: TcpListener,
    shared: Arc<ServerShared<P>>,
    stop: CancellationToken,
) {
    let mut circuits = JoinSet::new();
    loop {
        select! {
            _ = stop.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("Accepted circuit from {peer}");
                    circuits.spawn(
                        circuit::serve_circuit(stream, peer, shared.clone(), stop.clone())
                            .instrument(debug_span!("circuit", %peer)),
                    );
                }
                Err(e) => warn!("Failed to accept connection: {e}"),
            },
            // Reap finished circuits so the set does not grow without bound
            Some(_) = circuits.join_next(), if !circuits.is_empty() => (),
        }
    }
    while circuits.join_next().await.is_some() {}
}

/// A running server. Dropping it stops the server.
pub struct ServerHandle {
    connection_port: u16,
    search_port: u16,
    publisher: EventPublisher,
    stop: CancellationToken,
    tasks: JoinSet<()>,
}

impl ServerHandle {
    /// The TCP port circuits connect to
    pub fn connection_port(&self) -> u16 {
        self.connection_port
    }

    /// The UDP port searches are answered on
    pub fn search_port(&self) -> u16 {
        self.search_port
    }

    /// For publishing changes that do not originate in the provider
    pub fn publisher(&self) -> EventPublisher {
        self.publisher.clone()
    }

    /// Stop serving and wait for every task to finish
    pub async fn stop(mut self) -> Result<(), tokio::task::JoinError> {
        self.stop.cancel();
        self.join_tasks().await
    }

    /// Wait for the server to stop, which only happens on error or [`ServerHandle::stop`]
    pub async fn join(mut self) -> Result<(), tokio::task::JoinError> {
        self.join_tasks().await
    }

    async fn join_tasks(&mut self) -> Result<(), tokio::task::JoinError> {
        while let Some(result) = self.tasks.join_next().await {
            result?;
        }
        Ok(())
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}
