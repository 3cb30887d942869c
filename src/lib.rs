// #![warn(missing_docs)]

//! Pure-rust engine for the EPICS Channel Access protocol.
//!
//! This crate implements both ends of the [EPICS CA protocol] without depending
//! on the C-based [epics-base] project:
//!
//! - Encoding and decoding of every message kind, including the large-array
//!   header form, in module [messages].
//! - Representing data for transferring back and forth (["DBR" types]) in module
//!   [dbr].
//! - A [client] that searches for channels over UDP, keeps TCP circuits to the
//!   servers that answer, tracks outstanding requests, replays subscriptions
//!   after reconnects and throttles reconnection after a server drops away.
//! - A [server] that answers searches, announces itself with beacons, serves
//!   circuits and fans out subscription updates with explicit backpressure.
//! - [Provider], the trait a server uses to reach values in your application,
//!   with an in-memory [`providers::IntercomProvider`] built in.
//!
//! Configuration comes from the usual `EPICS_CA_*` environment variables (see
//! [config]), and can be overridden in code.
//!
//! ## Example
//!
//! Serve a single [i32] through the [providers::IntercomProvider], and read it
//! back with a client. You can also `caget NUMERIC_VALUE` or
//! `caput NUMERIC_VALUE <new_value>` from anywhere inside the same broadcast
//! network:
//!
//! ```no_run
//! use ca_engine::{ClientContext, ServerBuilder, providers::IntercomProvider};
//!
//! #[tokio::main]
//! async fn main() {
//!     let provider = IntercomProvider::new();
//!     let value = provider.add_pv("NUMERIC_VALUE", 42i32).unwrap();
//!     let _server = ServerBuilder::new(provider).start().await.unwrap();
//!
//!     let client = ClientContext::new().await.unwrap();
//!     let channel = client.open("NUMERIC_VALUE");
//!     client.put(channel, value.load() + 1).await.unwrap();
//!     assert_eq!(client.get::<i32>(channel).await.unwrap(), 43);
//! }
//! ```
//!
//! [EPICS CA protocol]:
//!     https://docs.epics-controls.org/en/latest/internal/ca_protocol.html
//! [epics-base]: https://github.com/epics-base/epics-base
//! ["DBR" types]:
//!     https://docs.epics-controls.org/en/latest/internal/ca_protocol.html#payload-data-types

pub mod client;
pub mod config;
pub mod dbr;
pub mod messages;
pub mod providers;
pub mod server;

mod queue;
mod utils;

pub use crate::client::ClientContext;
pub use crate::providers::Provider;
pub use crate::server::{ServerBuilder, ServerHandle};
