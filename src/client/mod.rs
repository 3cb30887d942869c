//! Channel Access client.
//!
//! A [`ClientContext`] owns everything one client needs: the channel registry,
//! the search engine, request tracking, the disconnect governor and the
//! circuits to each server. Several independent contexts can live in one
//! process.
//!
//! The application API is synchronous and never waits on the network.
//! Results arrive through callbacks, or through the async wrappers
//! ([`ClientContext::get`], [`ClientContext::put`], [`ClientContext::monitor`]).

mod beacons;
mod circuit;
mod context;
mod governor;
mod registry;
mod requests;
mod searcher;
mod subscription;

use std::{fmt, io};

pub use beacons::{BeaconAnomaly, BeaconHistory, BeaconUpdate};
pub use circuit::{CircuitId, CircuitState, DisconnectReason};
pub use context::ClientContext;
pub use governor::{DisconnectGovernor, GovernorState};
pub use registry::{ChannelInfo, ConnectionEvent, ConnectionState};
pub use requests::{RequestKind, RequestTracker, Response};
pub use searcher::SearchHandle;
pub use subscription::Monitor;

use crate::messages::ErrorCondition;

/// Client-side identifier of a channel, sent to servers as the CID
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChannelId(pub(crate) u32);

/// Identifies one outstanding read or write, sent to servers as the IOID
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestId(pub(crate) u32);

/// Identifies one subscription, sent to servers as the subscription ID
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(pub(crate) u32);

macro_rules! impl_id_display {
    ($($name:ident),*) => {
        $(
            impl $name {
                pub fn value(&self) -> u32 {
                    self.0
                }
            }
            impl fmt::Display for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    write!(f, "{}", self.0)
                }
            }
        )*
    };
}
impl_id_display!(ChannelId, RequestId, SubscriptionId);

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ClientError {
    #[error("{kind} on channel '{channel}' failed: circuit disconnected")]
    Disconnected { channel: String, kind: RequestKind },
    #[error("Channel is not connected")]
    ChannelNotConnected,
    #[error("The channel does not exist or is already closed")]
    ChannelClosed,
    #[error("Server could not create channel '{0}'")]
    CreateFailed(String),
    #[error("Server reported: {condition} ({message})")]
    ServerError {
        condition: ErrorCondition,
        message: String,
    },
    #[error("No read access")]
    NoReadAccess,
    #[error("No write access")]
    NoWriteAccess,
    #[error("Failed to interpret message from server: {0}")]
    InvalidResponse(String),
    #[error("The server version ({0}) was incompatible")]
    ServerVersionMismatch(u16),
    #[error("Timed out")]
    Timeout,
    #[error("The client context is closing or has closed")]
    ContextClosed,
    #[error("{0}")]
    Io(String),
}

impl From<io::Error> for ClientError {
    fn from(value: io::Error) -> Self {
        ClientError::Io(value.to_string())
    }
}

impl From<ErrorCondition> for ClientError {
    fn from(condition: ErrorCondition) -> Self {
        match condition {
            ErrorCondition::NoRdAccess => ClientError::NoReadAccess,
            ErrorCondition::NoWtAccess => ClientError::NoWriteAccess,
            condition => ClientError::ServerError {
                condition,
                message: String::new(),
            },
        }
    }
}
