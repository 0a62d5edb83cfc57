//! Application-supplied callback contracts.
//!
//! Every callback here fires **on the reactor thread** and must return
//! promptly: the library does not re-enter itself to run a callback
//! concurrently with another, and callbacks must not call back into
//! `start`/`stop`/`close`.

use std::net::SocketAddr;

use crate::channel::ChannelId;
use crate::graph::{NodeName, NodeStatus};

/// Fires once for every datagram delivered to this node, whether sent
/// directly to `send()` or addressed to a subnet this node owns.
pub type ReceiveCallback = Box<dyn FnMut(&NodeName, &[u8]) + Send + 'static>;

/// Fires when a node's reachability flips.
pub type NodeStatusCallback = Box<dyn FnMut(&NodeName, NodeStatus) + Send + 'static>;

/// Library log line, already formatted; level mirrors `tracing`'s.
pub type LogCallback = Box<dyn FnMut(LogLevel, &str) + Send + 'static>;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

/// Decides whether to accept an incoming channel open. Returning
/// `false` sends `RST` and discards the attempt.
pub type ChannelAcceptCallback = Box<dyn FnMut(&NodeName, ChannelId) -> bool + Send + 'static>;

/// Fires with bytes received on an open channel.
pub type ChannelReceiveCallback = Box<dyn FnMut(ChannelId, &[u8]) + Send + 'static>;

/// The set of callbacks a mesh handle invokes.
#[derive(Default)]
pub struct Callbacks {
    pub receive: Option<ReceiveCallback>,
    pub node_status: Option<NodeStatusCallback>,
    pub log: Option<LogCallback>,
    pub channel_accept: Option<ChannelAcceptCallback>,
    pub channel_receive: Option<ChannelReceiveCallback>,
}

impl Callbacks {
    pub fn new() -> Self {
        Callbacks::default()
    }

    pub fn log(&mut self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Debug => tracing::debug!("{}", message),
            LogLevel::Info => tracing::info!("{}", message),
            LogLevel::Warning => tracing::warn!("{}", message),
            LogLevel::Error => tracing::error!("{}", message),
        }
        if let Some(cb) = &mut self.log {
            cb(level, message);
        }
    }
}

/// The address a `REQ_EXTERNAL` response learned for a peer, surfaced
/// through the devtools/introspection accessors.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct ExternalAddress {
    pub addr: SocketAddr,
}
