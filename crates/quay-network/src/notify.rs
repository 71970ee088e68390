//! Network lifecycle notifications.

use crate::connection::Connection;
use crate::network::Network;
use std::sync::Arc;

/// A sink for network lifecycle events.
///
/// Notifications fire synchronously from the dial/accept task right after a
/// connection is registered; implementations must not block the network.
pub trait Notifiee: Send + Sync {
    /// Called when a connection is opened, in either direction.
    fn connected(&self, network: &Network, conn: &Arc<Connection>);
}

type ConnectedFn = Box<dyn Fn(&Network, &Arc<Connection>) + Send + Sync>;

/// A [`Notifiee`] assembled from optional callbacks.
#[derive(Default)]
pub struct NotifyBundle {
    pub connected: Option<ConnectedFn>,
}

impl Notifiee for NotifyBundle {
    fn connected(&self, network: &Network, conn: &Arc<Connection>) {
        if let Some(callback) = &self.connected {
            callback(network, conn);
        }
    }
}

/// The default sink: drops every event.
pub struct NoopNotifiee;

impl Notifiee for NoopNotifiee {
    fn connected(&self, _network: &Network, _conn: &Arc<Connection>) {}
}
