//! Message routing.
//!
//! Resolves the addressee of each client message through the registry and
//! forwards it. Payload fields go out exactly as they came in; only `from`
//! is rewritten to the sender's assigned identifier. A missing addressee is
//! logged and otherwise ignored: the sender gets no negative acknowledgement.

use crate::protocol::{ClientMessage, ServerMessage};
use crate::registry::ConnectionRegistry;

/// Outcome of routing one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteResult {
    /// Queued for the addressee.
    Delivered,
    /// The addressee is not online.
    TargetNotFound,
    /// A hangup with no addressee, or addressed to the sender itself.
    NoTarget,
    /// The roster was sent to this many participants.
    Broadcast(usize),
}

#[derive(Clone)]
pub struct MessageRouter {
    registry: ConnectionRegistry,
}

impl MessageRouter {
    pub fn new(registry: ConnectionRegistry) -> Self {
        Self { registry }
    }

    /// Route a message sent by `from`.
    pub fn route(&self, from: &str, message: ClientMessage) -> RouteResult {
        let kind = message.kind();
        match message {
            ClientMessage::Offer { to, payload, .. } => {
                let target = to.clone();
                self.forward(kind, &target, ServerMessage::Offer {
                    from: from.to_string(),
                    to,
                    payload,
                })
            }

            ClientMessage::Answer { to, payload, .. } => {
                let target = to.clone();
                self.forward(kind, &target, ServerMessage::Answer {
                    from: from.to_string(),
                    to,
                    payload,
                })
            }

            ClientMessage::IceCandidate { to, payload, .. } => {
                let target = to.clone();
                self.forward(kind, &target, ServerMessage::IceCandidate {
                    from: from.to_string(),
                    to,
                    payload,
                })
            }

            ClientMessage::Hangup { to, payload, .. } => {
                match to.filter(|to| !to.is_empty() && to != from) {
                    Some(target) => self.forward(kind, &target.clone(), ServerMessage::Hangup {
                        from: from.to_string(),
                        to: Some(target),
                        payload,
                    }),
                    None => {
                        tracing::debug!(from = from, "Hangup has no routable target");
                        RouteResult::NoTarget
                    }
                }
            }

            ClientMessage::RequestRoster => RouteResult::Broadcast(self.broadcast_roster()),
        }
    }

    fn forward(&self, kind: &str, to: &str, message: ServerMessage) -> RouteResult {
        if self.registry.send_to(to, message) {
            tracing::debug!(kind = kind, to = to, "Message forwarded");
            RouteResult::Delivered
        } else {
            tracing::warn!(kind = kind, to = to, "Failed to find user to forward message");
            RouteResult::TargetNotFound
        }
    }

    /// Send the full roster to everyone online. Returns how many participants
    /// it was queued for.
    pub fn broadcast_roster(&self) -> usize {
        let handles = self.registry.snapshot_handles();
        let mut ids: Vec<String> = handles.iter().map(|(id, _)| id.clone()).collect();
        ids.sort();

        tracing::debug!(online = ids.len(), "Broadcasting roster");

        let roster = ServerMessage::roster(ids);
        handles
            .iter()
            .filter(|(_, handle)| handle.send(roster.clone()))
            .count()
    }
}
