//! Per-peer behaviors: small state machines attached to every peer
//! that translate wire messages into calls on the node's components.

mod consensus;
mod gossip;
mod relay;

pub use consensus::ConsensusBehavior;
pub use gossip::AddressGossipBehavior;
pub use relay::TxRelayBehavior;

use std::sync::Arc;

use tracing::warn;

use crate::message::NetworkMessage;
use crate::peer::{MessageDispatcher, PeerHandle};

/// What a behavior wants done after seeing a message.
#[derive(Default)]
pub struct BehaviorOutcome {
    pub replies: Vec<NetworkMessage>,
    /// Close the connection and ban the peer for this many seconds.
    pub ban_peer_secs: Option<u64>,
    /// Close without banning.
    pub disconnect: bool,
}

impl BehaviorOutcome {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn reply(message: NetworkMessage) -> Self {
        Self {
            replies: vec![message],
            ..Self::default()
        }
    }

    pub fn replies(messages: Vec<NetworkMessage>) -> Self {
        Self {
            replies: messages,
            ..Self::default()
        }
    }

    pub fn ban(secs: u64) -> Self {
        Self {
            ban_peer_secs: Some(secs),
            disconnect: true,
            ..Self::default()
        }
    }
}

/// One concern attached to a peer. Every behavior sees every message
/// and contributes replies independently.
pub trait Behavior: Send {
    fn name(&self) -> &'static str;

    fn handle(&mut self, peer: &Arc<PeerHandle>, message: &NetworkMessage) -> BehaviorOutcome;

    /// Called once when the peer goes away.
    fn on_disconnected(&mut self, peer: &Arc<PeerHandle>) {
        let _ = peer;
    }
}

/// Ban callback invoked when a behavior condemns a peer.
pub type BanHook = Box<dyn Fn(&Arc<PeerHandle>, u64) + Send>;

/// Runs a stack of behaviors as the session dispatcher.
pub struct BehaviorStack {
    behaviors: Vec<Box<dyn Behavior>>,
    ban_hook: Option<BanHook>,
}

impl BehaviorStack {
    pub fn new(behaviors: Vec<Box<dyn Behavior>>) -> Self {
        Self {
            behaviors,
            ban_hook: None,
        }
    }

    /// Install the address-book ban callback.
    pub fn with_ban_hook(mut self, hook: BanHook) -> Self {
        self.ban_hook = Some(hook);
        self
    }
}

impl MessageDispatcher for BehaviorStack {
    fn dispatch(
        &mut self,
        peer: &Arc<PeerHandle>,
        message: NetworkMessage,
    ) -> Vec<NetworkMessage> {
        let mut replies = Vec::new();

        for behavior in self.behaviors.iter_mut() {
            let outcome = behavior.handle(peer, &message);
            replies.extend(outcome.replies);

            if let Some(ban_secs) = outcome.ban_peer_secs {
                warn!(
                    peer = peer.id,
                    behavior = behavior.name(),
                    ban_secs,
                    "behavior condemned peer"
                );

                if let Some(hook) = &self.ban_hook {
                    hook(peer, ban_secs);
                }
            }

            if outcome.disconnect {
                // the session loop observes the state change and
                // winds down after flushing replies
                peer.request_disconnect();
                break;
            }
        }

        replies
    }

    fn disconnected(&mut self, peer: &Arc<PeerHandle>) {
        for behavior in self.behaviors.iter_mut() {
            behavior.on_disconnected(peer);
        }
    }
}
