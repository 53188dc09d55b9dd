//! Chat facade: discovery engine + fragmenter + reassembly table for one device.

use tracing::debug;

use crate::engine::{Action, DiscoveryEngine, Event};
use crate::fragment::{Fragmenter, Reassembler};
use crate::identity::LocalIdentity;
use crate::protocol::Config;

/// Host-driven messenger. Same contract as [`DiscoveryEngine`], except inbound data is
/// reassembled: the host sees `MessageReceived(text)` instead of raw `DataReceived` bytes.
pub struct Messenger {
    engine: DiscoveryEngine,
    fragmenter: Fragmenter,
    reassembler: Reassembler,
    last_sent: Option<String>,
    last_received: Option<String>,
}

impl Messenger {
    pub fn new(config: Config) -> Self {
        Self::with_identity(LocalIdentity::generate(), config)
    }

    pub fn with_identity(identity: LocalIdentity, config: Config) -> Self {
        let fragmenter = Fragmenter::with_max_message_size(config.max_message_size);
        Self {
            engine: DiscoveryEngine::with_identity(identity, config),
            fragmenter,
            reassembler: Reassembler::new(),
            last_sent: None,
            last_received: None,
        }
    }

    pub fn engine(&self) -> &DiscoveryEngine {
        &self.engine
    }

    pub fn reassembler(&self) -> &Reassembler {
        &self.reassembler
    }

    pub fn last_sent(&self) -> Option<&str> {
        self.last_sent.as_deref()
    }

    pub fn last_received(&self) -> Option<&str> {
        self.last_received.as_deref()
    }

    pub fn start(&mut self) -> Vec<Action> {
        self.engine.start()
    }

    pub fn destroy(&mut self) -> Vec<Action> {
        self.engine.destroy()
    }

    pub fn handle(&mut self, event: Event) -> Vec<Action> {
        let actions = self.engine.handle(event);
        let mut out = Vec::with_capacity(actions.len());
        for action in actions {
            match action {
                Action::DataReceived(bytes) => {
                    if let Some(text) = self.reassembler.feed(&bytes) {
                        self.last_received = Some(text.clone());
                        out.push(Action::MessageReceived(text));
                    }
                }
                other => out.push(other),
            }
        }
        out
    }

    /// Fragment `text` for the live link. Surrounding whitespace is trimmed; blank text and
    /// sends while not connected produce nothing and do not consume a message id.
    pub fn send(&mut self, text: &str) -> Vec<Action> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Vec::new();
        }
        let Some(link) = self.engine.link() else {
            debug!("not connected, message not sent");
            return Vec::new();
        };
        let fragments = self.fragmenter.encode(trimmed, self.engine.mtu());
        self.last_sent = Some(trimmed.to_string());
        fragments.iter().map(|f| link.transmit(f)).collect()
    }
}
