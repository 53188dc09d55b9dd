//! Discovery state machine. Host passes radio events in; the engine returns actions.
//!
//! `idle -> discovering -> negotiating -> connected -> disconnected -> discovering ...`
//!
//! Every long-running radio request is tagged with the session that issued it and every
//! subscription with a [`WatchId`]. Teardown forgets all watch ids and starts a new session,
//! so completions or callbacks from a superseded session are dropped on arrival.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::b64;
use crate::identity::{arbitrate, parse_peer_id, Arbitration, LocalIdentity, PeerId, Role};
use crate::protocol::{Config, MESSAGE_CHAR_UUID, SERVICE_UUID};

/// Identifies one discovery cycle. Bumped on every (re)start.
pub type SessionId = u64;

/// Opaque radio address of a discovered device (what the scanner reports).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransportHandle(pub String);

/// Opaque handle of an established link.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionHandle(pub String);

impl fmt::Display for TransportHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Cancellable subscription registered with the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WatchId(u64);

impl WatchId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

/// What a watch listens for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchTarget {
    /// Central: notifications on the message characteristic of `connection`.
    CentralData { connection: ConnectionHandle },
    /// Central: `connection` dropped.
    CentralDisconnect { connection: ConnectionHandle },
    /// Peripheral: a central connected to us.
    PeripheralConnected,
    /// Peripheral: a central wrote to the message characteristic.
    PeripheralData,
    /// Peripheral: the central went away.
    PeripheralDisconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryState {
    Idle,
    Discovering,
    Negotiating,
    Connected,
    Disconnected,
}

impl fmt::Display for DiscoveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DiscoveryState::Idle => "idle",
            DiscoveryState::Discovering => "discovering",
            DiscoveryState::Negotiating => "negotiating",
            DiscoveryState::Connected => "connected",
            DiscoveryState::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

/// Adapter power/permission state as reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RadioState {
    Unknown,
    Resetting,
    Unsupported,
    Unauthorized,
    PoweredOff,
    PoweredOn,
}

/// The peer we arbitrated against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRef {
    pub transport_handle: TransportHandle,
    pub peer_id: PeerId,
    pub peer_name: String,
}

/// Characteristic value as delivered by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Raw(Vec<u8>),
    /// Text-encoded value, as some central stacks hand them out.
    Base64(String),
}

/// Host -> engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Scan result. `local_name` is whatever the device advertised, if anything.
    PeerFound {
        handle: TransportHandle,
        local_name: Option<String>,
    },
    AdvertiseFailed {
        session: SessionId,
        reason: String,
    },
    ConnectSucceeded {
        session: SessionId,
        connection: ConnectionHandle,
        mtu: u16,
    },
    ConnectFailed {
        session: SessionId,
        reason: String,
    },
    /// Fired on a [`WatchTarget::PeripheralConnected`] watch.
    PeerConnected {
        watch: WatchId,
        central: ConnectionHandle,
        mtu: Option<u16>,
    },
    /// Fired on a data watch.
    Data { watch: WatchId, payload: Payload },
    /// Fired on a disconnect watch.
    PeerDisconnected { watch: WatchId },
    /// A timer requested via [`Action::ScheduleRestart`] elapsed.
    RestartDue { session: SessionId },
    RadioState(RadioState),
}

/// Engine -> host. Radio requests first, then consumer notifications.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    StartAdvertising { local_name: String, service: Uuid },
    StopAdvertising,
    StartScan { service: Uuid },
    StopScan,
    /// Completion must come back as `ConnectSucceeded`/`ConnectFailed` with the same session.
    Connect {
        session: SessionId,
        peer: TransportHandle,
        request_mtu: u16,
        timeout: Duration,
    },
    Disconnect { connection: ConnectionHandle },
    /// Central write: value is base64 text.
    Write {
        connection: ConnectionHandle,
        characteristic: Uuid,
        value: String,
    },
    /// Peripheral notification: raw bytes.
    Notify { characteristic: Uuid, data: Vec<u8> },
    Watch { id: WatchId, target: WatchTarget },
    /// Detach immediately; nothing registered under `id` may reach the engine afterwards.
    Unwatch(WatchId),
    ScheduleRestart { session: SessionId, delay: Duration },

    StateChanged(DiscoveryState),
    RoleAssigned(Option<Role>),
    PeerNamed(String),
    DataReceived(Vec<u8>),
    MessageReceived(String),
    Error(EngineError),
}

/// Recoverable failures surfaced to the consumer. None of them stop the engine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("Advertising failed: {0}")]
    Advertise(String),
    #[error("Connection failed: {0}")]
    Connect(String),
    #[error("Radio unavailable: {0:?}")]
    RadioUnavailable(RadioState),
}

/// Outbound path once a role is fixed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Link {
    /// We connected: write base64 text to the peer's characteristic.
    Central { connection: ConnectionHandle },
    /// We were connected to: notify raw bytes.
    Peripheral,
}

impl Link {
    pub fn transmit(&self, fragment: &[u8]) -> Action {
        match self {
            Link::Central { connection } => Action::Write {
                connection: connection.clone(),
                characteristic: MESSAGE_CHAR_UUID,
                value: b64::encode(fragment),
            },
            Link::Peripheral => Action::Notify {
                characteristic: MESSAGE_CHAR_UUID,
                data: fragment.to_vec(),
            },
        }
    }
}

struct Session {
    id: SessionId,
    state: DiscoveryState,
    role: Option<Role>,
    peer: Option<PeerRef>,
    connection: Option<ConnectionHandle>,
    watchers: BTreeMap<WatchId, WatchTarget>,
    advertising: bool,
    scanning: bool,
    mtu: Option<u16>,
}

impl Session {
    fn new(id: SessionId) -> Self {
        Self {
            id,
            state: DiscoveryState::Idle,
            role: None,
            peer: None,
            connection: None,
            watchers: BTreeMap::new(),
            advertising: false,
            scanning: false,
            mtu: None,
        }
    }
}

pub struct DiscoveryEngine {
    identity: LocalIdentity,
    config: Config,
    session: Session,
    next_watch: u64,
    destroyed: bool,
    radio_down: bool,
}

impl DiscoveryEngine {
    pub fn new(config: Config) -> Self {
        Self::with_identity(LocalIdentity::generate(), config)
    }

    pub fn with_identity(identity: LocalIdentity, config: Config) -> Self {
        Self {
            identity,
            config,
            session: Session::new(0),
            next_watch: 0,
            destroyed: false,
            radio_down: false,
        }
    }

    pub fn identity(&self) -> &LocalIdentity {
        &self.identity
    }

    pub fn local_name(&self) -> &str {
        self.identity.advertised_name()
    }

    pub fn state(&self) -> DiscoveryState {
        self.session.state
    }

    pub fn role(&self) -> Option<Role> {
        self.session.role
    }

    pub fn peer(&self) -> Option<&PeerRef> {
        self.session.peer.as_ref()
    }

    pub fn session_id(&self) -> SessionId {
        self.session.id
    }

    pub fn connection(&self) -> Option<&ConnectionHandle> {
        self.session.connection.as_ref()
    }

    pub fn active_watchers(&self) -> usize {
        self.session.watchers.len()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Negotiated MTU for the live link, or the configured default.
    pub fn mtu(&self) -> u16 {
        self.session.mtu.unwrap_or(self.config.default_mtu)
    }

    /// Outbound path, only while connected.
    pub fn link(&self) -> Option<Link> {
        if self.session.state != DiscoveryState::Connected {
            return None;
        }
        match (self.session.role?, &self.session.connection) {
            (Role::Central, Some(connection)) => Some(Link::Central {
                connection: connection.clone(),
            }),
            (Role::Central, None) => None,
            (Role::Peripheral, _) => Some(Link::Peripheral),
        }
    }

    /// Transmit one already-encoded fragment over the live link.
    pub fn send_data(&self, fragment: &[u8]) -> Option<Action> {
        self.link().map(|link| link.transmit(fragment))
    }

    /// Begin advertising and scanning. No-op unless idle; a destroyed engine stays down.
    pub fn start(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.destroyed || self.session.state != DiscoveryState::Idle {
            return actions;
        }
        self.begin_discovery(&mut actions);
        actions
    }

    /// Tear everything down and return to idle for good. Idempotent.
    pub fn destroy(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.destroyed {
            return actions;
        }
        self.destroyed = true;
        self.teardown(&mut actions);
        if let Some(connection) = self.session.connection.take() {
            actions.push(Action::Disconnect { connection });
        }
        self.session.advertising = false;
        actions.push(Action::StopAdvertising);
        self.session.mtu = None;
        self.set_state(DiscoveryState::Idle, &mut actions);
        info!(local = %self.identity.id(), "discovery engine destroyed");
        actions
    }

    pub fn handle(&mut self, event: Event) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.destroyed {
            // A connect issued before destroy may still complete; release it.
            if let Event::ConnectSucceeded { connection, .. } = event {
                debug!(%connection, "releasing connection completed after destroy");
                actions.push(Action::Disconnect { connection });
            }
            return actions;
        }
        match event {
            Event::PeerFound { handle, local_name } => {
                if let Some(name) = local_name {
                    self.on_peer_found(handle, name, &mut actions);
                }
            }
            Event::AdvertiseFailed { session, reason } => {
                if session == self.session.id && self.session.advertising {
                    warn!(%reason, "advertising failed");
                    self.session.advertising = false;
                    actions.push(Action::Error(EngineError::Advertise(reason)));
                    if matches!(
                        self.session.state,
                        DiscoveryState::Discovering | DiscoveryState::Negotiating
                    ) {
                        self.restart(&mut actions);
                    }
                }
            }
            Event::ConnectSucceeded {
                session,
                connection,
                mtu,
            } => self.on_connect_succeeded(session, connection, mtu, &mut actions),
            Event::ConnectFailed { session, reason } => {
                if session == self.session.id
                    && self.session.state == DiscoveryState::Negotiating
                    && self.session.role == Some(Role::Central)
                {
                    warn!(%reason, "connection failed, restarting discovery");
                    actions.push(Action::Error(EngineError::Connect(reason)));
                    self.restart(&mut actions);
                }
            }
            Event::PeerConnected {
                watch,
                central,
                mtu,
            } => {
                if self.armed(watch) == Some(&WatchTarget::PeripheralConnected)
                    && self.session.state == DiscoveryState::Negotiating
                {
                    info!(%central, "central connected");
                    self.session.connection = Some(central);
                    self.session.mtu = mtu;
                    self.set_state(DiscoveryState::Connected, &mut actions);
                }
            }
            Event::Data { watch, payload } => {
                let is_data = matches!(
                    self.armed(watch),
                    Some(WatchTarget::CentralData { .. } | WatchTarget::PeripheralData)
                );
                if is_data {
                    match payload {
                        Payload::Raw(bytes) => actions.push(Action::DataReceived(bytes)),
                        Payload::Base64(text) => match b64::decode(&text) {
                            Ok(bytes) => actions.push(Action::DataReceived(bytes)),
                            Err(e) => warn!(error = %e, "dropping undecodable characteristic value"),
                        },
                    }
                }
            }
            Event::PeerDisconnected { watch } => {
                let is_disconnect = matches!(
                    self.armed(watch),
                    Some(WatchTarget::CentralDisconnect { .. } | WatchTarget::PeripheralDisconnected)
                );
                let live = matches!(
                    self.session.state,
                    DiscoveryState::Negotiating | DiscoveryState::Connected
                );
                if is_disconnect && live {
                    self.on_disconnect(&mut actions);
                }
            }
            Event::RestartDue { session } => {
                if session == self.session.id && self.session.state == DiscoveryState::Disconnected {
                    self.restart(&mut actions);
                }
            }
            Event::RadioState(radio) => self.on_radio_state(radio, &mut actions),
        }
        actions
    }

    fn on_peer_found(&mut self, handle: TransportHandle, name: String, actions: &mut Vec<Action>) {
        if self.session.state != DiscoveryState::Discovering {
            return;
        }
        let Some(peer_id) = parse_peer_id(&name) else {
            return;
        };

        match arbitrate(self.identity.id(), peer_id) {
            Arbitration::Collision => {
                let mut fresh = LocalIdentity::generate();
                while fresh.id() == peer_id {
                    fresh = LocalIdentity::generate();
                }
                debug!(old = %self.identity.id(), new = %fresh.id(), "identity collision, regenerated");
                self.identity = fresh;
                if self.session.advertising {
                    actions.push(Action::StopAdvertising);
                }
                self.advertise(actions);
            }
            Arbitration::Resolved(role) => {
                info!(peer = %peer_id, %role, "peer discovered");
                self.set_state(DiscoveryState::Negotiating, actions);
                self.session.role = Some(role);
                actions.push(Action::RoleAssigned(Some(role)));
                actions.push(Action::PeerNamed(name.clone()));
                self.session.peer = Some(PeerRef {
                    transport_handle: handle.clone(),
                    peer_id,
                    peer_name: name,
                });
                self.stop_scan(actions);
                match role {
                    Role::Central => {
                        if self.session.advertising {
                            self.session.advertising = false;
                            actions.push(Action::StopAdvertising);
                        }
                        actions.push(Action::Connect {
                            session: self.session.id,
                            peer: handle,
                            request_mtu: self.config.request_mtu,
                            timeout: self.config.connect_timeout,
                        });
                    }
                    Role::Peripheral => {
                        self.watch(WatchTarget::PeripheralConnected, actions);
                        self.watch(WatchTarget::PeripheralData, actions);
                        self.watch(WatchTarget::PeripheralDisconnected, actions);
                    }
                }
            }
        }
    }

    fn on_connect_succeeded(
        &mut self,
        session: SessionId,
        connection: ConnectionHandle,
        mtu: u16,
        actions: &mut Vec<Action>,
    ) {
        let expected = session == self.session.id
            && self.session.state == DiscoveryState::Negotiating
            && self.session.role == Some(Role::Central);
        if !expected {
            debug!(%connection, "releasing connection from a superseded session");
            actions.push(Action::Disconnect { connection });
            return;
        }
        info!(%connection, mtu, "connected as central");
        self.session.connection = Some(connection.clone());
        self.session.mtu = Some(mtu);
        self.watch(
            WatchTarget::CentralData {
                connection: connection.clone(),
            },
            actions,
        );
        self.watch(WatchTarget::CentralDisconnect { connection }, actions);
        self.set_state(DiscoveryState::Connected, actions);
    }

    fn on_disconnect(&mut self, actions: &mut Vec<Action>) {
        info!("peer disconnected");
        self.set_state(DiscoveryState::Disconnected, actions);
        self.session.connection = None;
        self.session.peer = None;
        self.session.mtu = None;
        self.clear_role(actions);
        actions.push(Action::ScheduleRestart {
            session: self.session.id,
            delay: self.config.restart_delay,
        });
    }

    fn on_radio_state(&mut self, radio: RadioState, actions: &mut Vec<Action>) {
        if self.session.state == DiscoveryState::Idle {
            return;
        }
        if radio != RadioState::PoweredOn {
            if !self.radio_down {
                warn!(?radio, "radio unavailable");
                self.radio_down = true;
                actions.push(Action::Error(EngineError::RadioUnavailable(radio)));
            }
            return;
        }
        if self.radio_down {
            self.radio_down = false;
            if self.session.state == DiscoveryState::Discovering {
                debug!("radio back on, restarting discovery");
                self.restart(actions);
            }
        }
    }

    /// Full teardown followed by a fresh discovery cycle.
    fn restart(&mut self, actions: &mut Vec<Action>) {
        self.begin_discovery(actions);
    }

    fn begin_discovery(&mut self, actions: &mut Vec<Action>) {
        self.teardown(actions);
        if let Some(connection) = self.session.connection.take() {
            actions.push(Action::Disconnect { connection });
        }
        self.session.id = self.session.id.wrapping_add(1);
        self.session.mtu = None;
        self.set_state(DiscoveryState::Discovering, actions);
        if self.session.advertising {
            actions.push(Action::StopAdvertising);
        }
        self.advertise(actions);
        self.session.scanning = true;
        actions.push(Action::StartScan {
            service: SERVICE_UUID,
        });
    }

    /// Detach every watcher, stop scanning, forget the peer and role.
    fn teardown(&mut self, actions: &mut Vec<Action>) {
        let watchers = std::mem::take(&mut self.session.watchers);
        actions.extend(watchers.into_keys().map(Action::Unwatch));
        self.stop_scan(actions);
        self.session.peer = None;
        self.clear_role(actions);
    }

    fn advertise(&mut self, actions: &mut Vec<Action>) {
        self.session.advertising = true;
        actions.push(Action::StartAdvertising {
            local_name: self.identity.advertised_name().to_string(),
            service: SERVICE_UUID,
        });
    }

    fn stop_scan(&mut self, actions: &mut Vec<Action>) {
        if self.session.scanning {
            self.session.scanning = false;
            actions.push(Action::StopScan);
        }
    }

    fn clear_role(&mut self, actions: &mut Vec<Action>) {
        if self.session.role.take().is_some() {
            actions.push(Action::RoleAssigned(None));
        }
    }

    fn watch(&mut self, target: WatchTarget, actions: &mut Vec<Action>) {
        let id = WatchId(self.next_watch);
        self.next_watch += 1;
        self.session.watchers.insert(id, target.clone());
        actions.push(Action::Watch { id, target });
    }

    fn armed(&self, watch: WatchId) -> Option<&WatchTarget> {
        self.session.watchers.get(&watch)
    }

    fn set_state(&mut self, state: DiscoveryState, actions: &mut Vec<Action>) {
        if self.session.state == state {
            return;
        }
        debug!(from = %self.session.state, to = %state, "discovery state");
        self.session.state = state;
        actions.push(Action::StateChanged(state));
    }
}
