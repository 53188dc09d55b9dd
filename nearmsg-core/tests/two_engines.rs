//! Two messengers talking through an in-memory radio.

use std::collections::{HashMap, HashSet, VecDeque};

use nearmsg_core::{
    b64, Action, Config, ConnectionHandle, DiscoveryState, Event, LocalIdentity, Messenger,
    Payload, PeerId, Role, SessionId, TransportHandle, WatchId, WatchTarget,
};

/// Radio-level happenings, resolved against the receiver's watches on delivery.
enum Signal {
    Engine(Event),
    CentralConnected { central: usize },
    Written(String),
    Notified(Vec<u8>),
    LinkDropped,
}

struct Node {
    messenger: Messenger,
    advertised: Option<String>,
    scanning: bool,
    seen: HashSet<String>,
    watches: HashMap<WatchId, WatchTarget>,
    timers: Vec<SessionId>,
    states: Vec<DiscoveryState>,
    roles: Vec<Option<Role>>,
    messages: Vec<String>,
    sent_fragments: Vec<Vec<u8>>,
}

impl Node {
    fn new(id: u32) -> Self {
        Self {
            messenger: Messenger::with_identity(
                LocalIdentity::from_id(PeerId::from_u32(id)),
                Config::default(),
            ),
            advertised: None,
            scanning: false,
            seen: HashSet::new(),
            watches: HashMap::new(),
            timers: Vec::new(),
            states: Vec::new(),
            roles: Vec::new(),
            messages: Vec::new(),
            sent_fragments: Vec::new(),
        }
    }

    fn watch(&self, pred: impl Fn(&WatchTarget) -> bool) -> Option<WatchId> {
        self.watches
            .iter()
            .find(|(_, t)| pred(t))
            .map(|(id, _)| *id)
    }
}

struct Air {
    nodes: [Node; 2],
    queue: VecDeque<(usize, Signal)>,
    mtu: u16,
}

impl Air {
    fn new(a: u32, b: u32) -> Self {
        Self {
            nodes: [Node::new(a), Node::new(b)],
            queue: VecDeque::new(),
            mtu: 20,
        }
    }

    fn start(&mut self, n: usize) {
        let actions = self.nodes[n].messenger.start();
        self.apply(n, actions);
    }

    fn send(&mut self, n: usize, text: &str) {
        let actions = self.nodes[n].messenger.send(text);
        self.apply(n, actions);
        self.pump();
    }

    fn destroy(&mut self, n: usize) {
        let actions = self.nodes[n].messenger.destroy();
        self.apply(n, actions);
        self.pump();
    }

    fn fire_timers(&mut self, n: usize) {
        let timers = std::mem::take(&mut self.nodes[n].timers);
        for session in timers {
            self.queue
                .push_back((n, Signal::Engine(Event::RestartDue { session })));
        }
        self.pump();
    }

    /// Queue scan results for every scanning node, in the given order.
    fn scan_tick(&mut self, order: [usize; 2]) {
        for n in order {
            let other = 1 - n;
            if !self.nodes[n].scanning {
                continue;
            }
            if let Some(name) = self.nodes[other].advertised.clone() {
                if self.nodes[n].seen.insert(name.clone()) {
                    self.queue.push_back((
                        n,
                        Signal::Engine(Event::PeerFound {
                            handle: TransportHandle(format!("radio-{}", other)),
                            local_name: Some(name),
                        }),
                    ));
                }
            }
        }
        self.pump();
    }

    fn pump(&mut self) {
        while let Some((n, signal)) = self.queue.pop_front() {
            let node = &self.nodes[n];
            let event = match signal {
                Signal::Engine(e) => Some(e),
                Signal::CentralConnected { central } => node
                    .watch(|t| *t == WatchTarget::PeripheralConnected)
                    .map(|watch| Event::PeerConnected {
                        watch,
                        central: ConnectionHandle(format!("radio-{}", central)),
                        mtu: Some(self.mtu),
                    }),
                Signal::Written(value) => node
                    .watch(|t| *t == WatchTarget::PeripheralData)
                    .map(|watch| Event::Data {
                        watch,
                        payload: Payload::Base64(value),
                    }),
                Signal::Notified(data) => node
                    .watch(|t| matches!(t, WatchTarget::CentralData { .. }))
                    .map(|watch| Event::Data {
                        watch,
                        payload: Payload::Raw(data),
                    }),
                Signal::LinkDropped => node
                    .watch(|t| {
                        matches!(
                            t,
                            WatchTarget::CentralDisconnect { .. }
                                | WatchTarget::PeripheralDisconnected
                        )
                    })
                    .map(|watch| Event::PeerDisconnected { watch }),
            };
            if let Some(event) = event {
                let actions = self.nodes[n].messenger.handle(event);
                self.apply(n, actions);
            }
        }
    }

    fn apply(&mut self, n: usize, actions: Vec<Action>) {
        let other = 1 - n;
        for action in actions {
            let node = &mut self.nodes[n];
            match action {
                Action::StartAdvertising { local_name, .. } => node.advertised = Some(local_name),
                Action::StopAdvertising => node.advertised = None,
                Action::StartScan { .. } => {
                    node.scanning = true;
                    node.seen.clear();
                }
                Action::StopScan => node.scanning = false,
                Action::Connect {
                    session,
                    request_mtu,
                    ..
                } => {
                    let event = if self.nodes[other].advertised.is_some() {
                        self.queue
                            .push_back((other, Signal::CentralConnected { central: n }));
                        Event::ConnectSucceeded {
                            session,
                            connection: ConnectionHandle(format!("radio-{}", other)),
                            mtu: request_mtu.min(self.mtu),
                        }
                    } else {
                        Event::ConnectFailed {
                            session,
                            reason: "peer not advertising".into(),
                        }
                    };
                    self.queue.push_back((n, Signal::Engine(event)));
                }
                Action::Disconnect { .. } => {
                    self.queue.push_back((other, Signal::LinkDropped));
                }
                Action::Write { value, .. } => {
                    node.sent_fragments.push(b64::decode(&value).unwrap());
                    self.queue.push_back((other, Signal::Written(value)));
                }
                Action::Notify { data, .. } => {
                    node.sent_fragments.push(data.clone());
                    self.queue.push_back((other, Signal::Notified(data)));
                }
                Action::Watch { id, target } => {
                    node.watches.insert(id, target);
                }
                Action::Unwatch(id) => {
                    node.watches.remove(&id);
                }
                Action::ScheduleRestart { session, .. } => node.timers.push(session),
                Action::StateChanged(s) => node.states.push(s),
                Action::RoleAssigned(r) => node.roles.push(r),
                Action::MessageReceived(text) => node.messages.push(text),
                Action::PeerNamed(_) | Action::DataReceived(_) | Action::Error(_) => {}
            }
        }
    }

    fn state(&self, n: usize) -> DiscoveryState {
        self.nodes[n].messenger.engine().state()
    }

    fn role(&self, n: usize) -> Option<Role> {
        self.nodes[n].messenger.engine().role()
    }
}

fn connected_pair(order: [usize; 2]) -> Air {
    let mut air = Air::new(0x0000_0001, 0x0000_0002);
    air.start(0);
    air.start(1);
    air.pump();
    air.scan_tick(order);
    air
}

#[test]
fn mutual_discovery_assigns_lower_id_central() {
    for order in [[0, 1], [1, 0]] {
        let air = connected_pair(order);
        assert_eq!(air.role(0), Some(Role::Central));
        assert_eq!(air.role(1), Some(Role::Peripheral));
        assert_eq!(air.state(0), DiscoveryState::Connected);
        assert_eq!(air.state(1), DiscoveryState::Connected);
        assert_eq!(
            air.nodes[0].states,
            vec![
                DiscoveryState::Discovering,
                DiscoveryState::Negotiating,
                DiscoveryState::Connected
            ]
        );
        assert_eq!(air.nodes[1].roles, vec![Some(Role::Peripheral)]);
    }
}

#[test]
fn hi_is_one_fragment_and_arrives_immediately() {
    let mut air = connected_pair([0, 1]);
    air.send(0, "hi");
    assert_eq!(
        air.nodes[0].sent_fragments,
        vec![vec![0x00, 0x00, 0x00, b'h', b'i']]
    );
    assert_eq!(air.nodes[1].messages, vec!["hi".to_string()]);
}

#[test]
fn long_messages_flow_both_ways() {
    let mut air = connected_pair([1, 0]);
    let long = "Fragments are reassembled in arrival order and surfaced only once the LAST flag lands.";

    air.send(0, long);
    assert!(air.nodes[0].sent_fragments.len() > 1);
    assert_eq!(air.nodes[1].messages, vec![long.to_string()]);

    air.send(1, long);
    assert_eq!(air.nodes[0].messages, vec![long.to_string()]);
    assert_eq!(air.nodes[1].messenger.reassembler().pending(), 0);
}

#[test]
fn disconnect_returns_survivor_to_discovery_once() {
    let mut air = connected_pair([0, 1]);
    air.nodes[1].states.clear();

    air.destroy(0);
    assert_eq!(air.state(0), DiscoveryState::Idle);
    assert_eq!(air.state(1), DiscoveryState::Disconnected);
    assert_eq!(air.role(1), None);

    // A second drop signal must not schedule a second restart.
    air.queue.push_back((1, Signal::LinkDropped));
    air.pump();
    assert_eq!(air.nodes[1].timers.len(), 1);

    air.fire_timers(1);
    assert_eq!(
        air.nodes[1].states,
        vec![DiscoveryState::Disconnected, DiscoveryState::Discovering]
    );
    assert!(air.nodes[1].scanning);
    assert!(air.nodes[1].advertised.is_some());
}

#[test]
fn equal_ids_never_connect() {
    let mut air = Air::new(0x0000_0009, 0x0000_0009);
    air.start(0);
    air.start(1);
    air.queue.push_back((
        0,
        Signal::Engine(Event::PeerFound {
            handle: TransportHandle("radio-1".into()),
            local_name: Some("NM-00000009".into()),
        }),
    ));
    air.pump();
    assert_eq!(air.state(0), DiscoveryState::Discovering);
    assert_eq!(air.role(0), None);
    assert_ne!(
        air.nodes[0].messenger.engine().identity().id(),
        PeerId::from_u32(9)
    );

    // With a fresh id the pair settles on opposite roles.
    air.scan_tick([0, 1]);
    assert_eq!(air.state(0), DiscoveryState::Connected);
    assert_eq!(air.state(1), DiscoveryState::Connected);
    let roles: HashSet<_> = [air.role(0), air.role(1)].into_iter().collect();
    assert_eq!(
        roles,
        HashSet::from([Some(Role::Central), Some(Role::Peripheral)])
    );
}
