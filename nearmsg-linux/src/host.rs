//! Host loop glue: executes engine actions on the emulated radio and turns radio signals into
//! engine events. Signals only reach the engine through a watch it has armed.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use nearmsg_core::{
    Action, ConnectionHandle, Event, Messenger, Payload, SessionId, TransportHandle, WatchId,
    WatchTarget,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::radio::{PeripheralLink, Radio, Signal};
use crate::wire::RadioFrame;

/// Scan in progress: service filter plus what was already reported this scan.
struct Scan {
    service: Uuid,
    seen: HashSet<(TransportHandle, String)>,
}

pub struct Host {
    messenger: Messenger,
    radio: Radio,
    watches: BTreeMap<WatchId, WatchTarget>,
    advertiser: Option<JoinHandle<()>>,
    scan: Option<Scan>,
    central_links: HashMap<ConnectionHandle, mpsc::UnboundedSender<RadioFrame>>,
    peripheral_link: Option<PeripheralLink>,
    backlog: VecDeque<Event>,
}

impl Host {
    pub fn new(messenger: Messenger, radio: Radio) -> Self {
        Self {
            messenger,
            radio,
            watches: BTreeMap::new(),
            advertiser: None,
            scan: None,
            central_links: HashMap::new(),
            peripheral_link: None,
            backlog: VecDeque::new(),
        }
    }

    pub fn messenger(&self) -> &Messenger {
        &self.messenger
    }

    /// Start discovery. Returns consumer notifications.
    pub fn start(&mut self) -> Vec<Action> {
        let actions = self.messenger.start();
        self.run(actions)
    }

    pub fn shutdown(&mut self) -> Vec<Action> {
        let actions = self.messenger.destroy();
        let notices = self.run(actions);
        self.stop_advertising();
        notices
    }

    /// Send one chat line. Returns false when nothing went out (blank or not connected).
    pub fn send(&mut self, text: &str) -> bool {
        let actions = self.messenger.send(text);
        let sent = !actions.is_empty();
        self.run(actions);
        sent
    }

    pub fn on_signal(&mut self, signal: Signal) -> Vec<Action> {
        match signal {
            Signal::Heard { from, frame } => {
                let RadioFrame::Advertisement {
                    version,
                    radio_id,
                    service,
                    local_name,
                    gatt_port,
                } = frame
                else {
                    return Vec::new();
                };
                if radio_id == self.radio.id() || version != nearmsg_core::PROTOCOL_VERSION {
                    return Vec::new();
                }
                let handle = TransportHandle(std::net::SocketAddr::new(from.ip(), gatt_port).to_string());
                self.report_scan_result(service, handle, local_name);
            }
            Signal::AdvertiseFailed { session, reason } => {
                self.backlog.push_back(Event::AdvertiseFailed { session, reason });
            }
            Signal::Accepted { stream, addr } => {
                if self.peripheral_link.is_some() || self.advertiser.is_none() {
                    debug!(%addr, "refusing central");
                } else {
                    self.peripheral_link = Some(self.radio.serve_central(stream, addr));
                }
            }
            Signal::CentralReady {
                central,
                mtu,
                local_name,
            } => {
                let Some(link) = self.peripheral_link.as_mut().filter(|l| l.central == central)
                else {
                    return Vec::new();
                };
                link.mtu = Some(mtu);
                // The central stopped advertising before connecting; its name doubles as a scan result.
                if let Some(service) = self.scan.as_ref().map(|s| s.service) {
                    self.report_scan_result(service, TransportHandle(central.0), local_name);
                }
                self.offer_central();
            }
            Signal::Connected {
                session,
                connection,
                mtu,
                outbound,
            } => {
                self.central_links.insert(connection.clone(), outbound);
                self.backlog.push_back(Event::ConnectSucceeded {
                    session,
                    connection,
                    mtu,
                });
            }
            Signal::ConnectFailed { session, reason } => {
                self.backlog.push_back(Event::ConnectFailed { session, reason });
            }
            Signal::Written { central, value } => {
                let current = self.peripheral_link.as_ref().is_some_and(|l| l.central == central);
                if let Some(watch) = self.armed(|t| *t == WatchTarget::PeripheralData).filter(|_| current) {
                    self.backlog.push_back(Event::Data {
                        watch,
                        payload: Payload::Base64(value),
                    });
                }
            }
            Signal::Notified { connection, data } => {
                let watch = self.armed(|t| {
                    matches!(t, WatchTarget::CentralData { connection: c } if *c == connection)
                });
                if let Some(watch) = watch {
                    self.backlog.push_back(Event::Data {
                        watch,
                        payload: Payload::Raw(data),
                    });
                }
            }
            Signal::LinkClosed { connection } => self.on_link_closed(connection),
            Signal::RestartDue { session } => {
                self.backlog.push_back(Event::RestartDue { session });
            }
            Signal::RadioState(state) => {
                debug!(?state, "radio state");
                self.backlog.push_back(Event::RadioState(state));
            }
        }
        self.run(Vec::new())
    }

    fn on_link_closed(&mut self, connection: ConnectionHandle) {
        if self.central_links.remove(&connection).is_some() {
            let watch = self.armed(|t| {
                matches!(t, WatchTarget::CentralDisconnect { connection: c } if *c == connection)
            });
            if let Some(watch) = watch {
                self.backlog.push_back(Event::PeerDisconnected { watch });
            }
            return;
        }
        let is_current = self
            .peripheral_link
            .as_ref()
            .is_some_and(|l| l.central == connection);
        if !is_current {
            trace!(%connection, "close of a released link");
            return;
        }
        let announced = self.peripheral_link.take().is_some_and(|l| l.announced);
        if announced {
            if let Some(watch) = self.armed(|t| *t == WatchTarget::PeripheralDisconnected) {
                self.backlog.push_back(Event::PeerDisconnected { watch });
            }
        }
    }

    /// Perform actions, feeding follow-up events back to the engine until nothing is left.
    fn run(&mut self, actions: Vec<Action>) -> Vec<Action> {
        let mut notices = Vec::new();
        let mut queue: VecDeque<Action> = actions.into();
        loop {
            while let Some(action) = queue.pop_front() {
                self.perform(action, &mut notices);
            }
            let Some(event) = self.backlog.pop_front() else {
                break;
            };
            queue.extend(self.messenger.handle(event));
        }
        notices
    }

    fn perform(&mut self, action: Action, notices: &mut Vec<Action>) {
        match action {
            Action::StartAdvertising {
                local_name,
                service,
            } => {
                self.stop_advertising();
                // A new name may make peers we already reported relevant again.
                if let Some(scan) = self.scan.as_mut() {
                    scan.seen.clear();
                }
                let session = self.session();
                self.advertiser = Some(self.radio.advertise(session, local_name, service));
            }
            Action::StopAdvertising => {
                self.stop_advertising();
                if self.peripheral_link.as_ref().is_some_and(|l| !l.announced) {
                    debug!("dropping unannounced central");
                    self.peripheral_link = None;
                }
            }
            Action::StartScan { service } => {
                self.scan = Some(Scan {
                    service,
                    seen: HashSet::new(),
                });
            }
            Action::StopScan => self.scan = None,
            Action::Connect {
                session,
                peer,
                request_mtu,
                timeout,
            } => {
                let local_name = self.messenger.engine().local_name().to_string();
                self.radio
                    .connect(session, peer, request_mtu, timeout, local_name);
            }
            Action::Disconnect { connection } => {
                if self.central_links.remove(&connection).is_none()
                    && self
                        .peripheral_link
                        .as_ref()
                        .is_some_and(|l| l.central == connection)
                {
                    self.peripheral_link = None;
                }
            }
            Action::Write {
                connection,
                characteristic,
                value,
            } => match self.central_links.get(&connection) {
                Some(tx) => {
                    let _ = tx.send(RadioFrame::Write {
                        characteristic,
                        value,
                    });
                }
                None => debug!(%connection, "write on a closed link"),
            },
            Action::Notify {
                characteristic,
                data,
            } => match &self.peripheral_link {
                Some(link) => {
                    let _ = link.outbound.send(RadioFrame::Notify {
                        characteristic,
                        data,
                    });
                }
                None => debug!("notify without a central"),
            },
            Action::Watch { id, target } => {
                let offers_central = target == WatchTarget::PeripheralConnected;
                self.watches.insert(id, target);
                if offers_central {
                    self.offer_central();
                }
            }
            Action::Unwatch(id) => {
                self.watches.remove(&id);
            }
            Action::ScheduleRestart { session, delay } => {
                self.radio.schedule_restart(session, delay);
            }
            other => notices.push(other),
        }
    }

    fn report_scan_result(&mut self, service: Uuid, handle: TransportHandle, local_name: String) {
        let Some(scan) = self.scan.as_mut() else {
            return;
        };
        if scan.service != service || !scan.seen.insert((handle.clone(), local_name.clone())) {
            return;
        }
        self.backlog.push_back(Event::PeerFound {
            handle,
            local_name: Some(local_name),
        });
    }

    /// Tell the engine about a ready central once it listens for one.
    fn offer_central(&mut self) {
        let Some(watch) = self.armed(|t| *t == WatchTarget::PeripheralConnected) else {
            return;
        };
        let Some(link) = self.peripheral_link.as_mut() else {
            return;
        };
        if link.announced {
            return;
        }
        if let Some(mtu) = link.mtu {
            link.announced = true;
            self.backlog.push_back(Event::PeerConnected {
                watch,
                central: link.central.clone(),
                mtu: Some(mtu),
            });
        }
    }

    fn armed(&self, pred: impl Fn(&WatchTarget) -> bool) -> Option<WatchId> {
        self.watches
            .iter()
            .find(|(_, target)| pred(target))
            .map(|(id, _)| *id)
    }

    fn stop_advertising(&mut self) {
        if let Some(task) = self.advertiser.take() {
            task.abort();
        }
    }

    fn session(&self) -> SessionId {
        self.messenger.engine().session_id()
    }
}
