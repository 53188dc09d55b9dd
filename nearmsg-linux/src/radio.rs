//! Emulated radio: advertising and scanning over UDP (multicast and/or unicast peers),
//! GATT links over TCP. Everything the sockets observe is reported to the host as a [`Signal`].

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use nearmsg_core::protocol::{MESSAGE_CHAR_UUID, PROTOCOL_VERSION};
use nearmsg_core::{ConnectionHandle, RadioState, Role, SessionId, TransportHandle};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::wire::{decode_frame, encode_frame, read_frame, write_frame, RadioFrame, WireError};

const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 60, 61);

/// Radio -> host.
#[derive(Debug)]
pub enum Signal {
    /// A datagram arrived on the scan socket.
    Heard { from: SocketAddr, frame: RadioFrame },
    AdvertiseFailed { session: SessionId, reason: String },
    /// A central opened a link to our GATT server.
    Accepted { stream: TcpStream, addr: SocketAddr },
    /// MTU exchange finished on an accepted link.
    CentralReady {
        central: ConnectionHandle,
        mtu: u16,
        local_name: String,
    },
    Connected {
        session: SessionId,
        connection: ConnectionHandle,
        mtu: u16,
        outbound: mpsc::UnboundedSender<RadioFrame>,
    },
    ConnectFailed { session: SessionId, reason: String },
    Written { central: ConnectionHandle, value: String },
    Notified { connection: ConnectionHandle, data: Vec<u8> },
    LinkClosed { connection: ConnectionHandle },
    RestartDue { session: SessionId },
    /// The scan socket failed (`PoweredOff`) or recovered (`PoweredOn`).
    RadioState(RadioState),
}

/// Accepted central link, owned by the host. Dropping `outbound` closes the link.
#[derive(Debug)]
pub struct PeripheralLink {
    pub central: ConnectionHandle,
    pub outbound: mpsc::UnboundedSender<RadioFrame>,
    /// Set once the MTU exchange completed.
    pub mtu: Option<u16>,
    /// Whether the engine has been told about this central.
    pub announced: bool,
}

pub struct Radio {
    id: Uuid,
    socket: Arc<UdpSocket>,
    destinations: Vec<SocketAddr>,
    gatt_port: u16,
    max_mtu: u16,
    advertise_interval: Duration,
    signals: mpsc::UnboundedSender<Signal>,
}

impl Radio {
    /// Bind the scan socket and the GATT listener, and start reporting what they see.
    pub async fn bind(cfg: &Config, signals: mpsc::UnboundedSender<Signal>) -> std::io::Result<Radio> {
        let std_sock = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, cfg.discovery_port))?;
        let mut destinations = Vec::new();
        if cfg.multicast {
            std_sock.join_multicast_v4(&MULTICAST_GROUP, &Ipv4Addr::UNSPECIFIED)?;
            std_sock.set_multicast_ttl_v4(1)?;
            destinations.push(SocketAddr::from((MULTICAST_GROUP, cfg.discovery_port)));
        }
        destinations.extend(cfg.peers.iter().copied());
        std_sock.set_nonblocking(true)?;
        let socket = Arc::new(UdpSocket::from_std(std_sock)?);

        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, cfg.gatt_port)).await?;
        let gatt_port = listener.local_addr()?.port();

        tokio::spawn(scan_loop(socket.clone(), signals.clone()));
        tokio::spawn(accept_loop(listener, signals.clone()));

        Ok(Radio {
            id: Uuid::new_v4(),
            socket,
            destinations,
            gatt_port,
            max_mtu: cfg.max_mtu,
            advertise_interval: cfg.advertise_interval(),
            signals,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn gatt_port(&self) -> u16 {
        self.gatt_port
    }

    pub fn discovery_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn add_destination(&mut self, addr: SocketAddr) {
        self.destinations.push(addr);
    }

    /// Broadcast `local_name` until the returned task is aborted.
    pub fn advertise(&self, session: SessionId, local_name: String, service: Uuid) -> JoinHandle<()> {
        let frame = RadioFrame::Advertisement {
            version: PROTOCOL_VERSION,
            radio_id: self.id,
            service,
            local_name,
            gatt_port: self.gatt_port,
        };
        let socket = self.socket.clone();
        let destinations = self.destinations.clone();
        let interval = self.advertise_interval;
        let signals = self.signals.clone();
        tokio::spawn(async move {
            let bytes = match encode_frame(&frame) {
                Ok(b) => b,
                Err(e) => {
                    let _ = signals.send(Signal::AdvertiseFailed {
                        session,
                        reason: e.to_string(),
                    });
                    return;
                }
            };
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let mut last_err = None;
                let mut delivered = false;
                for dest in &destinations {
                    match socket.send_to(&bytes, dest).await {
                        Ok(_) => delivered = true,
                        Err(e) => last_err = Some(e),
                    }
                }
                if !delivered {
                    let reason = last_err
                        .map(|e| e.to_string())
                        .unwrap_or_else(|| "no advertising destinations".into());
                    // Failure restarts discovery; hold it back so a dead radio does not spin.
                    ticker.tick().await;
                    let _ = signals.send(Signal::AdvertiseFailed { session, reason });
                    return;
                }
            }
        })
    }

    /// Open a link to `peer` as central. Completion arrives as `Connected` or `ConnectFailed`.
    pub fn connect(
        &self,
        session: SessionId,
        peer: TransportHandle,
        request_mtu: u16,
        timeout: Duration,
        local_name: String,
    ) {
        let signals = self.signals.clone();
        let mtu = request_mtu.min(self.max_mtu);
        tokio::spawn(async move {
            let opened = tokio::time::timeout(timeout, open_link(&peer.0, mtu, local_name)).await;
            match opened {
                Ok(Ok((stream, mtu))) => {
                    let connection = ConnectionHandle(peer.0);
                    let (outbound, rx) = mpsc::unbounded_channel();
                    let connected = Signal::Connected {
                        session,
                        connection: connection.clone(),
                        mtu,
                        outbound,
                    };
                    if signals.send(connected).is_ok() {
                        run_link(stream, connection, rx, signals, Role::Central).await;
                    }
                }
                Ok(Err(e)) => {
                    let _ = signals.send(Signal::ConnectFailed {
                        session,
                        reason: e.to_string(),
                    });
                }
                Err(_) => {
                    let _ = signals.send(Signal::ConnectFailed {
                        session,
                        reason: format!("timed out after {:?}", timeout),
                    });
                }
            }
        });
    }

    /// Serve an accepted central: MTU exchange, then the link.
    pub fn serve_central(&self, stream: TcpStream, addr: SocketAddr) -> PeripheralLink {
        let central = ConnectionHandle(addr.to_string());
        let (outbound, rx) = mpsc::unbounded_channel();
        let signals = self.signals.clone();
        let max_mtu = self.max_mtu;
        let handle = central.clone();
        tokio::spawn(async move {
            let mut stream = stream;
            match accept_mtu(&mut stream, max_mtu).await {
                Ok((mtu, local_name)) => {
                    let ready = Signal::CentralReady {
                        central: handle.clone(),
                        mtu,
                        local_name,
                    };
                    if signals.send(ready).is_ok() {
                        run_link(stream, handle, rx, signals, Role::Peripheral).await;
                    }
                }
                Err(e) => {
                    debug!(central = %handle, error = %e, "MTU exchange failed");
                    let _ = signals.send(Signal::LinkClosed { connection: handle });
                }
            }
        });
        PeripheralLink {
            central,
            outbound,
            mtu: None,
            announced: false,
        }
    }

    pub fn schedule_restart(&self, session: SessionId, delay: Duration) {
        let signals = self.signals.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = signals.send(Signal::RestartDue { session });
        });
    }
}

async fn scan_loop(socket: Arc<UdpSocket>, signals: mpsc::UnboundedSender<Signal>) {
    let mut buf = vec![0u8; 2048];
    let mut down = false;
    loop {
        let received = socket.recv_from(&mut buf).await;
        if received.is_ok() == down {
            down = !down;
            let state = if down { RadioState::PoweredOff } else { RadioState::PoweredOn };
            if signals.send(Signal::RadioState(state)).is_err() {
                return;
            }
        }
        match received {
            Ok((n, from)) => match decode_frame(&buf[..n]) {
                Ok((frame, _)) => {
                    if signals.send(Signal::Heard { from, frame }).is_err() {
                        return;
                    }
                }
                Err(e) => trace!(%from, error = %e, "ignoring datagram"),
            },
            Err(e) => {
                warn!(error = %e, "scan socket error");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn accept_loop(listener: TcpListener, signals: mpsc::UnboundedSender<Signal>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                if signals.send(Signal::Accepted { stream, addr }).is_err() {
                    return;
                }
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn open_link(addr: &str, mtu: u16, local_name: String) -> Result<(TcpStream, u16), WireError> {
    let mut stream = TcpStream::connect(addr).await?;
    write_frame(&mut stream, &RadioFrame::ExchangeMtu { mtu, local_name }).await?;
    match read_frame(&mut stream).await? {
        Some(RadioFrame::MtuAccepted { mtu: agreed }) => Ok((stream, agreed.min(mtu))),
        Some(_) => Err(WireError::Unexpected("MtuAccepted")),
        None => Err(WireError::Closed),
    }
}

async fn accept_mtu(stream: &mut TcpStream, max_mtu: u16) -> Result<(u16, String), WireError> {
    match read_frame(stream).await? {
        Some(RadioFrame::ExchangeMtu { mtu, local_name }) => {
            let agreed = mtu.min(max_mtu);
            write_frame(stream, &RadioFrame::MtuAccepted { mtu: agreed }).await?;
            Ok((agreed, local_name))
        }
        Some(_) => Err(WireError::Unexpected("ExchangeMtu")),
        None => Err(WireError::Closed),
    }
}

/// Pump one established link until either side closes it. Local close = drop the outbound sender.
async fn run_link(
    stream: TcpStream,
    connection: ConnectionHandle,
    mut outbound: mpsc::UnboundedReceiver<RadioFrame>,
    signals: mpsc::UnboundedSender<Signal>,
    role: Role,
) {
    let (mut reader, mut writer) = stream.into_split();
    let writer_task = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            if let Err(e) = write_frame(&mut writer, &frame).await {
                debug!(error = %e, "link write failed");
                break;
            }
        }
    });
    loop {
        match read_frame(&mut reader).await {
            Ok(Some(frame)) => {
                if let Some(signal) = inbound_signal(role, &connection, frame) {
                    if signals.send(signal).is_err() {
                        break;
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!(%connection, error = %e, "link read failed");
                break;
            }
        }
    }
    writer_task.abort();
    let _ = signals.send(Signal::LinkClosed { connection });
}

fn inbound_signal(role: Role, connection: &ConnectionHandle, frame: RadioFrame) -> Option<Signal> {
    match (role, frame) {
        (Role::Peripheral, RadioFrame::Write { characteristic, value })
            if characteristic == MESSAGE_CHAR_UUID =>
        {
            Some(Signal::Written {
                central: connection.clone(),
                value,
            })
        }
        (Role::Central, RadioFrame::Notify { characteristic, data })
            if characteristic == MESSAGE_CHAR_UUID =>
        {
            Some(Signal::Notified {
                connection: connection.clone(),
                data,
            })
        }
        (_, other) => {
            trace!(%connection, ?other, "ignoring frame");
            None
        }
    }
}
