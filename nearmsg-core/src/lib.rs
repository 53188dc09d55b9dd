//! nearmsg protocol core: two nearby devices find each other, agree who connects,
//! and exchange text larger than one radio transmission.
//! Host-driven: no I/O; host passes events and receives actions.

pub mod b64;
pub mod engine;
pub mod ffi;
pub mod fragment;
pub mod identity;
pub mod messenger;
pub mod protocol;

pub use engine::{
    Action, ConnectionHandle, DiscoveryEngine, DiscoveryState, EngineError, Event, Link, Payload,
    PeerRef, RadioState, SessionId, TransportHandle, WatchId, WatchTarget,
};
pub use fragment::{Flag, Fragment, FragmentError, Fragmenter, Reassembler};
pub use identity::{arbitrate, parse_peer_id, Arbitration, LocalIdentity, PeerId, Role};
pub use messenger::Messenger;
pub use protocol::{Config, PROTOCOL_VERSION};
