//! Device identity and role arbitration: ephemeral ids, advertised names, who connects to whom.

use std::fmt;
use std::str::FromStr;

use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::protocol::{DEVICE_ID_LENGTH, LOCAL_NAME_PREFIX};

/// Ephemeral device id (32 bits). Ordered as an unsigned integer; the order drives arbitration.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct PeerId(u32);

impl PeerId {
    pub const fn from_u32(v: u32) -> Self {
        PeerId(v)
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }

    pub fn to_bytes(&self) -> [u8; DEVICE_ID_LENGTH] {
        self.0.to_be_bytes()
    }

    /// Advertised name for this id: prefix + 8 lowercase hex chars.
    pub fn advertised_name(&self) -> String {
        format!("{}{}", LOCAL_NAME_PREFIX, self)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.to_bytes()))
    }
}

impl FromStr for PeerId {
    type Err = IdentityError;

    /// Parse exactly 8 hex digits.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut buf = [0u8; DEVICE_ID_LENGTH];
        hex::decode_to_slice(s, &mut buf).map_err(|_| IdentityError::BadHex(s.to_string()))?;
        Ok(PeerId(u32::from_be_bytes(buf)))
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("advertised name lacks the NM- prefix")]
    NotProtocolPeer,
    #[error("invalid device id {0:?}")]
    BadHex(String),
}

/// This device's identity for the current engine: id plus the name it advertises.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalIdentity {
    id: PeerId,
    advertised_name: String,
}

impl LocalIdentity {
    /// Fresh random identity. Not cryptographic; only needs to avoid clashing with a handful of neighbours.
    pub fn generate() -> Self {
        Self::generate_with(&mut rand::thread_rng())
    }

    pub fn generate_with<R: RngCore + ?Sized>(rng: &mut R) -> Self {
        let mut bytes = [0u8; DEVICE_ID_LENGTH];
        rng.fill_bytes(&mut bytes);
        Self::from_id(PeerId(u32::from_be_bytes(bytes)))
    }

    pub fn from_id(id: PeerId) -> Self {
        Self {
            id,
            advertised_name: id.advertised_name(),
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn advertised_name(&self) -> &str {
        &self.advertised_name
    }
}

/// Extract the peer id from an advertised name. `Err(NotProtocolPeer)` for foreign devices.
pub fn parse_advertised_name(name: &str) -> Result<PeerId, IdentityError> {
    let hex = name
        .strip_prefix(LOCAL_NAME_PREFIX)
        .ok_or(IdentityError::NotProtocolPeer)?;
    hex.parse()
}

/// Like [`parse_advertised_name`], but callers only care whether this is one of ours.
pub fn parse_peer_id(name: &str) -> Option<PeerId> {
    parse_advertised_name(name).ok()
}

/// Connection role once arbitration has run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Initiates the connection.
    Central,
    /// Keeps advertising and waits to be connected to.
    Peripheral,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Central => f.write_str("central"),
            Role::Peripheral => f.write_str("peripheral"),
        }
    }
}

/// Outcome of comparing two ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arbitration {
    /// Same id on both ends: regenerate and keep discovering.
    Collision,
    Resolved(Role),
}

/// Lower id connects, higher id waits. Both ends compute the mirror result, so exactly one initiates.
pub fn arbitrate(local: PeerId, peer: PeerId) -> Arbitration {
    match local.cmp(&peer) {
        std::cmp::Ordering::Equal => Arbitration::Collision,
        std::cmp::Ordering::Less => Arbitration::Resolved(Role::Central),
        std::cmp::Ordering::Greater => Arbitration::Resolved(Role::Peripheral),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::mock::StepRng;

    #[test]
    fn advertised_name_is_prefix_plus_lowercase_hex() {
        let ident = LocalIdentity::from_id(PeerId::from_u32(0x00ab_cdef));
        assert_eq!(ident.advertised_name(), "NM-00abcdef");
        assert_eq!(ident.id().to_string(), "00abcdef");
    }

    #[test]
    fn generated_name_parses_back() {
        let ident = LocalIdentity::generate();
        let name = ident.advertised_name();
        assert_eq!(name.len(), LOCAL_NAME_PREFIX.len() + 8);
        assert!(name[3..].chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(parse_peer_id(name), Some(ident.id()));
    }

    #[test]
    fn generate_with_uses_rng_bytes() {
        let mut rng = StepRng::new(0x0403_0201, 0);
        let ident = LocalIdentity::generate_with(&mut rng);
        assert_eq!(ident.advertised_name(), "NM-01020304");
    }

    #[test]
    fn foreign_names_are_not_peers() {
        assert_eq!(parse_peer_id("JBL Flip 5"), None);
        assert_eq!(
            parse_advertised_name("nm-00000001"),
            Err(IdentityError::NotProtocolPeer)
        );
        assert!(matches!(
            parse_advertised_name("NM-xyz"),
            Err(IdentityError::BadHex(_))
        ));
        assert_eq!(parse_peer_id("NM-0000000"), None);
        assert_eq!(parse_peer_id("NM-000000001"), None);
    }

    #[test]
    fn lower_id_is_central() {
        let one = PeerId::from_u32(1);
        let two = PeerId::from_u32(2);
        assert_eq!(arbitrate(one, two), Arbitration::Resolved(Role::Central));
        assert_eq!(arbitrate(two, one), Arbitration::Resolved(Role::Peripheral));
    }

    #[test]
    fn ids_compare_unsigned() {
        let low = PeerId::from_u32(0x7fff_ffff);
        let high = PeerId::from_u32(0x8000_0000);
        assert_eq!(arbitrate(low, high), Arbitration::Resolved(Role::Central));
    }

    #[test]
    fn equal_ids_collide() {
        let id = PeerId::from_u32(0xdead_beef);
        assert_eq!(arbitrate(id, id), Arbitration::Collision);
    }
}
