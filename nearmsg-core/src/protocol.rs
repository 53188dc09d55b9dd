//! nearmsg wire protocol: service identifiers, naming, fragment header layout and timing.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Current protocol version. Exposed over the C ABI.
pub const PROTOCOL_VERSION: u8 = 1;

/// GATT service advertised by every nearmsg device; scans are filtered to it.
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x00001337_0000_1000_8000_00805f9b34fb);

/// Characteristic carrying message fragments in both directions.
pub const MESSAGE_CHAR_UUID: Uuid = Uuid::from_u128(0x00001338_0000_1000_8000_00805f9b34fb);

/// Advertised local names start with this prefix; anything else is unrelated radio traffic.
pub const LOCAL_NAME_PREFIX: &str = "NM-";

/// Random identity length in bytes (rendered as 8 hex chars).
pub const DEVICE_ID_LENGTH: usize = 4;

/// Outbound text is truncated to this many UTF-8 bytes.
pub const MAX_MESSAGE_SIZE: usize = 512;

/// MTU assumed until the transport reports a negotiated one.
pub const DEFAULT_MTU: u16 = 20;

/// MTU the central asks for when connecting.
pub const REQUEST_MTU: u16 = 512;

/// Fragment header: 1 byte flag + 2 bytes message id.
pub const HEADER_SIZE: usize = 3;

pub const FLAG_LAST_FRAGMENT: u8 = 0x00;
pub const FLAG_MORE_FRAGMENTS: u8 = 0x01;

/// Delay between a peer disconnect and the automatic return to discovery.
pub const RESTART_DELAY: Duration = Duration::from_secs(1);

/// How long the central waits for a connection to come up.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Engine tunables. Defaults match the protocol constants above.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Fixed delay before rediscovery after a disconnect.
    #[serde(with = "millis")]
    pub restart_delay: Duration,
    /// MTU used for encoding when the transport did not report one.
    pub default_mtu: u16,
    /// MTU requested by the central on connect.
    pub request_mtu: u16,
    #[serde(with = "millis")]
    pub connect_timeout: Duration,
    pub max_message_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            restart_delay: RESTART_DELAY,
            default_mtu: DEFAULT_MTU,
            request_mtu: REQUEST_MTU,
            connect_timeout: CONNECT_TIMEOUT,
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(v: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        (v.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms: u64 = Deserialize::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuids_match_bluetooth_base() {
        assert_eq!(
            SERVICE_UUID.to_string(),
            "00001337-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            MESSAGE_CHAR_UUID.to_string(),
            "00001338-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn default_config_uses_protocol_constants() {
        let c = Config::default();
        assert_eq!(c.default_mtu, 20);
        assert_eq!(c.request_mtu, 512);
        assert_eq!(c.restart_delay, Duration::from_secs(1));
        assert_eq!(c.max_message_size, 512);
    }
}
