//! Emulated radio framing: length-prefix (4 bytes LE) + bincode payload.
//! Advertisements travel one frame per UDP datagram; link traffic is a TCP frame stream.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

const LEN_SIZE: usize = 4;
const MAX_FRAME_LEN: u32 = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RadioFrame {
    /// Periodic broadcast while advertising.
    Advertisement {
        version: u8,
        radio_id: Uuid,
        service: Uuid,
        local_name: String,
        gatt_port: u16,
    },
    /// First frame on a new link, central -> peripheral.
    ExchangeMtu { mtu: u16, local_name: String },
    /// Peripheral's answer with the agreed MTU.
    MtuAccepted { mtu: u16 },
    /// Central writes a characteristic value (base64 text).
    Write { characteristic: Uuid, value: String },
    /// Peripheral notifies a characteristic value (raw bytes).
    Notify { characteristic: Uuid, data: Vec<u8> },
}

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("link closed during MTU exchange")]
    Closed,
    #[error("unexpected frame, wanted {0}")]
    Unexpected(&'static str),
}

pub fn encode_frame(frame: &RadioFrame) -> Result<Vec<u8>, WireError> {
    let payload = bincode::serialize(frame)?;
    let len = payload.len() as u32;
    if len > MAX_FRAME_LEN {
        return Err(WireError::TooLarge);
    }
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Decode one frame from the front of `bytes`. Returns the frame and the number of bytes consumed.
pub fn decode_frame(bytes: &[u8]) -> Result<(RadioFrame, usize), WireError> {
    if bytes.len() < LEN_SIZE {
        return Err(WireError::NeedMore);
    }
    let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    if len > MAX_FRAME_LEN as usize {
        return Err(WireError::TooLarge);
    }
    if bytes.len() < LEN_SIZE + len {
        return Err(WireError::NeedMore);
    }
    let frame = bincode::deserialize(&bytes[LEN_SIZE..LEN_SIZE + len])?;
    Ok((frame, LEN_SIZE + len))
}

/// Read the next frame. `Ok(None)` on a clean close at a frame boundary.
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<Option<RadioFrame>, WireError> {
    let mut len_buf = [0u8; LEN_SIZE];
    match r.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_le_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(WireError::TooLarge);
    }
    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload).await?;
    Ok(Some(bincode::deserialize(&payload)?))
}

pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, frame: &RadioFrame) -> Result<(), WireError> {
    let bytes = encode_frame(frame)?;
    w.write_all(&bytes).await?;
    w.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nearmsg_core::protocol::{MESSAGE_CHAR_UUID, PROTOCOL_VERSION, SERVICE_UUID};

    fn advertisement() -> RadioFrame {
        RadioFrame::Advertisement {
            version: PROTOCOL_VERSION,
            radio_id: Uuid::new_v4(),
            service: SERVICE_UUID,
            local_name: "NM-0a0b0c0d".into(),
            gatt_port: 45691,
        }
    }

    #[test]
    fn datagram_roundtrip() {
        let frame = advertisement();
        let bytes = encode_frame(&frame).unwrap();
        let (decoded, n) = decode_frame(&bytes).unwrap();
        assert_eq!(n, bytes.len());
        assert_eq!(decoded, frame);
    }

    #[test]
    fn partial_read_need_more() {
        let bytes = encode_frame(&advertisement()).unwrap();
        assert!(matches!(decode_frame(&bytes[..2]), Err(WireError::NeedMore)));
        assert!(matches!(
            decode_frame(&bytes[..bytes.len() - 1]),
            Err(WireError::NeedMore)
        ));
    }

    #[test]
    fn oversized_length_rejected() {
        let mut bytes = (MAX_FRAME_LEN + 1).to_le_bytes().to_vec();
        bytes.extend_from_slice(&[0; 8]);
        assert!(matches!(decode_frame(&bytes), Err(WireError::TooLarge)));
    }

    #[tokio::test]
    async fn stream_of_frames_then_clean_close() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let frames = vec![
            RadioFrame::ExchangeMtu {
                mtu: 512,
                local_name: "NM-00000001".into(),
            },
            RadioFrame::Write {
                characteristic: MESSAGE_CHAR_UUID,
                value: "AAAAaGk=".into(),
            },
            RadioFrame::Notify {
                characteristic: MESSAGE_CHAR_UUID,
                data: vec![0, 0, 1, b'x'],
            },
        ];
        for f in &frames {
            write_frame(&mut a, f).await.unwrap();
        }
        drop(a);
        for f in &frames {
            assert_eq!(read_frame(&mut b).await.unwrap().as_ref(), Some(f));
        }
        assert!(read_frame(&mut b).await.unwrap().is_none());
    }
}
