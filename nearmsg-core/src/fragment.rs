//! Fragmentation: split outbound text into MTU-sized fragments, reassemble inbound ones.
//!
//! Wire form of one fragment: `[flag][message id hi][message id lo][payload...]`.
//! Message ids are not namespaced per peer; only one peer is connected at a time.

use std::collections::HashMap;

use crate::protocol::{FLAG_LAST_FRAGMENT, FLAG_MORE_FRAGMENTS, HEADER_SIZE, MAX_MESSAGE_SIZE};

/// Whether more fragments of the same message follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flag {
    More,
    Last,
}

impl Flag {
    pub fn to_byte(self) -> u8 {
        match self {
            Flag::More => FLAG_MORE_FRAGMENTS,
            Flag::Last => FLAG_LAST_FRAGMENT,
        }
    }

    /// Only the LAST flag terminates a message; any other byte means more follow.
    pub fn from_byte(b: u8) -> Self {
        if b == FLAG_LAST_FRAGMENT {
            Flag::Last
        } else {
            Flag::More
        }
    }
}

/// One wire unit: header plus a slice of the message bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub flag: Flag,
    pub message_id: u16,
    pub payload: Vec<u8>,
}

impl Fragment {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        out.push(self.flag.to_byte());
        out.extend_from_slice(&self.message_id.to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, FragmentError> {
        if bytes.len() < HEADER_SIZE {
            return Err(FragmentError::TooShort(bytes.len()));
        }
        Ok(Fragment {
            flag: Flag::from_byte(bytes[0]),
            message_id: u16::from_be_bytes([bytes[1], bytes[2]]),
            payload: bytes[HEADER_SIZE..].to_vec(),
        })
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FragmentError {
    #[error("fragment of {0} bytes is shorter than the {} byte header", HEADER_SIZE)]
    TooShort(usize),
}

/// Payload bytes per fragment for a given MTU. Never zero.
pub fn chunk_size(mtu: u16) -> usize {
    (mtu as usize).saturating_sub(HEADER_SIZE).max(1)
}

/// Cut `text` to at most `limit` UTF-8 bytes without splitting a character.
pub fn truncate_utf8(text: &str, limit: usize) -> &str {
    if text.len() <= limit {
        return text;
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Outbound side. Owns the message id counter; one per engine.
#[derive(Debug, Clone)]
pub struct Fragmenter {
    next_message_id: u16,
    max_message_size: usize,
}

impl Fragmenter {
    pub fn new() -> Self {
        Self::with_max_message_size(MAX_MESSAGE_SIZE)
    }

    pub fn with_max_message_size(max_message_size: usize) -> Self {
        Self {
            next_message_id: 0,
            max_message_size,
        }
    }

    /// Id the next `encode` call will use.
    pub fn peek_message_id(&self) -> u16 {
        self.next_message_id
    }

    fn allocate_message_id(&mut self) -> u16 {
        let id = self.next_message_id;
        self.next_message_id = self.next_message_id.wrapping_add(1);
        id
    }

    /// Split `text` into serialized fragments for the given MTU. Always at least one fragment.
    pub fn encode(&mut self, text: &str, mtu: u16) -> Vec<Vec<u8>> {
        let payload = truncate_utf8(text, self.max_message_size).as_bytes();
        let size = chunk_size(mtu);
        let message_id = self.allocate_message_id();

        if payload.len() <= size {
            return vec![Fragment {
                flag: Flag::Last,
                message_id,
                payload: payload.to_vec(),
            }
            .to_bytes()];
        }

        let count = payload.chunks(size).len();
        payload
            .chunks(size)
            .enumerate()
            .map(|(i, piece)| {
                let flag = if i + 1 == count { Flag::Last } else { Flag::More };
                Fragment {
                    flag,
                    message_id,
                    payload: piece.to_vec(),
                }
                .to_bytes()
            })
            .collect()
    }
}

impl Default for Fragmenter {
    fn default() -> Self {
        Self::new()
    }
}

/// Inbound side: message id -> chunks received so far, in arrival order.
#[derive(Debug, Default)]
pub struct Reassembler {
    pending: HashMap<u16, Vec<Vec<u8>>>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of messages with fragments buffered.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, message_id: u16) -> bool {
        self.pending.contains_key(&message_id)
    }

    /// Consume one raw fragment. Returns the complete text when this was the last fragment.
    /// Malformed input is dropped without touching buffered state.
    pub fn feed(&mut self, raw: &[u8]) -> Option<String> {
        let fragment = match Fragment::parse(raw) {
            Ok(f) => f,
            Err(e) => {
                tracing::trace!(error = %e, "dropping malformed fragment");
                return None;
            }
        };

        if fragment.flag == Flag::Last && !self.pending.contains_key(&fragment.message_id) {
            return Some(decode_text(&fragment.payload));
        }

        let parts = self.pending.entry(fragment.message_id).or_default();
        parts.push(fragment.payload);

        if fragment.flag == Flag::More {
            return None;
        }
        let parts = self.pending.remove(&fragment.message_id)?;
        Some(decode_text(&parts.concat()))
    }
}

/// Invalid UTF-8 sequences decode to U+FFFD rather than failing the whole message.
fn decode_text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_single_last_fragment() {
        let mut f = Fragmenter::new();
        let frags = f.encode("hi", 20);
        assert_eq!(frags, vec![vec![0x00, 0x00, 0x00, b'h', b'i']]);
    }

    #[test]
    fn exact_chunk_fits_in_one() {
        let mut f = Fragmenter::new();
        let text = "a".repeat(17);
        let frags = f.encode(&text, 20);
        assert_eq!(frags.len(), 1);
        assert_eq!(frags[0][0], FLAG_LAST_FRAGMENT);
        assert_eq!(frags[0].len(), 20);
    }

    #[test]
    fn long_text_splits_more_then_last() {
        let mut f = Fragmenter::new();
        let text = "abcdefghijklmnopqrstuvwxyz0123456789";
        let frags = f.encode(text, 20);
        assert_eq!(frags.len(), 3);
        assert_eq!(frags[0][0], FLAG_MORE_FRAGMENTS);
        assert_eq!(frags[1][0], FLAG_MORE_FRAGMENTS);
        assert_eq!(frags[2][0], FLAG_LAST_FRAGMENT);
        assert_eq!(frags[0].len(), 20);
        assert_eq!(frags[2].len(), HEADER_SIZE + 2);
        assert!(frags.iter().all(|fr| fr[1] == 0 && fr[2] == 0));
    }

    #[test]
    fn message_ids_increment_and_wrap() {
        let mut f = Fragmenter::new();
        f.encode("a", 20);
        let second = f.encode("b", 20);
        assert_eq!(&second[0][1..3], &[0x00, 0x01]);

        f.next_message_id = u16::MAX;
        let last = f.encode("c", 20);
        assert_eq!(&last[0][1..3], &[0xff, 0xff]);
        assert_eq!(f.peek_message_id(), 0);
    }

    #[test]
    fn tiny_mtu_still_makes_progress() {
        let mut f = Fragmenter::new();
        let frags = f.encode("abc", 2);
        assert_eq!(frags.len(), 3);
        assert!(frags.iter().all(|fr| fr.len() == HEADER_SIZE + 1));
    }

    #[test]
    fn truncates_on_char_boundary() {
        let text = "é".repeat(300);
        let cut = truncate_utf8(&text, MAX_MESSAGE_SIZE);
        assert_eq!(cut.len(), 512);
        let odd = format!("x{}", "é".repeat(300));
        assert_eq!(truncate_utf8(&odd, MAX_MESSAGE_SIZE).len(), 511);
    }

    #[test]
    fn encode_caps_payload_at_max_message_size() {
        let mut f = Fragmenter::new();
        let text = "z".repeat(2000);
        let frags = f.encode(&text, 512);
        let total: usize = frags.iter().map(|fr| fr.len() - HEADER_SIZE).sum();
        assert_eq!(total, MAX_MESSAGE_SIZE);
    }

    #[test]
    fn reassembles_in_order_on_last_only() {
        let mut f = Fragmenter::new();
        let text = "The quick brown fox jumps over the lazy dog, twice over.";
        let frags = f.encode(text, 20);
        assert!(frags.len() > 1);

        let mut r = Reassembler::new();
        for fr in &frags[..frags.len() - 1] {
            assert_eq!(r.feed(fr), None);
        }
        assert_eq!(r.pending(), 1);
        assert_eq!(r.feed(&frags[frags.len() - 1]).as_deref(), Some(text));
        assert_eq!(r.pending(), 0);
    }

    #[test]
    fn multibyte_split_across_fragments() {
        let mut f = Fragmenter::new();
        let text = "héllo wörld ✓ ünïcode ✓✓✓";
        let frags = f.encode(text, 8);
        let mut r = Reassembler::new();
        let out: Vec<String> = frags.iter().filter_map(|fr| r.feed(fr)).collect();
        assert_eq!(out, vec![text.to_string()]);
    }

    #[test]
    fn unfragmented_fast_path_leaves_table_empty() {
        let mut r = Reassembler::new();
        assert_eq!(r.feed(&[0x00, 0x12, 0x34, b'o', b'k']).as_deref(), Some("ok"));
        assert_eq!(r.pending(), 0);
    }

    #[test]
    fn short_fragment_is_dropped() {
        let mut r = Reassembler::new();
        assert_eq!(r.feed(&[0x01, 0x00, 0x07, b'a']), None);
        assert_eq!(r.feed(&[0x00, 0x00]), None);
        assert_eq!(r.feed(&[]), None);
        assert_eq!(r.pending(), 1);
        assert!(r.is_pending(7));
        assert_eq!(r.feed(&[0x00, 0x00, 0x07, b'b']).as_deref(), Some("ab"));
    }

    #[test]
    fn interleaved_messages_by_id() {
        let mut r = Reassembler::new();
        assert_eq!(r.feed(&[0x01, 0x00, 0x01, b'a']), None);
        assert_eq!(r.feed(&[0x01, 0x00, 0x02, b'x']), None);
        assert_eq!(r.feed(&[0x00, 0x00, 0x02, b'y']).as_deref(), Some("xy"));
        assert_eq!(r.feed(&[0x00, 0x00, 0x01, b'b']).as_deref(), Some("ab"));
    }

    #[test]
    fn parse_rejects_short_header() {
        assert_eq!(Fragment::parse(&[0x00, 0x01]), Err(FragmentError::TooShort(2)));
        let f = Fragment::parse(&[0x01, 0xab, 0xcd]).unwrap();
        assert_eq!(f.flag, Flag::More);
        assert_eq!(f.message_id, 0xabcd);
        assert!(f.payload.is_empty());
    }

    #[test]
    fn unknown_flag_keeps_message_open() {
        let mut r = Reassembler::new();
        assert_eq!(r.feed(&[0x02, 0x00, 0x01, b'a']), None);
        assert!(r.is_pending(1));
        assert_eq!(r.pending(), 1);
        assert_eq!(r.feed(&[0x00, 0x00, 0x01, b'b']).as_deref(), Some("ab"));
        assert_eq!(Fragment::parse(&[0xff, 0x00, 0x00]).unwrap().flag, Flag::More);
    }
}
