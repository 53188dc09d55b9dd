//! C ABI for linking nearmsg-core as a static library from Android (NDK) or iOS native modules.
//! Covers the pieces a platform radio module needs: arbitration, fragmentation, base64.

use std::ffi::c_void;
use std::os::raw::c_int;
use std::slice;

use crate::b64;
use crate::fragment::{Fragmenter, Reassembler};
use crate::identity::{arbitrate, parse_peer_id, Arbitration, PeerId, Role};
use crate::protocol::PROTOCOL_VERSION;

/// Returns the current protocol version. Used so the staticlib exports a C symbol and is linkable.
#[no_mangle]
pub extern "C" fn nm_core_version() -> u8 {
    PROTOCOL_VERSION
}

/// Arbitrate two ids. Returns 0 = collision, 1 = local is central, 2 = local is peripheral.
#[no_mangle]
pub extern "C" fn nm_arbitrate(local_id: u32, peer_id: u32) -> c_int {
    match arbitrate(PeerId::from_u32(local_id), PeerId::from_u32(peer_id)) {
        Arbitration::Collision => 0,
        Arbitration::Resolved(Role::Central) => 1,
        Arbitration::Resolved(Role::Peripheral) => 2,
    }
}

/// Parse an advertised name (UTF-8, name_len bytes). Writes the id to out_id. Returns 0, or -1 if not a nearmsg peer.
#[no_mangle]
pub extern "C" fn nm_parse_peer_id(name: *const u8, name_len: usize, out_id: *mut u32) -> c_int {
    if name.is_null() || out_id.is_null() {
        return -1;
    }
    let bytes = unsafe { slice::from_raw_parts(name, name_len) };
    let Ok(name) = std::str::from_utf8(bytes) else {
        return -1;
    };
    match parse_peer_id(name) {
        Some(id) => {
            unsafe {
                *out_id = id.as_u32();
            }
            0
        }
        None => -1,
    }
}

/// Create a fragmenter (owns the message id counter). Returns opaque handle.
#[no_mangle]
pub extern "C" fn nm_fragmenter_create() -> *mut c_void {
    Box::into_raw(Box::new(Fragmenter::new())) as *mut c_void
}

/// Destroy fragmenter. No-op if h is null.
#[no_mangle]
pub extern "C" fn nm_fragmenter_destroy(h: *mut c_void) {
    if h.is_null() {
        return;
    }
    let _ = unsafe { Box::from_raw(h as *mut Fragmenter) };
}

/// Encode UTF-8 text for the given MTU.
/// out_buf: 4 bytes fragment count (LE), then each fragment as (2 bytes len LE, bytes).
/// Returns bytes written, or -1 on error (invalid UTF-8, out_buf too small). A failed call still consumes a message id.
#[no_mangle]
pub extern "C" fn nm_fragmenter_encode(
    h: *mut c_void,
    text: *const u8,
    text_len: usize,
    mtu: u16,
    out_buf: *mut u8,
    out_buf_len: usize,
) -> c_int {
    if h.is_null() || text.is_null() || out_buf.is_null() {
        return -1;
    }
    let fragmenter = unsafe { &mut *(h as *mut Fragmenter) };
    let bytes = unsafe { slice::from_raw_parts(text, text_len) };
    let Ok(text) = std::str::from_utf8(bytes) else {
        return -1;
    };
    let fragments = fragmenter.encode(text, mtu);
    let need = 4 + fragments.iter().map(|f| 2 + f.len()).sum::<usize>();
    if out_buf_len < need {
        return -1;
    }
    let buf = unsafe { slice::from_raw_parts_mut(out_buf, out_buf_len) };
    buf[0..4].copy_from_slice(&(fragments.len() as u32).to_le_bytes());
    let mut off = 4;
    for f in &fragments {
        buf[off..off + 2].copy_from_slice(&(f.len() as u16).to_le_bytes());
        off += 2;
        buf[off..off + f.len()].copy_from_slice(f);
        off += f.len();
    }
    off as c_int
}

/// Create a reassembly table. Returns opaque handle.
#[no_mangle]
pub extern "C" fn nm_reassembler_create() -> *mut c_void {
    Box::into_raw(Box::new(Reassembler::new())) as *mut c_void
}

/// Destroy reassembly table. No-op if h is null.
#[no_mangle]
pub extern "C" fn nm_reassembler_destroy(h: *mut c_void) {
    if h.is_null() {
        return;
    }
    let _ = unsafe { Box::from_raw(h as *mut Reassembler) };
}

/// Feed one raw fragment. Returns 1 when a message completed (UTF-8 text in out_buf, length in
/// out_text_len), 0 when more fragments are needed or the fragment was malformed, -1 on error.
/// If out_buf is too small the completed message is dropped and -1 returned.
#[no_mangle]
pub extern "C" fn nm_reassembler_feed(
    h: *mut c_void,
    bytes: *const u8,
    len: usize,
    out_buf: *mut u8,
    out_buf_len: usize,
    out_text_len: *mut usize,
) -> c_int {
    if h.is_null() || bytes.is_null() || out_buf.is_null() || out_text_len.is_null() {
        return -1;
    }
    let reassembler = unsafe { &mut *(h as *mut Reassembler) };
    let raw = unsafe { slice::from_raw_parts(bytes, len) };
    let Some(text) = reassembler.feed(raw) else {
        return 0;
    };
    if text.len() > out_buf_len {
        return -1;
    }
    unsafe {
        out_buf.copy_from_nonoverlapping(text.as_ptr(), text.len());
        *out_text_len = text.len();
    }
    1
}

/// Base64-encode bytes into out_buf (ASCII, no terminator). Returns bytes written, or -1.
#[no_mangle]
pub extern "C" fn nm_base64_encode(
    bytes: *const u8,
    len: usize,
    out_buf: *mut u8,
    out_buf_len: usize,
) -> c_int {
    if bytes.is_null() || out_buf.is_null() {
        return -1;
    }
    let input = unsafe { slice::from_raw_parts(bytes, len) };
    let text = b64::encode(input);
    if text.len() > out_buf_len {
        return -1;
    }
    unsafe {
        out_buf.copy_from_nonoverlapping(text.as_ptr(), text.len());
    }
    text.len() as c_int
}

/// Decode base64 text into out_buf. Returns bytes written, or -1 on invalid input / small buffer.
#[no_mangle]
pub extern "C" fn nm_base64_decode(
    text: *const u8,
    len: usize,
    out_buf: *mut u8,
    out_buf_len: usize,
) -> c_int {
    if text.is_null() || out_buf.is_null() {
        return -1;
    }
    let input = unsafe { slice::from_raw_parts(text, len) };
    let Ok(text) = std::str::from_utf8(input) else {
        return -1;
    };
    let bytes = match b64::decode(text) {
        Ok(b) => b,
        Err(_) => return -1,
    };
    if bytes.len() > out_buf_len {
        return -1;
    }
    unsafe {
        out_buf.copy_from_nonoverlapping(bytes.as_ptr(), bytes.len());
    }
    bytes.len() as c_int
}
