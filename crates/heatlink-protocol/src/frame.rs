//! Frame codec for the heat pump serial protocol.
//!
//! Pure byte-level functions: checksums, escape-byte stuffing and
//! de-stuffing, frame validation and request construction. Nothing here
//! touches a transport.
//!
//! # Frame format
//!
//! ```text
//! 0x01 <dir> <checksum> <payload>... 0x10 0x03
//! ```
//!
//! - `0x01`: `HEADERSTART`
//! - `dir`: `GET` (0x00) for reads, `SET` (0x80) for writes
//! - `checksum`: 1 plus the sum of the payload bytes, modulo 256
//! - `payload`: request byte followed by record data
//! - `0x10 0x03`: `ESCAPE END` footer
//!
//! Literal `0x10` bytes between the direction byte and the footer are sent
//! doubled on the wire. [`fix_duplicated_bytes`] undoes that before
//! validation; [`add_duplicated_bytes`] applies it to outgoing frames.

use bytes::{BufMut, BytesMut};
use heatlink_core::FrameError;

/// First byte of every frame.
pub const HEADERSTART: u8 = 0x01;

/// Read-direction marker.
pub const GET: u8 = 0x00;

/// Write-direction marker.
pub const SET: u8 = 0x80;

/// Escape byte. Also the handshake reply and the acknowledge byte.
pub const ESCAPE: u8 = 0x10;

/// Last byte of every frame, preceded by [`ESCAPE`].
pub const END: u8 = 0x03;

/// Handshake initiation byte, and the second half of the data-available
/// marker.
pub const STARTCOMMUNICATION: u8 = 0x02;

/// Request byte of the firmware version query.
pub const VERSION_REQUEST: u8 = 0xFD;

/// The two bytes the device sends when a response is ready.
pub const DATA_AVAILABLE: [u8; 2] = [ESCAPE, STARTCOMMUNICATION];

/// Offset of the checksum byte.
pub const CHECKSUM_INDEX: usize = 2;

/// Offset of the first payload byte (the echoed request byte).
pub const PAYLOAD_START: usize = 3;

/// Smallest well-formed frame: header, direction, checksum and footer.
pub const MIN_FRAME_LEN: usize = 5;

/// Checksum of a payload region: seed 1, add each byte modulo 256.
///
/// ```
/// use heatlink_protocol::frame::checksum;
///
/// assert_eq!(checksum(&[]), 0x01);
/// assert_eq!(checksum(&[0xFD]), 0xFE);
/// assert_eq!(checksum(&[0xFF]), 0x00);
/// ```
pub fn checksum(region: &[u8]) -> u8 {
    region.iter().fold(1u8, |acc, b| acc.wrapping_add(*b))
}

/// Checksum of a whole frame.
///
/// For frames longer than 4 bytes the header, direction and checksum bytes
/// and the two footer bytes are stripped before summing; shorter input is
/// summed as is.
pub fn frame_checksum(frame: &[u8]) -> u8 {
    if frame.len() > 4 {
        checksum(&frame[PAYLOAD_START..frame.len() - 2])
    } else {
        checksum(frame)
    }
}

/// Whether `raw` ends with a footer that is not itself a stuffed `0x10`.
fn has_footer(raw: &[u8]) -> bool {
    raw.len() >= 2 && raw[raw.len() - 2] == ESCAPE && raw[raw.len() - 1] == END
}

/// Collapse every doubled `0x10` back into a single byte.
///
/// Pairs are consumed left to right over everything before the trailing
/// `ESCAPE END`, which is kept as is. Input without doubled escapes is
/// returned unchanged.
///
/// ```
/// use heatlink_protocol::frame::fix_duplicated_bytes;
///
/// let raw = [0x01, 0x00, 0x11, 0x10, 0x10, 0x10, 0x03];
/// assert_eq!(fix_duplicated_bytes(&raw), vec![0x01, 0x00, 0x11, 0x10, 0x10, 0x03]);
/// ```
pub fn fix_duplicated_bytes(raw: &[u8]) -> Vec<u8> {
    let body_end = if has_footer(raw) { raw.len() - 2 } else { raw.len() };
    let (body, footer) = raw.split_at(body_end);

    let mut out = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < body.len() {
        out.push(body[i]);
        if body[i] == ESCAPE && body.get(i + 1) == Some(&ESCAPE) {
            i += 2;
        } else {
            i += 1;
        }
    }
    out.extend_from_slice(footer);
    out
}

/// Double every `0x10` between the direction byte and the footer.
///
/// The header, direction byte and the trailing `ESCAPE END` are left
/// untouched. Frames shorter than 4 bytes have nothing to stuff.
pub fn add_duplicated_bytes(frame: &[u8]) -> Vec<u8> {
    if frame.len() < 4 {
        return frame.to_vec();
    }
    let body_end = frame.len() - 2;
    let mut out = BytesMut::with_capacity(frame.len() + 4);
    out.put_slice(&frame[..CHECKSUM_INDEX]);
    for &b in &frame[CHECKSUM_INDEX..body_end] {
        out.put_u8(b);
        if b == ESCAPE {
            out.put_u8(ESCAPE);
        }
    }
    out.put_slice(&frame[body_end..]);
    out.to_vec()
}

/// Check a de-stuffed frame, reporting why it is unusable.
pub fn validate_frame(frame: &[u8]) -> Result<(), FrameError> {
    if frame.len() < MIN_FRAME_LEN {
        return Err(FrameError::TooShort { len: frame.len() });
    }
    if frame[0] != HEADERSTART {
        return Err(FrameError::BadHeader { found: frame[0] });
    }
    if !has_footer(frame) {
        return Err(FrameError::BadFooter);
    }
    let computed = frame_checksum(frame);
    let found = frame[CHECKSUM_INDEX];
    if found != computed {
        return Err(FrameError::ChecksumMismatch { found, computed });
    }
    Ok(())
}

/// `true` if `frame` has the header, footer and checksum of a valid frame.
///
/// ```
/// use heatlink_protocol::frame::header_check;
///
/// assert!(header_check(&[0x01, 0x00, 0x06, 0x05, 0x10, 0x03]));
/// assert!(!header_check(&[0x01, 0x00, 0x07, 0x05, 0x10, 0x03]));
/// ```
pub fn header_check(frame: &[u8]) -> bool {
    validate_frame(frame).is_ok()
}

/// Whether the raw bytes received so far end with a real `ESCAPE END`.
///
/// A `0x03` preceded by an even run of `0x10` is payload data following a
/// stuffed escape, not the footer.
pub fn is_terminated(raw: &[u8]) -> bool {
    if raw.len() < 4 || raw[raw.len() - 1] != END {
        return false;
    }
    let escapes = raw[..raw.len() - 1]
        .iter()
        .rev()
        .take_while(|&&b| b == ESCAPE)
        .count();
    escapes % 2 == 1
}

fn build_frame(direction: u8, payload: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(payload.len() + MIN_FRAME_LEN);
    buf.put_u8(HEADERSTART);
    buf.put_u8(direction);
    buf.put_u8(checksum(payload));
    buf.put_slice(payload);
    buf.put_u8(ESCAPE);
    buf.put_u8(END);
    add_duplicated_bytes(&buf)
}

/// Build the wire bytes of a read request.
///
/// ```
/// use heatlink_protocol::frame::build_get_request;
///
/// assert_eq!(build_get_request(0xFB), vec![0x01, 0x00, 0xFC, 0xFB, 0x10, 0x03]);
/// ```
pub fn build_get_request(request_byte: u8) -> Vec<u8> {
    build_frame(GET, &[request_byte])
}

/// Build the wire bytes of a write request carrying `data` after the
/// request byte.
pub fn build_set_request(request_byte: u8, data: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(data.len() + 1);
    payload.push(request_byte);
    payload.extend_from_slice(data);
    build_frame(SET, &payload)
}
