//! SMPTE 291 ancillary packets
//!
//! Camera control bytes travel as one type-2 packet: ancillary data flag, DID,
//! SDID, data count, user words and checksum, all as 10-bit words.

/// VANC line the camera listens on.
pub const CAMERA_CONTROL_LINE: u32 = 16;

/// Data identifier for camera control.
pub const DID: u8 = 0x51;
/// Secondary data identifier for camera control.
pub const SDID: u8 = 0x53;

/// Largest payload one packet can carry.
pub const MAX_PAYLOAD: usize = 255;

const ADF: [u16; 3] = [0x000, 0x3FF, 0x3FF];

/// Put an 8-bit value in a 10-bit word: b8 is even parity, b9 its inverse.
fn with_parity(value: u8) -> u16 {
    let b8 = (value.count_ones() & 1) as u16;
    value as u16 | (b8 << 8) | ((b8 ^ 1) << 9)
}

fn checksum(words: &[u16]) -> u16 {
    let sum = words.iter().fold(0u16, |acc, word| acc.wrapping_add(word & 0x1FF)) & 0x1FF;
    let b8 = (sum >> 8) & 1;
    sum | ((b8 ^ 1) << 9)
}

/// Wrap `payload` in a packet. Returns `None` if it is longer than [`MAX_PAYLOAD`].
pub fn encode_packet(payload: &[u8]) -> Option<Vec<u16>> {
    if payload.len() > MAX_PAYLOAD {
        return None;
    }

    let mut words = Vec::with_capacity(ADF.len() + 4 + payload.len());
    words.extend_from_slice(&ADF);
    words.push(with_parity(DID));
    words.push(with_parity(SDID));
    words.push(with_parity(payload.len() as u8));
    words.extend(payload.iter().map(|byte| with_parity(*byte)));

    let sum = checksum(&words[ADF.len()..]);
    words.push(sum);
    Some(words)
}

/// Pull the payload back out of a camera control packet.
///
/// Rejects packets with the wrong identifiers, a short body or a bad checksum.
pub fn decode_packet(words: &[u16]) -> Option<Vec<u8>> {
    let body = words.strip_prefix(&ADF)?;
    let (&did, rest) = body.split_first()?;
    let (&sdid, rest) = rest.split_first()?;
    let (&count, rest) = rest.split_first()?;
    if did & 0xFF != DID as u16 || sdid & 0xFF != SDID as u16 {
        return None;
    }

    let count = (count & 0xFF) as usize;
    if rest.len() < count + 1 {
        return None;
    }
    if checksum(&body[..3 + count]) != rest[count] {
        return None;
    }

    Some(rest[..count].iter().map(|word| (word & 0xFF) as u8).collect())
}
