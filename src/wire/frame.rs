//! Stream framing: `[len: u32 LE][crc32c: u32 LE][payload]`.
//!
//! The checksum covers the payload only. Length is validated against the
//! frame cap before any allocation, so a hostile length prefix cannot balloon
//! memory.

use super::WireError;
use crate::core::Limits;

pub const FRAME_HEADER_LEN: usize = 8;

pub fn encode_frame(payload: &[u8], limits: &Limits) -> Result<Vec<u8>, WireError> {
    if payload.len() > limits.max_frame_bytes {
        return Err(WireError::FrameTooLarge {
            got: payload.len(),
            max: limits.max_frame_bytes,
        });
    }
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&crc32c::crc32c(payload).to_le_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Try to take one frame off the front of `buf`. Returns the payload and the
/// number of bytes consumed, or `None` when the buffer does not yet hold a
/// complete frame.
pub fn decode_frame(buf: &[u8], limits: &Limits) -> Result<Option<(Vec<u8>, usize)>, WireError> {
    if buf.len() < FRAME_HEADER_LEN {
        return Ok(None);
    }
    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&buf[..4]);
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > limits.max_frame_bytes {
        return Err(WireError::FrameTooLarge {
            got: len,
            max: limits.max_frame_bytes,
        });
    }
    let mut crc_bytes = [0u8; 4];
    crc_bytes.copy_from_slice(&buf[4..8]);
    let expected = u32::from_le_bytes(crc_bytes);

    let total = FRAME_HEADER_LEN + len;
    if buf.len() < total {
        return Ok(None);
    }
    let payload = &buf[FRAME_HEADER_LEN..total];
    if crc32c::crc32c(payload) != expected {
        return Err(WireError::ChecksumMismatch);
    }
    Ok(Some((payload.to_vec(), total)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_and_partial_reads() {
        let limits = Limits::default();
        let frame = encode_frame(b"hello", &limits).unwrap();
        assert_eq!(frame.len(), FRAME_HEADER_LEN + 5);

        // Incomplete prefixes yield None without error.
        for cut in 0..frame.len() {
            assert!(decode_frame(&frame[..cut], &limits).unwrap().is_none());
        }

        let (payload, consumed) = decode_frame(&frame, &limits).unwrap().unwrap();
        assert_eq!(payload, b"hello");
        assert_eq!(consumed, frame.len());
    }

    #[test]
    fn two_frames_in_one_buffer() {
        let limits = Limits::default();
        let mut buf = encode_frame(b"one", &limits).unwrap();
        buf.extend(encode_frame(b"two", &limits).unwrap());

        let (first, consumed) = decode_frame(&buf, &limits).unwrap().unwrap();
        assert_eq!(first, b"one");
        let (second, _) = decode_frame(&buf[consumed..], &limits).unwrap().unwrap();
        assert_eq!(second, b"two");
    }

    #[test]
    fn corrupted_payload_detected() {
        let limits = Limits::default();
        let mut frame = encode_frame(b"payload", &limits).unwrap();
        let last = frame.len() - 1;
        frame[last] ^= 0x01;
        assert!(matches!(
            decode_frame(&frame, &limits),
            Err(WireError::ChecksumMismatch)
        ));
    }

    #[test]
    fn hostile_length_rejected_before_allocation() {
        let limits = Limits::default();
        let mut frame = vec![0u8; FRAME_HEADER_LEN];
        frame[..4].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(
            decode_frame(&frame, &limits),
            Err(WireError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn oversize_payload_refused_at_encode() {
        let limits = Limits {
            max_frame_bytes: 8,
            ..Limits::default()
        };
        assert!(matches!(
            encode_frame(&[0u8; 9], &limits),
            Err(WireError::FrameTooLarge { got: 9, max: 8 })
        ));
    }
}
