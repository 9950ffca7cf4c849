//! Data-channel frame format.
//!
//! Every synthetic data-channel message is a fixed 300-byte frame:
//!
//! ```text
//! [0..4]   CRC-32 (IEEE) of the payload, little-endian
//! [4..300] payload (random bytes)
//! ```
//!
//! The checksum lets the consuming side detect corruption introduced
//! anywhere between the producing bot and the SFU fan-out.

/// Total frame length pushed on every producer tick.
pub const DATA_FRAME_LEN: usize = 300;

/// Length of the little-endian CRC-32 prefix.
pub const CHECKSUM_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("frame too short: {0} bytes")]
    TooShort(usize),
    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },
}

/// Stamp the checksum of `frame[4..]` into `frame[0..4]`.
pub fn seal(frame: &mut [u8]) -> Result<(), FrameError> {
    if frame.len() < CHECKSUM_LEN {
        return Err(FrameError::TooShort(frame.len()));
    }

    let checksum = crc32fast::hash(&frame[CHECKSUM_LEN..]);
    frame[..CHECKSUM_LEN].copy_from_slice(&checksum.to_le_bytes());
    Ok(())
}

/// Validate a sealed frame and return its payload.
pub fn verify(frame: &[u8]) -> Result<&[u8], FrameError> {
    if frame.len() < CHECKSUM_LEN {
        return Err(FrameError::TooShort(frame.len()));
    }

    let expected = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]);
    let actual = crc32fast::hash(&frame[CHECKSUM_LEN..]);
    if expected != actual {
        return Err(FrameError::ChecksumMismatch { expected, actual });
    }

    Ok(&frame[CHECKSUM_LEN..])
}
