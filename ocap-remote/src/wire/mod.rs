//! Wire format for frame serialization.
//!
//! Frame format: `[length:4][checksum:4][json:N]`
//!
//! - **length**: Total frame size including header (little-endian u32)
//! - **checksum**: CRC32C of the JSON body
//! - **json**: a serialized [`Envelope`]
//!
//! A checksum or length error means the stream can no longer be trusted; the
//! connection that produced it is torn down.

mod envelope;

pub use envelope::{Deliver, Envelope, Hello, MessageBody, Reply};

/// Header size: 4 (length) + 4 (checksum) = 8 bytes.
pub const HEADER_SIZE: usize = 8;

/// Maximum body size (1MB).
///
/// Frames announcing a larger body are rejected before it is buffered.
pub const MAX_PAYLOAD_SIZE: usize = 1024 * 1024;

/// Largest message payload accepted for sending.
///
/// Payloads travel hex-encoded inside the JSON body, which doubles their size,
/// and the envelope needs a little room of its own.
pub const MAX_MESSAGE_SIZE: usize = (MAX_PAYLOAD_SIZE - 4096) / 2;

/// Wire format error types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    /// Checksum verification failed - data was corrupted.
    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// Expected checksum from header.
        expected: u32,
        /// Computed checksum from data.
        actual: u32,
    },

    /// Body exceeds maximum allowed size.
    #[error("frame too large: {size} bytes (max {MAX_PAYLOAD_SIZE})")]
    FrameTooLarge {
        /// Body size in bytes.
        size: usize,
    },

    /// Length field has an invalid value.
    #[error("invalid frame length: {length}")]
    InvalidLength {
        /// The invalid length value from the header.
        length: u32,
    },

    /// The body is not a valid envelope, or params do not match the method.
    #[error("malformed envelope: {message}")]
    Malformed {
        /// Parser error.
        message: String,
    },
}

impl From<serde_json::Error> for WireError {
    fn from(err: serde_json::Error) -> Self {
        WireError::Malformed {
            message: err.to_string(),
        }
    }
}

/// Serialize an envelope into a complete frame.
///
/// # Errors
///
/// Returns `FrameTooLarge` if the JSON body exceeds [`MAX_PAYLOAD_SIZE`].
///
/// # Examples
///
/// ```
/// use ocap_remote::wire::{Envelope, MessageBody, encode_frame, try_decode_frame};
///
/// let envelope = MessageBody::Ack.to_envelope(0, 7).expect("envelope");
/// let frame = encode_frame(&envelope).expect("encode");
///
/// let (decoded, consumed) = try_decode_frame(&frame).expect("decode").expect("complete");
/// assert_eq!(decoded, envelope);
/// assert_eq!(consumed, frame.len());
/// ```
pub fn encode_frame(envelope: &Envelope) -> Result<Vec<u8>, WireError> {
    let body = serde_json::to_vec(envelope)?;
    if body.len() > MAX_PAYLOAD_SIZE {
        return Err(WireError::FrameTooLarge { size: body.len() });
    }

    let total_length = HEADER_SIZE + body.len();
    let mut frame = Vec::with_capacity(total_length);
    frame.extend_from_slice(&(total_length as u32).to_le_bytes());
    frame.extend_from_slice(&crc32c::crc32c(&body).to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Try to decode one frame from a buffer that may hold partial data.
///
/// # Returns
///
/// - `Ok(Some((envelope, consumed)))` if a complete frame was parsed
/// - `Ok(None)` if more data is needed (not an error condition)
/// - `Err` if the data is malformed
pub fn try_decode_frame(data: &[u8]) -> Result<Option<(Envelope, usize)>, WireError> {
    if data.len() < HEADER_SIZE {
        return Ok(None);
    }

    let length = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
    let checksum = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);

    if (length as usize) < HEADER_SIZE {
        return Err(WireError::InvalidLength { length });
    }
    let body_len = length as usize - HEADER_SIZE;
    if body_len > MAX_PAYLOAD_SIZE {
        return Err(WireError::FrameTooLarge { size: body_len });
    }

    let expected_len = length as usize;
    if data.len() < expected_len {
        return Ok(None);
    }

    let body = &data[HEADER_SIZE..expected_len];
    let computed = crc32c::crc32c(body);
    if computed != checksum {
        return Err(WireError::ChecksumMismatch {
            expected: checksum,
            actual: computed,
        });
    }

    let envelope = serde_json::from_slice(body)?;
    Ok(Some((envelope, expected_len)))
}
