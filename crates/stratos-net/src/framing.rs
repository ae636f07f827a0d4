//! Typed, length-prefixed framing for sensor TCP streams.
//!
//! Every packet on the wire is a 9-byte header followed by the payload:
//!
//! ```text
//! +-------------------+-----------+--------------------+
//! | length (8 bytes)  | tag (1 B) |   payload          |
//! | u64 little-endian | DataType  |   (length bytes)   |
//! +-------------------+-----------+--------------------+
//! ```
//!
//! The length does **not** include the header. Frames are concatenated with no
//! delimiter, so boundaries only exist by counting bytes. A length of 0 is a
//! valid frame (an empty name or an empty `Other` message).

use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Size of the fixed frame header in bytes.
pub const HEADER_SIZE: usize = 9;

/// Default cap on a single payload: 16 MiB.
pub const DEFAULT_MAX_PAYLOAD_SIZE: u64 = 16 * 1024 * 1024;

/// Payload classification carried in the header's tag byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DataType {
    /// Raw image bytes, usually JPEG.
    Image = 0,
    /// 4-byte float, degrees.
    Temperature = 1,
    /// 4-byte float, relative humidity.
    Humidity = 2,
    /// 4-byte float, barometric pressure.
    Pressure = 3,
    /// UTF-8 client name for the rest of the session.
    Name = 4,
    /// Free-form UTF-8 text for the operator log.
    Other = 5,
}

impl DataType {
    /// The wire tag for this type.
    pub fn tag(self) -> u8 {
        self as u8
    }

    /// Whether the payload is a single `f32` reading.
    pub fn is_reading(self) -> bool {
        matches!(self, Self::Temperature | Self::Humidity | Self::Pressure)
    }
}

impl TryFrom<u8> for DataType {
    type Error = FrameError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            0 => Ok(Self::Image),
            1 => Ok(Self::Temperature),
            2 => Ok(Self::Humidity),
            3 => Ok(Self::Pressure),
            4 => Ok(Self::Name),
            5 => Ok(Self::Other),
            other => Err(FrameError::UnknownType(other)),
        }
    }
}

/// Configuration for the framing layer.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum allowed payload size in bytes. Default: 16 MiB.
    pub max_payload_size: u64,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
        }
    }
}

/// Errors that can occur while decoding or encoding frames.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The header bytes could not be interpreted.
    #[error("could not decode frame header: {0}")]
    HeaderDecode(String),

    /// The tag byte is outside the declared [`DataType`] set.
    #[error("unknown data type tag {0}")]
    UnknownType(u8),

    /// The payload size exceeds the configured maximum.
    #[error("payload size {size} exceeds maximum {max}")]
    PayloadTooLarge {
        /// The size claimed by the header.
        size: u64,
        /// The configured maximum.
        max: u64,
    },

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Decoded 9-byte frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Payload length in bytes.
    pub length: usize,
    /// Raw tag byte. Classified separately so unknown tags can be reported.
    pub tag: u8,
}

impl FrameHeader {
    /// Build a header for a known data type.
    pub fn new(data_type: DataType, length: usize) -> Self {
        Self {
            length,
            tag: data_type.tag(),
        }
    }

    /// Classify the tag byte.
    pub fn data_type(&self) -> Result<DataType, FrameError> {
        DataType::try_from(self.tag)
    }

    /// Reject headers that claim more than `config.max_payload_size` bytes.
    pub fn check_size(&self, config: &FrameConfig) -> Result<(), FrameError> {
        let size = self.length as u64;
        if size > config.max_payload_size {
            return Err(FrameError::PayloadTooLarge {
                size,
                max: config.max_payload_size,
            });
        }
        Ok(())
    }

    /// Serialize to the wire representation.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[..8].copy_from_slice(&(self.length as u64).to_le_bytes());
        out[8] = self.tag;
        out
    }
}

/// A complete, classified frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Payload classification.
    pub data_type: DataType,
    /// Exactly `length` payload bytes.
    pub payload: Vec<u8>,
}

/// Decode the header at the start of `bytes`.
///
/// Only the first [`HEADER_SIZE`] bytes are inspected; anything after them is
/// ignored.
pub fn decode_header(bytes: &[u8]) -> Result<FrameHeader, FrameError> {
    let Some(header) = bytes.get(..HEADER_SIZE) else {
        return Err(FrameError::HeaderDecode(format!(
            "need {HEADER_SIZE} bytes, got {}",
            bytes.len()
        )));
    };

    let mut len_buf = [0u8; 8];
    len_buf.copy_from_slice(&header[..8]);
    let raw_len = u64::from_le_bytes(len_buf);
    let length = usize::try_from(raw_len).map_err(|_| {
        FrameError::HeaderDecode(format!("length {raw_len} does not fit in memory"))
    })?;

    Ok(FrameHeader {
        length,
        tag: header[8],
    })
}

/// Encode a complete frame (header and payload) into a fresh buffer.
pub fn encode_frame(data_type: DataType, payload: &[u8]) -> Vec<u8> {
    let header = FrameHeader::new(data_type, payload.len());
    let mut out = Vec::with_capacity(HEADER_SIZE + payload.len());
    out.extend_from_slice(&header.encode());
    out.extend_from_slice(payload);
    out
}

/// Write a single frame to the stream.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    data_type: DataType,
    payload: &[u8],
    config: &FrameConfig,
) -> Result<(), FrameError> {
    let header = FrameHeader::new(data_type, payload.len());
    header.check_size(config)?;

    writer.write_all(&header.encode()).await?;
    if !payload.is_empty() {
        writer.write_all(payload).await?;
    }
    writer.flush().await?;

    Ok(())
}
