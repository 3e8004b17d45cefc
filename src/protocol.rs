//! On-wire framing and the connect handshake.
//!
//! Every message is one frame: a fixed 16-byte little-endian header followed
//! by `data_size` payload bytes. The header leads with its own size so the
//! format stays forward-extensible; readers skip bytes beyond the 16 they
//! understand, and unknown content types are discarded without dropping the
//! connection.
//!
//! Wire layout (all little-endian):
//!
//! | offset | field       | type |
//! |--------|-------------|------|
//! | 0..2   | header_size | u16  |
//! | 2      | type        | u8   |
//! | 3      | reserved    | u8   |
//! | 4..12  | data_size   | u64  |
//! | 12..16 | padding     | zero |
//!
//! Immediately after TCP establishment each side sends one
//! [`ProtocolHandshake`](ContentType::ProtocolHandshake) frame carrying a
//! [`Handshake`] record; regular payloads follow only after that exchange.

use tokio::io::{AsyncRead, AsyncReadExt};

/// Size of the frame header in its current version.
pub const HEADER_SIZE: usize = 16;

/// Protocol version advertised in the handshake record.
pub const PROTOCOL_VERSION: u8 = 1;

/// Handshake flag bit: the subscriber asks for transient-local replay.
pub const FLAG_TRANSIENT_LOCAL: u8 = 0b0000_0001;

/// Ceiling on `data_size` accepted from the wire. Anything larger is treated
/// as a corrupt header rather than an allocation request. Generous enough
/// for concatenated replay frames.
pub const MAX_DATA_SIZE: u64 = 256 * 1024 * 1024;

/// Frame content discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    /// Opaque user payload.
    RegularPayload,
    /// Handshake record exchanged once per direction on connect.
    ProtocolHandshake,
    /// A type this version does not understand; skipped by readers.
    Unknown(u8),
}

impl ContentType {
    pub fn from_wire(value: u8) -> Self {
        match value {
            0 => ContentType::RegularPayload,
            1 => ContentType::ProtocolHandshake,
            other => ContentType::Unknown(other),
        }
    }

    pub fn to_wire(self) -> u8 {
        match self {
            ContentType::RegularPayload => 0,
            ContentType::ProtocolHandshake => 1,
            ContentType::Unknown(other) => other,
        }
    }
}

/// Errors on the framing layer. All of them are connection-fatal for the
/// session that hit them, except where the read loop explicitly skips.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid frame header: header_size {header_size} below minimum")]
    InvalidHeader { header_size: u16 },

    #[error("Frame of {data_size} bytes exceeds the frame ceiling")]
    Oversized { data_size: u64 },

    #[error("Handshake record too short: {len} bytes")]
    ShortHandshake { len: usize },

    #[error("Expected a handshake frame, got content type {0}")]
    UnexpectedContentType(u8),
}

/// Parsed frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub header_size: u16,
    pub content_type: ContentType,
    pub data_size: u64,
}

impl FrameHeader {
    /// Header for an outgoing frame of the current version.
    pub fn new(content_type: ContentType, data_size: u64) -> Self {
        Self {
            header_size: HEADER_SIZE as u16,
            content_type,
            data_size,
        }
    }

    /// Serialize little-endian into the 16-byte wire form.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[0..2].copy_from_slice(&self.header_size.to_le_bytes());
        bytes[2] = self.content_type.to_wire();
        // byte 3 reserved, bytes 12..16 padding; both stay zero
        bytes[4..12].copy_from_slice(&self.data_size.to_le_bytes());
        bytes
    }

    /// Parse the leading 16 bytes of a frame header.
    ///
    /// A `header_size` larger than 16 is legal (the extra bytes belong to a
    /// newer header revision and are skipped by the reader); smaller than 16
    /// is corrupt.
    pub fn parse(bytes: &[u8; HEADER_SIZE]) -> Result<Self, FrameError> {
        let header_size = u16::from_le_bytes([bytes[0], bytes[1]]);
        if (header_size as usize) < HEADER_SIZE {
            return Err(FrameError::InvalidHeader { header_size });
        }
        let mut data_size_bytes = [0u8; 8];
        data_size_bytes.copy_from_slice(&bytes[4..12]);
        let data_size = u64::from_le_bytes(data_size_bytes);
        if data_size > MAX_DATA_SIZE {
            return Err(FrameError::Oversized { data_size });
        }
        Ok(Self {
            header_size,
            content_type: ContentType::from_wire(bytes[2]),
            data_size,
        })
    }
}

/// Handshake record, carried as the payload of a
/// [`ProtocolHandshake`](ContentType::ProtocolHandshake) frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    pub version: u8,
    pub flags: u8,
}

/// Encoded size of the handshake record.
pub const HANDSHAKE_SIZE: usize = 2;

impl Handshake {
    /// Record for the current protocol version with the given flags.
    pub fn new(flags: u8) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            flags,
        }
    }

    /// Whether the peer asked for transient-local replay.
    pub fn requests_transient_local(&self) -> bool {
        self.flags & FLAG_TRANSIENT_LOCAL != 0
    }

    pub fn encode(&self) -> [u8; HANDSHAKE_SIZE] {
        [self.version, self.flags]
    }

    /// Parse a handshake payload. Trailing bytes beyond the record belong
    /// to a newer protocol revision and are ignored.
    pub fn parse(payload: &[u8]) -> Result<Self, FrameError> {
        if payload.len() < HANDSHAKE_SIZE {
            return Err(FrameError::ShortHandshake {
                len: payload.len(),
            });
        }
        Ok(Self {
            version: payload[0],
            flags: payload[1],
        })
    }

    /// The record as a complete frame, ready to write on connect.
    pub fn encode_frame(&self) -> [u8; HEADER_SIZE + HANDSHAKE_SIZE] {
        let mut frame = [0u8; HEADER_SIZE + HANDSHAKE_SIZE];
        let header = FrameHeader::new(ContentType::ProtocolHandshake, HANDSHAKE_SIZE as u64);
        frame[..HEADER_SIZE].copy_from_slice(&header.encode());
        frame[HEADER_SIZE..].copy_from_slice(&self.encode());
        frame
    }
}

/// Read one frame: header (skipping any forward-compat extension bytes),
/// then exactly `data_size` payload bytes into `payload`, which is reused
/// across calls to amortize allocation.
pub async fn read_frame<R>(reader: &mut R, payload: &mut Vec<u8>) -> Result<FrameHeader, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut header_bytes = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header_bytes).await?;
    let header = FrameHeader::parse(&header_bytes)?;

    // Extension bytes of a newer header revision: consume and discard.
    let mut extra = header.header_size as usize - HEADER_SIZE;
    let mut scratch = [0u8; 64];
    while extra > 0 {
        let chunk = extra.min(scratch.len());
        reader.read_exact(&mut scratch[..chunk]).await?;
        extra -= chunk;
    }

    payload.clear();
    payload.resize(header.data_size as usize, 0);
    reader.read_exact(payload).await?;

    Ok(header)
}

/// Read frames until one carrying a handshake record arrives, skipping
/// unknown content types; a regular payload before the handshake is a
/// protocol error.
pub async fn read_handshake<R>(reader: &mut R, payload: &mut Vec<u8>) -> Result<Handshake, FrameError>
where
    R: AsyncRead + Unpin,
{
    loop {
        let header = read_frame(reader, payload).await?;
        match header.content_type {
            ContentType::ProtocolHandshake => return Handshake::parse(payload),
            ContentType::Unknown(_) => continue,
            ContentType::RegularPayload => {
                return Err(FrameError::UnexpectedContentType(
                    header.content_type.to_wire(),
                ))
            }
        }
    }
}
