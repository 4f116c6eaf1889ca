//! Video chunk header for low-latency UDP delivery.
//!
//! Encrypted frames larger than the path MTU are split into chunks. Each
//! chunk packet payload is:
//!
//! ```text
//! [frame_id:u32 BE][chunk_index:u16 BE][total_chunks:u16 BE][chunk_bytes]
//! ```
//!
//! The header is added after encryption; the receiver concatenates chunks in
//! ascending `chunk_index` and decrypts the result.

pub const CHUNK_HEADER_LEN: usize = 8;

/// Default chunk payload size, chosen to keep chunk packets under a typical
/// 1500-byte path MTU with headroom for UDP/IP headers.
pub const DEFAULT_CHUNK_SIZE: usize = 1200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub frame_id: u32,
    pub chunk_index: u16,
    pub total_chunks: u16,
}

impl ChunkHeader {
    pub fn encode(&self) -> [u8; CHUNK_HEADER_LEN] {
        let mut buf = [0u8; CHUNK_HEADER_LEN];
        buf[0..4].copy_from_slice(&self.frame_id.to_be_bytes());
        buf[4..6].copy_from_slice(&self.chunk_index.to_be_bytes());
        buf[6..8].copy_from_slice(&self.total_chunks.to_be_bytes());
        buf
    }

    /// Split a chunk packet payload into its header and chunk bytes.
    /// `None` when the payload is shorter than the header.
    pub fn decode(data: &[u8]) -> Option<(Self, &[u8])> {
        if data.len() < CHUNK_HEADER_LEN {
            return None;
        }
        let header = Self {
            frame_id: u32::from_be_bytes([data[0], data[1], data[2], data[3]]),
            chunk_index: u16::from_be_bytes([data[4], data[5]]),
            total_chunks: u16::from_be_bytes([data[6], data[7]]),
        };
        Some((header, &data[CHUNK_HEADER_LEN..]))
    }
}

/// Split an encrypted frame into chunk packet payloads of at most
/// `chunk_size` chunk bytes each, `total_chunks = ceil(len / chunk_size)`.
///
/// Returns `None` when the frame is empty or would need more than
/// `u16::MAX` chunks; the sender drops such frames.
pub fn split_frame(frame_id: u32, frame: &[u8], chunk_size: usize) -> Option<Vec<Vec<u8>>> {
    if frame.is_empty() || chunk_size == 0 {
        return None;
    }
    let total = frame.len().div_ceil(chunk_size);
    if total > u16::MAX as usize {
        return None;
    }
    let total_chunks = total as u16;
    let mut chunks = Vec::with_capacity(total);
    for (index, piece) in frame.chunks(chunk_size).enumerate() {
        let header = ChunkHeader {
            frame_id,
            chunk_index: index as u16,
            total_chunks,
        };
        let mut packet = Vec::with_capacity(CHUNK_HEADER_LEN + piece.len());
        packet.extend_from_slice(&header.encode());
        packet.extend_from_slice(piece);
        chunks.push(packet);
    }
    Some(chunks)
}

/// Reassemble chunk packet payloads back into the encrypted frame.
/// `None` if any index is missing, duplicated, or inconsistent.
pub fn reassemble(chunks: &[Vec<u8>]) -> Option<Vec<u8>> {
    let (first, _) = ChunkHeader::decode(chunks.first()?)?;
    let total = first.total_chunks as usize;
    if chunks.len() != total {
        return None;
    }
    let mut parts: Vec<Option<&[u8]>> = vec![None; total];
    for chunk in chunks {
        let (header, bytes) = ChunkHeader::decode(chunk)?;
        if header.frame_id != first.frame_id
            || header.total_chunks != first.total_chunks
            || header.chunk_index as usize >= total
        {
            return None;
        }
        let slot = &mut parts[header.chunk_index as usize];
        if slot.is_some() {
            return None;
        }
        *slot = Some(bytes);
    }
    let mut frame = Vec::new();
    for part in parts {
        frame.extend_from_slice(part?);
    }
    Some(frame)
}
