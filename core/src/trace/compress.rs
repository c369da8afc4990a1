//! Packet body decompression

use lz4_flex::decompress_size_prepended;

use super::{CompressType, Packet, PACKET_HEADER_SIZE, TraceError};

/// Decompressor selected from the header's compression type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decompressor {
    Lz4,
}

impl Decompressor {
    /// `Ok(None)` for uncompressed traces
    pub fn for_type(kind: CompressType) -> Result<Option<Self>, TraceError> {
        match kind {
            CompressType::None => Ok(None),
            CompressType::Lz4 => Ok(Some(Decompressor::Lz4)),
            CompressType::Unknown(byte) => Err(TraceError::UnsupportedCompression(byte)),
        }
    }

    /// Replace a compressed body with its decompressed bytes.
    ///
    /// Packets from uncompressed tracers pass through untouched. The tracer
    /// id is left alone; the replay loop maps it to the right replayer.
    pub fn decompress(&self, packet: &mut Packet) -> Result<(), TraceError> {
        if !packet.tracer_id().is_compressed() {
            return Ok(());
        }
        let body = match self {
            Decompressor::Lz4 => decompress_size_prepended(&packet.body).map_err(|e| {
                TraceError::Decompress {
                    index: packet.index(),
                    reason: e.to_string(),
                }
            })?,
        };
        packet.header.size = PACKET_HEADER_SIZE + body.len() as u64;
        packet.body = body;
        Ok(())
    }
}
