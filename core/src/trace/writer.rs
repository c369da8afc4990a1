//! Trace file writer
//!
//! Builds traces in memory, mainly to produce synthetic traces for tests.

use byteorder::{LittleEndian, WriteBytesExt};
use lz4_flex::compress_prepend_size;

use super::{
    CompressType, GpuInfo, PACKET_HEADER_SIZE, PacketHeader, PacketKind, TraceHeader, TracerId,
    packet_id,
};

/// In-memory trace builder
pub struct TraceWriter {
    header: TraceHeader,
    packets: Vec<u8>,
    next_index: u64,
}

impl TraceWriter {
    /// Create a writer for the host's pointer size and byte order with one GPU
    pub fn new(compress_type: CompressType) -> Self {
        let header = TraceHeader {
            compress_type,
            gpu_info: vec![GpuInfo {
                gpu_id: 0x10de_0000_2484,
                gpu_drv_vers: 0x0214_0000,
            }],
            tracer_ids: vec![TracerId::VULKAN.0],
            ..Default::default()
        };
        Self {
            header,
            packets: Vec::new(),
            next_index: 0,
        }
    }

    /// Header fields that change the header size must be set before the
    /// first packet is appended.
    pub fn header_mut(&mut self) -> &mut TraceHeader {
        &mut self.header
    }

    /// Append a packet and return its file offset.
    ///
    /// API packets from the Vulkan tracer are stored compressed when the
    /// trace declares LZ4 compression.
    pub fn packet(&mut self, (tracer, id, body): (TracerId, u16, Vec<u8>)) -> u64 {
        let (tracer, body) = if self.header.compress_type == CompressType::Lz4
            && tracer == TracerId::VULKAN
            && matches!(PacketKind::of(id), PacketKind::Api | PacketKind::Present)
        {
            (TracerId::VULKAN_COMPRESSED, compress_prepend_size(&body))
        } else {
            (tracer, body)
        };

        let offset = self.offset();
        let header = PacketHeader {
            size: PACKET_HEADER_SIZE + body.len() as u64,
            global_packet_index: self.next_index,
            tracer_id: tracer.0,
            packet_id: id,
            ..Default::default()
        };
        self.next_index += 1;
        // Writes into a Vec cannot fail
        let _ = header.write_to(&mut self.packets);
        self.packets.extend_from_slice(&body);
        offset
    }

    /// Append a metadata packet and point the header at it
    pub fn metadata(&mut self, document: &serde_json::Value) -> u64 {
        let body = serde_json::to_vec(document).unwrap_or_default();
        let offset = self.packet((TracerId::VULKAN, packet_id::META_DATA, body));
        self.header.meta_data_offset = offset;
        offset
    }

    /// Append the portability table listing `offsets`; call last
    pub fn portability_table(&mut self, offsets: &[u64]) -> u64 {
        let mut body = Vec::with_capacity((offsets.len() + 1) * 8);
        for &offset in offsets {
            let _ = body.write_u64::<LittleEndian>(offset);
        }
        let _ = body.write_u64::<LittleEndian>(offsets.len() as u64);
        self.header.portability_table_valid = true;
        self.packet((TracerId::VULKAN, packet_id::PORTABILITY_TABLE, body))
    }

    /// Offset the next packet will be written at
    pub fn offset(&self) -> u64 {
        self.header.encoded_len() + self.packets.len() as u64
    }

    /// Encode the header and return the complete file
    pub fn finish(mut self) -> Vec<u8> {
        self.header.first_packet_offset = self.header.encoded_len();
        self.header.decompress_file_size = self.offset();
        let mut bytes = Vec::with_capacity(self.offset() as usize);
        let _ = self.header.write_to(&mut bytes);
        bytes.extend_from_slice(&self.packets);
        bytes
    }
}
