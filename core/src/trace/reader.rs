//! Trace file reader

use byteorder::{LittleEndian, ReadBytesExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use super::{
    Decompressor, PACKET_HEADER_SIZE, Packet, PacketHeader, TraceError, TraceHeader, packet_id,
};

/// JSON document stored in the metadata packet
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TraceMetadata {
    #[serde(rename = "ReplayOptions", default)]
    pub replay_options: BTreeMap<String, serde_json::Value>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl TraceMetadata {
    /// Replay options as strings, in the form the command line would give them
    pub fn option_strings(&self) -> BTreeMap<String, String> {
        self.replay_options
            .iter()
            .map(|(name, value)| {
                let value = match value {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (name.clone(), value)
            })
            .collect()
    }
}

/// Packets listed in the trailing portability table
#[derive(Debug, Clone, Default)]
pub struct PortabilityTable {
    pub offsets: Vec<u64>,
    pub packets: Vec<Packet>,
}

/// Random-access reader over a trace file.
///
/// The header is decoded on construction; packets are read on demand by
/// offset.
pub struct TraceReader<R> {
    inner: R,
    header: TraceHeader,
    len: u64,
    decompressor: Option<Decompressor>,
}

impl TraceReader<BufReader<File>> {
    /// Open a trace file from disk
    pub fn open(path: &Path) -> Result<Self, TraceError> {
        if path.extension().is_some_and(|ext| ext == "gfxr") {
            return Err(TraceError::ForeignCapture(path.display().to_string()));
        }
        let file = File::open(path)?;
        Self::new(BufReader::new(file))
    }
}

impl<R: Read + Seek> TraceReader<R> {
    pub fn new(mut inner: R) -> Result<Self, TraceError> {
        let len = inner.seek(SeekFrom::End(0))?;
        inner.seek(SeekFrom::Start(0))?;
        let header = TraceHeader::read_from(&mut inner)?;
        let decompressor = Decompressor::for_type(header.compress_type).ok().flatten();
        Ok(Self {
            inner,
            header,
            len,
            decompressor,
        })
    }

    pub fn header(&self) -> &TraceHeader {
        &self.header
    }

    /// File length in bytes
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Validate the header and the presence of a decompressor
    pub fn validate(&self) -> Result<(), TraceError> {
        self.header.validate()?;
        Decompressor::for_type(self.header.compress_type)?;
        Ok(())
    }

    /// Offset of the first packet after the header
    pub fn first_packet_offset(&self) -> u64 {
        if self.header.first_packet_offset > 0 {
            self.header.first_packet_offset
        } else {
            self.header.encoded_len()
        }
    }

    /// Read the packet at `offset`, returning it and the offset that follows.
    ///
    /// Compressed bodies are decompressed before the packet is returned.
    pub fn read_packet_at(&mut self, offset: u64) -> Result<(Packet, u64), TraceError> {
        self.inner.seek(SeekFrom::Start(offset))?;
        let header = PacketHeader::read_from(&mut self.inner)?;
        if header.size < PACKET_HEADER_SIZE {
            return Err(TraceError::TruncatedPacket {
                offset,
                size: header.size,
            });
        }
        let next = offset
            .checked_add(header.size)
            .filter(|next| *next <= self.len)
            .ok_or(TraceError::PacketOutOfBounds { offset })?;

        let mut body = vec![0u8; (header.size - PACKET_HEADER_SIZE) as usize];
        self.inner.read_exact(&mut body)?;

        let mut packet = Packet::new(header, body);
        if let Some(decompressor) = &self.decompressor {
            decompressor.decompress(&mut packet)?;
        }
        Ok((packet, next))
    }

    /// Read the metadata packet if the header points at one
    pub fn read_metadata(&mut self) -> Result<Option<TraceMetadata>, TraceError> {
        if !self.header.has_metadata() {
            return Ok(None);
        }
        let (packet, _) = self.read_packet_at(self.header.meta_data_offset)?;
        if packet.header.packet_id != packet_id::META_DATA {
            tracing::warn!(
                "Packet at metadata offset {} has id {}, ignoring metadata",
                self.header.meta_data_offset,
                packet.header.packet_id
            );
            return Ok(None);
        }
        let metadata = serde_json::from_slice(&packet.body)?;
        Ok(Some(metadata))
    }

    /// Read the trailing portability table and the packets it lists
    pub fn read_portability_table(&mut self) -> Result<Option<PortabilityTable>, TraceError> {
        if !self.header.portability_table_valid {
            return Ok(None);
        }
        let data_start = self.first_packet_offset();
        if self.len < data_start + 8 {
            return Err(TraceError::BadPortabilityTable(
                "file too short for a table".into(),
            ));
        }

        self.inner.seek(SeekFrom::Start(self.len - 8))?;
        let count = self.inner.read_u64::<LittleEndian>()?;
        let table_len = count
            .checked_add(1)
            .and_then(|n| n.checked_mul(8))
            .filter(|table_len| *table_len <= self.len - data_start)
            .ok_or_else(|| {
                TraceError::BadPortabilityTable(format!("{count} entries do not fit the file"))
            })?;

        self.inner.seek(SeekFrom::Start(self.len - table_len))?;
        let mut offsets = Vec::with_capacity(count as usize);
        for _ in 0..count {
            offsets.push(self.inner.read_u64::<LittleEndian>()?);
        }

        let mut packets = Vec::with_capacity(offsets.len());
        for &offset in &offsets {
            let (packet, _) = self.read_packet_at(offset)?;
            packets.push(packet);
        }
        Ok(Some(PortabilityTable { offsets, packets }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::{CompressType, MessagePacket, TraceWriter, TracerId};
    use std::io::Cursor;

    fn api(id: u16, body: &[u8]) -> (TracerId, u16, Vec<u8>) {
        (TracerId::VULKAN, id, body.to_vec())
    }

    #[test]
    fn test_reads_packets_in_order() {
        let mut writer = TraceWriter::new(CompressType::None);
        writer.packet(api(40, b"first"));
        writer.packet(api(41, b"second"));
        let bytes = writer.finish();

        let mut reader = TraceReader::new(Cursor::new(bytes)).unwrap();
        reader.validate().unwrap();
        let start = reader.first_packet_offset();
        let (first, next) = reader.read_packet_at(start).unwrap();
        assert_eq!(first.body, b"first");
        assert_eq!(first.index(), 0);
        let (second, end) = reader.read_packet_at(next).unwrap();
        assert_eq!(second.body, b"second");
        assert_eq!(second.index(), 1);
        assert_eq!(end, reader.len());
    }

    #[test]
    fn test_compressed_packets_are_inflated() {
        let mut writer = TraceWriter::new(CompressType::Lz4);
        writer.packet(api(40, &b"draw".repeat(32)));
        let bytes = writer.finish();

        let mut reader = TraceReader::new(Cursor::new(bytes)).unwrap();
        let start = reader.first_packet_offset();
        let (packet, _) = reader.read_packet_at(start).unwrap();
        assert_eq!(packet.tracer_id(), TracerId::VULKAN_COMPRESSED);
        assert_eq!(packet.body, b"draw".repeat(32));
    }

    #[test]
    fn test_truncated_file_is_out_of_bounds() {
        let mut writer = TraceWriter::new(CompressType::None);
        writer.packet(api(40, b"0123456789"));
        let mut bytes = writer.finish();
        bytes.truncate(bytes.len() - 4);

        let mut reader = TraceReader::new(Cursor::new(bytes)).unwrap();
        let start = reader.first_packet_offset();
        assert!(matches!(
            reader.read_packet_at(start),
            Err(TraceError::PacketOutOfBounds { .. })
        ));
    }

    #[test]
    fn test_undersized_packet_is_rejected() {
        let mut writer = TraceWriter::new(CompressType::None);
        writer.packet(api(40, b""));
        let mut bytes = writer.finish();
        let start = TraceReader::new(Cursor::new(bytes.clone()))
            .unwrap()
            .first_packet_offset() as usize;
        bytes[start..start + 8].copy_from_slice(&10u64.to_le_bytes());

        let mut reader = TraceReader::new(Cursor::new(bytes)).unwrap();
        assert!(matches!(
            reader.read_packet_at(start as u64),
            Err(TraceError::TruncatedPacket { size: 10, .. })
        ));
    }

    #[test]
    fn test_metadata_options() {
        let mut writer = TraceWriter::new(CompressType::None);
        writer.packet(api(40, b""));
        writer.metadata(&serde_json::json!({
            "ReplayOptions": { "l": "3", "pmp": 60 },
            "deviceFeatures": {}
        }));
        let bytes = writer.finish();

        let mut reader = TraceReader::new(Cursor::new(bytes)).unwrap();
        let metadata = reader.read_metadata().unwrap().unwrap();
        let options = metadata.option_strings();
        assert_eq!(options.get("l").map(String::as_str), Some("3"));
        assert_eq!(options.get("pmp").map(String::as_str), Some("60"));
        assert!(metadata.extra.contains_key("deviceFeatures"));
    }

    #[test]
    fn test_no_metadata_without_offset() {
        let mut writer = TraceWriter::new(CompressType::None);
        writer.packet(api(40, b""));
        let mut reader = TraceReader::new(Cursor::new(writer.finish())).unwrap();
        assert!(reader.read_metadata().unwrap().is_none());
    }

    #[test]
    fn test_portability_table() {
        let mut writer = TraceWriter::new(CompressType::None);
        writer.packet(api(40, b"a"));
        let listed = writer.packet(api(41, b"b"));
        writer.packet((
            TracerId::VULKAN,
            crate::trace::packet_id::MESSAGE,
            MessagePacket {
                level: 2,
                text: "hi".into(),
            }
            .encode(),
        ));
        writer.portability_table(&[listed]);
        let bytes = writer.finish();

        let mut reader = TraceReader::new(Cursor::new(bytes)).unwrap();
        let table = reader.read_portability_table().unwrap().unwrap();
        assert_eq!(table.offsets, vec![listed]);
        assert_eq!(table.packets.len(), 1);
        assert_eq!(table.packets[0].body, b"b");
    }

    #[test]
    fn test_portability_table_count_overflow() {
        let mut writer = TraceWriter::new(CompressType::None);
        writer.packet(api(40, b"a"));
        writer.portability_table(&[]);
        let mut bytes = writer.finish();
        let len = bytes.len();
        bytes[len - 8..].copy_from_slice(&u64::MAX.to_le_bytes());

        let mut reader = TraceReader::new(Cursor::new(bytes)).unwrap();
        assert!(matches!(
            reader.read_portability_table(),
            Err(TraceError::BadPortabilityTable(_))
        ));
    }

    #[test]
    fn test_open_rejects_gfxr() {
        let result = TraceReader::open(Path::new("capture.gfxr"));
        assert!(matches!(result, Err(TraceError::ForeignCapture(_))));
    }
}
