//! Trace file header

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{self, Read, Write};

use super::TraceError;

/// Magic number at offset 0 of every trace
pub const TRACE_MAGIC: u32 = 0xABAD_D068;
/// Version written by the current tracer
pub const TRACE_FILE_VERSION: u16 = 10;
/// Oldest version this replayer accepts
pub const TRACE_FILE_VERSION_MIN_COMPATIBLE: u16 = 8;

/// Size of the fixed part of the header
pub(crate) const HEADER_FIXED_SIZE: u64 = 48;

bitflags::bitflags! {
    /// Trace feature flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct HeaderFlags: u16 {
        /// Traced application used the acceleration structure API
        const ACCELERATION_STRUCTURE_API = 0b0000_0001;
        /// Frame boundaries are marked with explicit packets instead of presents
        const FRAME_BOUNDARY_MARKERS = 0b0000_0010;
        /// Buffer device addresses were captured
        const BUFFER_DEVICE_ADDRESS = 0b0000_0100;
    }
}

// Manual serde implementation for HeaderFlags
impl Serialize for HeaderFlags {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.bits().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for HeaderFlags {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let bits = u16::deserialize(deserializer)?;
        Ok(HeaderFlags::from_bits_truncate(bits))
    }
}

/// Byte order of the tracing host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Endianness {
    Little,
    Big,
}

impl Endianness {
    /// Byte order of the running process
    pub fn host() -> Self {
        if cfg!(target_endian = "big") {
            Endianness::Big
        } else {
            Endianness::Little
        }
    }

    fn from_byte(byte: u8) -> Self {
        if byte == 0 {
            Endianness::Little
        } else {
            Endianness::Big
        }
    }

    fn to_byte(self) -> u8 {
        match self {
            Endianness::Little => 0,
            Endianness::Big => 1,
        }
    }
}

impl fmt::Display for Endianness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endianness::Little => f.write_str("Little"),
            Endianness::Big => f.write_str("Big"),
        }
    }
}

/// Packet compression declared by the header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompressType {
    None,
    Lz4,
    Unknown(u8),
}

impl CompressType {
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            0 => CompressType::None,
            1 => CompressType::Lz4,
            other => CompressType::Unknown(other),
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            CompressType::None => 0,
            CompressType::Lz4 => 1,
            CompressType::Unknown(other) => other,
        }
    }
}

/// One traced GPU
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuInfo {
    /// Vendor id in the high 32 bits, device id in the low 32 bits
    pub gpu_id: u64,
    pub gpu_drv_vers: u64,
}

impl GpuInfo {
    pub fn vendor_id(&self) -> u32 {
        (self.gpu_id >> 32) as u32
    }

    pub fn device_id(&self) -> u32 {
        self.gpu_id as u32
    }
}

/// Decoded trace header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceHeader {
    pub magic: u32,
    pub trace_file_version: u16,
    pub bit_flags: HeaderFlags,
    pub tracer_version: u32,
    /// Pointer size of the traced process in bytes
    pub ptr_size: u8,
    pub endianness: Endianness,
    pub compress_type: CompressType,
    pub portability_table_valid: bool,
    pub first_packet_offset: u64,
    pub meta_data_offset: u64,
    pub decompress_file_size: u64,
    pub gpu_info: Vec<GpuInfo>,
    pub tracer_ids: Vec<u8>,
}

impl Default for TraceHeader {
    fn default() -> Self {
        Self {
            magic: TRACE_MAGIC,
            trace_file_version: TRACE_FILE_VERSION,
            bit_flags: HeaderFlags::empty(),
            tracer_version: 0,
            ptr_size: std::mem::size_of::<usize>() as u8,
            endianness: Endianness::host(),
            compress_type: CompressType::None,
            portability_table_valid: false,
            first_packet_offset: 0,
            meta_data_offset: 0,
            decompress_file_size: 0,
            gpu_info: Vec::new(),
            tracer_ids: Vec::new(),
        }
    }
}

impl TraceHeader {
    /// Size of the encoded header including the variable tables
    pub fn encoded_len(&self) -> u64 {
        HEADER_FIXED_SIZE + self.gpu_info.len() as u64 * 16 + self.tracer_ids.len() as u64
    }

    pub fn read_from<R: Read>(reader: &mut R) -> io::Result<Self> {
        let magic = reader.read_u32::<LittleEndian>()?;
        let trace_file_version = reader.read_u16::<LittleEndian>()?;
        let bit_flags = HeaderFlags::from_bits_truncate(reader.read_u16::<LittleEndian>()?);
        let tracer_version = reader.read_u32::<LittleEndian>()?;
        let ptr_size = reader.read_u8()?;
        let endianness = Endianness::from_byte(reader.read_u8()?);
        let compress_type = CompressType::from_byte(reader.read_u8()?);
        let portability_table_valid = reader.read_u8()? != 0;
        let first_packet_offset = reader.read_u64::<LittleEndian>()?;
        let meta_data_offset = reader.read_u64::<LittleEndian>()?;
        let decompress_file_size = reader.read_u64::<LittleEndian>()?;
        let n_gpuinfo = reader.read_u32::<LittleEndian>()?;
        let tracer_count = reader.read_u32::<LittleEndian>()?;

        let mut gpu_info = Vec::with_capacity(n_gpuinfo.min(64) as usize);
        for _ in 0..n_gpuinfo {
            gpu_info.push(GpuInfo {
                gpu_id: reader.read_u64::<LittleEndian>()?,
                gpu_drv_vers: reader.read_u64::<LittleEndian>()?,
            });
        }

        if tracer_count > 256 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("tracer count {tracer_count} exceeds 256"),
            ));
        }
        let mut tracer_ids = vec![0u8; tracer_count as usize];
        reader.read_exact(&mut tracer_ids)?;

        Ok(Self {
            magic,
            trace_file_version,
            bit_flags,
            tracer_version,
            ptr_size,
            endianness,
            compress_type,
            portability_table_valid,
            first_packet_offset,
            meta_data_offset,
            decompress_file_size,
            gpu_info,
            tracer_ids,
        })
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_u32::<LittleEndian>(self.magic)?;
        writer.write_u16::<LittleEndian>(self.trace_file_version)?;
        writer.write_u16::<LittleEndian>(self.bit_flags.bits())?;
        writer.write_u32::<LittleEndian>(self.tracer_version)?;
        writer.write_u8(self.ptr_size)?;
        writer.write_u8(self.endianness.to_byte())?;
        writer.write_u8(self.compress_type.to_byte())?;
        writer.write_u8(self.portability_table_valid as u8)?;
        writer.write_u64::<LittleEndian>(self.first_packet_offset)?;
        writer.write_u64::<LittleEndian>(self.meta_data_offset)?;
        writer.write_u64::<LittleEndian>(self.decompress_file_size)?;
        writer.write_u32::<LittleEndian>(self.gpu_info.len() as u32)?;
        writer.write_u32::<LittleEndian>(self.tracer_ids.len() as u32)?;
        for info in &self.gpu_info {
            writer.write_u64::<LittleEndian>(info.gpu_id)?;
            writer.write_u64::<LittleEndian>(info.gpu_drv_vers)?;
        }
        writer.write_all(&self.tracer_ids)?;
        Ok(())
    }

    /// Reject traces this replayer cannot play on this host.
    ///
    /// Checks run in a fixed order so the first problem reported is stable:
    /// version, magic, gpu info, pointer size, endianness, compression.
    pub fn validate(&self) -> Result<(), TraceError> {
        if !(TRACE_FILE_VERSION_MIN_COMPATIBLE..=TRACE_FILE_VERSION)
            .contains(&self.trace_file_version)
        {
            return Err(TraceError::IncompatibleVersion {
                found: self.trace_file_version,
                min: TRACE_FILE_VERSION_MIN_COMPATIBLE,
                current: TRACE_FILE_VERSION,
            });
        }
        if self.magic != TRACE_MAGIC {
            return Err(TraceError::BadMagic(self.magic));
        }
        if self.gpu_info.is_empty() {
            return Err(TraceError::NoGpuInfo);
        }
        let host_ptr = std::mem::size_of::<usize>() as u32 * 8;
        let trace_ptr = self.ptr_size as u32 * 8;
        if trace_ptr != host_ptr {
            return Err(TraceError::PointerSize {
                trace: trace_ptr,
                host: host_ptr,
            });
        }
        if self.endianness != Endianness::host() {
            return Err(TraceError::Endianness {
                trace: self.endianness,
                host: Endianness::host(),
            });
        }
        if let CompressType::Unknown(kind) = self.compress_type {
            return Err(TraceError::UnsupportedCompression(kind));
        }
        Ok(())
    }

    /// Whether the metadata packet offset should be honored
    pub fn has_metadata(&self) -> bool {
        self.trace_file_version >= TRACE_FILE_VERSION && self.meta_data_offset > 0
    }
}

/// Render a packed tracer version as `major.minor.patch`
pub fn tracer_version_string(version: u32) -> String {
    format!(
        "{}.{}.{}",
        version >> 22,
        (version >> 12) & 0x3ff,
        version & 0xfff
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::TracerId;
    use std::io::Cursor;

    fn valid_header() -> TraceHeader {
        TraceHeader {
            gpu_info: vec![GpuInfo {
                gpu_id: 0x1002_0000_0000_73bf,
                gpu_drv_vers: 0x0020_0001,
            }],
            tracer_ids: vec![TracerId::VULKAN.0],
            ..Default::default()
        }
    }

    #[test]
    fn test_header_encoding_matches_layout() {
        let header = valid_header();
        let mut bytes = Vec::new();
        header.write_to(&mut bytes).unwrap();
        assert_eq!(bytes.len() as u64, header.encoded_len());
        assert_eq!(&bytes[0..4], &TRACE_MAGIC.to_le_bytes());

        let decoded = TraceHeader::read_from(&mut Cursor::new(bytes)).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_validate_accepts_host_trace() {
        assert!(valid_header().validate().is_ok());
    }

    #[test]
    fn test_validate_checks_version_before_magic() {
        let header = TraceHeader {
            magic: 0xdead_beef,
            trace_file_version: 3,
            ..valid_header()
        };
        assert!(matches!(
            header.validate(),
            Err(TraceError::IncompatibleVersion { found: 3, .. })
        ));
    }

    #[test]
    fn test_validate_rejects_bad_magic() {
        let header = TraceHeader {
            magic: 0xdead_beef,
            ..valid_header()
        };
        assert!(matches!(header.validate(), Err(TraceError::BadMagic(0xdead_beef))));
    }

    #[test]
    fn test_validate_requires_gpu_info() {
        let header = TraceHeader {
            gpu_info: Vec::new(),
            ..valid_header()
        };
        assert!(matches!(header.validate(), Err(TraceError::NoGpuInfo)));
    }

    #[test]
    fn test_validate_rejects_foreign_pointer_size() {
        let foreign = if std::mem::size_of::<usize>() == 8 { 4 } else { 8 };
        let header = TraceHeader {
            ptr_size: foreign,
            ..valid_header()
        };
        assert!(matches!(header.validate(), Err(TraceError::PointerSize { .. })));
    }

    #[test]
    fn test_validate_rejects_foreign_endianness() {
        let foreign = match Endianness::host() {
            Endianness::Little => Endianness::Big,
            Endianness::Big => Endianness::Little,
        };
        let header = TraceHeader {
            endianness: foreign,
            ..valid_header()
        };
        assert!(matches!(header.validate(), Err(TraceError::Endianness { .. })));
    }

    #[test]
    fn test_validate_rejects_unknown_compression() {
        let header = TraceHeader {
            compress_type: CompressType::Unknown(9),
            ..valid_header()
        };
        assert!(matches!(
            header.validate(),
            Err(TraceError::UnsupportedCompression(9))
        ));
    }

    #[test]
    fn test_gpu_info_split() {
        let info = valid_header().gpu_info[0];
        assert_eq!(info.vendor_id(), 0x1002);
        assert_eq!(info.device_id(), 0x73bf);
    }

    #[test]
    fn test_tracer_version_string() {
        let version = (1 << 22) | (2 << 12) | 3;
        assert_eq!(tracer_version_string(version), "1.2.3");
    }

    #[test]
    fn test_flags_serde_as_bits() {
        let flags = HeaderFlags::ACCELERATION_STRUCTURE_API | HeaderFlags::BUFFER_DEVICE_ADDRESS;
        let json = serde_json::to_string(&flags).unwrap();
        assert_eq!(json, "5");
        let back: HeaderFlags = serde_json::from_str(&json).unwrap();
        assert_eq!(back, flags);
    }
}
