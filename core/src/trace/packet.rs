//! Packet headers, ids and the locally handled packet bodies

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fmt;
use std::io::{self, Cursor, Read, Write};

use super::TraceError;

/// Size of the encoded packet header
pub const PACKET_HEADER_SIZE: u64 = 56;

/// Packet ids with a fixed meaning across tracers
pub mod packet_id {
    pub const UNKNOWN: u16 = 0;
    pub const MESSAGE: u16 = 1;
    pub const MARKER_API_BOUNDARY: u16 = 2;
    pub const MARKER_API_GROUP_BEGIN: u16 = 3;
    pub const MARKER_API_GROUP_END: u16 = 4;
    pub const MARKER_TERMINATE_PROCESS: u16 = 5;
    pub const MARKER_FRAME_BOUNDARY: u16 = 6;
    pub const PORTABILITY_TABLE: u16 = 7;

    /// First id of the per-API band
    pub const API_FIRST: u16 = 32;
    pub const API_VERSION: u16 = 32;
    pub const CREATE_INSTANCE: u16 = 33;
    pub const CREATE_DEVICE: u16 = 34;
    pub const CREATE_SWAPCHAIN: u16 = 35;
    pub const QUEUE_PRESENT: u16 = 36;
    pub const FRAME_BOUNDARY: u16 = 37;
    /// One past the last id of the per-API band
    pub const API_END: u16 = 0x1000;

    pub const META_DATA: u16 = 0x1000;
}

/// Tracer that produced a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TracerId(pub u8);

impl TracerId {
    pub const RESERVED: TracerId = TracerId(0);
    pub const GL_FPS: TracerId = TracerId(1);
    pub const VULKAN: TracerId = TracerId(2);
    pub const VULKAN_COMPRESSED: TracerId = TracerId(3);
    /// Ids at or above this are out of range
    pub const MAX: TracerId = TracerId(14);

    pub fn is_valid(self) -> bool {
        self != Self::RESERVED && self < Self::MAX
    }

    /// Tracer whose replayer handles this tracer's packets
    pub fn replayer_id(self) -> TracerId {
        if self == Self::VULKAN_COMPRESSED {
            Self::VULKAN
        } else {
            self
        }
    }

    pub fn is_compressed(self) -> bool {
        self == Self::VULKAN_COMPRESSED
    }
}

impl fmt::Display for TracerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How the replay loop treats a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Message,
    Marker,
    PortabilityTable,
    MetaData,
    /// Present or frame boundary: ends a frame
    Present,
    /// Any other packet in the per-API band
    Api,
    /// Outside every known band
    Invalid,
}

impl PacketKind {
    pub fn of(id: u16) -> Self {
        match id {
            packet_id::MESSAGE => PacketKind::Message,
            packet_id::MARKER_API_BOUNDARY..=packet_id::MARKER_FRAME_BOUNDARY => PacketKind::Marker,
            packet_id::PORTABILITY_TABLE => PacketKind::PortabilityTable,
            packet_id::META_DATA => PacketKind::MetaData,
            packet_id::QUEUE_PRESENT | packet_id::FRAME_BOUNDARY => PacketKind::Present,
            packet_id::API_FIRST..packet_id::API_END => PacketKind::Api,
            _ => PacketKind::Invalid,
        }
    }
}

/// Fixed part of every packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketHeader {
    /// Total packet size, header included
    pub size: u64,
    pub global_packet_index: u64,
    pub tracer_id: u8,
    pub packet_id: u16,
    pub thread_id: u32,
    pub tracer_begin_time: u64,
    pub tracer_end_time: u64,
    pub entrypoint_begin_time: u64,
    pub entrypoint_end_time: u64,
}

impl PacketHeader {
    pub fn read_from<R: Read>(reader: &mut R) -> io::Result<Self> {
        let size = reader.read_u64::<LittleEndian>()?;
        let global_packet_index = reader.read_u64::<LittleEndian>()?;
        let tracer_id = reader.read_u8()?;
        let _reserved = reader.read_u8()?;
        let packet_id = reader.read_u16::<LittleEndian>()?;
        let thread_id = reader.read_u32::<LittleEndian>()?;
        Ok(Self {
            size,
            global_packet_index,
            tracer_id,
            packet_id,
            thread_id,
            tracer_begin_time: reader.read_u64::<LittleEndian>()?,
            tracer_end_time: reader.read_u64::<LittleEndian>()?,
            entrypoint_begin_time: reader.read_u64::<LittleEndian>()?,
            entrypoint_end_time: reader.read_u64::<LittleEndian>()?,
        })
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_u64::<LittleEndian>(self.size)?;
        writer.write_u64::<LittleEndian>(self.global_packet_index)?;
        writer.write_u8(self.tracer_id)?;
        writer.write_u8(0)?;
        writer.write_u16::<LittleEndian>(self.packet_id)?;
        writer.write_u32::<LittleEndian>(self.thread_id)?;
        writer.write_u64::<LittleEndian>(self.tracer_begin_time)?;
        writer.write_u64::<LittleEndian>(self.tracer_end_time)?;
        writer.write_u64::<LittleEndian>(self.entrypoint_begin_time)?;
        writer.write_u64::<LittleEndian>(self.entrypoint_end_time)?;
        Ok(())
    }
}

/// A packet read from the trace.
///
/// `interpreted` is set once the owning replayer has converted the body into
/// its in-memory form, so the replay loop does not interpret it twice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: PacketHeader,
    pub body: Vec<u8>,
    pub interpreted: bool,
}

impl Packet {
    pub fn new(header: PacketHeader, body: Vec<u8>) -> Self {
        Self {
            header,
            body,
            interpreted: false,
        }
    }

    pub fn tracer_id(&self) -> TracerId {
        TracerId(self.header.tracer_id)
    }

    pub fn kind(&self) -> PacketKind {
        PacketKind::of(self.header.packet_id)
    }

    pub fn index(&self) -> u64 {
        self.header.global_packet_index
    }

    /// Creation packets every later packet depends on
    pub fn is_object_creation(&self) -> bool {
        matches!(
            self.header.packet_id,
            packet_id::CREATE_INSTANCE | packet_id::CREATE_DEVICE | packet_id::CREATE_SWAPCHAIN
        )
    }
}

/// Body of a traced debug message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessagePacket {
    pub level: u32,
    pub text: String,
}

impl MessagePacket {
    pub fn decode(body: &[u8]) -> Result<Self, TraceError> {
        let mut cursor = Cursor::new(body);
        let level = cursor
            .read_u32::<LittleEndian>()
            .map_err(|e| TraceError::BadMessage(e.to_string()))?;
        let len = cursor
            .read_u32::<LittleEndian>()
            .map_err(|e| TraceError::BadMessage(e.to_string()))? as usize;
        let rest = &body[8..];
        if rest.len() < len {
            return Err(TraceError::BadMessage(format!(
                "text length {len} exceeds body ({} bytes)",
                rest.len()
            )));
        }
        let text = String::from_utf8_lossy(&rest[..len]).into_owned();
        Ok(Self { level, text })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(8 + self.text.len());
        body.extend_from_slice(&self.level.to_le_bytes());
        body.extend_from_slice(&(self.text.len() as u32).to_le_bytes());
        body.extend_from_slice(self.text.as_bytes());
        body
    }

    pub fn level_name(&self) -> &'static str {
        match self.level {
            0 => "Always",
            1 => "Debug",
            2 => "Info",
            3 => "Warning",
            4 => "Error",
            _ => "Unknown",
        }
    }
}
