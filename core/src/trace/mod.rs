//! Trace file format
//!
//! A trace is a fixed header followed by a stream of packets, all
//! little-endian:
//!
//! ```text
//! ┌──────────────────────────────┐
//! │ TraceHeader (48 bytes)       │
//! │ gpu info × n_gpuinfo         │
//! │ tracer id × tracer_count     │
//! ├──────────────────────────────┤  first_packet_offset
//! │ PacketHeader (56 bytes)      │
//! │ body (size - 56 bytes)       │
//! │ ...                          │
//! ├──────────────────────────────┤  meta_data_offset (optional)
//! │ metadata packet (JSON body)  │
//! ├──────────────────────────────┤
//! │ portability table packet     │
//! │   offsets u64 × n, n u64     │  last eight bytes of the file
//! └──────────────────────────────┘
//! ```

mod compress;
mod header;
mod packet;
mod reader;
mod writer;

pub use compress::Decompressor;
pub use header::{
    CompressType, Endianness, GpuInfo, HeaderFlags, TRACE_FILE_VERSION,
    TRACE_FILE_VERSION_MIN_COMPATIBLE, TRACE_MAGIC, TraceHeader, tracer_version_string,
};
pub use packet::{
    MessagePacket, PACKET_HEADER_SIZE, Packet, PacketHeader, PacketKind, TracerId, packet_id,
};
pub use reader::{PortabilityTable, TraceMetadata, TraceReader};
pub use writer::TraceWriter;

use std::io;

/// Errors raised while reading or validating a trace file
#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid magic number {0:#010x}")]
    BadMagic(u32),

    #[error(
        "trace file version {found} is not compatible with this replayer \
         (supported {min}..={current})"
    )]
    IncompatibleVersion { found: u16, min: u16, current: u16 },

    #[error("trace file does not contain any GPU info")]
    NoGpuInfo,

    #[error("trace was recorded with {trace}-bit pointers, host uses {host}-bit")]
    PointerSize { trace: u32, host: u32 },

    #[error("trace was recorded on a {trace} endian host, replayer is {host} endian")]
    Endianness { trace: Endianness, host: Endianness },

    #[error("no decompressor for compression type {0}")]
    UnsupportedCompression(u8),

    #[error("failed to decompress packet {index}: {reason}")]
    Decompress { index: u64, reason: String },

    #[error("packet at offset {offset} declares size {size}, smaller than its header")]
    TruncatedPacket { offset: u64, size: u64 },

    #[error("packet at offset {offset} runs past the end of the trace")]
    PacketOutOfBounds { offset: u64 },

    #[error("malformed message packet: {0}")]
    BadMessage(String),

    #[error("malformed metadata: {0}")]
    BadMetadata(#[from] serde_json::Error),

    #[error("malformed portability table: {0}")]
    BadPortabilityTable(String),

    #[error("{0} is a gfxreconstruct capture, not a tracegrab trace")]
    ForeignCapture(String),
}
