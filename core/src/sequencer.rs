//! Packet sequencer
//!
//! Hands packets to the replay loop in file order, either straight from the
//! trace or from an in-memory preload buffer, and supports bookmarking a
//! stream position so a loop can be replayed from the same point again.

use std::io::{Read, Seek};

use crate::trace::{Packet, TraceError, TraceReader};

/// Exact stream position captured for a loop restart
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bookmark {
    offset: u64,
}

impl Bookmark {
    pub fn offset(&self) -> u64 {
        self.offset
    }
}

/// Sequencer life cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequencerState {
    /// Nothing read yet
    Idle,
    Streaming,
    /// Positioned at a bookmark, nothing read since
    Bookmarked,
    /// End of stream reached
    Drained,
}

/// Summary of a preload pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PreloadStats {
    pub packets: usize,
    pub bytes: u64,
    /// The rest of the trace fit in the budget
    pub complete: bool,
}

struct PreloadSlot {
    offset: u64,
    next: u64,
    /// Taken on first delivery; a rewind re-reads it from the file
    packet: Option<Packet>,
}

struct Preload {
    start: u64,
    end: u64,
    slots: Vec<PreloadSlot>,
    cursor: usize,
}

impl Preload {
    fn slot_at(&mut self, offset: u64) -> Option<&mut PreloadSlot> {
        if offset < self.start || offset >= self.end {
            return None;
        }
        let index = match self.slots.get(self.cursor) {
            Some(slot) if slot.offset == offset => self.cursor,
            _ => self.slots.binary_search_by_key(&offset, |slot| slot.offset).ok()?,
        };
        self.cursor = index + 1;
        self.slots.get_mut(index)
    }
}

/// Ordered packet source over a trace
pub struct Sequencer<R> {
    reader: TraceReader<R>,
    start: u64,
    position: u64,
    bookmark: Bookmark,
    preload: Option<Preload>,
    state: SequencerState,
}

impl<R: Read + Seek> Sequencer<R> {
    pub fn new(reader: TraceReader<R>) -> Self {
        let start = reader.first_packet_offset();
        Self {
            reader,
            start,
            position: start,
            bookmark: Bookmark { offset: start },
            preload: None,
            state: SequencerState::Idle,
        }
    }

    pub fn reader(&self) -> &TraceReader<R> {
        &self.reader
    }

    /// Random access to the trace; does not move the stream position
    pub fn reader_mut(&mut self) -> &mut TraceReader<R> {
        &mut self.reader
    }

    pub fn state(&self) -> SequencerState {
        self.state
    }

    /// Offset of the next packet to be delivered
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Next packet in file order, `None` at end of stream
    pub fn next_packet(&mut self) -> Result<Option<Packet>, TraceError> {
        if self.position >= self.reader.len() {
            self.state = SequencerState::Drained;
            return Ok(None);
        }

        if let Some(slot) = self
            .preload
            .as_mut()
            .and_then(|preload| preload.slot_at(self.position))
        {
            if let Some(packet) = slot.packet.take() {
                self.position = slot.next;
                self.state = SequencerState::Streaming;
                return Ok(Some(packet));
            }
        }

        let (packet, next) = self.reader.read_packet_at(self.position)?;
        self.position = next;
        self.state = SequencerState::Streaming;
        Ok(Some(packet))
    }

    /// Remember the current position
    pub fn record_bookmark(&mut self) {
        self.bookmark = Bookmark {
            offset: self.position,
        };
        tracing::debug!("Bookmark recorded at offset {}", self.position);
    }

    pub fn bookmark(&self) -> Bookmark {
        self.bookmark
    }

    /// Rewind (or advance) to `bookmark`
    pub fn set_bookmark(&mut self, bookmark: Bookmark) {
        self.position = bookmark.offset.max(self.start);
        self.state = SequencerState::Bookmarked;
    }

    /// Read ahead from the current position into memory.
    ///
    /// Packets are loaded until `memory_percentage` percent of the remaining
    /// trace bytes are buffered; each one goes through `interpret` first.
    /// Returns the stats, or `None` when not a single packet fit.
    pub fn start_preload<F>(
        &mut self,
        memory_percentage: u8,
        mut interpret: F,
    ) -> Result<Option<PreloadStats>, TraceError>
    where
        F: FnMut(Packet) -> Packet,
    {
        let remaining = self.reader.len().saturating_sub(self.position);
        let budget = remaining / 100 * memory_percentage as u64
            + remaining % 100 * memory_percentage as u64 / 100;

        let start = self.position;
        let mut offset = start;
        let mut bytes = 0u64;
        let mut slots = Vec::new();
        while offset < self.reader.len() {
            let (packet, next) = self.reader.read_packet_at(offset)?;
            let size = next - offset;
            if bytes + size > budget {
                break;
            }
            bytes += size;
            slots.push(PreloadSlot {
                offset,
                next,
                packet: Some(interpret(packet)),
            });
            offset = next;
        }

        if slots.is_empty() {
            self.preload = None;
            return Ok(None);
        }

        let stats = PreloadStats {
            packets: slots.len(),
            bytes,
            complete: offset >= self.reader.len(),
        };
        tracing::debug!(
            "Preloaded {} packets ({} bytes) starting at offset {}",
            stats.packets,
            stats.bytes,
            start
        );
        self.preload = Some(Preload {
            start,
            end: offset,
            slots,
            cursor: 0,
        });
        Ok(Some(stats))
    }

    /// Drop the preload buffer
    pub fn stop_preload(&mut self) {
        self.preload = None;
    }

    pub fn is_preloaded(&self) -> bool {
        self.preload.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::{CompressType, TraceWriter, TracerId};
    use std::io::Cursor;

    fn trace(packets: usize, compress: CompressType) -> Vec<u8> {
        let mut writer = TraceWriter::new(compress);
        for i in 0..packets {
            writer.packet((TracerId::VULKAN, 40, vec![i as u8; 16]));
        }
        writer.finish()
    }

    fn sequencer(bytes: Vec<u8>) -> Sequencer<Cursor<Vec<u8>>> {
        Sequencer::new(TraceReader::new(Cursor::new(bytes)).unwrap())
    }

    fn drain(seq: &mut Sequencer<Cursor<Vec<u8>>>) -> Vec<u64> {
        let mut indices = Vec::new();
        while let Some(packet) = seq.next_packet().unwrap() {
            indices.push(packet.index());
        }
        indices
    }

    #[test]
    fn test_delivers_file_order_then_drains() {
        let mut seq = sequencer(trace(4, CompressType::None));
        assert_eq!(seq.state(), SequencerState::Idle);
        assert_eq!(drain(&mut seq), vec![0, 1, 2, 3]);
        assert_eq!(seq.state(), SequencerState::Drained);
        assert!(seq.next_packet().unwrap().is_none());
    }

    #[test]
    fn test_bookmark_replays_same_order_repeatedly() {
        let mut seq = sequencer(trace(6, CompressType::Lz4));
        seq.next_packet().unwrap();
        seq.next_packet().unwrap();
        seq.record_bookmark();
        let first = drain(&mut seq);
        assert_eq!(first, vec![2, 3, 4, 5]);

        for _ in 0..3 {
            let bookmark = seq.bookmark();
            seq.set_bookmark(bookmark);
            assert_eq!(seq.state(), SequencerState::Bookmarked);
            assert_eq!(drain(&mut seq), first);
        }
    }

    #[test]
    fn test_preload_serves_interpreted_packets() {
        let mut seq = sequencer(trace(5, CompressType::None));
        seq.next_packet().unwrap();
        let stats = seq
            .start_preload(100, |mut packet| {
                packet.interpreted = true;
                packet
            })
            .unwrap()
            .unwrap();
        assert_eq!(stats.packets, 4);
        assert!(stats.complete);

        let mut delivered = Vec::new();
        while let Some(packet) = seq.next_packet().unwrap() {
            assert!(packet.interpreted);
            delivered.push(packet.index());
        }
        assert_eq!(delivered, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_preload_respects_budget() {
        let mut seq = sequencer(trace(10, CompressType::None));
        let stats = seq.start_preload(50, |packet| packet).unwrap().unwrap();
        assert_eq!(stats.packets, 5);
        assert!(!stats.complete);
        assert_eq!(drain(&mut seq), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_preload_with_nothing_fitting() {
        let mut seq = sequencer(trace(3, CompressType::None));
        assert!(seq.start_preload(1, |packet| packet).unwrap().is_none());
        assert!(!seq.is_preloaded());
        assert_eq!(drain(&mut seq), vec![0, 1, 2]);
    }

    #[test]
    fn test_rewind_after_preload_rereads_from_file() {
        let mut seq = sequencer(trace(4, CompressType::None));
        seq.record_bookmark();
        seq.start_preload(100, |mut packet| {
            packet.interpreted = true;
            packet
        })
        .unwrap();
        assert_eq!(drain(&mut seq), vec![0, 1, 2, 3]);

        seq.set_bookmark(seq.bookmark());
        let packet = seq.next_packet().unwrap().unwrap();
        assert_eq!(packet.index(), 0);
        assert!(!packet.interpreted);
    }
}
