//! Chunked PCM writes from the current variant into the sink.

use crate::config::BYTES_PER_FRAME;
use crate::playback::PcmSink;
use crate::variant::TempoVariant;

/// Position of the stream within the current variant and the sink.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PlaybackCursor {
    /// Next byte of the variant's PCM to hand to the sink.
    pub write_index: usize,
    /// Bytes handed to the sink since it was last flushed.
    pub sink_index: usize,
}

impl PlaybackCursor {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Move the write index to the same musical position in a variant at `new_bpm`.
    pub fn rescale(&mut self, old_bpm: i32, new_bpm: i32) {
        self.write_index = rescale_offset(self.write_index, old_bpm, new_bpm);
    }
}

/// `round(offset * old / new)`, then down to a frame boundary.
pub fn rescale_offset(offset: usize, old_bpm: i32, new_bpm: i32) -> usize {
    if old_bpm <= 0 || new_bpm <= 0 {
        return align_to_frame(offset);
    }
    let scaled = (offset as f64 * old_bpm as f64 / new_bpm as f64).round() as usize;
    align_to_frame(scaled)
}

pub fn align_to_frame(bytes: usize) -> usize {
    bytes / BYTES_PER_FRAME * BYTES_PER_FRAME
}

/// Keeps the sink topped up in fixed-size chunks.
#[derive(Clone, Debug)]
pub struct StreamingBufferScheduler {
    buffer_bytes: usize,
}

impl StreamingBufferScheduler {
    pub fn new(buffer_bytes: usize) -> Self {
        Self {
            buffer_bytes: align_to_frame(buffer_bytes).max(BYTES_PER_FRAME),
        }
    }

    pub fn buffer_bytes(&self) -> usize {
        self.buffer_bytes
    }

    /// Whole-frame bytes of `variant` not yet handed to the sink.
    pub fn remaining(&self, variant: &TempoVariant, cursor: &PlaybackCursor) -> usize {
        align_to_frame(variant.len_bytes().saturating_sub(cursor.write_index))
    }

    /// Bytes handed to the sink that it has not played yet.
    pub fn unplayed_bytes(&self, cursor: &PlaybackCursor, sink: &dyn PcmSink) -> usize {
        cursor.sink_index.saturating_sub(sink.played_bytes())
    }

    /// `true` when no more than one chunk is waiting in the sink.
    pub fn needs_refill(&self, cursor: &PlaybackCursor, sink: &dyn PcmSink) -> bool {
        self.unplayed_bytes(cursor, sink) <= self.buffer_bytes
    }

    /// Write up to `count` chunks starting at the cursor.
    ///
    /// Stops early when the variant is exhausted or the sink takes less than
    /// offered. Sink failures are logged and left for the next callback to
    /// retry. Returns the bytes the sink accepted.
    pub fn write_next_buffers(
        &self,
        variant: &TempoVariant,
        cursor: &mut PlaybackCursor,
        sink: &mut dyn PcmSink,
        count: usize,
    ) -> usize {
        let mut written = 0;
        for _ in 0..count {
            let chunk = self.remaining(variant, cursor).min(self.buffer_bytes);
            if chunk == 0 {
                break;
            }
            let start = cursor.write_index;
            match sink.write(&variant.pcm[start..start + chunk]) {
                Ok(accepted) => {
                    cursor.write_index += accepted;
                    cursor.sink_index += accepted;
                    written += accepted;
                    if accepted < chunk {
                        tracing::warn!(
                            offered = chunk,
                            accepted,
                            "sink accepted a partial buffer"
                        );
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!("sink write failed: {e}");
                    break;
                }
            }
        }
        if written > 0 {
            tracing::trace!(
                variant = ?variant.label,
                written,
                write_index = cursor.write_index,
                "pcm buffers written"
            );
        }
        written
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playback::MemorySink;
    use cadence_types::VariantLabel;

    fn variant(bytes: usize) -> TempoVariant {
        let pcm: Vec<u8> = (0..bytes).map(|i| (i % 251) as u8).collect();
        TempoVariant::new("Song", VariantLabel::Original, 120, pcm)
    }

    #[test]
    fn rescale_keeps_musical_position_on_frame_boundary() {
        assert_eq!(rescale_offset(4800, 120, 160), 3600);
        // 1000 * 120 / 90 = 1333.3 -> 1333 -> 1332
        assert_eq!(rescale_offset(1000, 120, 90), 1332);
        let mut cursor = PlaybackCursor {
            write_index: 4800,
            sink_index: 96,
        };
        cursor.rescale(120, 160);
        assert_eq!(cursor.write_index, 3600);
        assert_eq!(cursor.sink_index, 96);
    }

    #[test]
    fn writes_requested_chunks_and_advances_both_indexes() {
        let scheduler = StreamingBufferScheduler::new(40);
        let v = variant(200);
        let mut sink = MemorySink::new(1_000);
        let mut cursor = PlaybackCursor::default();

        assert_eq!(scheduler.write_next_buffers(&v, &mut cursor, &mut sink, 2), 80);
        assert_eq!(cursor, PlaybackCursor { write_index: 80, sink_index: 80 });
        assert_eq!(sink.written(), &v.pcm[..80]);
    }

    #[test]
    fn stops_at_end_of_variant() {
        let scheduler = StreamingBufferScheduler::new(40);
        let v = variant(100);
        let mut sink = MemorySink::new(1_000);
        let mut cursor = PlaybackCursor::default();

        assert_eq!(scheduler.write_next_buffers(&v, &mut cursor, &mut sink, 5), 100);
        assert_eq!(scheduler.remaining(&v, &cursor), 0);
        assert_eq!(scheduler.write_next_buffers(&v, &mut cursor, &mut sink, 1), 0);
    }

    #[test]
    fn partial_sink_write_advances_by_accepted_bytes_only() {
        let scheduler = StreamingBufferScheduler::new(40);
        let v = variant(200);
        let mut sink = MemorySink::new(60);
        let mut cursor = PlaybackCursor::default();

        assert_eq!(scheduler.write_next_buffers(&v, &mut cursor, &mut sink, 2), 60);
        assert_eq!(cursor.write_index, 60);
    }

    #[test]
    fn refill_needed_once_at_most_one_chunk_is_unplayed() {
        let scheduler = StreamingBufferScheduler::new(40);
        let v = variant(400);
        let mut sink = MemorySink::new(1_000);
        let mut cursor = PlaybackCursor::default();
        scheduler.write_next_buffers(&v, &mut cursor, &mut sink, 2);

        assert_eq!(scheduler.unplayed_bytes(&cursor, &sink), 80);
        assert!(!scheduler.needs_refill(&cursor, &sink));
        sink.advance_played(40);
        assert!(scheduler.needs_refill(&cursor, &sink));
    }
}
