//! Bounded PCM queue between the controller and the output callback.
//!
//! The controller pushes interleaved stereo 16-bit frames without blocking; the
//! cpal callback drains up to a burst of frames at a time and never waits. The
//! callback reports frames back once it has rendered them; that count, reset by
//! [`PcmQueue::clear`], is the sink's playback head. Every clear starts a new
//! epoch, and reports tagged with an older epoch are dropped.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::config::{BYTES_PER_FRAME, OUTPUT_CHANNELS};

/// Thread-safe bounded queue of interleaved stereo `i16` samples.
pub struct PcmQueue {
    inner: Mutex<QueueInner>,
    max_frames: usize,
    low_watermark_ms: AtomicU64,
}

struct QueueInner {
    samples: VecDeque<i16>,
    played_frames: u64,
    epoch: u64,
    done: bool,
}

impl PcmQueue {
    pub fn new(max_frames: usize) -> Self {
        let max_frames = max_frames.max(1);
        Self {
            inner: Mutex::new(QueueInner {
                samples: VecDeque::with_capacity(max_frames * OUTPUT_CHANNELS),
                played_frames: 0,
                epoch: 0,
                done: false,
            }),
            max_frames,
            low_watermark_ms: AtomicU64::new(0),
        }
    }

    fn inner(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Capacity in frames.
    pub fn max_frames(&self) -> usize {
        self.max_frames
    }

    /// Queued frames (best-effort snapshot).
    pub fn len_frames(&self) -> usize {
        self.inner().samples.len() / OUTPUT_CHANNELS
    }

    /// Frames reported played since the last clear.
    pub fn played_frames(&self) -> u64 {
        self.inner().played_frames
    }

    /// Number of clears so far.
    pub fn epoch(&self) -> u64 {
        self.inner().epoch
    }

    pub fn is_done(&self) -> bool {
        self.inner().done
    }

    /// Stop accepting pushes. Idempotent.
    pub fn close(&self) {
        self.inner().done = true;
    }

    /// Drop everything queued, restart the played-frame count and open a new epoch.
    pub fn clear(&self) {
        let mut g = self.inner();
        g.samples.clear();
        g.played_frames = 0;
        g.epoch = g.epoch.wrapping_add(1);
    }

    /// Count `frames` popped during `epoch` as played. Stale epochs are ignored.
    pub fn mark_played(&self, epoch: u64, frames: usize) {
        let mut g = self.inner();
        if g.epoch == epoch {
            g.played_frames = g.played_frames.saturating_add(frames as u64);
        }
    }

    /// Queue little-endian stereo 16-bit PCM without blocking.
    ///
    /// Only whole frames that fit are accepted; returns the number of bytes taken.
    pub fn push_pcm_bytes(&self, pcm: &[u8]) -> usize {
        let mut g = self.inner();
        if g.done {
            return 0;
        }
        let free_frames = self.max_frames.saturating_sub(g.samples.len() / OUTPUT_CHANNELS);
        let frames = (pcm.len() / BYTES_PER_FRAME).min(free_frames);
        let bytes = frames * BYTES_PER_FRAME;
        g.samples.extend(
            pcm[..bytes]
                .chunks_exact(2)
                .map(|pair| i16::from_le_bytes([pair[0], pair[1]])),
        );
        bytes
    }

    /// Pop up to `max_frames` frames with the epoch they belong to, or `None`
    /// when nothing is queued.
    pub fn pop_up_to(&self, max_frames: usize) -> Option<(u64, Vec<i16>)> {
        let mut g = self.inner();
        let take_frames = (g.samples.len() / OUTPUT_CHANNELS).min(max_frames);
        if take_frames == 0 {
            return None;
        }
        let out: Vec<i16> = g.samples.drain(..take_frames * OUTPUT_CHANNELS).collect();
        let epoch = g.epoch;
        let queued = g.samples.len();
        drop(g);
        self.log_low_watermark(queued);
        Some((epoch, out))
    }

    fn log_low_watermark(&self, queued: usize) {
        let threshold = (self.max_frames * OUTPUT_CHANNELS / 8).max(OUTPUT_CHANNELS * 16);
        if queued > 0 && queued < threshold {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_else(|_| Duration::from_millis(0))
                .as_millis() as u64;
            let last = self.low_watermark_ms.load(Ordering::Relaxed);
            if now.saturating_sub(last) > 1000 {
                self.low_watermark_ms.store(now, Ordering::Relaxed);
                tracing::info!(
                    queued_samples = queued,
                    threshold_samples = threshold,
                    "pcm queue low watermark"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn frames(values: &[i16]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    #[test]
    fn pop_on_empty_queue_returns_none() {
        let q = PcmQueue::new(16);
        assert!(q.pop_up_to(4).is_none());
    }

    #[test]
    fn push_decodes_little_endian_samples() {
        let q = PcmQueue::new(16);
        assert_eq!(q.push_pcm_bytes(&frames(&[1, -1, 300, -300])), 8);
        assert_eq!(q.pop_up_to(8).unwrap(), (0, vec![1, -1, 300, -300]));
    }

    #[test]
    fn push_accepts_only_whole_frames_that_fit() {
        let q = PcmQueue::new(2);
        // Three frames plus a dangling byte; only two frames fit.
        let mut pcm = frames(&[1, 2, 3, 4, 5, 6]);
        pcm.push(0);
        assert_eq!(q.push_pcm_bytes(&pcm), 8);
        assert_eq!(q.len_frames(), 2);
        assert_eq!(q.push_pcm_bytes(&frames(&[7, 8])), 0);
    }

    #[test]
    fn popping_alone_does_not_advance_played_frames() {
        let q = PcmQueue::new(16);
        q.push_pcm_bytes(&frames(&[0; 12]));
        let (epoch, popped) = q.pop_up_to(4).unwrap();
        assert_eq!(popped.len(), 8);
        assert_eq!(q.played_frames(), 0);
        q.mark_played(epoch, 3);
        assert_eq!(q.played_frames(), 3);
    }

    #[test]
    fn clear_resets_count_and_drops_reports_from_before_it() {
        let q = PcmQueue::new(16);
        q.push_pcm_bytes(&frames(&[0; 8]));
        let (before, _) = q.pop_up_to(2).unwrap();
        q.mark_played(before, 1);
        q.clear();
        assert_eq!(q.played_frames(), 0);
        assert_eq!(q.len_frames(), 0);
        assert_eq!(q.epoch(), before + 1);

        // The rest of the pre-clear pop lands after the clear.
        q.mark_played(before, 1);
        assert_eq!(q.played_frames(), 0);

        q.push_pcm_bytes(&frames(&[0; 4]));
        let (after, _) = q.pop_up_to(2).unwrap();
        assert_eq!(after, q.epoch());
        q.mark_played(after, 2);
        assert_eq!(q.played_frames(), 2);
    }

    #[test]
    fn closed_queue_rejects_pushes() {
        let q = PcmQueue::new(16);
        q.close();
        assert!(q.is_done());
        assert_eq!(q.push_pcm_bytes(&frames(&[1, 2])), 0);
    }

    #[test]
    fn concurrent_producer_and_consumer_lose_nothing() {
        let q = Arc::new(PcmQueue::new(64));
        let producer = {
            let q = q.clone();
            thread::spawn(move || {
                let pcm = frames(&[5; 2 * 1_000]);
                let mut offset = 0;
                while offset < pcm.len() {
                    offset += q.push_pcm_bytes(&pcm[offset..]);
                    thread::yield_now();
                }
            })
        };
        let mut drained = 0;
        while drained < 1_000 {
            if let Some((epoch, v)) = q.pop_up_to(16) {
                let n = v.len() / OUTPUT_CHANNELS;
                q.mark_played(epoch, n);
                drained += n;
            } else {
                thread::yield_now();
            }
        }
        producer.join().unwrap();
        assert_eq!(q.played_frames(), 1_000);
    }
}
