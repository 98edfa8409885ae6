//! PCM sinks.
//!
//! [`PcmSink`] is the streaming output the controller writes into. [`CpalSink`]
//! implements it over a [`PcmQueue`] drained by a cpal output callback. The
//! callback:
//! - refills a small local buffer from the queue without blocking
//! - reports frames to the queue as played once rendered, not when popped
//! - applies basic channel mapping (stereo to the device layout)
//! - converts samples to the device sample format
//! - outputs silence while stopped/paused or on underrun
//! - fires a periodic notification every `notification_period_frames` of
//!   played output

use std::sync::atomic::{AtomicI32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result, anyhow};
use cpal::traits::{DeviceTrait, StreamTrait};
use crossbeam_channel::Sender;

use crate::config::{BYTES_PER_FRAME, OUTPUT_CHANNELS, PlaybackConfig};
use crate::device;
use crate::error::{EngineError, EngineResult};
use crate::queue::PcmQueue;

/// Streaming PCM output consumed by the playback controller.
///
/// PCM is interleaved stereo 16-bit little-endian.
pub trait PcmSink: Send {
    /// Process-unique id of this output session.
    fn session_id(&self) -> i32;

    fn play(&mut self) -> EngineResult<()>;

    /// Stop output without discarding queued audio.
    fn pause(&mut self) -> EngineResult<()>;

    /// Discard queued audio and restart the played-byte count.
    fn flush(&mut self);

    /// Queue PCM without blocking; returns the bytes accepted.
    fn write(&mut self, pcm: &[u8]) -> EngineResult<usize>;

    /// Bytes played since the last flush.
    fn played_bytes(&self) -> usize;

    fn is_playing(&self) -> bool;

    fn is_paused(&self) -> bool;
}

/// Sent by [`CpalSink`] each time another notification period has played.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SinkNotification {
    pub session_id: i32,
}

static NEXT_SESSION_ID: AtomicI32 = AtomicI32::new(1);

/// Allocate a process-unique sink session id.
pub fn next_session_id() -> i32 {
    NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed)
}

const STOPPED: u8 = 0;
const PLAYING: u8 = 1;
const PAUSED: u8 = 2;

struct SinkShared {
    queue: PcmQueue,
    state: AtomicU8,
}

impl SinkShared {
    fn state(&self) -> u8 {
        self.state.load(Ordering::Acquire)
    }
}

/// Stream parameters chosen when the sink opened.
#[derive(Clone, Debug)]
pub struct OutputInfo {
    pub device: String,
    pub sample_rate: u32,
    pub channels: u16,
    pub sample_format: String,
}

/// cpal-backed [`PcmSink`].
///
/// The stream is built and owned by a dedicated thread because `cpal::Stream`
/// is not `Send` on every host; the sink talks to it through shared atomics and
/// the queue. Dropping the sink stops that thread.
pub struct CpalSink {
    session_id: i32,
    shared: Arc<SinkShared>,
    info: OutputInfo,
    shutdown: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl CpalSink {
    /// Open the output device matching `needle` (or the default device).
    ///
    /// The stream prefers `playback.sample_rate`; check [`CpalSink::info`] for
    /// the rate actually used and render variants at that rate.
    pub fn open(
        needle: Option<&str>,
        playback: &PlaybackConfig,
        notify: Sender<SinkNotification>,
    ) -> Result<Self> {
        let session_id = next_session_id();
        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<Result<(Arc<SinkShared>, OutputInfo)>>(1);
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded::<()>(1);
        let needle = needle.map(str::to_string);
        let playback = playback.clone();

        let thread = thread::Builder::new()
            .name("cadence-sink".to_string())
            .spawn(move || {
                let host = cpal::default_host();
                let opened = open_stream(&host, needle.as_deref(), &playback, session_id, notify);
                let stream = match opened {
                    Ok((stream, shared, info)) => {
                        let _ = ready_tx.send(Ok((shared, info)));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                // Parked until the sink is dropped.
                let _ = shutdown_rx.recv();
                drop(stream);
            })
            .context("spawn sink thread")?;

        let (shared, info) = ready_rx
            .recv()
            .map_err(|_| anyhow!("sink thread exited before opening the stream"))??;
        tracing::info!(
            session_id,
            device = %info.device,
            sample_rate = info.sample_rate,
            channels = info.channels,
            sample_format = %info.sample_format,
            "pcm sink opened"
        );

        Ok(Self {
            session_id,
            shared,
            info,
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        })
    }

    pub fn info(&self) -> &OutputInfo {
        &self.info
    }
}

impl PcmSink for CpalSink {
    fn session_id(&self) -> i32 {
        self.session_id
    }

    fn play(&mut self) -> EngineResult<()> {
        if self.shared.queue.is_done() {
            return Err(EngineError::Sink("output stream closed".to_string()));
        }
        self.shared.state.store(PLAYING, Ordering::Release);
        Ok(())
    }

    fn pause(&mut self) -> EngineResult<()> {
        if self.shared.state() == PLAYING {
            self.shared.state.store(PAUSED, Ordering::Release);
        }
        Ok(())
    }

    fn flush(&mut self) {
        self.shared.queue.clear();
    }

    fn write(&mut self, pcm: &[u8]) -> EngineResult<usize> {
        if self.shared.queue.is_done() {
            return Err(EngineError::Sink("output stream closed".to_string()));
        }
        Ok(self.shared.queue.push_pcm_bytes(pcm))
    }

    /// Frames handed to the device; the device's own buffer is not subtracted.
    fn played_bytes(&self) -> usize {
        self.shared.queue.played_frames() as usize * BYTES_PER_FRAME
    }

    fn is_playing(&self) -> bool {
        self.shared.state() == PLAYING
    }

    fn is_paused(&self) -> bool {
        self.shared.state() == PAUSED
    }
}

impl Drop for CpalSink {
    fn drop(&mut self) {
        self.shared.state.store(STOPPED, Ordering::Release);
        self.shared.queue.close();
        self.shutdown.take();
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

fn open_stream(
    host: &cpal::Host,
    needle: Option<&str>,
    playback: &PlaybackConfig,
    session_id: i32,
    notify: Sender<SinkNotification>,
) -> Result<(cpal::Stream, Arc<SinkShared>, OutputInfo)> {
    let device = device::find_output_device(host, needle)?;
    let config = device::choose_stream_config(&device, playback.sample_rate)?;
    let mut stream_config: cpal::StreamConfig = config.clone().into();
    if let Some(buf) = device::fixed_buffer_size(&config) {
        stream_config.buffer_size = buf;
    }

    let rate = stream_config.sample_rate;
    let mut effective = playback.clone();
    effective.sample_rate = rate;
    // Room for the two chunks written on start/resume plus one refill.
    let max_frames = crate::config::buffer_frames(rate, effective.buffer_seconds) * 3;
    let shared = Arc::new(SinkShared {
        queue: PcmQueue::new(max_frames),
        state: AtomicU8::new(STOPPED),
    });

    let callback = CallbackConfig {
        refill_max_frames: effective.refill_max_frames.max(1),
        notification_period_frames: effective.notification_period_frames(),
        session_id,
    };
    let stream = build_output_stream(&device, &stream_config, config.sample_format(), &shared, callback, notify)?;
    stream.play().context("start output stream")?;

    let info = OutputInfo {
        device: device
            .description()
            .map(|d| d.to_string())
            .unwrap_or_else(|_| "<unknown>".to_string()),
        sample_rate: rate,
        channels: stream_config.channels,
        sample_format: format!("{:?}", config.sample_format()),
    };
    Ok((stream, shared, info))
}

#[derive(Clone, Copy, Debug)]
struct CallbackConfig {
    refill_max_frames: usize,
    notification_period_frames: usize,
    session_id: i32,
}

fn build_output_stream(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    sample_format: cpal::SampleFormat,
    shared: &Arc<SinkShared>,
    cfg: CallbackConfig,
    notify: Sender<SinkNotification>,
) -> Result<cpal::Stream> {
    match sample_format {
        cpal::SampleFormat::F32 => build_stream::<f32>(device, config, shared, cfg, notify),
        cpal::SampleFormat::I16 => build_stream::<i16>(device, config, shared, cfg, notify),
        cpal::SampleFormat::I32 => build_stream::<i32>(device, config, shared, cfg, notify),
        cpal::SampleFormat::U16 => build_stream::<u16>(device, config, shared, cfg, notify),
        other => Err(anyhow!("Unsupported sample format: {other:?}")),
    }
}

/// Type-specialized stream builder for cpal sample formats.
fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    shared: &Arc<SinkShared>,
    cfg: CallbackConfig,
    notify: Sender<SinkNotification>,
) -> Result<cpal::Stream>
where
    T: cpal::Sample + cpal::SizedSample + cpal::FromSample<f32>,
{
    let channels_out = config.channels as usize;
    let state = Arc::new(Mutex::new(CallbackState {
        pos: 0,
        src: Vec::new(),
        since_notify: 0,
        epoch: 0,
        played: 0,
    }));

    let shared_cb = shared.clone();
    let err_fn = |err| tracing::warn!("stream error: {err}");

    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _| {
            let silence = <T as cpal::Sample>::from_sample::<f32>(0.0);
            if shared_cb.state() != PLAYING {
                data.fill(silence);
                return;
            }

            let mut st = state.lock().unwrap_or_else(PoisonError::into_inner);
            st.sync_epoch(&shared_cb.queue);
            let frames = data.len() / channels_out;

            for frame in 0..frames {
                if !st.ensure_frame(&shared_cb.queue, cfg.refill_max_frames) {
                    data[frame * channels_out..].fill(silence);
                    break;
                }
                for ch in 0..channels_out {
                    let sample = next_sample_mapped(&mut st, channels_out, ch);
                    data[frame * channels_out + ch] = <T as cpal::Sample>::from_sample::<f32>(sample);
                }
                st.played += 1;
            }
            st.report_played(&shared_cb.queue);

            st.since_notify += frames;
            if st.since_notify >= cfg.notification_period_frames {
                st.since_notify = 0;
                // A pending notification already covers this one.
                let _ = notify.try_send(SinkNotification {
                    session_id: cfg.session_id,
                });
            }
        },
        err_fn,
        None,
    )?;

    Ok(stream)
}

/// Local buffer the callback drains between queue pops.
struct CallbackState {
    pos: usize,
    src: Vec<i16>,
    since_notify: usize,
    /// Queue epoch `src` was popped in.
    epoch: u64,
    /// Frames rendered from `src` not yet reported to the queue.
    played: usize,
}

impl CallbackState {
    /// Drop the local buffer if the queue was cleared since it was filled.
    fn sync_epoch(&mut self, queue: &PcmQueue) {
        let epoch = queue.epoch();
        if self.epoch != epoch {
            self.epoch = epoch;
            self.src.clear();
            self.pos = 0;
            self.played = 0;
        }
    }

    /// Make a source frame available at `pos`, popping from `queue` when the
    /// local buffer is drained. `false` on underrun.
    fn ensure_frame(&mut self, queue: &PcmQueue, refill_max_frames: usize) -> bool {
        if self.pos < self.src.len() {
            return true;
        }
        self.pos = 0;
        self.src.clear();
        let Some((epoch, frames)) = queue.pop_up_to(refill_max_frames) else {
            return false;
        };
        if epoch != self.epoch {
            self.report_played(queue);
            self.epoch = epoch;
        }
        self.src = frames;
        true
    }

    fn report_played(&mut self, queue: &PcmQueue) {
        if self.played > 0 {
            queue.mark_played(self.epoch, self.played);
            self.played = 0;
        }
    }
}

/// Read one output sample for `dst_ch` from the stereo source frame.
///
/// - stereo → mono: average L/R
/// - stereo → stereo: pass-through
/// - wider layouts: L/R on the first two channels, silence elsewhere
///
/// `st.pos` advances once per destination frame (after the last channel).
fn next_sample_mapped(st: &mut CallbackState, dst_channels: usize, dst_ch: usize) -> f32 {
    if st.pos + OUTPUT_CHANNELS > st.src.len() {
        return 0.0;
    }
    let left = sample_to_f32(st.src[st.pos]);
    let right = sample_to_f32(st.src[st.pos + 1]);

    let out = match (dst_channels, dst_ch) {
        (1, _) => 0.5 * (left + right),
        (_, 0) => left,
        (_, 1) => right,
        _ => 0.0,
    };

    if dst_ch + 1 == dst_channels {
        st.pos += OUTPUT_CHANNELS;
    }
    out
}

fn sample_to_f32(sample: i16) -> f32 {
    sample as f32 / 32_768.0
}

/// Print available output devices to stdout.
pub fn list_output_devices() -> Result<()> {
    let host = cpal::default_host();
    tracing::debug!(host = ?host.id(), "listing output devices");
    device::print_output_devices(&host)
}

/// In-memory sink for controller and scheduler tests.
#[cfg(test)]
pub(crate) struct MemorySink {
    session_id: i32,
    capacity: usize,
    written: Vec<u8>,
    played: usize,
    state: u8,
    pub flushes: usize,
    pub fail_writes: bool,
}

#[cfg(test)]
impl MemorySink {
    /// `capacity` caps unplayed bytes held at once.
    pub fn new(capacity: usize) -> Self {
        Self {
            session_id: next_session_id(),
            capacity,
            written: Vec::new(),
            played: 0,
            state: STOPPED,
            flushes: 0,
            fail_writes: false,
        }
    }

    /// Bytes written since the last flush.
    pub fn written(&self) -> &[u8] {
        &self.written
    }

    pub fn advance_played(&mut self, bytes: usize) {
        self.played = (self.played + bytes).min(self.written.len());
    }
}

#[cfg(test)]
impl PcmSink for MemorySink {
    fn session_id(&self) -> i32 {
        self.session_id
    }

    fn play(&mut self) -> EngineResult<()> {
        self.state = PLAYING;
        Ok(())
    }

    fn pause(&mut self) -> EngineResult<()> {
        if self.state == PLAYING {
            self.state = PAUSED;
        }
        Ok(())
    }

    fn flush(&mut self) {
        self.flushes += 1;
        self.written.clear();
        self.played = 0;
    }

    fn write(&mut self, pcm: &[u8]) -> EngineResult<usize> {
        if self.fail_writes {
            return Err(EngineError::Sink("rejected".to_string()));
        }
        let unplayed = self.written.len() - self.played;
        let free = self.capacity.saturating_sub(unplayed) / BYTES_PER_FRAME * BYTES_PER_FRAME;
        let take = (pcm.len() / BYTES_PER_FRAME * BYTES_PER_FRAME).min(free);
        self.written.extend_from_slice(&pcm[..take]);
        Ok(take)
    }

    fn played_bytes(&self) -> usize {
        self.played
    }

    fn is_playing(&self) -> bool {
        self.state == PLAYING
    }

    fn is_paused(&self) -> bool {
        self.state == PAUSED
    }
}
