use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

/// Sample rate remote audio is decoded at.
pub const PLAYOUT_SAMPLE_RATE: u32 = 48_000;
/// Remote audio is mixed down to mono.
pub const PLAYOUT_CHANNELS: u32 = 1;

/// Longest backlog kept before old audio is skipped.
const MAX_LATENCY: Duration = Duration::from_secs(2);

/// Ring buffer between decoded remote call audio and the platform speaker.
///
/// Remote audio tracks push interleaved i16 PCM; the platform audio output
/// pulls fixed-size chunks. When the speaker falls behind, the oldest samples
/// are discarded so latency stays bounded.
pub struct AudioPlayoutBuffer {
    samples: Mutex<VecDeque<i16>>,
    capacity: usize,
}

impl AudioPlayoutBuffer {
    pub fn new() -> Self {
        Self::for_latency(PLAYOUT_SAMPLE_RATE, PLAYOUT_CHANNELS, MAX_LATENCY)
    }

    /// Buffer holding at most `latency` worth of audio.
    pub fn for_latency(sample_rate: u32, channels: u32, latency: Duration) -> Self {
        let per_second = sample_rate as u128 * channels as u128;
        let capacity = (per_second * latency.as_millis() / 1000) as usize;
        Self::with_capacity(capacity)
    }

    fn with_capacity(capacity: usize) -> Self {
        Self {
            samples: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Append decoded samples, discarding the oldest on overflow.
    pub fn push(&self, pcm: &[i16]) {
        let mut samples = self.samples.lock().unwrap();
        samples.extend(pcm.iter().copied());
        let overflow = samples.len().saturating_sub(self.capacity);
        if overflow > 0 {
            samples.drain(..overflow);
            tracing::trace!("playout overflow: skipped {overflow} samples");
        }
    }

    /// Fill `out` from the buffer and pad the rest with silence.
    ///
    /// Returns how many real samples were written.
    pub fn pull(&self, out: &mut [i16]) -> usize {
        let mut samples = self.samples.lock().unwrap();
        let n = samples.len().min(out.len());
        for (slot, sample) in out.iter_mut().zip(samples.drain(..n)) {
            *slot = sample;
        }
        out[n..].fill(0);
        n
    }

    pub fn buffered(&self) -> usize {
        self.samples.lock().unwrap().len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drop everything queued, e.g. when the call is torn down.
    pub fn clear(&self) {
        self.samples.lock().unwrap().clear();
    }
}

impl Default for AudioPlayoutBuffer {
    fn default() -> Self {
        Self::new()
    }
}
