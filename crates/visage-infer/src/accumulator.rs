//! Streaming input history for the executors. Both accumulators support
//! drop-before so a long session's memory stays bounded by the executor's
//! read cursor rather than the session length.

use crate::device::Stream;
use crate::InferError;

/// Growable audio history with an absolute sample-index origin.
pub struct AudioAccumulator {
    base: usize,
    samples: Vec<f32>,
}

impl AudioAccumulator {
    pub fn new() -> Self {
        Self {
            base: 0,
            samples: Vec::new(),
        }
    }

    pub fn reset(&mut self) {
        self.base = 0;
        self.samples.clear();
    }

    /// Total samples ever accumulated, including dropped history.
    pub fn nb_accumulated_samples(&self) -> usize {
        self.base + self.samples.len()
    }

    /// Append samples. The stream argument mirrors the upload path; the
    /// reference implementation keeps the history host-side.
    pub fn accumulate(&mut self, samples: &[f32], _stream: &Stream) {
        self.samples.extend_from_slice(samples);
    }

    /// Copy of the absolute sample range `[start, end)`. Positions outside
    /// the retained history read as silence.
    pub fn range(&self, start: usize, end: usize) -> Vec<f32> {
        let mut out = vec![0.0; end.saturating_sub(start)];
        for (i, slot) in out.iter_mut().enumerate() {
            let index = start + i;
            if index >= self.base {
                if let Some(&sample) = self.samples.get(index - self.base) {
                    *slot = sample;
                }
            }
        }
        out
    }

    /// Release history before the absolute index `index`.
    pub fn drop_samples_before(&mut self, index: usize) {
        if index <= self.base {
            return;
        }
        let drop = (index - self.base).min(self.samples.len());
        self.samples.drain(..drop);
        self.base += drop;
    }

    /// Samples currently held in memory.
    pub fn retained_samples(&self) -> usize {
        self.samples.len()
    }
}

impl Default for AudioAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

/// Timestamped emotion history. Closing freezes the history; a closed
/// accumulator holds the emotion for the rest of the session.
pub struct EmotionAccumulator {
    emotion_size: usize,
    closed: bool,
    entries: Vec<(i64, Vec<f32>)>,
}

impl EmotionAccumulator {
    pub fn new(emotion_size: usize) -> Self {
        Self {
            emotion_size,
            closed: false,
            entries: Vec::new(),
        }
    }

    pub fn emotion_size(&self) -> usize {
        self.emotion_size
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn reset(&mut self) {
        self.closed = false;
        self.entries.clear();
    }

    /// Append an emotion vector at `timestamp` (samples, non-decreasing).
    pub fn accumulate(
        &mut self,
        timestamp: i64,
        emotion: &[f32],
        _stream: &Stream,
    ) -> Result<(), InferError> {
        if self.closed {
            return Err(InferError::AccumulatorClosed);
        }
        if emotion.len() != self.emotion_size {
            return Err(InferError::SizeMismatch {
                expected: self.emotion_size,
                got: emotion.len(),
            });
        }
        if let Some(&(last, _)) = self.entries.last() {
            if timestamp < last {
                return Err(InferError::Unsupported(format!(
                    "emotion timestamp {timestamp} precedes {last}"
                )));
            }
        }
        self.entries.push((timestamp, emotion.to_vec()));
        Ok(())
    }

    pub fn close(&mut self) {
        self.closed = true;
    }

    /// Latest emotion at or before `timestamp`; neutral zeros when the
    /// history holds nothing that early.
    pub fn sample_at(&self, timestamp: i64) -> Vec<f32> {
        self.entries
            .iter()
            .rev()
            .find(|(ts, _)| *ts <= timestamp)
            .map(|(_, emotion)| emotion.clone())
            .unwrap_or_else(|| vec![0.0; self.emotion_size])
    }

    /// Release history before `timestamp`, keeping the latest entry at or
    /// before it so `sample_at` stays answerable.
    pub fn drop_emotions_before(&mut self, timestamp: i64) {
        let keep_from = self
            .entries
            .iter()
            .rposition(|(ts, _)| *ts <= timestamp)
            .unwrap_or(0);
        self.entries.drain(..keep_from);
    }

    pub fn retained_entries(&self) -> usize {
        self.entries.len()
    }
}
