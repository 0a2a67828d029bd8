//! Blendshape executor bundles.
//!
//! A bundle owns one executor plus the per-track audio and emotion
//! accumulators and the device stream its results are scheduled on. The
//! in-tree executor is a deterministic reference implementation; the
//! contract it honors is the one the gateway depends on: results are
//! device-typed, scheduled on the bundle stream, and delivered through a
//! sink invoked from within `execute`.

use crate::accumulator::{AudioAccumulator, EmotionAccumulator};
use crate::device::{DeviceTensor, Stream};
use crate::model::ModelDescription;
use crate::InferError;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Which blendshape solvers an executor drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOption {
    None,
    Skin,
    Tongue,
    SkinTongue,
}

impl ExecutionOption {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionOption::None => "None",
            ExecutionOption::Skin => "Skin",
            ExecutionOption::Tongue => "Tongue",
            ExecutionOption::SkinTongue => "SkinTongue",
        }
    }

    pub fn includes_skin(&self) -> bool {
        matches!(self, ExecutionOption::Skin | ExecutionOption::SkinTongue)
    }

    pub fn includes_tongue(&self) -> bool {
        matches!(self, ExecutionOption::Tongue | ExecutionOption::SkinTongue)
    }
}

impl fmt::Display for ExecutionOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionOption {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "skintongue" => Ok(ExecutionOption::SkinTongue),
            "skin" => Ok(ExecutionOption::Skin),
            "tongue" => Ok(ExecutionOption::Tongue),
            "none" => Ok(ExecutionOption::None),
            _ => Err(format!("Unsupported execution option: {s}")),
        }
    }
}

/// How an executor delivers its results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultsType {
    Host,
    Device,
}

/// One frame of weights, produced on the device and scheduled on `stream`.
/// The weights are finalized on the stream; host-side consumers must copy
/// them out and synchronize before reading.
pub struct DeviceResults {
    pub track: usize,
    pub weights: DeviceTensor,
    pub stream: Stream,
    pub timestamp_current_frame: i64,
    pub timestamp_next_frame: i64,
}

/// Per-call results sink, invoked from within `execute` once per produced
/// frame.
pub type ResultsSink<'a> = dyn FnMut(&DeviceResults) + 'a;

#[derive(Debug, Clone, Copy)]
enum Variant {
    Regression,
    Diffusion { identity: usize, constant_noise: bool },
}

struct TrackState {
    next_frame: u64,
}

pub struct ExecutorBundle {
    model: ModelDescription,
    variant: Variant,
    execution_option: ExecutionOption,
    use_gpu_solver: bool,
    fps_numerator: u32,
    fps_denominator: u32,
    weight_count: usize,
    tracks: Vec<TrackState>,
    audio: Vec<AudioAccumulator>,
    emotion: Vec<EmotionAccumulator>,
    stream: Stream,
}

impl ExecutorBundle {
    /// Build a regression bundle from a model description file.
    pub fn read_regression(
        nb_tracks: usize,
        model_path: impl AsRef<Path>,
        execution_option: ExecutionOption,
        use_gpu_solver: bool,
        fps_numerator: u32,
        fps_denominator: u32,
    ) -> Result<Self, InferError> {
        let model = ModelDescription::load(model_path)?;
        Self::build(
            model,
            Variant::Regression,
            nb_tracks,
            execution_option,
            use_gpu_solver,
            fps_numerator,
            fps_denominator,
        )
    }

    /// Build a diffusion bundle from a model description file.
    pub fn read_diffusion(
        nb_tracks: usize,
        model_path: impl AsRef<Path>,
        execution_option: ExecutionOption,
        use_gpu_solver: bool,
        identity: usize,
        constant_noise: bool,
        fps_numerator: u32,
        fps_denominator: u32,
    ) -> Result<Self, InferError> {
        let model = ModelDescription::load(model_path)?;
        Self::build(
            model,
            Variant::Diffusion {
                identity,
                constant_noise,
            },
            nb_tracks,
            execution_option,
            use_gpu_solver,
            fps_numerator,
            fps_denominator,
        )
    }

    fn build(
        model: ModelDescription,
        variant: Variant,
        nb_tracks: usize,
        execution_option: ExecutionOption,
        use_gpu_solver: bool,
        fps_numerator: u32,
        fps_denominator: u32,
    ) -> Result<Self, InferError> {
        if nb_tracks == 0 {
            return Err(InferError::Unsupported("bundle needs at least one track".into()));
        }
        if fps_numerator == 0 || fps_denominator == 0 {
            return Err(InferError::Unsupported("frame rate must be positive".into()));
        }

        let mut weight_count = 0;
        if execution_option.includes_skin() {
            weight_count += model.skin.poses.len();
        }
        if execution_option.includes_tongue() {
            weight_count += model.tongue.poses.len();
        }

        let emotion_size = model.emotion_size;
        Ok(Self {
            model,
            variant,
            execution_option,
            use_gpu_solver,
            fps_numerator,
            fps_denominator,
            weight_count,
            tracks: (0..nb_tracks).map(|_| TrackState { next_frame: 0 }).collect(),
            audio: (0..nb_tracks).map(|_| AudioAccumulator::new()).collect(),
            emotion: (0..nb_tracks)
                .map(|_| EmotionAccumulator::new(emotion_size))
                .collect(),
            stream: Stream::new(),
        })
    }

    pub fn nb_tracks(&self) -> usize {
        self.tracks.len()
    }

    pub fn sampling_rate(&self) -> u32 {
        self.model.sampling_rate
    }

    pub fn frame_rate(&self) -> (u32, u32) {
        (self.fps_numerator, self.fps_denominator)
    }

    pub fn weight_count(&self) -> usize {
        self.weight_count
    }

    pub fn execution_option(&self) -> ExecutionOption {
        self.execution_option
    }

    pub fn results_type(&self) -> ResultsType {
        if self.use_gpu_solver {
            ResultsType::Device
        } else {
            ResultsType::Host
        }
    }

    /// Pose names of the active skin solver, in weight order.
    pub fn skin_pose_names(&self) -> &[String] {
        if self.execution_option.includes_skin() {
            &self.model.skin.poses
        } else {
            &[]
        }
    }

    /// Pose names of the active tongue solver, in weight order.
    pub fn tongue_pose_names(&self) -> &[String] {
        if self.execution_option.includes_tongue() {
            &self.model.tongue.poses
        } else {
            &[]
        }
    }

    pub fn stream(&self) -> &Stream {
        &self.stream
    }

    pub fn audio_accumulator(&self, track: usize) -> &AudioAccumulator {
        &self.audio[track]
    }

    pub fn audio_accumulator_mut(&mut self, track: usize) -> &mut AudioAccumulator {
        &mut self.audio[track]
    }

    pub fn emotion_accumulator(&self, track: usize) -> &EmotionAccumulator {
        &self.emotion[track]
    }

    pub fn emotion_accumulator_mut(&mut self, track: usize) -> &mut EmotionAccumulator {
        &mut self.emotion[track]
    }

    /// Absolute sample index where frame `frame` begins.
    fn frame_start_sample(&self, frame: u64) -> u64 {
        frame * u64::from(self.model.sampling_rate) * u64::from(self.fps_denominator)
            / u64::from(self.fps_numerator)
    }

    fn track_ready(&self, track: usize) -> bool {
        let next = self.tracks[track].next_frame;
        let needed = self.frame_start_sample(next + 1);
        (self.audio[track].nb_accumulated_samples() as u64) >= needed
    }

    /// Number of tracks with at least one computable frame.
    pub fn nb_ready_tracks(&self) -> usize {
        (0..self.tracks.len()).filter(|&t| self.track_ready(t)).count()
    }

    /// Compute the next frame of the first ready track. The results sink is
    /// invoked from within this call; the weights it sees are scheduled on
    /// the bundle stream, not yet host-visible. One frame is produced per
    /// call, so callers drive draining (and interleave flushes) themselves.
    pub fn execute(&mut self, sink: &mut ResultsSink<'_>) -> Result<(), InferError> {
        let track = (0..self.tracks.len())
            .find(|&t| self.track_ready(t))
            .ok_or_else(|| InferError::Unsupported("execute called with no ready track".into()))?;

        let frame = self.tracks[track].next_frame;
        let ts_current = self.frame_start_sample(frame) as i64;
        let ts_next = self.frame_start_sample(frame + 1) as i64;

        let samples = self.audio[track].range(ts_current as usize, ts_next as usize);
        let emotion = self.emotion[track].sample_at(ts_current);
        let weights = self.synthesize(frame, &samples, &emotion);

        self.tracks[track].next_frame = frame + 1;

        let results = DeviceResults {
            track,
            weights: DeviceTensor::from_vec(weights),
            stream: self.stream.clone(),
            timestamp_current_frame: ts_current,
            timestamp_next_frame: ts_next,
        };
        sink(&results);
        Ok(())
    }

    /// Block until work already scheduled for `track` has completed.
    pub fn wait(&self, _track: usize) {
        self.stream.synchronize();
    }

    /// Rewind `track` to frame zero. Accumulators are reset separately.
    pub fn reset_track(&mut self, track: usize) {
        self.tracks[track].next_frame = 0;
    }

    /// First audio sample still needed by `track`; everything before it may
    /// be dropped from the audio accumulator.
    pub fn next_audio_sample_to_read(&self, track: usize) -> usize {
        self.frame_start_sample(self.tracks[track].next_frame) as usize
    }

    /// Earliest emotion timestamp still needed by `track`.
    pub fn next_emotion_timestamp_to_read(&self, track: usize) -> i64 {
        self.frame_start_sample(self.tracks[track].next_frame) as i64
    }

    fn synthesize(&self, frame: u64, samples: &[f32], emotion: &[f32]) -> Vec<f32> {
        if self.weight_count == 0 {
            return Vec::new();
        }

        let mean_square =
            samples.iter().map(|s| s * s).sum::<f32>() / samples.len().max(1) as f32;
        let energy = (mean_square.sqrt() * 4.0).min(1.0);
        let emotion_bias = if emotion.is_empty() {
            0.0
        } else {
            emotion.iter().sum::<f32>() / emotion.len() as f32
        };

        (0..self.weight_count)
            .map(|channel| {
                let response = 0.5 + 0.5 * ((channel as f32 + 1.0) * 0.37).sin();
                let mut weight = energy * response + 0.1 * emotion_bias;
                if let Variant::Diffusion {
                    identity,
                    constant_noise,
                } = self.variant
                {
                    let noise_frame = if constant_noise { 0 } else { frame };
                    weight += 0.05 * hash_noise(identity, noise_frame, channel);
                }
                weight.clamp(0.0, 1.0)
            })
            .collect()
    }
}

/// Deterministic noise in [-1, 1] from (identity, frame, channel).
fn hash_noise(identity: usize, frame: u64, channel: usize) -> f32 {
    let mut x = (identity as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15)
        ^ frame.wrapping_mul(0xBF58_476D_1CE4_E5B9)
        ^ ((channel as u64) << 17);
    x ^= x >> 33;
    x = x.wrapping_mul(0xFF51_AFD7_ED55_8CCD);
    x ^= x >> 33;
    ((x & 0xFFFF) as f32 / 32767.5) - 1.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_option_from_str_case_insensitive() {
        assert_eq!(
            "SKINTONGUE".parse::<ExecutionOption>().unwrap(),
            ExecutionOption::SkinTongue
        );
        assert_eq!("skin".parse::<ExecutionOption>().unwrap(), ExecutionOption::Skin);
        assert_eq!("Tongue".parse::<ExecutionOption>().unwrap(), ExecutionOption::Tongue);
        assert_eq!("none".parse::<ExecutionOption>().unwrap(), ExecutionOption::None);
        assert!("lips".parse::<ExecutionOption>().is_err());
    }

    #[test]
    fn test_hash_noise_deterministic_and_bounded() {
        for channel in 0..64 {
            let a = hash_noise(3, 7, channel);
            let b = hash_noise(3, 7, channel);
            assert_eq!(a, b);
            assert!((-1.0..=1.0).contains(&a));
        }
        assert_ne!(hash_noise(3, 7, 0), hash_noise(4, 7, 0));
    }
}
