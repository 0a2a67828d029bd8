//! Per-slot session state: one executor bundle, audio/emotion history, a
//! pinned staging buffer and the queue of frames awaiting flush.
//!
//! Results staged from within `execute` reference staging slots in queue
//! order; a slot is reused only after the flush that consumed it. Flushing
//! synchronizes the bundle stream first, so the staged bytes are
//! host-visible by the time they are written to the socket.

use crate::config::ServerConfig;
use crate::wire;
use serde_json::{json, Value};
use std::fmt;
use std::net::TcpStream;
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;
use visage_infer::{
    set_device, DeviceResults, ExecutionOption, ExecutorBundle, InferError, PinnedBuffer,
    ResultsType, Stream,
};
use visage_ws::{write_frame, Opcode};

/// Hard cap on frames staged but not yet flushed.
pub const MAX_STAGED_FRAMES: usize = 256;
/// Flush eagerly once this many frames are staged.
pub const FLUSH_THRESHOLD_FRAMES: usize = 32;
/// Largest tolerated gap between pushes, in seconds of audio.
const MAX_GAP_SECONDS: usize = 10;

const TRACK: usize = 0;

#[derive(Debug, Clone, Copy)]
pub struct PendingFrame {
    pub frame_index: u64,
    pub timestamp_current: i64,
    pub timestamp_next: i64,
    pub slot_index: usize,
}

#[derive(Debug)]
pub enum SessionError {
    NegativeStartSample,
    OutOfOrderAudio,
    GapTooLarge,
    Backpressure,
    Detached,
    Io(String),
    Internal(String),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::NegativeStartSample => write!(f, "startSampleIndex must be >= 0"),
            SessionError::OutOfOrderAudio => write!(
                f,
                "PushAudio startSampleIndex is behind the accumulator (out-of-order audio)"
            ),
            SessionError::GapTooLarge => write!(f, "Audio gap too large"),
            SessionError::Backpressure => write!(f, "Too many pending frames (client too slow?)"),
            SessionError::Detached => write!(f, "session is not bound to a socket"),
            SessionError::Io(msg) => write!(f, "socket error: {msg}"),
            SessionError::Internal(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for SessionError {}

impl SessionError {
    /// Whether the client should be told. Socket-level failures and detached
    /// sessions have no one to tell.
    fn reportable(&self) -> bool {
        !matches!(self, SessionError::Detached | SessionError::Io(_))
    }
}

struct SessionState {
    bundle: ExecutorBundle,
    staging: PinnedBuffer,
    pending: Vec<PendingFrame>,
    next_frame_index: u64,
    session_id: String,
    socket: Option<Arc<TcpStream>>,
    last_stream: Option<Stream>,
    scratch: Vec<f32>,
}

/// One pre-allocated session slot, recycled across client sessions.
pub struct SessionContext {
    cuda_device: i32,
    model_path: String,
    use_gpu_solver: bool,
    execution_option: ExecutionOption,
    sampling_rate: u32,
    fps_numerator: u32,
    fps_denominator: u32,
    weight_count: usize,
    channels: Vec<String>,
    skin_weight_count: usize,
    tongue_weight_count: usize,
    state: Mutex<SessionState>,
}

impl SessionContext {
    pub fn init(config: &ServerConfig) -> Result<Self, InferError> {
        if !config.use_gpu_solver {
            return Err(InferError::Unsupported(
                "only the GPU blendshape solver is supported by this server".to_string(),
            ));
        }

        set_device(config.cuda_device)?;

        let bundle = if config.diffusion {
            ExecutorBundle::read_diffusion(
                1,
                &config.model,
                config.execution_option,
                config.use_gpu_solver,
                config.diffusion_identity,
                config.diffusion_constant_noise,
                config.fps_numerator,
                config.fps_denominator,
            )?
        } else {
            ExecutorBundle::read_regression(
                1,
                &config.model,
                config.execution_option,
                config.use_gpu_solver,
                config.fps_numerator,
                config.fps_denominator,
            )?
        };

        if bundle.results_type() != ResultsType::Device {
            return Err(InferError::Unsupported(
                "expected DEVICE results from the GPU solver".to_string(),
            ));
        }

        let sampling_rate = bundle.sampling_rate();
        let (fps_numerator, fps_denominator) = bundle.frame_rate();
        let weight_count = bundle.weight_count();

        let skin_weight_count = bundle.skin_pose_names().len();
        let tongue_weight_count = bundle.tongue_pose_names().len();
        let mut channels = Vec::with_capacity(weight_count);
        channels.extend(bundle.skin_pose_names().iter().cloned());
        channels.extend(bundle.tongue_pose_names().iter().cloned());
        if channels.len() != weight_count {
            return Err(InferError::SizeMismatch {
                expected: weight_count,
                got: channels.len(),
            });
        }

        let staging = PinnedBuffer::new(weight_count * MAX_STAGED_FRAMES);

        let context = Self {
            cuda_device: config.cuda_device,
            model_path: config.model.clone(),
            use_gpu_solver: config.use_gpu_solver,
            execution_option: config.execution_option,
            sampling_rate,
            fps_numerator,
            fps_denominator,
            weight_count,
            channels,
            skin_weight_count,
            tongue_weight_count,
            state: Mutex::new(SessionState {
                bundle,
                staging,
                pending: Vec::new(),
                next_frame_index: 0,
                session_id: String::new(),
                socket: None,
                last_stream: None,
                scratch: Vec::new(),
            }),
        };
        context.reset_for_reuse()?;
        Ok(context)
    }

    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Bind the slot to a connection and mint a fresh session id.
    pub fn start(&self, socket: Arc<TcpStream>) {
        let mut state = self.lock_state();
        state.socket = Some(socket);
        state.session_id = Uuid::new_v4().simple().to_string();
        state.pending.clear();
        state.next_frame_index = 0;
    }

    /// Detach the slot from its connection.
    pub fn stop(&self) {
        let mut state = self.lock_state();
        state.socket = None;
    }

    pub fn session_id(&self) -> String {
        self.lock_state().session_id.clone()
    }

    pub fn weight_count(&self) -> usize {
        self.weight_count
    }

    /// Clear all executor and accumulator state and re-arm the neutral
    /// emotion, making the slot ready for the next client.
    pub fn reset_for_reuse(&self) -> Result<(), InferError> {
        let mut guard = self.lock_state();
        let state = &mut *guard;

        state.bundle.wait(TRACK);
        state.bundle.reset_track(TRACK);
        state.bundle.audio_accumulator_mut(TRACK).reset();
        state.bundle.emotion_accumulator_mut(TRACK).reset();

        // Neutral emotion for the lifetime of the session
        let stream = state.bundle.stream().clone();
        let emotion_size = state.bundle.emotion_accumulator(TRACK).emotion_size();
        let zeros = vec![0.0f32; emotion_size];
        state
            .bundle
            .emotion_accumulator_mut(TRACK)
            .accumulate(0, &zeros, &stream)?;
        state.bundle.emotion_accumulator_mut(TRACK).close();

        state.pending.clear();
        state.next_frame_index = 0;
        state.last_stream = None;
        Ok(())
    }

    pub fn describe_session_started(&self) -> Value {
        let state = self.lock_state();
        json!({
            "type": "SessionStarted",
            "protocol": {"version": wire::PROTOCOL_VERSION},
            "session_id": state.session_id,
            "model": self.model_path,
            "options": {
                "use_gpu_solver": self.use_gpu_solver,
                "execution_option": self.execution_option.as_str(),
            },
            "sampling_rate": self.sampling_rate,
            "frame_rate": {
                "numerator": self.fps_numerator,
                "denominator": self.fps_denominator,
            },
            "weight_count": self.weight_count,
            "channels": self.channels,
            "channel_groups": [
                {"name": "skin", "count": self.skin_weight_count},
                {"name": "tongue", "count": self.tongue_weight_count},
            ],
        })
    }

    /// Accumulate one PushAudio message and drain the executor, flushing
    /// finished frames to the bound socket in order.
    ///
    /// Errors are reported to the client (where possible) before returning;
    /// the session stays bound either way.
    pub fn push_audio(&self, start_sample_index: i64, pcm: &[i16]) -> Result<(), SessionError> {
        if start_sample_index < 0 {
            let state = self.lock_state();
            return Err(report_error(&state.socket, SessionError::NegativeStartSample));
        }

        if let Err(err) = set_device(self.cuda_device) {
            let state = self.lock_state();
            return Err(report_error(
                &state.socket,
                SessionError::Internal(format!("Failed to set device: {err}")),
            ));
        }

        let mut guard = self.lock_state();
        let state = &mut *guard;
        if state.socket.is_none() {
            return Err(SessionError::Detached);
        }

        let accumulated = state.bundle.audio_accumulator(TRACK).nb_accumulated_samples();
        let start = start_sample_index as usize;
        if start < accumulated {
            return Err(report_error(&state.socket, SessionError::OutOfOrderAudio));
        }
        let gap = start - accumulated;
        if gap > MAX_GAP_SECONDS * self.sampling_rate as usize {
            return Err(report_error(&state.socket, SessionError::GapTooLarge));
        }

        let stream = state.bundle.stream().clone();
        if gap > 0 {
            state.scratch.clear();
            state.scratch.resize(gap, 0.0);
            state
                .bundle
                .audio_accumulator_mut(TRACK)
                .accumulate(&state.scratch, &stream);
        }

        state.scratch.clear();
        state
            .scratch
            .extend(pcm.iter().map(|&sample| f32::from(sample) / 32768.0));
        state
            .bundle
            .audio_accumulator_mut(TRACK)
            .accumulate(&state.scratch, &stream);

        let weight_count = self.weight_count;
        while state.bundle.nb_ready_tracks() > 0 {
            let SessionState {
                bundle,
                staging,
                pending,
                next_frame_index,
                socket,
                last_stream,
                ..
            } = state;

            let mut sink_error = None;
            let executed = bundle.execute(&mut |results| {
                if let Err(err) = stage_device_results(
                    staging,
                    pending,
                    next_frame_index,
                    last_stream,
                    weight_count,
                    results,
                ) {
                    sink_error = Some(err);
                }
            });

            if let Err(err) = executed {
                return Err(report_error(
                    socket,
                    SessionError::Internal(format!("Execute failed: {err}")),
                ));
            }
            if let Some(err) = sink_error {
                return Err(report_error(socket, err));
            }

            if pending.len() >= FLUSH_THRESHOLD_FRAMES {
                if let Err(err) =
                    flush_pending(socket, bundle, staging, pending, last_stream, weight_count)
                {
                    return Err(report_error(socket, err));
                }
            }
        }

        {
            let SessionState {
                bundle,
                staging,
                pending,
                socket,
                last_stream,
                ..
            } = state;
            if let Err(err) =
                flush_pending(socket, bundle, staging, pending, last_stream, weight_count)
            {
                return Err(report_error(socket, err));
            }
        }

        // Drop consumed audio/emotion history to bound memory
        let drop_audio_before = state.bundle.next_audio_sample_to_read(TRACK);
        state
            .bundle
            .audio_accumulator_mut(TRACK)
            .drop_samples_before(drop_audio_before);
        let drop_emotions_before = state.bundle.next_emotion_timestamp_to_read(TRACK);
        state
            .bundle
            .emotion_accumulator_mut(TRACK)
            .drop_emotions_before(drop_emotions_before);

        Ok(())
    }
}

/// Report `err` to the client when there is one to tell, then hand it back.
fn report_error(socket: &Option<Arc<TcpStream>>, err: SessionError) -> SessionError {
    if err.reportable() {
        if let Some(socket) = socket {
            let _ = wire::send_json(&mut &**socket, &wire::error_message(&err.to_string()));
        }
    }
    err
}

/// Stage one device result: schedule its copy into the next free staging
/// slot and queue the frame for flush. Empty weight vectors are skipped.
fn stage_device_results(
    staging: &PinnedBuffer,
    pending: &mut Vec<PendingFrame>,
    next_frame_index: &mut u64,
    last_stream: &mut Option<Stream>,
    weight_count: usize,
    results: &DeviceResults,
) -> Result<(), SessionError> {
    if results.weights.is_empty() {
        return Ok(());
    }
    if results.weights.len() != weight_count {
        return Err(SessionError::Internal(
            "Unexpected weight vector size from executor".to_string(),
        ));
    }
    if pending.len() >= MAX_STAGED_FRAMES {
        return Err(SessionError::Backpressure);
    }

    let slot_index = pending.len();
    staging
        .copy_from_device(slot_index * weight_count, &results.weights, &results.stream)
        .map_err(|err| SessionError::Internal(format!("Device to host copy failed: {err}")))?;

    *last_stream = Some(results.stream.clone());
    pending.push(PendingFrame {
        frame_index: *next_frame_index,
        timestamp_current: results.timestamp_current_frame,
        timestamp_next: results.timestamp_next_frame,
        slot_index,
    });
    *next_frame_index += 1;
    Ok(())
}

/// Synchronize the bundle stream and write every pending frame in enqueue
/// order, then clear the queue.
fn flush_pending(
    socket: &Option<Arc<TcpStream>>,
    bundle: &ExecutorBundle,
    staging: &PinnedBuffer,
    pending: &mut Vec<PendingFrame>,
    last_stream: &Option<Stream>,
    weight_count: usize,
) -> Result<(), SessionError> {
    if pending.is_empty() {
        return Ok(());
    }
    if last_stream.is_none() {
        return Err(SessionError::Internal(
            "Internal error: no stream associated with pending frames".to_string(),
        ));
    }

    bundle.stream().synchronize();

    let Some(socket) = socket else {
        return Err(SessionError::Detached);
    };
    for frame in pending.iter() {
        let weights = staging.read(frame.slot_index * weight_count, weight_count);
        let payload = wire::encode_blendshape_frame(
            frame.frame_index,
            frame.timestamp_current,
            frame.timestamp_next,
            &weights,
        );
        write_frame(&mut &**socket, Opcode::Binary, &payload)
            .map_err(|err| SessionError::Io(err.to_string()))?;
    }
    pending.clear();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use visage_infer::DeviceTensor;

    fn results(weights: Vec<f32>, stream: &Stream) -> DeviceResults {
        DeviceResults {
            track: 0,
            weights: DeviceTensor::from_vec(weights),
            stream: stream.clone(),
            timestamp_current_frame: 0,
            timestamp_next_frame: 266,
        }
    }

    #[test]
    fn test_staging_slots_follow_queue_order() {
        let stream = Stream::new();
        let staging = PinnedBuffer::new(2 * MAX_STAGED_FRAMES);
        let mut pending = Vec::new();
        let mut next_frame_index = 0;
        let mut last_stream = None;

        for _ in 0..3 {
            stage_device_results(
                &staging,
                &mut pending,
                &mut next_frame_index,
                &mut last_stream,
                2,
                &results(vec![0.5, 0.5], &stream),
            )
            .unwrap();
        }

        assert_eq!(next_frame_index, 3);
        assert!(last_stream.is_some());
        for (i, frame) in pending.iter().enumerate() {
            assert_eq!(frame.frame_index, i as u64);
            assert_eq!(frame.slot_index, i);
        }
    }

    #[test]
    fn test_staging_caps_at_max_pending_frames() {
        let stream = Stream::new();
        let staging = PinnedBuffer::new(MAX_STAGED_FRAMES);
        let mut pending = Vec::new();
        let mut next_frame_index = 0;
        let mut last_stream = None;

        for _ in 0..MAX_STAGED_FRAMES {
            stage_device_results(
                &staging,
                &mut pending,
                &mut next_frame_index,
                &mut last_stream,
                1,
                &results(vec![0.1], &stream),
            )
            .unwrap();
        }

        let overflow = stage_device_results(
            &staging,
            &mut pending,
            &mut next_frame_index,
            &mut last_stream,
            1,
            &results(vec![0.1], &stream),
        );
        let err = overflow.unwrap_err();
        assert!(matches!(err, SessionError::Backpressure));
        assert_eq!(err.to_string(), "Too many pending frames (client too slow?)");
        assert_eq!(pending.len(), MAX_STAGED_FRAMES);
    }

    #[test]
    fn test_staging_skips_empty_weights() {
        let stream = Stream::new();
        let staging = PinnedBuffer::new(4);
        let mut pending = Vec::new();
        let mut next_frame_index = 0;
        let mut last_stream = None;

        stage_device_results(
            &staging,
            &mut pending,
            &mut next_frame_index,
            &mut last_stream,
            2,
            &results(Vec::new(), &stream),
        )
        .unwrap();

        assert!(pending.is_empty());
        assert_eq!(next_frame_index, 0);
        assert!(last_stream.is_none());
    }

    #[test]
    fn test_staging_rejects_wrong_weight_count() {
        let stream = Stream::new();
        let staging = PinnedBuffer::new(4);
        let mut pending = Vec::new();
        let mut next_frame_index = 0;
        let mut last_stream = None;

        let err = stage_device_results(
            &staging,
            &mut pending,
            &mut next_frame_index,
            &mut last_stream,
            2,
            &results(vec![0.1, 0.2, 0.3], &stream),
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "Unexpected weight vector size from executor");
    }

    #[test]
    fn test_flush_requires_recorded_stream() {
        let mut pending = vec![PendingFrame {
            frame_index: 0,
            timestamp_current: 0,
            timestamp_next: 266,
            slot_index: 0,
        }];
        let staging = PinnedBuffer::new(1);
        let bundle = test_bundle();
        let err = flush_pending(&None, &bundle, &staging, &mut pending, &None, 1).unwrap_err();
        assert!(err.to_string().contains("no stream"), "{err}");
    }

    fn test_bundle() -> ExecutorBundle {
        use std::io::Write;
        let path = std::env::temp_dir().join(format!(
            "visage-session-test-{}-bundle.json",
            std::process::id()
        ));
        let mut file = std::fs::File::create(&path).expect("create temp model");
        file.write_all(
            br#"{
                "name": "test",
                "sampling_rate": 16000,
                "emotion_size": 1,
                "skin": {"poses": ["jawOpen"]},
                "tongue": {"poses": []}
            }"#,
        )
        .expect("write temp model");
        let bundle = ExecutorBundle::read_regression(
            1,
            &path,
            ExecutionOption::SkinTongue,
            true,
            60,
            1,
        )
        .expect("bundle init failed");
        std::fs::remove_file(path).ok();
        bundle
    }
}
