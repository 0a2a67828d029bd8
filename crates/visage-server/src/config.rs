//! Server configuration and StartSession validation.
//!
//! The model, frame rate and solver options are fixed at startup; a
//! StartSession request may restate any of them, and a restated value that
//! disagrees with the server is a validation error.

use clap::{ArgAction, Parser};
use serde_json::Value;
use visage_infer::ExecutionOption;

/// WebSocket blendshape inference gateway.
#[derive(Debug, Parser)]
#[command(name = "visage-server", version)]
pub struct Args {
    /// Bind host (IPv4)
    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,

    /// Bind port
    #[arg(long, default_value_t = 8765)]
    pub port: u16,

    /// CUDA device id
    #[arg(long = "cuda_device", default_value_t = 0)]
    pub cuda_device: i32,

    /// Max concurrent sessions
    #[arg(long = "max_sessions", default_value_t = 4)]
    pub max_sessions: usize,

    /// Path to model.json
    #[arg(long, default_value = "data/default/model.json")]
    pub model: String,

    /// Use diffusion model
    #[arg(long, default_value_t = false, action = ArgAction::Set)]
    pub diffusion: bool,

    /// Diffusion identity index
    #[arg(long = "identity", default_value_t = 0)]
    pub identity: usize,

    /// Diffusion constant noise
    #[arg(long = "constant_noise", default_value_t = true, action = ArgAction::Set)]
    pub constant_noise: bool,

    /// Execution option: SkinTongue|Skin|Tongue|None
    #[arg(long = "execution_option", default_value = "SkinTongue")]
    pub execution_option: String,

    /// Frame rate numerator (denominator is 1)
    #[arg(long, default_value_t = 60)]
    pub fps: u32,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub cuda_device: i32,
    pub max_sessions: usize,
    pub model: String,
    pub diffusion: bool,
    pub diffusion_identity: usize,
    pub diffusion_constant_noise: bool,
    pub execution_option: ExecutionOption,
    pub fps_numerator: u32,
    pub fps_denominator: u32,
    pub use_gpu_solver: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8765,
            cuda_device: 0,
            max_sessions: 4,
            model: "data/default/model.json".to_string(),
            diffusion: false,
            diffusion_identity: 0,
            diffusion_constant_noise: true,
            execution_option: ExecutionOption::SkinTongue,
            fps_numerator: 60,
            fps_denominator: 1,
            use_gpu_solver: true,
        }
    }
}

impl ServerConfig {
    /// Resolve parsed CLI arguments; fails on an unknown execution option.
    pub fn from_args(args: Args) -> Result<Self, String> {
        let execution_option: ExecutionOption = args.execution_option.parse()?;
        Ok(Self {
            host: args.host,
            port: args.port,
            cuda_device: args.cuda_device,
            max_sessions: args.max_sessions,
            model: args.model,
            diffusion: args.diffusion,
            diffusion_identity: args.identity,
            diffusion_constant_noise: args.constant_noise,
            execution_option,
            fps_numerator: args.fps,
            fps_denominator: 1,
            use_gpu_solver: true,
        })
    }
}

/// Canonical form for model-path comparison: separators normalized, edges
/// trimmed, a leading `./` removed. Lowercased only on case-insensitive
/// filesystems.
pub fn canonicalize_model_path(path: &str) -> String {
    let mut s: String = path
        .chars()
        .map(|c| {
            let c = if c == '\\' { '/' } else { c };
            if cfg!(windows) {
                c.to_ascii_lowercase()
            } else {
                c
            }
        })
        .collect();
    while s.ends_with(|c: char| c == '/' || c.is_whitespace()) {
        s.pop();
    }
    let s = s.trim_start();
    let s = s.strip_prefix("./").unwrap_or(s);
    s.to_string()
}

/// Canonical form for execution-option comparison: lowercase ASCII
/// alphanumerics only.
pub fn canonicalize_execution_option(option: &str) -> String {
    option
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

fn is_integer(value: &Value) -> bool {
    value.is_i64() || value.is_u64()
}

/// Parse a client frame rate: either a positive integer fps or an object
/// `{numerator, denominator}`.
fn parse_frame_rate(value: &Value) -> Result<(u64, u64), String> {
    if is_integer(value) {
        let fps = value.as_i64().unwrap_or(-1);
        if fps <= 0 {
            return Err("fps must be > 0".to_string());
        }
        return Ok((fps as u64, 1));
    }
    if let Some(object) = value.as_object() {
        let (Some(numerator), Some(denominator)) =
            (object.get("numerator"), object.get("denominator"))
        else {
            return Err("frame_rate must contain numerator and denominator".to_string());
        };
        if !is_integer(numerator) || !is_integer(denominator) {
            return Err("frame_rate numerator/denominator must be integers".to_string());
        }
        let numerator = numerator.as_i64().unwrap_or(-1);
        let denominator = denominator.as_i64().unwrap_or(-1);
        if numerator <= 0 || denominator <= 0 {
            return Err("frame_rate numerator/denominator must be > 0".to_string());
        }
        return Ok((numerator as u64, denominator as u64));
    }
    Err("fps must be an integer or an object {numerator,denominator}".to_string())
}

/// Check a StartSession request against the SessionStarted description the
/// server is about to send. Absent request fields are accepted; present ones
/// must match the server.
pub fn validate_start_session(request: &Value, session_started: &Value) -> Result<(), String> {
    if let Some(model) = request.get("model") {
        let Some(model) = model.as_str() else {
            return Err("StartSession.model must be a string".to_string());
        };
        let requested = canonicalize_model_path(model);
        let actual = canonicalize_model_path(
            session_started.get("model").and_then(Value::as_str).unwrap_or(""),
        );
        if !actual.is_empty() && requested != actual {
            return Err("Requested model does not match server model".to_string());
        }
    }

    let frame_rate_request = request.get("frame_rate").or_else(|| request.get("fps"));
    if let Some(value) = frame_rate_request {
        let (requested_num, requested_den) = parse_frame_rate(value)?;

        let Some(frame_rate) = session_started.get("frame_rate").and_then(Value::as_object)
        else {
            return Err("Internal error: missing frame_rate in SessionStarted".to_string());
        };
        let (Some(actual_num), Some(actual_den)) = (
            frame_rate.get("numerator").and_then(Value::as_u64),
            frame_rate.get("denominator").and_then(Value::as_u64),
        ) else {
            return Err("Internal error: invalid frame_rate in SessionStarted".to_string());
        };

        if requested_num != actual_num || requested_den != actual_den {
            return Err(format!(
                "Requested frame_rate {requested_num}/{requested_den} does not match server {actual_num}/{actual_den}"
            ));
        }
    }

    if let Some(options) = request.get("options") {
        let Some(options) = options.as_object() else {
            return Err("StartSession.options must be an object".to_string());
        };
        let Some(actual_options) = session_started.get("options").and_then(Value::as_object)
        else {
            return Err("Internal error: missing options in SessionStarted".to_string());
        };

        if let Some(use_gpu) = options.get("use_gpu_solver") {
            let Some(use_gpu) = use_gpu.as_bool() else {
                return Err("options.use_gpu_solver must be boolean".to_string());
            };
            let actual_gpu = actual_options
                .get("use_gpu_solver")
                .and_then(Value::as_bool)
                .unwrap_or(true);
            if use_gpu != actual_gpu {
                return Err("options.use_gpu_solver does not match server".to_string());
            }
        }

        if let Some(execution_option) = options.get("execution_option") {
            let Some(execution_option) = execution_option.as_str() else {
                return Err("options.execution_option must be a string".to_string());
            };
            let requested = canonicalize_execution_option(execution_option);
            let actual = canonicalize_execution_option(
                actual_options
                    .get("execution_option")
                    .and_then(Value::as_str)
                    .unwrap_or(""),
            );
            if !actual.is_empty() && requested != actual {
                return Err("options.execution_option does not match server".to_string());
            }
        }
    }

    Ok(())
}
