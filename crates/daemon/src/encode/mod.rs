//! Encoder adapter: locating ffmpeg and converting one file to AIFF.

pub mod ffmpeg;
pub mod locate;

pub use ffmpeg::{
    build_ffmpeg_command, convert, is_target_format, stderr_tail, unique_output_path,
    unique_path, EncodeError, DEFAULT_CONVERT_TIMEOUT, STDERR_TAIL_CHARS, TARGET_EXTENSION,
};
pub use locate::{
    encoder_candidates, locate_encoder, parse_ffmpeg_version, probe_encoder, EncoderInfo,
    DEFAULT_PROBE_TIMEOUT, ENCODER_COMMAND,
};
