// Encoding Argument Builder
// Maps destination configuration to typed FFmpeg command-line arguments

use crate::models::{EncodingSettings, RateControl, VideoEncoder};

/// Input read/write timeout in microseconds
const RW_TIMEOUT_US: u64 = 5_000_000;
const MAX_MUXING_QUEUE_SIZE: u32 = 1024;
const DEFAULT_X264_PRESET: &str = "veryfast";

/// One FFmpeg argument: an option with its value, or the trailing output URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FfmpegArg {
    Opt { flag: &'static str, value: String },
    Output(String),
}

/// Ordered FFmpeg argument list, rendered to tokens only at spawn time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FfmpegArgs {
    args: Vec<FfmpegArg>,
}

impl FfmpegArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn opt(&mut self, flag: &'static str, value: impl ToString) -> &mut Self {
        self.args.push(FfmpegArg::Opt {
            flag,
            value: value.to_string(),
        });
        self
    }

    pub fn output(&mut self, url: impl Into<String>) -> &mut Self {
        self.args.push(FfmpegArg::Output(url.into()));
        self
    }

    pub fn append(&mut self, other: FfmpegArgs) -> &mut Self {
        self.args.extend(other.args);
        self
    }

    pub fn args(&self) -> &[FfmpegArg] {
        &self.args
    }

    /// Value of the first occurrence of `flag`
    pub fn value_of(&self, flag: &str) -> Option<&str> {
        self.args.iter().find_map(|arg| match arg {
            FfmpegArg::Opt { flag: f, value } if *f == flag => Some(value.as_str()),
            _ => None,
        })
    }

    /// Position of `flag` in option order, ignoring values
    pub fn position_of(&self, flag: &str) -> Option<usize> {
        self.args.iter().position(|arg| matches!(arg, FfmpegArg::Opt { flag: f, .. } if *f == flag))
    }

    pub fn to_tokens(&self) -> Vec<String> {
        let mut tokens = Vec::with_capacity(self.args.len() * 2);
        for arg in &self.args {
            match arg {
                FfmpegArg::Opt { flag, value } => {
                    tokens.push((*flag).to_string());
                    tokens.push(value.clone());
                }
                FfmpegArg::Output(url) => tokens.push(url.clone()),
            }
        }
        tokens
    }
}

/// Video/audio codec arguments for one destination.
/// Absent settings or the copy encoder produce a plain stream copy.
pub fn build_output_args(encoding: Option<&EncodingSettings>) -> FfmpegArgs {
    let mut args = FfmpegArgs::new();

    let enc = match encoding {
        Some(enc) if !enc.is_passthrough() => enc,
        _ => {
            args.opt("-c", "copy");
            return args;
        }
    };

    args.opt("-c:v", enc.encoder.as_str());

    if let Some(bitrate) = enc.bitrate.filter(|b| *b > 0) {
        args.opt("-b:v", format!("{bitrate}k"));
        match enc.rate_control {
            RateControl::Vbr => {
                let maxrate = (bitrate as f64 * 1.5).round() as u64;
                args.opt("-maxrate", format!("{maxrate}k"))
                    .opt("-bufsize", format!("{}k", bitrate as u64 * 2));
            }
            RateControl::Cbr => {
                args.opt("-maxrate", format!("{bitrate}k"))
                    .opt("-bufsize", format!("{bitrate}k"));
            }
        }
    }

    if enc.encoder == VideoEncoder::Libx264 {
        let preset = enc
            .x264_preset
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .unwrap_or(DEFAULT_X264_PRESET);
        args.opt("-preset", preset).opt("-tune", "zerolatency");
    }

    if let Some(scale) = enc.resolution.scale() {
        args.opt("-vf", format!("scale={scale}"));
    }

    let fps = enc.fps.fixed();
    if let Some(fps) = fps {
        args.opt("-r", fps);
    }

    if let Some(interval) = enc.keyframe_interval.filter(|i| *i > 0) {
        match fps {
            Some(fps) => {
                args.opt("-g", u64::from(fps) * u64::from(interval));
            }
            None => {
                args.opt("-force_key_frames", format!("expr:gte(t,n_forced*{interval})"));
            }
        }
    }

    args.opt("-c:a", "copy");
    args
}

/// Full relay command: ingest input, codec arguments, FLV muxing, then the publish URL
pub fn build_relay_args(
    ingest_url: &str,
    encoding: Option<&EncodingSettings>,
    buffer_micros: Option<u64>,
    target_url: &str,
) -> FfmpegArgs {
    let mut args = FfmpegArgs::new();
    args.opt("-rw_timeout", RW_TIMEOUT_US);

    if let Some(us) = buffer_micros {
        args.opt("-fflags", "+genpts+discardcorrupt")
            .opt("-analyzeduration", us)
            .opt("-probesize", us);
    }

    args.opt("-i", ingest_url);
    args.append(build_output_args(encoding));
    args.opt("-f", "flv").opt("-flvflags", "no_duration_filesize");

    if let Some(us) = buffer_micros {
        args.opt("-max_muxing_queue_size", MAX_MUXING_QUEUE_SIZE)
            .opt("-max_interleave_delta", us);
    }

    args.output(target_url);
    args
}

/// Short synthetic publish used to verify a destination accepts the stream key
pub fn build_test_publish_args(target_url: &str, duration_secs: u32) -> FfmpegArgs {
    let mut args = FfmpegArgs::new();
    args.opt("-f", "lavfi")
        .opt("-i", "color=black:s=160x90:r=1")
        .opt("-f", "lavfi")
        .opt("-i", "anullsrc=r=44100:cl=mono")
        .opt("-t", duration_secs)
        .opt("-c:v", "libx264")
        .opt("-preset", "ultrafast")
        .opt("-tune", "zerolatency")
        .opt("-b:v", "100k")
        .opt("-c:a", "aac")
        .opt("-ar", 44100)
        .opt("-f", "flv")
        .output(target_url);
    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FrameRate, Resolution};

    fn tokens(args: &FfmpegArgs) -> Vec<String> {
        args.to_tokens()
    }

    #[test]
    fn test_passthrough_is_plain_copy() {
        assert_eq!(tokens(&build_output_args(None)), vec!["-c", "copy"]);

        let enc = EncodingSettings {
            encoder: VideoEncoder::Copy,
            bitrate: Some(6000),
            resolution: Resolution::P720,
            ..Default::default()
        };
        assert_eq!(tokens(&build_output_args(Some(&enc))), vec!["-c", "copy"]);
    }

    #[test]
    fn test_libx264_720p30() {
        let enc = EncodingSettings {
            encoder: VideoEncoder::Libx264,
            bitrate: Some(3500),
            resolution: Resolution::P720,
            fps: FrameRate::Fixed(30),
            keyframe_interval: Some(2),
            ..Default::default()
        };
        assert_eq!(
            tokens(&build_output_args(Some(&enc))),
            vec![
                "-c:v", "libx264", "-b:v", "3500k", "-maxrate", "3500k", "-bufsize", "3500k",
                "-preset", "veryfast", "-tune", "zerolatency", "-vf", "scale=1280:720",
                "-r", "30", "-g", "60", "-c:a", "copy",
            ]
        );
    }

    #[test]
    fn test_large_gop_does_not_overflow() {
        let enc = EncodingSettings {
            encoder: VideoEncoder::Libx264,
            fps: FrameRate::Fixed(100_000),
            keyframe_interval: Some(100_000),
            ..Default::default()
        };
        let args = build_output_args(Some(&enc));
        assert_eq!(args.value_of("-g"), Some("10000000000"));
    }

    #[test]
    fn test_vbr_caps() {
        let enc = EncodingSettings {
            encoder: VideoEncoder::Nvenc,
            bitrate: Some(3333),
            rate_control: RateControl::Vbr,
            ..Default::default()
        };
        let args = build_output_args(Some(&enc));
        assert_eq!(args.value_of("-maxrate"), Some("5000k"));
        assert_eq!(args.value_of("-bufsize"), Some("6666k"));
        assert_eq!(args.value_of("-preset"), None);
    }

    #[test]
    fn test_source_resolution_and_fps_emit_nothing() {
        let enc = EncodingSettings {
            encoder: VideoEncoder::Qsv,
            ..Default::default()
        };
        assert_eq!(
            tokens(&build_output_args(Some(&enc))),
            vec!["-c:v", "h264_qsv", "-c:a", "copy"]
        );
    }

    #[test]
    fn test_keyframes_forced_for_source_fps() {
        let enc = EncodingSettings {
            encoder: VideoEncoder::Libx264,
            keyframe_interval: Some(2),
            x264_preset: Some("fast".to_string()),
            ..Default::default()
        };
        let args = build_output_args(Some(&enc));
        assert_eq!(args.value_of("-force_key_frames"), Some("expr:gte(t,n_forced*2)"));
        assert_eq!(args.value_of("-g"), None);
        assert_eq!(args.value_of("-preset"), Some("fast"));
        assert_eq!(tokens(&args).last().map(String::as_str), Some("copy"));
    }

    #[test]
    fn test_relay_args_without_buffer() {
        let args = build_relay_args("rtmp://localhost:1935/live/stream", None, None, "rtmp://a/b/key");
        assert_eq!(
            tokens(&args),
            vec![
                "-rw_timeout", "5000000", "-i", "rtmp://localhost:1935/live/stream",
                "-c", "copy", "-f", "flv", "-flvflags", "no_duration_filesize", "rtmp://a/b/key",
            ]
        );
    }

    #[test]
    fn test_relay_buffer_flag_placement() {
        let args = build_relay_args("rtmp://in", None, Some(2_000_000), "rtmp://out/key");
        let input = args.position_of("-i").unwrap();

        for flag in ["-fflags", "-analyzeduration", "-probesize"] {
            assert!(args.position_of(flag).unwrap() < input, "{flag} must precede -i");
        }
        let flvflags = args.position_of("-flvflags").unwrap();
        for flag in ["-max_muxing_queue_size", "-max_interleave_delta"] {
            assert!(args.position_of(flag).unwrap() > flvflags, "{flag} must follow the muxer");
        }
        assert_eq!(args.value_of("-analyzeduration"), Some("2000000"));
        assert_eq!(args.value_of("-max_muxing_queue_size"), Some("1024"));
        assert_eq!(tokens(&args).last().map(String::as_str), Some("rtmp://out/key"));
    }

    #[test]
    fn test_publish_args_target_last() {
        let args = build_test_publish_args("rtmp://host/app/key", 3);
        let tokens = tokens(&args);
        assert_eq!(tokens.last().map(String::as_str), Some("rtmp://host/app/key"));
        assert_eq!(args.value_of("-t"), Some("3"));
        assert!(tokens.contains(&"anullsrc=r=44100:cl=mono".to_string()));
    }
}
