//! FFmpeg-backed transformations.
//!
//! Every operation is planned as one or more ffmpeg invocations writing into
//! the job's destination directory. GIF output needs two passes: a palette is
//! generated first, then used to render the animation.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::operation::{AudioFormat, Operation, Quality, TimeRange, VideoFormat};
use super::process::ToolCommand;
use crate::job::{JobError, Step};

const GIF_FPS: u32 = 12;
const GIF_WIDTH: u32 = 640;
const GIF_DITHER: &str = "sierra2_4a";

/// The ffmpeg invocations needed for one operation.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscodePlan {
    pub passes: Vec<Vec<OsString>>,
    pub output: PathBuf,
}

pub struct FfmpegTranscoder {
    program: PathBuf,
}

impl FfmpegTranscoder {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Apply `operation` to `input`, writing only inside `dest_dir`.
    pub async fn transform(
        &self,
        input: &Path,
        operation: &Operation,
        dest_dir: &Path,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<PathBuf>, JobError> {
        let plan = plan(input, operation, dest_dir);
        let deadline = Instant::now() + timeout;

        for pass in plan.passes {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(JobError::Timeout {
                    step: Step::Transform,
                    after: timeout,
                });
            }

            let output = ToolCommand::new(&self.program, Step::Transform, remaining)
                .args(pass)
                .run(cancel)
                .await
                .map_err(|e| match e {
                    JobError::Timeout { step, .. } => JobError::Timeout {
                        step,
                        after: timeout,
                    },
                    other => other,
                })?;

            if !output.success() {
                warn!("ffmpeg exited with {}", output.status);
                return Err(JobError::Processing {
                    diagnostics: output.diagnostics(),
                });
            }
        }

        let produced = tokio::fs::metadata(&plan.output)
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        if produced == 0 {
            return Err(JobError::Processing {
                diagnostics: "ffmpeg finished but produced no output".to_string(),
            });
        }

        info!(
            "{} completed: {:?} -> {:?} ({} bytes)",
            operation, input, plan.output, produced
        );
        Ok(vec![plan.output])
    }
}

/// Build the ffmpeg passes for `operation`.
pub fn plan(input: &Path, operation: &Operation, dest_dir: &Path) -> TranscodePlan {
    match operation {
        Operation::Convert { format } => video_plan(input, *format, None, None, dest_dir),
        Operation::Compress { quality } => {
            let format = VideoFormat::from_path(input).unwrap_or(VideoFormat::Mp4);
            video_plan(input, format, Some(*quality), None, dest_dir)
        }
        Operation::Trim { range, format } => {
            let format = format
                .or_else(|| VideoFormat::from_path(input))
                .unwrap_or(VideoFormat::Mp4);
            video_plan(input, format, None, Some(range), dest_dir)
        }
        Operation::ExtractAudio {
            format,
            bitrate,
            range,
        } => {
            let output = dest_dir.join(format!("output.{}", format.extension()));
            let mut args = input_args(input);
            args.push("-vn".into());
            match format {
                AudioFormat::Mp3 => {
                    push(&mut args, &["-c:a", "libmp3lame", "-b:a", bitrate.as_str()]);
                }
                AudioFormat::Aac => {
                    push(&mut args, &["-c:a", "aac", "-b:a", bitrate.as_str()]);
                }
                AudioFormat::Wav => push(&mut args, &["-c:a", "pcm_s16le"]),
            }
            if let Some(range) = range {
                range_args(&mut args, range);
            }
            args.push(output.clone().into_os_string());
            TranscodePlan {
                passes: vec![args],
                output,
            }
        }
    }
}

fn video_plan(
    input: &Path,
    format: VideoFormat,
    quality: Option<Quality>,
    range: Option<&TimeRange>,
    dest_dir: &Path,
) -> TranscodePlan {
    let output = dest_dir.join(format!("output.{}", format.extension()));

    if format == VideoFormat::Gif {
        return gif_plan(input, range, dest_dir, output);
    }

    let mut args = input_args(input);
    if let Some(range) = range {
        range_args(&mut args, range);
    }

    match (format, quality, range.is_some()) {
        (VideoFormat::Webm, Some(quality), _) => {
            let crf = match quality {
                Quality::Low => "40",
                Quality::Medium => "34",
                Quality::High => "30",
            };
            push(
                &mut args,
                &[
                    "-c:v",
                    "libvpx-vp9",
                    "-crf",
                    crf,
                    "-b:v",
                    "0",
                    "-c:a",
                    "libopus",
                    "-b:a",
                    "96k",
                ],
            );
        }
        (_, Some(quality), _) => {
            let (crf, preset) = match quality {
                Quality::Low => ("28", "faster"),
                Quality::Medium => ("23", "medium"),
                Quality::High => ("20", "medium"),
            };
            push(&mut args, &["-c:v", "libx264", "-crf", crf, "-preset", preset]);
            push(&mut args, &["-c:a", "copy"]);
        }
        (VideoFormat::Mp4 | VideoFormat::Mkv | VideoFormat::Mov, None, true) => {
            push(
                &mut args,
                &[
                    "-c:v", "libx264", "-crf", "16", "-preset", "medium", "-c:a", "aac", "-b:a",
                    "192k", "-flags", "+global_header",
                ],
            );
        }
        _ => codec_defaults(&mut args, format),
    }

    if matches!(format, VideoFormat::Mp4 | VideoFormat::Mov) {
        push(&mut args, &["-movflags", "+faststart"]);
    }

    args.push(output.clone().into_os_string());
    TranscodePlan {
        passes: vec![args],
        output,
    }
}

fn codec_defaults(args: &mut Vec<OsString>, format: VideoFormat) {
    match format {
        VideoFormat::Mp4 | VideoFormat::Mkv | VideoFormat::Mov => push(
            args,
            &[
                "-c:v", "libx264", "-crf", "20", "-preset", "medium", "-pix_fmt", "yuv420p",
                "-c:a", "aac", "-b:a", "192k",
            ],
        ),
        VideoFormat::Webm => push(
            args,
            &[
                "-c:v", "libvpx-vp9", "-crf", "30", "-b:v", "0", "-deadline", "good", "-c:a",
                "libopus", "-b:a", "128k",
            ],
        ),
        VideoFormat::Avi => push(
            args,
            &["-c:v", "mpeg4", "-qscale:v", "3", "-c:a", "libmp3lame", "-b:a", "192k"],
        ),
        VideoFormat::Gif => {}
    }
}

fn gif_plan(
    input: &Path,
    range: Option<&TimeRange>,
    dest_dir: &Path,
    output: PathBuf,
) -> TranscodePlan {
    let palette = dest_dir.join("palette.png");
    let scale = format!("fps={GIF_FPS},scale={GIF_WIDTH}:-1:flags=lanczos");

    let mut first = Vec::new();
    let mut second = Vec::new();
    for args in [&mut first, &mut second] {
        push(args, &["-hide_banner", "-nostdin", "-y"]);
        if let Some(range) = range {
            seek_args(args, range);
        }
        args.push("-i".into());
        args.push(input.as_os_str().to_os_string());
    }

    first.push("-vf".into());
    first.push(format!("{scale},palettegen=stats_mode=diff").into());
    first.push(palette.clone().into_os_string());

    second.push("-i".into());
    second.push(palette.into_os_string());
    second.push("-filter_complex".into());
    second.push(
        format!("{scale}[x];[x][1:v]paletteuse=dither={GIF_DITHER}:diff_mode=rectangle").into(),
    );
    second.push(output.clone().into_os_string());

    TranscodePlan {
        passes: vec![first, second],
        output,
    }
}

fn input_args(input: &Path) -> Vec<OsString> {
    let mut args = Vec::new();
    push(&mut args, &["-hide_banner", "-nostdin", "-y", "-i"]);
    args.push(input.as_os_str().to_os_string());
    args
}

/// Output-side range: accurate cut after decoding.
fn range_args(args: &mut Vec<OsString>, range: &TimeRange) {
    args.push("-ss".into());
    args.push(range.start().to_string().into());
    if let Some(end) = range.end() {
        args.push("-to".into());
        args.push(end.to_string().into());
    }
}

/// Input-side range for the GIF passes, where `-to` is relative to the seek.
fn seek_args(args: &mut Vec<OsString>, range: &TimeRange) {
    args.push("-ss".into());
    args.push(range.start().to_string().into());
    if let Some(end) = range.end() {
        args.push("-t".into());
        args.push((end - range.start()).to_string().into());
    }
}

fn push(args: &mut Vec<OsString>, items: &[&str]) {
    args.extend(items.iter().map(OsString::from));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::operation::AudioBitrate;

    fn strings(pass: &[OsString]) -> Vec<String> {
        pass.iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    fn has_pair(args: &[String], key: &str, value: &str) -> bool {
        args.windows(2).any(|w| w[0] == key && w[1] == value)
    }

    #[test]
    fn test_convert_mp4_uses_h264_defaults() {
        let plan = plan(
            Path::new("/ws/input.mkv"),
            &Operation::Convert {
                format: VideoFormat::Mp4,
            },
            Path::new("/ws"),
        );
        assert_eq!(plan.output, PathBuf::from("/ws/output.mp4"));
        assert_eq!(plan.passes.len(), 1);
        let args = strings(&plan.passes[0]);
        assert!(has_pair(&args, "-c:v", "libx264"));
        assert!(has_pair(&args, "-crf", "20"));
        assert!(has_pair(&args, "-pix_fmt", "yuv420p"));
        assert!(has_pair(&args, "-movflags", "+faststart"));
        assert_eq!(args.last().unwrap(), "/ws/output.mp4");
    }

    #[test]
    fn test_convert_webm_and_avi_codecs() {
        let webm = plan(
            Path::new("/ws/input.mp4"),
            &Operation::Convert {
                format: VideoFormat::Webm,
            },
            Path::new("/ws"),
        );
        let args = strings(&webm.passes[0]);
        assert!(has_pair(&args, "-c:v", "libvpx-vp9"));
        assert!(has_pair(&args, "-c:a", "libopus"));

        let avi = plan(
            Path::new("/ws/input.mp4"),
            &Operation::Convert {
                format: VideoFormat::Avi,
            },
            Path::new("/ws"),
        );
        let args = strings(&avi.passes[0]);
        assert!(has_pair(&args, "-c:v", "mpeg4"));
        assert!(has_pair(&args, "-qscale:v", "3"));
    }

    #[test]
    fn test_gif_uses_palette_two_pass() {
        let plan = plan(
            Path::new("/ws/input.mp4"),
            &Operation::Convert {
                format: VideoFormat::Gif,
            },
            Path::new("/ws"),
        );
        assert_eq!(plan.passes.len(), 2);
        let first = strings(&plan.passes[0]);
        let second = strings(&plan.passes[1]);
        assert!(first.iter().any(|a| a.contains("palettegen")));
        assert_eq!(first.last().unwrap(), "/ws/palette.png");
        assert!(has_pair(&second, "-i", "/ws/palette.png"));
        assert!(second.iter().any(|a| a.contains("dither=sierra2_4a")));
        assert_eq!(plan.output, PathBuf::from("/ws/output.gif"));
    }

    #[test]
    fn test_compress_keeps_container_and_maps_quality() {
        let plan = plan(
            Path::new("/ws/input.mov"),
            &Operation::Compress {
                quality: Quality::Low,
            },
            Path::new("/ws"),
        );
        assert_eq!(plan.output, PathBuf::from("/ws/output.mov"));
        let args = strings(&plan.passes[0]);
        assert!(has_pair(&args, "-crf", "28"));
        assert!(has_pair(&args, "-preset", "faster"));
    }

    #[test]
    fn test_compress_unknown_container_falls_back_to_mp4() {
        let plan = plan(
            Path::new("/ws/input.3gp"),
            &Operation::Compress {
                quality: Quality::High,
            },
            Path::new("/ws"),
        );
        assert_eq!(plan.output, PathBuf::from("/ws/output.mp4"));
        assert!(has_pair(&strings(&plan.passes[0]), "-crf", "20"));
    }

    #[test]
    fn test_trim_sets_range_and_high_quality() {
        let range = TimeRange::new(5.0, Some(12.5)).unwrap();
        let plan = plan(
            Path::new("/ws/input.mp4"),
            &Operation::Trim {
                range,
                format: None,
            },
            Path::new("/ws"),
        );
        let args = strings(&plan.passes[0]);
        assert!(has_pair(&args, "-ss", "5"));
        assert!(has_pair(&args, "-to", "12.5"));
        assert!(has_pair(&args, "-crf", "16"));
        assert_eq!(plan.output, PathBuf::from("/ws/output.mp4"));
    }

    #[test]
    fn test_trim_to_gif_seeks_both_passes() {
        let range = TimeRange::new(2.0, Some(6.0)).unwrap();
        let plan = plan(
            Path::new("/ws/input.mp4"),
            &Operation::Trim {
                range,
                format: Some(VideoFormat::Gif),
            },
            Path::new("/ws"),
        );
        for pass in &plan.passes {
            let args = strings(pass);
            assert!(has_pair(&args, "-ss", "2"));
            assert!(has_pair(&args, "-t", "4"));
        }
    }

    #[test]
    fn test_extract_audio_variants() {
        let mp3 = plan(
            Path::new("/ws/input.mp4"),
            &Operation::ExtractAudio {
                format: AudioFormat::Mp3,
                bitrate: AudioBitrate::High,
                range: None,
            },
            Path::new("/ws"),
        );
        let args = strings(&mp3.passes[0]);
        assert!(args.contains(&"-vn".to_string()));
        assert!(has_pair(&args, "-c:a", "libmp3lame"));
        assert!(has_pair(&args, "-b:a", "320k"));
        assert_eq!(mp3.output, PathBuf::from("/ws/output.mp3"));

        let wav = plan(
            Path::new("/ws/input.mp4"),
            &Operation::ExtractAudio {
                format: AudioFormat::Wav,
                bitrate: AudioBitrate::Medium,
                range: Some(TimeRange::new(1.0, None).unwrap()),
            },
            Path::new("/ws"),
        );
        let args = strings(&wav.passes[0]);
        assert!(has_pair(&args, "-c:a", "pcm_s16le"));
        assert!(has_pair(&args, "-ss", "1"));
        assert!(!args.contains(&"-to".to_string()));
    }

    #[test]
    fn test_outputs_stay_inside_dest_dir() {
        let dest = Path::new("/ws/job-1");
        let ops = [
            Operation::Convert {
                format: VideoFormat::Gif,
            },
            Operation::Compress {
                quality: Quality::Medium,
            },
            Operation::ExtractAudio {
                format: AudioFormat::Aac,
                bitrate: AudioBitrate::Low,
                range: None,
            },
        ];
        for op in &ops {
            let plan = plan(Path::new("/elsewhere/input.mp4"), op, dest);
            assert!(plan.output.starts_with(dest));
            for pass in &plan.passes {
                let written = PathBuf::from(pass.last().unwrap());
                assert!(written.starts_with(dest), "{op:?} writes {written:?}");
            }
        }
    }

    #[tokio::test]
    async fn test_real_ffmpeg_conversion() {
        let available = std::process::Command::new("ffmpeg")
            .arg("-version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false);
        if !available {
            eprintln!("Skipping: FFmpeg not installed");
            return;
        }

        let dir = tempfile::TempDir::new().unwrap();
        let input = dir.path().join("input.mp4");
        let status = std::process::Command::new("ffmpeg")
            .args(["-hide_banner", "-loglevel", "error", "-f", "lavfi", "-i"])
            .arg("testsrc=duration=1:size=128x96:rate=10")
            .args(["-pix_fmt", "yuv420p", "-y"])
            .arg(&input)
            .status()
            .unwrap();
        if !status.success() {
            eprintln!("Skipping: could not synthesize test input");
            return;
        }

        let transcoder = FfmpegTranscoder::new("ffmpeg");
        let outputs = transcoder
            .transform(
                &input,
                &Operation::Convert {
                    format: VideoFormat::Mkv,
                },
                dir.path(),
                Duration::from_secs(60),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(outputs, vec![dir.path().join("output.mkv")]);
        assert!(outputs[0].metadata().unwrap().len() > 0);
    }

    #[tokio::test]
    async fn test_garbage_input_is_processing_error() {
        let available = std::process::Command::new("ffmpeg")
            .arg("-version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false);
        if !available {
            eprintln!("Skipping: FFmpeg not installed");
            return;
        }

        let dir = tempfile::TempDir::new().unwrap();
        let input = dir.path().join("input.mp4");
        std::fs::write(&input, b"definitely not a video").unwrap();

        let result = FfmpegTranscoder::new("ffmpeg")
            .transform(
                &input,
                &Operation::Compress {
                    quality: Quality::Medium,
                },
                dir.path(),
                Duration::from_secs(60),
                &CancellationToken::new(),
            )
            .await;
        match result {
            Err(JobError::Processing { diagnostics }) => assert!(!diagnostics.is_empty()),
            other => panic!("expected processing error, got {other:?}"),
        }
    }
}
