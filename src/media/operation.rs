//! Requested transformations and their parameters.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum OperationError {
    #[error("invalid time '{0}': use seconds, MM:SS or H:MM:SS")]
    InvalidTimestamp(String),
    #[error("start time must not be negative")]
    NegativeStart,
    #[error("end time {end}s must be greater than start time {start}s")]
    EndBeforeStart { start: f64, end: f64 },
    #[error("unknown {kind} '{value}'")]
    UnknownValue { kind: &'static str, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoFormat {
    Mp4,
    Mkv,
    Avi,
    Mov,
    Webm,
    Gif,
}

impl VideoFormat {
    pub const ALL: [VideoFormat; 6] = [
        VideoFormat::Mp4,
        VideoFormat::Mkv,
        VideoFormat::Avi,
        VideoFormat::Mov,
        VideoFormat::Webm,
        VideoFormat::Gif,
    ];

    pub fn extension(&self) -> &'static str {
        match self {
            VideoFormat::Mp4 => "mp4",
            VideoFormat::Mkv => "mkv",
            VideoFormat::Avi => "avi",
            VideoFormat::Mov => "mov",
            VideoFormat::Webm => "webm",
            VideoFormat::Gif => "gif",
        }
    }

    /// Format implied by a file's extension, if it is one we can write.
    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|e| e.to_str())
            .and_then(|e| e.parse().ok())
    }
}

impl FromStr for VideoFormat {
    type Err = OperationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        VideoFormat::ALL
            .into_iter()
            .find(|f| f.extension() == lower)
            .ok_or(OperationError::UnknownValue {
                kind: "video format",
                value: s.to_string(),
            })
    }
}

impl fmt::Display for VideoFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    Low,
    #[default]
    Medium,
    High,
}

impl FromStr for Quality {
    type Err = OperationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Quality::Low),
            "medium" => Ok(Quality::Medium),
            "high" => Ok(Quality::High),
            _ => Err(OperationError::UnknownValue {
                kind: "quality",
                value: s.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    #[default]
    Mp3,
    Wav,
    Aac,
}

impl AudioFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            AudioFormat::Mp3 => "mp3",
            AudioFormat::Wav => "wav",
            AudioFormat::Aac => "aac",
        }
    }
}

impl FromStr for AudioFormat {
    type Err = OperationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mp3" => Ok(AudioFormat::Mp3),
            "wav" => Ok(AudioFormat::Wav),
            "aac" => Ok(AudioFormat::Aac),
            _ => Err(OperationError::UnknownValue {
                kind: "audio format",
                value: s.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AudioBitrate {
    #[serde(rename = "128k")]
    Low,
    #[default]
    #[serde(rename = "192k")]
    Medium,
    #[serde(rename = "320k")]
    High,
}

impl AudioBitrate {
    pub fn as_str(&self) -> &'static str {
        match self {
            AudioBitrate::Low => "128k",
            AudioBitrate::Medium => "192k",
            AudioBitrate::High => "320k",
        }
    }
}

impl FromStr for AudioBitrate {
    type Err = OperationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "128k" => Ok(AudioBitrate::Low),
            "192k" => Ok(AudioBitrate::Medium),
            "320k" => Ok(AudioBitrate::High),
            _ => Err(OperationError::UnknownValue {
                kind: "audio bitrate",
                value: s.to_string(),
            }),
        }
    }
}

/// A span of the input in seconds. `end = None` runs to the end of the input.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawTimeRange")]
pub struct TimeRange {
    start: f64,
    end: Option<f64>,
}

#[derive(Deserialize)]
struct RawTimeRange {
    #[serde(default)]
    start: f64,
    #[serde(default)]
    end: Option<f64>,
}

impl TryFrom<RawTimeRange> for TimeRange {
    type Error = OperationError;

    fn try_from(raw: RawTimeRange) -> Result<Self, Self::Error> {
        TimeRange::new(raw.start, raw.end)
    }
}

impl TimeRange {
    pub fn new(start: f64, end: Option<f64>) -> Result<Self, OperationError> {
        if !start.is_finite() || start < 0.0 {
            return Err(OperationError::NegativeStart);
        }
        if let Some(end) = end {
            if !end.is_finite() || end <= start {
                return Err(OperationError::EndBeforeStart { start, end });
            }
        }
        Ok(Self { start, end })
    }

    /// Parse user-typed bounds. The end may be written `+N` to mean N seconds
    /// after the start.
    pub fn parse(start: &str, end: Option<&str>) -> Result<Self, OperationError> {
        let start = parse_timestamp(start)?;
        let end = match end.map(str::trim).filter(|e| !e.is_empty()) {
            None => None,
            Some(rel) if rel.starts_with('+') => Some(start + parse_timestamp(&rel[1..])?),
            Some(abs) => Some(parse_timestamp(abs)?),
        };
        Self::new(start, end)
    }

    pub fn start(&self) -> f64 {
        self.start
    }

    pub fn end(&self) -> Option<f64> {
        self.end
    }
}

/// Parse `SS[.fff]`, `MM:SS` or `H:MM:SS` into seconds.
pub fn parse_timestamp(input: &str) -> Result<f64, OperationError> {
    let invalid = || OperationError::InvalidTimestamp(input.to_string());
    let text = input.trim();
    if text.is_empty() {
        return Err(invalid());
    }

    let parts: Vec<&str> = text.split(':').collect();
    let numbers = parts
        .iter()
        .map(|p| p.trim().parse::<f64>().map_err(|_| invalid()))
        .collect::<Result<Vec<_>, _>>()?;

    if numbers.iter().any(|n| !n.is_finite() || *n < 0.0) {
        return Err(if text.starts_with('-') {
            OperationError::NegativeStart
        } else {
            invalid()
        });
    }

    match numbers.as_slice() {
        [seconds] => Ok(*seconds),
        [minutes, seconds] => Ok(minutes * 60.0 + seconds),
        [hours, minutes, seconds] => Ok(hours * 3600.0 + minutes * 60.0 + seconds),
        _ => Err(invalid()),
    }
}

/// One user-requested transformation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    Convert {
        format: VideoFormat,
    },
    Compress {
        #[serde(default)]
        quality: Quality,
    },
    ExtractAudio {
        #[serde(default)]
        format: AudioFormat,
        #[serde(default)]
        bitrate: AudioBitrate,
        #[serde(default)]
        range: Option<TimeRange>,
    },
    Trim {
        range: TimeRange,
        #[serde(default)]
        format: Option<VideoFormat>,
    },
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Convert { .. } => "convert",
            Operation::Compress { .. } => "compress",
            Operation::ExtractAudio { .. } => "extract_audio",
            Operation::Trim { .. } => "trim",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Convert { format } => write!(f, "convert to {format}"),
            Operation::Compress { quality } => write!(f, "compress ({quality:?})"),
            Operation::ExtractAudio {
                format, bitrate, ..
            } => write!(f, "extract audio as {} {}", format.extension(), bitrate.as_str()),
            Operation::Trim { range, .. } => match range.end() {
                Some(end) => write!(f, "trim {}s-{}s", range.start(), end),
                None => write!(f, "trim from {}s", range.start()),
            },
        }
    }
}
