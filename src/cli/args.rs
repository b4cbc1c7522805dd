use clap::{Args as ClapArgs, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "vidshift")]
#[command(about = "Video conversion service with bounded, self-cleaning jobs", long_about = None)]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<CliCommand>,
}

#[derive(Subcommand, Debug)]
pub enum CliCommand {
    /// Run the HTTP gateway (default)
    Serve,
    /// Run a single job locally and write the result next to you
    Process(ProcessCliArgs),
    /// Show the effective configuration
    Config(ConfigCliArgs),
    /// Check that ffmpeg and yt-dlp are usable
    Check,
    /// Print version information
    Version,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperationKind {
    Convert,
    Compress,
    ExtractAudio,
    Trim,
}

#[derive(ClapArgs, Debug)]
pub struct ProcessCliArgs {
    /// Local file path or video URL
    pub input: String,
    /// Operation to apply
    #[arg(long, value_enum, default_value = "convert")]
    pub op: OperationKind,
    /// Target container (convert, trim) or audio format (extract-audio)
    #[arg(short, long)]
    pub format: Option<String>,
    /// Compression quality: low, medium, high
    #[arg(long)]
    pub quality: Option<String>,
    /// Audio bitrate preset: low (128k), medium (192k), high (320k)
    #[arg(long)]
    pub bitrate: Option<String>,
    /// Start timestamp (seconds, MM:SS or H:MM:SS)
    #[arg(long)]
    pub start: Option<String>,
    /// End timestamp, or +N for N seconds after start
    #[arg(long)]
    pub end: Option<String>,
    /// Full operation as JSON; overrides the flags above
    #[arg(long)]
    pub json: Option<String>,
    /// Where to write the result (file or directory, default: current directory)
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

#[derive(ClapArgs, Debug)]
pub struct ConfigCliArgs {
    /// Print only the config file location
    #[arg(long)]
    pub path: bool,
}
