//! CLI handler for running a single job locally.
//!
//! Goes through the same controller as the gateway, so limits, timeouts and
//! workspace cleanup behave identically.

use anyhow::{anyhow, bail, Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::args::{OperationKind, ProcessCliArgs};
use crate::config::Config;
use crate::job::{FileInput, InputSpec, JobController};
use crate::media::{
    AudioBitrate, AudioFormat, Operation, Quality, TimeRange, ToolAdapter, VideoFormat,
};

/// User id recorded for jobs started from the command line.
const LOCAL_USER_ID: i64 = 0;

pub async fn handle_process_command(args: ProcessCliArgs) -> Result<()> {
    let operation = build_operation(&args)?;
    let config = Config::load()?;
    let policy = config.policy()?;
    let adapter = ToolAdapter::from_config(&config.tools)?;
    let controller = JobController::new(policy, Arc::new(adapter));

    let input = if is_url(&args.input) {
        InputSpec::Url(args.input.clone())
    } else {
        let path = Path::new(&args.input);
        InputSpec::File(
            FileInput::open(path)
                .await
                .with_context(|| format!("Failed to open {}", path.display()))?,
        )
    };

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling job");
            on_interrupt.cancel();
        }
    });

    println!("Running {operation} on {}...", args.input);
    let report = controller
        .submit(LOCAL_USER_ID, input, operation, &cancel)
        .await;

    let delivery = match report.outcome {
        Ok(delivery) => delivery,
        Err(failure) => bail!("Job failed ({}): {}", failure.kind, failure.message),
    };

    let stem = input_stem(&args.input);
    let mut written = Vec::new();
    for output in delivery.outputs() {
        let dest = destination(output, &stem, args.output.as_deref())?;
        tokio::fs::copy(output, &dest)
            .await
            .with_context(|| format!("Failed to write {}", dest.display()))?;
        written.push(dest);
    }
    if let Err(e) = delivery.acknowledge().await {
        warn!("Failed to clean up workspace: {}", e);
    }

    for path in &written {
        info!("Wrote {:?}", path);
        println!("✓ {}", path.display());
    }
    Ok(())
}

/// Turn command-line flags (or `--json`) into an operation.
pub fn build_operation(args: &ProcessCliArgs) -> Result<Operation> {
    if let Some(json) = &args.json {
        return serde_json::from_str(json).context("Invalid --json operation");
    }

    let range = match &args.start {
        Some(start) => Some(TimeRange::parse(start, args.end.as_deref())?),
        None if args.end.is_some() => bail!("--end requires --start"),
        None => None,
    };

    let operation = match args.op {
        OperationKind::Convert => {
            let format = args
                .format
                .as_deref()
                .ok_or_else(|| anyhow!("convert needs --format"))?
                .parse::<VideoFormat>()?;
            Operation::Convert { format }
        }
        OperationKind::Compress => Operation::Compress {
            quality: parse_or_default::<Quality>(args.quality.as_deref())?,
        },
        OperationKind::ExtractAudio => Operation::ExtractAudio {
            format: parse_or_default::<AudioFormat>(args.format.as_deref())?,
            bitrate: parse_or_default::<AudioBitrate>(args.bitrate.as_deref())?,
            range,
        },
        OperationKind::Trim => Operation::Trim {
            range: range.ok_or_else(|| anyhow!("trim needs --start"))?,
            format: args
                .format
                .as_deref()
                .map(str::parse::<VideoFormat>)
                .transpose()?,
        },
    };
    Ok(operation)
}

fn parse_or_default<T>(value: Option<&str>) -> Result<T>
where
    T: std::str::FromStr + Default,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match value {
        Some(v) => Ok(v.parse()?),
        None => Ok(T::default()),
    }
}

fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

fn input_stem(input: &str) -> String {
    if is_url(input) {
        return "download".to_string();
    }
    Path::new(input)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("output")
        .to_string()
}

/// Where to copy one job output. A requested path that is an existing
/// directory (or absent) gets `<stem>.<ext>` inside it.
fn destination(output: &Path, stem: &str, requested: Option<&Path>) -> Result<PathBuf> {
    let ext = output
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("out");
    let file_name = format!("{stem}-vidshift.{ext}");

    match requested {
        Some(path) if path.is_dir() => Ok(path.join(file_name)),
        Some(path) => Ok(path.to_path_buf()),
        None => Ok(std::env::current_dir()
            .context("Failed to determine current directory")?
            .join(file_name)),
    }
}
