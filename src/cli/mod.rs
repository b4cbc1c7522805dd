pub mod args;
pub mod process;

use crate::config::Config;
use crate::global;
use crate::media::{resolve_tool, tool_available};
use anyhow::{bail, Context, Result};

pub use args::{Cli, CliCommand, ConfigCliArgs, OperationKind, ProcessCliArgs};
pub use process::{build_operation, handle_process_command};

pub fn handle_config_command(args: ConfigCliArgs) -> Result<()> {
    let path = global::config_file()?;
    if args.path {
        println!("{}", path.display());
        return Ok(());
    }

    let config = Config::load()?;
    let rendered = toml::to_string_pretty(&config).context("Failed to render config")?;
    println!("# {}", path.display());
    println!("{rendered}");
    println!("# workspace root: {}", config.workspace_root()?.display());
    Ok(())
}

pub async fn handle_check_command() -> Result<()> {
    let config = Config::load()?;
    let tools = [
        ("ffmpeg", resolve_tool(config.tools.ffmpeg_path.as_deref(), "ffmpeg")),
        ("yt-dlp", resolve_tool(config.tools.ytdlp_path.as_deref(), "yt-dlp")),
    ];

    let mut missing = Vec::new();
    for (name, path) in &tools {
        if tool_available(path).await {
            println!("✓ {name}: {}", path.display());
        } else {
            println!("✗ {name}: not usable at {}", path.display());
            missing.push(*name);
        }
    }

    if !missing.is_empty() {
        bail!("Missing tools: {}", missing.join(", "));
    }
    Ok(())
}
