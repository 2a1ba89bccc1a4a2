use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use video_ingest::SourceDescriptor;

use crate::watch::{self, PipelineArgs, WatchSettings, monitor, server, telemetry};

#[derive(Debug, Parser)]
#[command(name = "aerial-watch", version, about = "Intruder watch: detection, alert snapshots and live MJPEG streaming")]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve the HTTP control surface and live feed.
    Serve(ServeArgs),
    /// Run the pipeline from the terminal, with a local preview window when available.
    Run(RunArgs),
}

#[derive(Debug, Args)]
struct ServeArgs {
    /// Address the HTTP server binds to.
    #[arg(long, value_name = "ADDR", default_value = "127.0.0.1:5000")]
    bind: String,
    #[command(flatten)]
    pipeline: PipelineArgs,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum SourceArg {
    Camera,
    Video,
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Which source to read from.
    #[arg(long, value_enum, default_value_t = SourceArg::Camera)]
    source: SourceArg,
    /// Video file to play when `--source video` is selected.
    #[arg(long, value_name = "PATH")]
    video: Option<PathBuf>,
    /// Only log to the terminal; never open a preview window.
    #[arg(long)]
    headless: bool,
    #[command(flatten)]
    pipeline: PipelineArgs,
}

pub fn handle(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Serve(args) => {
            let settings = WatchSettings::try_from(args.pipeline)?;
            let _telemetry = telemetry::init(&settings.telemetry);
            let control = watch::build_control(&settings)?;
            server::serve(control, settings.into(), args.bind)
        }
        Command::Run(args) => {
            let settings = WatchSettings::try_from(args.pipeline)?;
            let _telemetry = telemetry::init(&settings.telemetry);
            let source = match (args.source, args.video) {
                (SourceArg::Camera, None) => SourceDescriptor::Camera {
                    index: settings.camera_index,
                },
                (SourceArg::Camera, Some(_)) => bail!("--video requires --source video"),
                (SourceArg::Video, Some(path)) => SourceDescriptor::File { path },
                (SourceArg::Video, None) => bail!("--source video requires --video <path>"),
            };
            let control = watch::build_control(&settings)?;
            monitor::run_monitor(
                control,
                settings.pipeline.with_source(source),
                !args.headless,
            )
        }
    }
}
