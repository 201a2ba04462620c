//! redub - offline video dubbing
//!
//! Transcribes and translates the speech of a video, re-speaks it in the
//! original speaker's cloned voice and resynthesizes the lips to match.

use anyhow::Result;
use clap::Parser;
use std::path::Path;
use tracing::{info, Level};
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use redub::cli::{Args, Commands, quad};
use redub::config::Config;
use redub::lipsync::LipSyncRequest;
use redub::workflow::{DubOptions, Workflow};

const DEFAULT_CONFIG: &str = "redub.toml";

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Setup logging to both console and file
    setup_logging(args.verbose)?;

    if let Commands::InitConfig { output } = &args.command {
        Config::default().save_to_file(output)?;
        println!("Default configuration written to {}", output.display());
        return Ok(());
    }

    // Load configuration
    let mut config = match &args.config {
        Some(config_path) => Config::from_file(config_path)?,
        None => {
            if Path::new(DEFAULT_CONFIG).exists() {
                info!("Found {} in current directory, loading...", DEFAULT_CONFIG);
                Config::from_file(DEFAULT_CONFIG)?
            } else {
                Config::default()
            }
        }
    };

    match args.command {
        Commands::Dub {
            input,
            target_lang,
            output,
            remove_subtitles,
            no_time_stretch,
        } => {
            info!("Dubbing {} into {}", input.display(), target_lang);
            let options = DubOptions {
                target_language: target_lang,
                output,
                remove_subtitles: remove_subtitles || config.subtitles.enabled,
                time_stretch: config.voice.time_stretch && !no_time_stretch,
            };

            let workflow = Workflow::new(config)?;
            let report = workflow.dub(&input, &options).await?;
            for skip in report.skips() {
                println!("warning: {}", skip);
            }
            if let Some(output) = &report.output {
                println!("{}", output.display());
            }
        }
        Commands::Lipsync {
            face,
            audio,
            output,
            force_static,
            fps,
            pads,
            fixed_box,
            crop,
            resize_factor,
            rotate,
            nosmooth,
            face_det_batch_size,
            batch_size,
        } => {
            let lipsync = &mut config.lipsync;
            if let Some(fps) = fps {
                lipsync.static_fps = fps;
            }
            if let Some(pads) = quad(pads) {
                lipsync.pads = pads;
            }
            if let Some(fixed_box) = quad(fixed_box) {
                lipsync.fixed_box = Some(fixed_box);
            }
            if let Some(crop) = quad(crop) {
                lipsync.crop = Some(crop);
            }
            if let Some(factor) = resize_factor {
                lipsync.resize_factor = factor;
            }
            if let Some(size) = face_det_batch_size {
                lipsync.face_det_batch_size = size;
            }
            if let Some(size) = batch_size {
                lipsync.batch_size = size;
            }
            lipsync.rotate |= rotate;
            if nosmooth {
                lipsync.smoothing_window = 1;
            }
            config.validate()?;

            let lipsync = config.lipsync.clone();
            let request = LipSyncRequest {
                face,
                audio,
                output,
                force_static,
            };
            let workflow = Workflow::new(config)?;
            let report = workflow.lipsync(lipsync, &request).await?;
            info!(
                "Wrote {} frames ({} with detected faces) to {}",
                report.frames_written,
                report.valid_frames,
                request.output.display()
            );
        }
        Commands::Transcribe {
            input,
            output,
            target_lang,
        } => {
            info!("Transcribing: {}", input.display());
            let workflow = Workflow::new(config)?;
            workflow.transcribe(&input, &output, target_lang.as_deref()).await?;
        }
        Commands::ExtractReference {
            input,
            output,
            seconds,
        } => {
            let workflow = Workflow::new(config)?;
            workflow.extract_reference(&input, &output, seconds).await?;
        }
        Commands::InitConfig { .. } => {}
    }

    info!("redub completed successfully");
    Ok(())
}

/// Setup logging to both console and file
fn setup_logging(verbose: bool) -> Result<()> {
    let log_dir = std::env::current_dir()?.join(".redub").join("log");
    std::fs::create_dir_all(&log_dir)?;

    // Set up file appender with daily rotation
    let file_appender = rolling::daily(&log_dir, "redub.log");
    let (non_blocking_file, guard) = non_blocking(file_appender);
    // Keep the guard alive for the duration of the program
    std::mem::forget(guard);

    let log_level = if verbose { Level::DEBUG } else { Level::INFO };

    let console_layer = fmt::layer()
        .with_target(false)
        .with_file(true)
        .with_line_number(true);

    let file_layer = fmt::layer()
        .with_writer(non_blocking_file)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive(log_level.into()))
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    info!(
        "Logging initialized - console: {}, file: {}",
        log_level,
        log_dir.join("redub.log").display()
    );

    Ok(())
}
