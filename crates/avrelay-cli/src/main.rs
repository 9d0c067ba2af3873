//! avrelay command line.
//!
//! Builds one pipeline from the subcommand, wires Ctrl+C to its cancel flag
//! and runs it on the main thread until shutdown.

mod cli;
mod devices;

use std::process::ExitCode;
use std::sync::atomic::Ordering;
use std::thread;

use anyhow::{Context, Result};
use avrelay_device::{capture_device, playback_device};
use avrelay_engine::{create_pipeline, Sink, Source};
use avrelay_transport::{RtmpPlayer, RtmpPublisher};
use avrelay_types::{DeviceDirection, Direction, PipelineConfig, PipelineEvent};
use clap::Parser;
use crossbeam_channel::Receiver;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::cli::{Cli, Command};
use crate::devices::{print_devices, select_device};

/// Initialize logging on stderr; stdout may carry media for pipe devices.
fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| default.into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Create the device and the RTMP endpoint for the configured direction.
fn build_adapters(command: &Command, config: &PipelineConfig) -> Result<(Source, Sink)> {
    let kind = config.target_format.kind();
    let selector = command.common().and_then(|c| c.device.as_deref());

    match config.direction {
        Direction::Publish => {
            let spec = select_device(selector, DeviceDirection::Input, kind)?;
            let device = capture_device(&spec, kind)
                .with_context(|| format!("Cannot use capture device {spec}"))?;
            let publisher = RtmpPublisher::new(&config.url)?;
            info!(device = %spec, "Capture device selected");
            Ok((Source::capture(device), Sink::publish(Box::new(publisher))))
        }
        Direction::Play => {
            let spec = select_device(selector, DeviceDirection::Output, kind)?;
            let device = playback_device(&spec, kind)
                .with_context(|| format!("Cannot use playback device {spec}"))?;
            let player = RtmpPlayer::new(&config.url, kind)?;
            info!(device = %spec, "Playback device selected");
            Ok((Source::ingest(Box::new(player)), Sink::playback(device)))
        }
    }
}

/// Surface pipeline events until the pipeline is dropped.
fn log_events(events: Receiver<PipelineEvent>) {
    for event in events {
        match event {
            PipelineEvent::PhaseChanged { current, .. } => {
                info!(phase = current.name(), "Connection phase changed");
            }
            PipelineEvent::Reconnected { total } => info!(total, "Stream restored"),
            PipelineEvent::Closed => info!("Stream closed"),
            other => debug!(?other, "Pipeline event"),
        }
    }
}

fn run(cli: &Cli) -> Result<()> {
    if let Command::Devices { kind } = &cli.command {
        print_devices(kind.map(Into::into));
        return Ok(());
    }

    let config = cli.command.pipeline_config()?;
    let (source, sink) = build_adapters(&cli.command, &config)?;
    let (mut pipeline, events) = create_pipeline(config, source, sink)?;

    let cancel = pipeline.cancel_handle();
    ctrlc::set_handler(move || {
        cancel.store(true, Ordering::SeqCst);
    })
    .context("Failed to install signal handler")?;

    let logger = thread::Builder::new()
        .name("avrelay-events".into())
        .spawn(move || log_events(events))
        .context("Failed to spawn event thread")?;

    let result = pipeline.run();
    // Dropping the pipeline closes the event channel.
    drop(pipeline);
    if logger.join().is_err() {
        warn!("Event thread panicked");
    }

    result?;
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(&cli) {
        Ok(()) => {
            info!("Shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
