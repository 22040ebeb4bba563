use std::path::PathBuf;

use anyhow::{Context, bail};
use clap::Parser;

use fluxdump::{CaptureConfig, KryofluxDevice, SideMode, UsbContext, capture_tracks};

/// Record raw per-track flux streams from a KryoFlux sampling device.
#[derive(Debug, Parser)]
#[command(name = "fluxdump")]
#[command(about = "KryoFlux raw flux stream capture")]
struct Args {
    /// Output base name; each track is written to <BASE>TT.S.raw
    #[arg(short = 'f', long = "file", value_name = "BASE")]
    file: String,

    /// Drive select
    #[arg(short = 'd', long, default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=1))]
    drive: u8,

    /// Drive density line: 0=L, 1=H
    #[arg(long, default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=1))]
    density: u8,

    /// First track to capture (defaults to 0)
    #[arg(short = 's', long, value_name = "TRK", value_parser = clap::value_parser!(u8).range(0..=83))]
    start: Option<u8>,

    /// Last track to capture (defaults to 83)
    #[arg(short = 'e', long, value_name = "TRK", value_parser = clap::value_parser!(u8).range(0..=83))]
    end: Option<u8>,

    /// Sides: 0=side 0 only, 1=side 1 only, 2=both
    #[arg(short = 'g', long = "side", default_value_t = 2, value_parser = clap::value_parser!(u8).range(0..=2))]
    side: u8,

    /// Track step: 1=80-track media, 2=40-track media
    #[arg(short = 'k', long = "step", default_value_t = 1, value_parser = clap::value_parser!(u8).range(1..=2))]
    step: u8,

    /// Firmware image uploaded when the device has none yet
    #[arg(long, value_name = "PATH", default_value = "firmware.bin")]
    firmware: PathBuf,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let min_track = 0u8;
    let max_track = 83u8;
    let cfg = CaptureConfig {
        basename: args.file,
        drive: args.drive,
        density: args.density,
        min_track,
        max_track,
        start_track: args.start.unwrap_or(min_track),
        end_track: args.end.unwrap_or(max_track),
        side_mode: SideMode::from_flag(args.side).context("side must be 0, 1 or 2")?,
        track_step: args.step,
        firmware_path: args.firmware,
    };
    if cfg.start_track > cfg.end_track {
        bail!(
            "start track {} is beyond end track {}",
            cfg.start_track,
            cfg.end_track
        );
    }

    let ctx = UsbContext::new().context("failed to initialize USB")?;
    let device =
        KryofluxDevice::open(&ctx, &cfg.firmware_path).context("device initialization failed")?;
    device
        .configure(cfg.drive, cfg.density, cfg.min_track, cfg.max_track)
        .context("device configuration failed")?;

    capture_tracks(&device, &cfg).context("capture failed")?;

    println!("\nEnjoy your shiny new disk image!");
    Ok(())
}
