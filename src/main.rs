//! Multicam-capture binary: negotiates streams from a catalog and prints the
//! frame sets it receives.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use multicam_stream::validation::validate_frame_order;
use multicam_stream::{
    CameraInfo, CameraSession, PixelFormat, Preset, Stream, StreamMode, V4L2Device,
};

/// Capture from a multi-sensor camera described by a TOML catalog.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Camera catalog (TOML).
    catalog: PathBuf,

    /// `/dev/video` index of each subdevice, in subdevice order.
    #[arg(short, long = "device", required = true)]
    devices: Vec<usize>,

    /// Explicit stream request, e.g. `color:640x480:yuyv@30`.
    #[arg(short, long = "stream")]
    streams: Vec<StreamSpec>,

    /// Preset request, e.g. `depth=best-quality`.
    #[arg(short, long = "preset")]
    presets: Vec<PresetSpec>,

    /// Number of frame sets to capture.
    #[arg(short, long, default_value_t = 30)]
    frames: usize,

    /// Give up on a frame set after this many milliseconds.
    #[arg(long, default_value_t = 2000)]
    timeout_ms: u64,
}

#[derive(Debug, Clone, Copy)]
struct StreamSpec {
    stream: Stream,
    width: u32,
    height: u32,
    format: PixelFormat,
    fps: u32,
}

impl FromStr for StreamSpec {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let usage = || format!("expected stream:WxH:format@fps, got {s:?}");
        let mut parts = s.split(':');
        let (Some(stream), Some(size), Some(rest), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            bail!(usage());
        };
        let (width, height) = size.split_once('x').with_context(usage)?;
        let (format, fps) = rest.split_once('@').with_context(usage)?;

        Ok(Self {
            stream: stream.parse::<Stream>().map_err(anyhow::Error::msg)?,
            width: width.parse().with_context(usage)?,
            height: height.parse().with_context(usage)?,
            format: format.parse::<PixelFormat>().map_err(anyhow::Error::msg)?,
            fps: fps.parse().with_context(usage)?,
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct PresetSpec {
    stream: Stream,
    preset: Preset,
}

impl FromStr for PresetSpec {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (stream, preset) = s
            .split_once('=')
            .with_context(|| format!("expected stream=preset, got {s:?}"))?;
        Ok(Self {
            stream: stream.parse::<Stream>().map_err(anyhow::Error::msg)?,
            preset: preset.parse::<Preset>().map_err(anyhow::Error::msg)?,
        })
    }
}

/// The stream pacing each frame set: the one with the highest framerate.
fn fastest_stream(modes: &[StreamMode]) -> Option<Stream> {
    modes
        .iter()
        .max_by_key(|mode| mode.fps)
        .map(|mode| mode.stream)
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(err) = run(&Args::parse()) {
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
}

fn run(args: &Args) -> anyhow::Result<()> {
    let info = CameraInfo::load(&args.catalog)
        .with_context(|| format!("loading catalog {}", args.catalog.display()))?;
    println!("Camera: {}", info.name);

    let device = V4L2Device::new(args.devices.clone(), info.calibration.clone());
    let mut session = CameraSession::new(device, info);

    for request in &args.streams {
        session.enable_stream(
            request.stream,
            request.width,
            request.height,
            request.format,
            request.fps,
        )?;
    }
    for request in &args.presets {
        session.enable_stream_preset(request.stream, request.preset)?;
    }

    session.start_capture().context("starting capture")?;
    let modes: Vec<StreamMode> = Stream::ALL
        .into_iter()
        .filter_map(|stream| session.stream_mode(stream).ok())
        .collect();
    for mode in &modes {
        println!(
            "{}: {}x{} {} @ {}fps",
            mode.stream, mode.width, mode.height, mode.format, mode.fps
        );
    }
    let enabled: Vec<Stream> = modes.iter().map(|mode| mode.stream).collect();
    let paced = fastest_stream(&modes);

    let timeout = Duration::from_millis(args.timeout_ms);
    let mut numbers = Vec::with_capacity(args.frames);
    for set in 0..args.frames {
        if !session.wait_all_streams_timeout(timeout) {
            bail!("no frames within {timeout:?} (frame set {set})");
        }
        let line = enabled
            .iter()
            .map(|stream| {
                session
                    .frame_number(*stream)
                    .map(|number| format!("{stream}#{number}"))
            })
            .collect::<Result<Vec<_>, _>>()?
            .join(" ");
        println!("Frame set {set}: {line}");

        if let Some(stream) = paced {
            numbers.push(session.frame_number(stream)?);
        }
    }
    session.stop_capture();

    // catalogs without a frame-number decoder leave every number at zero
    if numbers.iter().any(|&number| number != 0) {
        if let Err(err) = validate_frame_order(&numbers) {
            warn!(error = %err, "Frame numbers out of order");
        }
    }
    for index in session.open_subdevices() {
        if let Some(stats) = session.subdevice_stats(index) {
            info!(
                subdevice = index,
                delivered = stats.frames_delivered,
                dropped = stats.frames_dropped,
                "Capture statistics"
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mode(stream: Stream, fps: u32) -> StreamMode {
        StreamMode {
            stream,
            width: 640,
            height: 480,
            format: PixelFormat::Yuyv,
            fps,
            intrinsics_index: 0,
        }
    }

    #[test]
    fn test_fastest_stream_paces_frame_sets() {
        let modes = [
            mode(Stream::Depth, 30),
            mode(Stream::Color, 60),
            mode(Stream::Infrared, 30),
        ];
        assert_eq!(fastest_stream(&modes), Some(Stream::Color));
        assert_eq!(fastest_stream(&[]), None);
    }

    #[test]
    fn test_stream_request_parsing() {
        let request: StreamSpec = "color:640x480:yuyv@30".parse().expect("valid request");
        assert_eq!(request.stream, Stream::Color);
        assert_eq!((request.width, request.height, request.fps), (640, 480, 30));
        assert!("color:640x480".parse::<StreamSpec>().is_err());
    }
}
