//! Subcommand runners.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use cpal::traits::{DeviceTrait, StreamTrait};
use crossbeam_channel::{Receiver, select, unbounded};
use track_engine::demux::{ContainerDemuxer, Demuxer};
use track_engine::source::FileSource;
use track_engine::{
    ChannelListener, EngineConfig, FileOpener, OrderedExecutor, OutputFormat, PlaybackPool,
    SampleEncoding, TrackDescriptor, TrackEndReason, TrackEvent, TrackExecutor,
};

use crate::device;
use crate::output::{OutputCounters, build_output_stream};

const PROGRESS_INTERVAL: Duration = Duration::from_secs(5);
const PROVIDE_TIMEOUT: Duration = Duration::from_millis(250);

/// Output overrides of the `render` subcommand.
#[derive(Clone, Copy, Debug, Default)]
pub struct RenderFormat {
    pub rate: Option<u32>,
    pub channels: Option<u16>,
    pub encoding: Option<SampleEncoding>,
}

#[derive(Debug)]
struct ProbeReport {
    container: &'static str,
    codec: &'static str,
    sample_rate: u32,
    channels: u16,
    bits_per_sample: Option<u32>,
    duration_ms: Option<u64>,
}

pub fn list_devices() -> Result<()> {
    let host = cpal::default_host();
    device::list_devices(&host)
}

/// Inspect every path on the playback pool and print the results in order.
pub fn run_probe(config: EngineConfig, paths: Vec<PathBuf>) -> Result<()> {
    let pool = Arc::new(PlaybackPool::new(&config)?);
    let ordered = OrderedExecutor::new(pool);
    let (tx, rx) = unbounded();

    for (idx, path) in paths.iter().enumerate() {
        let tx = tx.clone();
        let key = path.parent().map(Path::to_path_buf).unwrap_or_default();
        let path = path.clone();
        ordered.submit(key, move || {
            let _ = tx.send((idx, probe_file(&path)));
        })?;
    }
    drop(tx);

    let mut results: Vec<_> = rx.iter().collect();
    results.sort_by_key(|(idx, _)| *idx);
    let mut failed = 0;
    for ((_, result), path) in results.into_iter().zip(&paths) {
        match result {
            Ok(report) => print_report(path, &report),
            Err(e) => {
                failed += 1;
                println!("{}: error: {e:#}", path.display());
            }
        }
    }
    if failed > 0 {
        return Err(anyhow!("{failed} of {} files could not be probed", paths.len()));
    }
    Ok(())
}

fn probe_file(path: &Path) -> Result<ProbeReport> {
    let source = FileSource::open(path).with_context(|| format!("open {}", path.display()))?;
    let demuxer = ContainerDemuxer::open(Box::new(source))?;
    let params = demuxer.params();
    Ok(ProbeReport {
        container: params.container.label(),
        codec: params.codec_label,
        sample_rate: params.sample_rate,
        channels: params.channels,
        bits_per_sample: params.bits_per_sample,
        duration_ms: demuxer.duration_ms(),
    })
}

fn print_report(path: &Path, report: &ProbeReport) {
    let bits = report
        .bits_per_sample
        .map(|b| format!(" {b}-bit"))
        .unwrap_or_default();
    let duration = report
        .duration_ms
        .map(format_ms)
        .unwrap_or_else(|| "unknown".to_string());
    println!(
        "{}: {} / {}, {} Hz, {} ch{bits}, duration {duration}",
        path.display(),
        report.container,
        report.codec,
        report.sample_rate,
        report.channels,
    );
}

fn format_ms(ms: u64) -> String {
    let secs = ms / 1000;
    format!("{}:{:02}.{:03}", secs / 60, secs % 60, ms % 1000)
}

/// Decode `path` into `out` as raw interleaved PCM.
pub fn run_render(
    mut config: EngineConfig,
    path: &Path,
    out: &Path,
    seek_ms: Option<u64>,
    format: RenderFormat,
) -> Result<()> {
    config.output = OutputFormat {
        channels: format.channels.unwrap_or(config.output.channels),
        sample_rate: format.rate.unwrap_or(config.output.sample_rate),
        encoding: format.encoding.unwrap_or(config.output.encoding),
    };
    let pool = PlaybackPool::new(&config)?;
    let (executor, events) = spawn_local_track(&pool, config.clone(), path)?;
    if let Some(ms) = seek_ms {
        executor.set_position(ms);
    }

    let file = File::create(out).with_context(|| format!("create {}", out.display()))?;
    let mut writer = BufWriter::new(file);
    let mut bytes = 0u64;
    let mut last_report = Instant::now();
    loop {
        match executor.provide(PROVIDE_TIMEOUT) {
            Some(frame) => {
                writer.write_all(&frame.data).context("write pcm")?;
                bytes += frame.data.len() as u64;
            }
            None if executor.state().is_terminal() => break,
            None => {}
        }
        if last_report.elapsed() >= PROGRESS_INTERVAL {
            last_report = Instant::now();
            tracing::info!(position_ms = executor.position(), bytes, "rendering");
        }
    }
    writer.flush().context("flush pcm")?;

    let reason = wait_for_end(&events)?;
    tracing::info!(
        out = %out.display(),
        bytes,
        position_ms = executor.position(),
        rate_hz = config.output.sample_rate,
        channels = config.output.channels,
        encoding = %config.output.encoding,
        "render complete"
    );
    match reason {
        TrackEndReason::Finished => Ok(()),
        other => Err(anyhow!("track ended early: {other:?}")),
    }
}

/// Play `path` on an output device until it ends or Ctrl-C is pressed.
pub fn run_play(
    mut config: EngineConfig,
    path: &Path,
    device_name: Option<&str>,
    seek_ms: Option<u64>,
) -> Result<()> {
    let host = cpal::default_host();
    let device = device::pick_device(&host, device_name)?;
    tracing::info!(device = %device.description()?, "output device");

    let source_rate = probe_file(path)?.sample_rate;
    let supported = device::pick_output_config(&device, source_rate)?;
    let stream_config: cpal::StreamConfig = supported.config();
    config.output = OutputFormat {
        channels: stream_config.channels,
        sample_rate: stream_config.sample_rate,
        encoding: SampleEncoding::F32Le,
    };
    tracing::info!(
        source_rate_hz = source_rate,
        output_rate_hz = stream_config.sample_rate,
        channels = stream_config.channels,
        sample_format = ?supported.sample_format(),
        "device output config"
    );

    let pool = PlaybackPool::new(&config)?;
    let (executor, events) = spawn_local_track(&pool, config, path)?;
    if let Some(ms) = seek_ms {
        executor.set_position(ms);
    }

    let (interrupt_tx, interrupt_rx) = crossbeam_channel::bounded(1);
    ctrlc::set_handler(move || {
        let _ = interrupt_tx.try_send(());
    })
    .context("install Ctrl-C handler")?;

    let counters = Arc::new(OutputCounters::default());
    let stream = build_output_stream(
        &device,
        &stream_config,
        supported.sample_format(),
        executor.clone(),
        counters.clone(),
    )?;
    stream.play()?;

    let reason = loop {
        select! {
            recv(events) -> event => match event {
                Ok(TrackEvent::Ended(reason)) => break reason,
                Ok(TrackEvent::Exception { message, fatal }) => {
                    tracing::warn!(fatal, "track error: {message}");
                }
                Ok(TrackEvent::Stuck(threshold)) => {
                    tracing::warn!(threshold_ms = threshold.as_millis() as u64, "track stuck, stopping");
                    executor.stop();
                }
                Ok(TrackEvent::Started) => {}
                Err(_) => return Err(anyhow!("track listener disconnected")),
            },
            recv(interrupt_rx) -> _ => {
                tracing::info!("interrupted, stopping track");
                executor.stop();
            }
        }
    };

    if reason == TrackEndReason::Finished {
        // Let the device play out what the callback already took.
        std::thread::sleep(Duration::from_millis(200));
    }
    drop(stream);
    tracing::info!(
        ?reason,
        position_ms = executor.position(),
        played_frames = counters.played_frames.load(Ordering::Relaxed),
        underrun_events = counters.underrun_events.load(Ordering::Relaxed),
        underrun_frames = counters.underrun_frames.load(Ordering::Relaxed),
        "playback ended"
    );
    match reason {
        TrackEndReason::LoadFailed => Err(anyhow!("track failed to play")),
        _ => Ok(()),
    }
}

fn spawn_local_track(
    pool: &PlaybackPool,
    config: EngineConfig,
    path: &Path,
) -> Result<(TrackExecutor, Receiver<TrackEvent>)> {
    let descriptor = TrackDescriptor::local(path.to_string_lossy());
    let executor = TrackExecutor::new(descriptor, Arc::new(FileOpener), Arc::new(config), None);
    let (tx, rx) = unbounded();
    pool.spawn_track(executor.clone(), Arc::new(ChannelListener::new(tx)))?;
    Ok((executor, rx))
}

fn wait_for_end(events: &Receiver<TrackEvent>) -> Result<TrackEndReason> {
    let mut error: Option<String> = None;
    for event in events.iter() {
        match event {
            TrackEvent::Ended(reason) => {
                return match (reason, error) {
                    (TrackEndReason::LoadFailed, Some(message)) => Err(anyhow!(message)),
                    (reason, _) => Ok(reason),
                };
            }
            TrackEvent::Exception { message, fatal: true } => error = Some(message),
            TrackEvent::Exception { message, fatal: false } => {
                tracing::warn!("track warning: {message}");
            }
            TrackEvent::Stuck(_) | TrackEvent::Started => {}
        }
    }
    Err(anyhow!("track listener disconnected"))
}
