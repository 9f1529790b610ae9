use std::{
    env,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use framefeed::{
    config::{SchedMode, StreamConfig},
    feed::{
        frame::PixelFormat,
        scheduler::{Schedule, Scheduler},
    },
    remote::{
        time_micros,
        track::{h264_track, TrackSink},
        Broadcaster, EncodedFrame, OutputSink,
    },
};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

const RUN_FOR: Duration = Duration::from_secs(5);
const TRACK_QUEUE: usize = 64;

/// Diagonal gradient that scrolls with `tick`.
fn gradient(width: usize, height: usize, tick: usize) -> Vec<u8> {
    let mut pixels = vec![255u8; width * height * 4];
    for (i, px) in pixels.chunks_exact_mut(4).enumerate() {
        let (x, y) = (i % width, i / width);
        px[0] = ((x + tick * 4) % 256) as u8;
        px[1] = ((y + tick * 2) % 256) as u8;
        px[2] = ((x + y + tick) % 256) as u8;
    }
    pixels
}

fn render(scheduler: &Scheduler, config: &StreamConfig, stop: &AtomicBool) {
    let interval = Duration::from_secs_f32(1. / config.max_fps);
    let started = Instant::now();
    let mut keyframe_requested = false;
    let mut tick = 0;

    while !stop.load(Ordering::Relaxed) && started.elapsed() < RUN_FOR {
        let frame_started = Instant::now();
        let pixels = gradient(config.width, config.height, tick);
        scheduler.submit_pixels(
            &pixels,
            config.width,
            config.height,
            PixelFormat::Rgba,
            time_micros(),
        );
        if scheduler.mode() == SchedMode::Hook {
            scheduler.fire("readPixels");
            scheduler.fire("commit");
        }

        if !keyframe_requested && started.elapsed() >= RUN_FOR / 2 {
            info!("requesting keyframe");
            scheduler.request_keyframe();
            keyframe_requested = true;
        }

        tick += 1;
        thread::sleep(interval.saturating_sub(frame_started.elapsed()));
    }
    info!(frames = tick, "renderer finished");
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config_path = env::args_os().nth(1).map(PathBuf::from);
    let config = StreamConfig::load(config_path.as_deref())?;
    info!(
        width = config.width,
        height = config.height,
        max_fps = config.max_fps,
        mode = ?config.sched_mode,
        "starting"
    );

    let broadcaster = Arc::new(Broadcaster::new());
    broadcaster.add_fn(|frame: &Arc<EncodedFrame>| {
        debug!(
            index = frame.frame_index,
            bytes = frame.data.len(),
            pts = frame.presentation_timestamp_us,
            keyframe = frame.keyframe,
            "encoded frame"
        );
        if frame.keyframe {
            info!(index = frame.frame_index, "keyframe");
        }
    });
    let track = TrackSink::attach(
        broadcaster.clone(),
        h264_track("video", "framefeed"),
        TRACK_QUEUE,
    );

    let scheduler = {
        let config = config.clone();
        let output = OutputSink::new(broadcaster.clone());
        tokio::task::spawn_blocking(move || {
            Scheduler::start(&config, config.backend().factory(), output)
        })
        .await?
        .context("Failed to start encoder")?
    };
    let scheduler = Arc::new(scheduler);

    let stop = Arc::new(AtomicBool::new(false));
    let mut renderer = {
        let scheduler = scheduler.clone();
        let config = config.clone();
        let stop = stop.clone();
        tokio::task::spawn_blocking(move || render(&scheduler, &config, &stop))
    };

    tokio::select! {
        finished = &mut renderer => finished?,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted");
            stop.store(true, Ordering::Relaxed);
            renderer.await?;
        }
    }

    {
        let scheduler = scheduler.clone();
        tokio::task::spawn_blocking(move || scheduler.shutdown()).await?;
    }
    let stats = scheduler.stats();
    info!(
        received = stats.received,
        submitted = stats.submitted,
        delivered = stats.delivered,
        throttled = stats.throttled,
        overwritten = stats.overwritten,
        repeated = stats.repeated,
        timeouts = stats.timeouts,
        failed = stats.failed,
        "encoder stopped"
    );

    match track.finish().await {
        Ok(samples) => info!(samples, "track closed"),
        Err(e) => warn!(error = %e, "track sink failed"),
    }
    Ok(())
}
