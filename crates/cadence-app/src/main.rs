// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::Result;
use cadence_core::init_tracing;
use cadence_platform::PlatformWindow;
use cadence_render::{FrameOutcome, Renderer, SurfaceSource};
use cadence_render_vk::{FrameConfig, PresentSync, VkRenderer, VkVsyncMode};
use clap::Parser;
use serde::Deserialize;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the TOML config file
    #[arg(long, default_value = "cadence.toml")]
    config: PathBuf,
    /// Override `render.frames_in_flight`
    #[arg(long)]
    frames_in_flight: Option<usize>,
    /// Exit after this many presented frames
    #[arg(long)]
    max_frames: Option<u64>,
    #[arg(long, default_value_t = 1280)]
    width: u32,
    #[arg(long, default_value_t = 720)]
    height: u32,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq)]
struct RenderCfg {
    #[serde(default = "default_clear")]
    clear_color: [f32; 4],
    #[serde(default = "default_frames")]
    frames_in_flight: usize,
    #[serde(default)]
    vsync_mode: VsyncMode,
    #[serde(default)]
    present_sync: PresentSyncCfg,
    #[serde(default)]
    fence_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
enum VsyncMode {
    Fifo,
    #[default]
    Mailbox,
}

#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
enum PresentSyncCfg {
    #[default]
    PerImage,
    PerSlot,
}

#[derive(Debug, Deserialize, Default, PartialEq)]
struct AppCfg {
    #[serde(default)]
    render: RenderCfg,
}

impl Default for RenderCfg {
    fn default() -> Self {
        RenderCfg {
            clear_color: default_clear(),
            frames_in_flight: default_frames(),
            vsync_mode: VsyncMode::Mailbox,
            present_sync: PresentSyncCfg::PerImage,
            fence_timeout_ms: None,
        }
    }
}

fn default_clear() -> [f32; 4] {
    [0.02, 0.02, 0.04, 1.0]
}
fn default_frames() -> usize {
    2
}

impl RenderCfg {
    fn to_frame_config(self, frames_override: Option<usize>) -> FrameConfig {
        FrameConfig {
            frames_in_flight: frames_override.unwrap_or(self.frames_in_flight),
            vsync_mode: match self.vsync_mode {
                VsyncMode::Fifo => VkVsyncMode::Fifo,
                VsyncMode::Mailbox => VkVsyncMode::Mailbox,
            },
            present_sync: match self.present_sync {
                PresentSyncCfg::PerImage => PresentSync::PerImage,
                PresentSyncCfg::PerSlot => PresentSync::PerSlot,
            },
            fence_timeout: self.fence_timeout_ms.map(Duration::from_millis),
            ..FrameConfig::default()
        }
    }
}

fn parse_cfg(text: &str) -> Result<AppCfg, toml::de::Error> {
    toml::from_str::<AppCfg>(text)
}

fn load_cfg(path: &Path) -> AppCfg {
    match fs::read_to_string(path) {
        Ok(s) => parse_cfg(&s).unwrap_or_else(|e| {
            warn!("{}: {e}; using defaults", path.display());
            AppCfg::default()
        }),
        Err(e) if e.kind() == ErrorKind::NotFound => AppCfg::default(),
        Err(e) => {
            warn!("{}: {e}; using defaults", path.display());
            AppCfg::default()
        }
    }
}

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let cfg = load_cfg(&args.config);
    let frame_cfg = cfg.render.to_frame_config(args.frames_in_flight);
    info!(
        "frames in flight = {}, vsync = {:?}, present sync = {:?}",
        frame_cfg.frames_in_flight, frame_cfg.vsync_mode, frame_cfg.present_sync
    );

    let mut platform = PlatformWindow::new("cadence", args.width, args.height)?;
    let window = platform.window();
    let mut renderer = VkRenderer::new(&*window, &*window, &mut platform, frame_cfg)?;
    renderer.set_clear_color(cfg.render.clear_color);

    let mut presented: u64 = 0;
    let mut frames: u32 = 0;
    let mut last_fps_instant = Instant::now();

    loop {
        if !platform.pump() || platform.is_closing() {
            break;
        }
        if let Some(size) = platform.take_resize() {
            renderer.resize(size);
        }

        match renderer.render(&mut platform)? {
            FrameOutcome::Presented => {
                presented += 1;
                frames = frames.saturating_add(1);
            }
            FrameOutcome::Skipped => {}
            FrameOutcome::Closing => break,
        }
        if args.max_frames.is_some_and(|max| presented >= max) {
            info!("presented {presented} frames, stopping");
            break;
        }

        let now = Instant::now();
        if now.duration_since(last_fps_instant).as_secs_f32() >= 1.0 {
            info!("fps ~ {}", frames);
            frames = 0;
            last_fps_instant = now;
        }
    }

    renderer.drain()?;
    let stats = renderer.stats();
    info!(
        "shutdown: {} ticks, {} presented, {} recreations, {} timeouts",
        stats.ticks, stats.presented, stats.recreations, stats.timeouts
    );
    drop(renderer);
    drop(window);
    Ok(())
}
