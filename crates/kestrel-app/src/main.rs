// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
mod config;
mod layers;

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use kestrel_core::init_tracing;
use kestrel_platform::Platform;
use kestrel_render::{Event, FrameStatus, RenderSize, Renderer, SkipReason};
use kestrel_render_vk::VkRenderer;
use tracing::{debug, info};

use crate::config::load_cfg;
use crate::layers::{BackgroundLayer, SceneViewLayer};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the TOML configuration
    #[arg(long, default_value = "kestrel.toml")]
    config: PathBuf,
}

/// What one loop iteration does with the events it drained.
#[derive(Debug, PartialEq, Eq)]
struct FramePlan {
    /// Only the final size of a burst is worth a swapchain rebuild.
    resize: Option<RenderSize>,
    draw: bool,
}

fn plan_frame(events: &[Event], closing: bool) -> FramePlan {
    let resize = events.iter().rev().find_map(|e| match *e {
        Event::WindowResize { width, height } => Some(RenderSize::new(width, height)),
        _ => None,
    });
    let close_seen = events.iter().any(|e| matches!(e, Event::WindowClose));
    FramePlan {
        resize,
        draw: !(closing || close_seen),
    }
}

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let cfg = load_cfg(&args.config);

    let mut platform = Platform::new(cfg.window_spec()).context("open window")?;
    let window = platform.window();
    let mut renderer = VkRenderer::new(
        window,
        window,
        platform.framebuffer_size(),
        cfg.vk_settings(),
    )
    .context("vk init")?;

    // Registration order: background first, so the scene view sees events first.
    renderer.push_layer(Box::new(BackgroundLayer::new()));
    renderer.push_layer(Box::new(SceneViewLayer::new(
        cfg.scene.clear_color,
        cfg.scene.spin_speed,
    )));

    let mut frames: u32 = 0;
    let mut last_fps_instant = Instant::now();

    while !platform.should_close() {
        platform.poll_events();

        let events: Vec<Event> = platform.drain_events().collect();
        let plan = plan_frame(&events, platform.should_close());
        if let Some(size) = plan.resize {
            renderer.resize(size)?;
        }
        for event in &events {
            if renderer.dispatch_event(event) {
                debug!("{event} handled");
            }
        }
        if !plan.draw {
            break;
        }

        match renderer.render()? {
            // count only frames that were actually presented
            FrameStatus::Presented => frames = frames.saturating_add(1),
            // minimised: nothing to draw until the next resize
            FrameStatus::Skipped(SkipReason::Paused) => std::thread::sleep(Duration::from_millis(16)),
            FrameStatus::Skipped(reason) => debug!("frame skipped: {reason:?}"),
        }

        let now = Instant::now();
        if now.duration_since(last_fps_instant).as_secs_f32() >= 1.0 {
            info!("fps ~ {}", frames);
            frames = 0;
            last_fps_instant = now;
        }
    }

    info!("window closed");
    // Renderer holds the surface; it goes before the window.
    drop(renderer);
    drop(platform);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resize(width: u32, height: u32) -> Event {
        Event::WindowResize { width, height }
    }

    #[test]
    fn burst_of_resizes_keeps_the_last() {
        let events = [
            resize(800, 600),
            Event::MouseMoved { x: 1.0, y: 2.0 },
            resize(1024, 768),
        ];
        let plan = plan_frame(&events, false);
        assert_eq!(plan.resize, Some(RenderSize::new(1024, 768)));
        assert!(plan.draw);
        assert_eq!(plan_frame(&events[1..2], false).resize, None);
    }

    #[test]
    fn minimise_after_resize_wins() {
        let plan = plan_frame(&[resize(800, 600), resize(0, 0)], false);
        assert_eq!(plan.resize, Some(RenderSize::new(0, 0)));
    }

    #[test]
    fn close_skips_the_draw() {
        let plan = plan_frame(&[Event::MouseMoved { x: 0.0, y: 0.0 }, Event::WindowClose], true);
        assert!(!plan.draw);
        assert!(!plan_frame(&[], true).draw);
        assert!(!plan_frame(&[Event::WindowClose], false).draw);
        assert!(plan_frame(&[], false).draw);
    }
}
