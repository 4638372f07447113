// SPDX-License-Identifier: CEPL-1.0
//! Window and event pumping on top of winit.
//!
//! The render loop owns control flow, so events are pumped on demand instead
//! of handing the thread to `run_app`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use cadence_render::{RenderSize, SurfaceSource};
use tracing::info;

pub use winit;

use winit::{
    application::ApplicationHandler,
    dpi::{LogicalSize, PhysicalSize},
    error::OsError,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    platform::pump_events::{EventLoopExtPumpEvents, PumpStatus},
    window::{Window, WindowId},
};

struct WindowState {
    title: String,
    initial: LogicalSize<u32>,
    window: Option<Arc<Window>>,
    create_error: Option<OsError>,
    size: RenderSize,
    pending_resize: Option<RenderSize>,
    close_requested: bool,
}

impl WindowState {
    fn new(title: &str, width: u32, height: u32) -> Self {
        Self {
            title: title.to_owned(),
            initial: LogicalSize::new(width, height),
            window: None,
            create_error: None,
            size: RenderSize::default(),
            pending_resize: None,
            close_requested: false,
        }
    }

    fn apply(&mut self, event: &WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                info!("CloseRequested");
                self.close_requested = true;
            }
            WindowEvent::Resized(new_size) => {
                let size = physical(*new_size);
                if size.is_zero_area() != self.size.is_zero_area() {
                    info!(
                        "Resized → {}x{} (zero area={})",
                        size.width,
                        size.height,
                        size.is_zero_area()
                    );
                }
                self.size = size;
                self.pending_resize = Some(size);
            }
            _ => {}
        }
    }
}

fn physical(size: PhysicalSize<u32>) -> RenderSize {
    RenderSize::new(size.width, size.height)
}

impl ApplicationHandler for WindowState {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }
        let attrs = Window::default_attributes()
            .with_title(self.title.clone())
            .with_inner_size(self.initial);
        match event_loop.create_window(attrs) {
            Ok(window) => {
                self.size = physical(window.inner_size());
                self.window = Some(Arc::new(window));
            }
            Err(e) => self.create_error = Some(e),
        }
    }

    fn window_event(&mut self, _event_loop: &ActiveEventLoop, window_id: WindowId, event: WindowEvent) {
        if let Some(window) = &self.window {
            if window_id != window.id() {
                return;
            }
        }
        self.apply(&event);
    }
}

/// A single window plus the event loop that feeds it.
pub struct PlatformWindow {
    window: Arc<Window>,
    state: WindowState,
    exited: bool,
    event_loop: EventLoop<()>,
}

impl PlatformWindow {
    pub fn new(title: &str, width: u32, height: u32) -> Result<Self> {
        let mut event_loop = EventLoop::new()?;
        let mut state = WindowState::new(title, width, height);

        // winit hands out the window from `resumed`.
        let window = loop {
            if let Some(e) = state.create_error.take() {
                return Err(anyhow!("create_window: {e}"));
            }
            if let Some(window) = &state.window {
                break window.clone();
            }
            if let PumpStatus::Exit(code) =
                event_loop.pump_app_events(Some(Duration::ZERO), &mut state)
            {
                bail!("event loop exited with {code} before a window was created");
            }
        };
        info!(
            "window ready ({}x{} physical)",
            state.size.width, state.size.height
        );

        Ok(Self {
            window,
            state,
            exited: false,
            event_loop,
        })
    }

    /// The window, for surface creation.
    pub fn window(&self) -> Arc<Window> {
        self.window.clone()
    }

    /// Processes whatever events are queued without blocking. Returns
    /// `false` once the event loop has exited.
    pub fn pump(&mut self) -> bool {
        self.pump_with(Some(Duration::ZERO))
    }

    fn pump_with(&mut self, timeout: Option<Duration>) -> bool {
        if self.exited {
            return false;
        }
        if let PumpStatus::Exit(code) = self.event_loop.pump_app_events(timeout, &mut self.state) {
            info!("event loop exited ({code})");
            self.exited = true;
        }
        !self.exited
    }

    /// The latest size reported since the previous call, if any.
    pub fn take_resize(&mut self) -> Option<RenderSize> {
        self.state.pending_resize.take()
    }
}

impl SurfaceSource for PlatformWindow {
    fn drawable_size(&self) -> RenderSize {
        self.state.size
    }

    fn wait_events(&mut self) {
        self.pump_with(None);
    }

    fn is_closing(&self) -> bool {
        self.state.close_requested || self.exited
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resize_events_update_size_and_queue_once() {
        let mut state = WindowState::new("t", 800, 600);
        state.apply(&WindowEvent::Resized(PhysicalSize::new(0, 0)));
        assert!(state.size.is_zero_area());

        state.apply(&WindowEvent::Resized(PhysicalSize::new(1024, 768)));
        assert_eq!(state.size, RenderSize::new(1024, 768));
        assert_eq!(state.pending_resize.take(), Some(RenderSize::new(1024, 768)));
        assert_eq!(state.pending_resize, None);
    }

    #[test]
    fn close_request_is_sticky() {
        let mut state = WindowState::new("t", 800, 600);
        assert!(!state.close_requested);
        state.apply(&WindowEvent::CloseRequested);
        state.apply(&WindowEvent::Resized(PhysicalSize::new(10, 10)));
        assert!(state.close_requested);
    }
}
