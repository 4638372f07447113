// SPDX-License-Identifier: CEPL-1.0
//! Fences, semaphores and batched host waits.
//!
//! Fences gate the host on GPU completion and are reset explicitly. Binary
//! semaphores order GPU work against GPU work and cannot be observed from the
//! host; timeline semaphores can, which is why they are the only semaphore
//! kind a [`WaitGroup`] accepts.

use std::cell::Cell;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ash::vk;
use tracing::debug;

use crate::config::timeout_ns;
use crate::device::{DeviceApi, SemaphoreKind};
use crate::error::{FrameError, FrameResult};

/// Outcome of a bounded host wait. Expiry is not an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitStatus {
    Ready,
    TimedOut,
}

pub struct Fence<D: DeviceApi> {
    device: Arc<D>,
    handle: vk::Fence,
    // Set by a wait that saw the fence signaled, cleared by reset.
    observed: Cell<bool>,
    // Handed to a queue and not yet seen complete.
    submitted: Cell<bool>,
    // Unsignaled and not yet handed to a queue since the last reset.
    armed: Cell<bool>,
}

impl<D: DeviceApi> Fence<D> {
    pub fn new(device: Arc<D>, signaled: bool) -> FrameResult<Self> {
        let handle = device
            .create_fence(signaled)
            .map_err(|e| FrameError::vk("create_fence", e))?;
        debug!(signaled, "created fence");
        Ok(Self {
            device,
            handle,
            observed: Cell::new(false),
            submitted: Cell::new(false),
            armed: Cell::new(!signaled),
        })
    }

    #[inline]
    pub fn handle(&self) -> vk::Fence {
        self.handle
    }

    /// Blocks until the fence is signaled or `timeout` expires (`None` waits
    /// forever).
    ///
    /// A lost device is reported as [`FrameError::DeviceLost`]; any other
    /// driver failure keeps its code as [`FrameError::Vulkan`].
    pub fn wait(&self, timeout: Option<Duration>) -> FrameResult<WaitStatus> {
        match self
            .device
            .wait_for_fences(&[self.handle], true, timeout_ns(timeout))
        {
            Ok(()) => {
                self.mark_observed();
                Ok(WaitStatus::Ready)
            }
            Err(vk::Result::TIMEOUT) => Ok(WaitStatus::TimedOut),
            Err(e) => Err(FrameError::vk("wait_for_fences", e)),
        }
    }

    /// Returns the fence to the unsignaled state.
    ///
    /// Only legal after a wait on this fence returned [`WaitStatus::Ready`]
    /// since the previous reset.
    pub fn reset(&self) -> FrameResult<()> {
        debug_assert!(
            self.observed.get(),
            "fence reset without an observed signaled wait"
        );
        self.device
            .reset_fences(&[self.handle])
            .map_err(|e| FrameError::vk("reset_fences", e))?;
        self.observed.set(false);
        self.armed.set(true);
        Ok(())
    }

    /// Non-blocking status query.
    pub fn is_signaled(&self) -> FrameResult<bool> {
        self.device
            .fence_status(self.handle)
            .map_err(|e| FrameError::vk("get_fence_status", e))
    }

    /// True while work that signals this fence has been submitted but not yet
    /// observed complete.
    pub fn is_in_flight(&self) -> bool {
        self.submitted.get()
    }

    /// True when the fence may be handed to a queue: it was created
    /// unsignaled or reset, and nothing has been submitted with it since.
    pub fn is_armed(&self) -> bool {
        self.armed.get()
    }

    pub(crate) fn mark_observed(&self) {
        self.observed.set(true);
        self.submitted.set(false);
        self.armed.set(false);
    }

    pub(crate) fn mark_submitted(&self) {
        self.submitted.set(true);
        self.armed.set(false);
    }

    pub(crate) fn device(&self) -> &Arc<D> {
        &self.device
    }
}

impl<D: DeviceApi> Drop for Fence<D> {
    fn drop(&mut self) {
        unsafe { self.device.destroy_fence(self.handle) };
    }
}

pub struct Semaphore<D: DeviceApi> {
    device: Arc<D>,
    handle: vk::Semaphore,
    kind: SemaphoreKind,
}

impl<D: DeviceApi> Semaphore<D> {
    /// A binary semaphore: one signal, consumed by exactly one wait.
    pub fn new(device: Arc<D>) -> FrameResult<Self> {
        Self::with_kind(device, SemaphoreKind::Binary)
    }

    /// A timeline semaphore starting at `initial`. Needs Vulkan 1.2.
    pub fn timeline(device: Arc<D>, initial: u64) -> FrameResult<Self> {
        Self::with_kind(device, SemaphoreKind::Timeline { initial })
    }

    fn with_kind(device: Arc<D>, kind: SemaphoreKind) -> FrameResult<Self> {
        let handle = device
            .create_semaphore(kind)
            .map_err(|e| FrameError::vk("create_semaphore", e))?;
        debug!(?kind, "created semaphore");
        Ok(Self {
            device,
            handle,
            kind,
        })
    }

    #[inline]
    pub fn handle(&self) -> vk::Semaphore {
        self.handle
    }

    #[inline]
    pub fn kind(&self) -> SemaphoreKind {
        self.kind
    }

    pub fn is_timeline(&self) -> bool {
        matches!(self.kind, SemaphoreKind::Timeline { .. })
    }

    /// Host-side signal of a timeline semaphore.
    pub fn signal(&self, value: u64) -> FrameResult<()> {
        debug_assert!(self.is_timeline(), "host signal on a binary semaphore");
        self.device
            .signal_semaphore(self.handle, value)
            .map_err(|e| FrameError::vk("signal_semaphore", e))
    }

    /// Current counter of a timeline semaphore.
    pub fn value(&self) -> FrameResult<u64> {
        debug_assert!(self.is_timeline(), "counter query on a binary semaphore");
        self.device
            .semaphore_counter_value(self.handle)
            .map_err(|e| FrameError::vk("get_semaphore_counter_value", e))
    }

    pub(crate) fn device(&self) -> &Arc<D> {
        &self.device
    }
}

impl<D: DeviceApi> Drop for Semaphore<D> {
    fn drop(&mut self) {
        unsafe { self.device.destroy_semaphore(self.handle) };
    }
}

/// Something the host can block on.
pub enum SyncPrimitive<'a, D: DeviceApi> {
    Fence(&'a Fence<D>),
    /// A semaphore and the counter value to wait for.
    Timeline(&'a Semaphore<D>, u64),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitMode {
    All,
    Any,
}

/// A batch of host waits issued with as few device calls as possible.
pub struct WaitGroup<'a, D: DeviceApi> {
    device: Option<Arc<D>>,
    fences: Vec<&'a Fence<D>>,
    timelines: Vec<(&'a Semaphore<D>, u64)>,
    mode: WaitMode,
    timeout: Option<Duration>,
}

impl<'a, D: DeviceApi> WaitGroup<'a, D> {
    pub fn new(
        primitives: impl IntoIterator<Item = SyncPrimitive<'a, D>>,
        mode: WaitMode,
        timeout: Option<Duration>,
    ) -> FrameResult<Self> {
        let mut device = None;
        let mut fences = Vec::new();
        let mut timelines = Vec::new();

        for primitive in primitives {
            match primitive {
                SyncPrimitive::Fence(fence) => {
                    device.get_or_insert_with(|| fence.device().clone());
                    fences.push(fence);
                }
                SyncPrimitive::Timeline(semaphore, value) => {
                    if !semaphore.is_timeline() {
                        return Err(FrameError::InvalidWaitGroup(
                            "binary semaphores cannot be waited on from the host",
                        ));
                    }
                    device.get_or_insert_with(|| semaphore.device().clone());
                    timelines.push((semaphore, value));
                }
            }
        }

        if mode == WaitMode::Any && !fences.is_empty() && !timelines.is_empty() {
            return Err(FrameError::InvalidWaitGroup(
                "wait-any cannot mix fences and timeline semaphores",
            ));
        }

        Ok(Self {
            device,
            fences,
            timelines,
            mode,
            timeout,
        })
    }

    pub fn len(&self) -> usize {
        self.fences.len() + self.timelines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn wait(&self) -> FrameResult<WaitStatus> {
        let Some(device) = &self.device else {
            return Ok(WaitStatus::Ready);
        };
        let wait_all = self.mode == WaitMode::All;
        let start = Instant::now();

        if !self.fences.is_empty() {
            let handles: Vec<_> = self.fences.iter().map(|f| f.handle()).collect();
            match device.wait_for_fences(&handles, wait_all, timeout_ns(self.timeout)) {
                Ok(()) => {}
                Err(vk::Result::TIMEOUT) => return Ok(WaitStatus::TimedOut),
                Err(e) => return Err(FrameError::vk("wait_for_fences", e)),
            }
            if wait_all {
                self.fences.iter().for_each(|f| f.mark_observed());
            } else {
                for fence in &self.fences {
                    if fence.is_signaled()? {
                        fence.mark_observed();
                    }
                }
            }
        }

        if !self.timelines.is_empty() {
            // Fences and semaphores share one deadline.
            let remaining = self.timeout.map(|t| t.saturating_sub(start.elapsed()));
            let (handles, values): (Vec<_>, Vec<_>) = self
                .timelines
                .iter()
                .map(|(s, v)| (s.handle(), *v))
                .unzip();
            match device.wait_semaphores(&handles, &values, !wait_all, timeout_ns(remaining)) {
                Ok(()) => {}
                Err(vk::Result::TIMEOUT) => return Ok(WaitStatus::TimedOut),
                Err(e) => return Err(FrameError::vk("wait_semaphores", e)),
            }
        }

        Ok(WaitStatus::Ready)
    }

    /// Resets every fence in the group with one call. Timeline semaphores are
    /// monotonic and have nothing to reset.
    pub fn reset(&self) -> FrameResult<()> {
        let Some(device) = &self.device else {
            return Ok(());
        };
        if self.fences.is_empty() {
            return Ok(());
        }
        debug_assert!(
            self.fences.iter().all(|f| f.observed.get()),
            "wait group reset before every fence was observed signaled"
        );
        let handles: Vec<_> = self.fences.iter().map(|f| f.handle()).collect();
        device
            .reset_fences(&handles)
            .map_err(|e| FrameError::vk("reset_fences", e))?;
        self.fences.iter().for_each(|f| {
            f.observed.set(false);
            f.armed.set(true);
        });
        Ok(())
    }
}
