// SPDX-License-Identifier: CEPL-1.0
//! Per-frame resources.
//!
//! A [`FramePool`] holds a fixed number of [`FrameSlot`]s, each a complete set
//! of resources for one frame in flight. Slots are visited round-robin and the
//! slot's fence is the only thing that says its resources are free again.

use std::sync::Arc;
use std::time::Duration;

use ash::vk;
use tracing::debug;

use crate::device::DeviceApi;
use crate::error::{FrameError, FrameResult};
use crate::sync::{Fence, Semaphore, SyncPrimitive, WaitGroup, WaitMode, WaitStatus};

/// Owns a command pool whose buffers can be reset one at a time.
pub struct CommandPool<D: DeviceApi> {
    device: Arc<D>,
    handle: vk::CommandPool,
}

impl<D: DeviceApi> CommandPool<D> {
    pub fn new(device: Arc<D>, queue_family: u32) -> FrameResult<Self> {
        let handle = device
            .create_command_pool(queue_family)
            .map_err(|e| FrameError::vk("create_command_pool", e))?;
        Ok(Self { device, handle })
    }

    pub fn handle(&self) -> vk::CommandPool {
        self.handle
    }

    pub fn allocate(&self, count: usize) -> FrameResult<Vec<vk::CommandBuffer>> {
        let count = u32::try_from(count)
            .map_err(|_| FrameError::InvalidConfig(format!("{count} command buffers")))?;
        self.device
            .allocate_command_buffers(self.handle, count)
            .map_err(|e| FrameError::vk("allocate_command_buffers", e))
    }
}

impl<D: DeviceApi> Drop for CommandPool<D> {
    fn drop(&mut self) {
        // Frees every buffer allocated from it.
        unsafe { self.device.destroy_command_pool(self.handle) };
    }
}

pub struct FrameSlot<D: DeviceApi, T> {
    index: usize,
    command_buffer: vk::CommandBuffer,
    image_available: Semaphore<D>,
    render_finished: Semaphore<D>,
    in_flight: Fence<D>,
    data: T,
}

impl<D: DeviceApi, T> FrameSlot<D, T> {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn command_buffer(&self) -> vk::CommandBuffer {
        self.command_buffer
    }

    /// Signaled by acquire, waited on by submit.
    pub fn image_available(&self) -> &Semaphore<D> {
        &self.image_available
    }

    /// Signaled by submit, waited on by present.
    pub fn render_finished(&self) -> &Semaphore<D> {
        &self.render_finished
    }

    /// Signaled when the slot's last submission has executed. Created
    /// signaled so the first wait on a fresh slot returns immediately.
    pub fn in_flight(&self) -> &Fence<D> {
        &self.in_flight
    }

    pub fn data(&self) -> &T {
        &self.data
    }

    /// Only safe to touch between the slot's fence wait and its next submit.
    pub fn data_mut(&mut self) -> &mut T {
        &mut self.data
    }
}

pub struct FramePool<D: DeviceApi, T> {
    // Declared before the pool: slots must not outlive their command buffers.
    slots: Box<[FrameSlot<D, T>]>,
    command_pool: CommandPool<D>,
    current: usize,
}

impl<D: DeviceApi, T> FramePool<D, T> {
    /// Builds `count` slots on `queue_family`. `init` produces the per-slot
    /// payload.
    pub fn new(
        device: &Arc<D>,
        queue_family: u32,
        count: usize,
        mut init: impl FnMut(usize) -> T,
    ) -> FrameResult<Self> {
        if count == 0 {
            return Err(FrameError::InvalidConfig(
                "a frame pool needs at least one slot".into(),
            ));
        }
        let command_pool = CommandPool::new(device.clone(), queue_family)?;
        let buffers = command_pool.allocate(count)?;

        let slots = buffers
            .into_iter()
            .enumerate()
            .map(|(index, command_buffer)| -> FrameResult<FrameSlot<D, T>> {
                Ok(FrameSlot {
                    index,
                    command_buffer,
                    image_available: Semaphore::new(device.clone())?,
                    render_finished: Semaphore::new(device.clone())?,
                    in_flight: Fence::new(device.clone(), true)?,
                    data: init(index),
                })
            })
            .collect::<FrameResult<Vec<_>>>()?
            .into_boxed_slice();

        debug!(slots = count, "frame pool ready");
        Ok(Self {
            slots,
            command_pool,
            current: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn current_index(&self) -> usize {
        self.current
    }

    pub fn current(&self) -> &FrameSlot<D, T> {
        &self.slots[self.current]
    }

    pub fn current_mut(&mut self) -> &mut FrameSlot<D, T> {
        &mut self.slots[self.current]
    }

    pub fn slot(&self, index: usize) -> Option<&FrameSlot<D, T>> {
        self.slots.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &FrameSlot<D, T>> {
        self.slots.iter()
    }

    pub fn command_pool(&self) -> &CommandPool<D> {
        &self.command_pool
    }

    /// Moves to the next slot and returns its index.
    pub fn advance(&mut self) -> usize {
        self.current = (self.current + 1) % self.slots.len();
        self.current
    }

    /// Blocks until every slot with a submission in flight has retired.
    pub fn wait_in_flight(&self, timeout: Option<Duration>) -> FrameResult<WaitStatus> {
        let group = WaitGroup::new(
            self.slots
                .iter()
                .filter(|s| s.in_flight.is_in_flight())
                .map(|s| SyncPrimitive::Fence(&s.in_flight)),
            WaitMode::All,
            timeout,
        )?;
        group.wait()
    }
}
