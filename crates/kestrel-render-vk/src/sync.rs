// SPDX-License-Identifier: CEPL-1.0
//! Frames-in-flight ring: per-slot fence, acquire semaphore and command
//! buffer, plus per-swapchain-image render-finished semaphores.

use anyhow::{anyhow, Context, Result};
use ash::prelude::VkResult;
use ash::vk;
use tracing::{debug, warn};

use crate::device::DeviceContext;

/// The queue and swapchain operations the ring drives, so the ordering can be
/// checked without a GPU.
pub trait FrameQueue {
    fn wait_for_fence(&mut self, fence: vk::Fence) -> VkResult<()>;
    fn reset_fence(&mut self, fence: vk::Fence) -> VkResult<()>;
    /// Returns the image index and whether the swapchain is suboptimal.
    fn acquire_next_image(&mut self, signal: vk::Semaphore) -> VkResult<(u32, bool)>;
    fn submit(
        &mut self,
        command_buffer: vk::CommandBuffer,
        wait: vk::Semaphore,
        signal: vk::Semaphore,
        fence: vk::Fence,
    ) -> VkResult<()>;
    /// Returns whether the swapchain is suboptimal.
    fn present(&mut self, image_index: u32, wait: vk::Semaphore) -> VkResult<bool>;
}

pub struct VkFrameQueue<'a> {
    ctx: &'a DeviceContext,
    swapchain: vk::SwapchainKHR,
}

impl<'a> VkFrameQueue<'a> {
    pub fn new(ctx: &'a DeviceContext, swapchain: vk::SwapchainKHR) -> Self {
        Self { ctx, swapchain }
    }
}

impl FrameQueue for VkFrameQueue<'_> {
    fn wait_for_fence(&mut self, fence: vk::Fence) -> VkResult<()> {
        unsafe { self.ctx.device.wait_for_fences(&[fence], true, u64::MAX) }
    }

    fn reset_fence(&mut self, fence: vk::Fence) -> VkResult<()> {
        unsafe { self.ctx.device.reset_fences(&[fence]) }
    }

    fn acquire_next_image(&mut self, signal: vk::Semaphore) -> VkResult<(u32, bool)> {
        unsafe {
            self.ctx.swapchain_loader.acquire_next_image(
                self.swapchain,
                u64::MAX,
                signal,
                vk::Fence::null(),
            )
        }
    }

    fn submit(
        &mut self,
        command_buffer: vk::CommandBuffer,
        wait: vk::Semaphore,
        signal: vk::Semaphore,
        fence: vk::Fence,
    ) -> VkResult<()> {
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let submit = vk::SubmitInfo {
            s_type: vk::StructureType::SUBMIT_INFO,
            wait_semaphore_count: 1,
            p_wait_semaphores: &wait,
            p_wait_dst_stage_mask: wait_stages.as_ptr(),
            command_buffer_count: 1,
            p_command_buffers: &command_buffer,
            signal_semaphore_count: 1,
            p_signal_semaphores: &signal,
            ..Default::default()
        };
        unsafe {
            self.ctx.device.queue_submit(
                self.ctx.graphics_queue,
                std::slice::from_ref(&submit),
                fence,
            )
        }
    }

    fn present(&mut self, image_index: u32, wait: vk::Semaphore) -> VkResult<bool> {
        let present = vk::PresentInfoKHR {
            s_type: vk::StructureType::PRESENT_INFO_KHR,
            wait_semaphore_count: 1,
            p_wait_semaphores: &wait,
            swapchain_count: 1,
            p_swapchains: &self.swapchain,
            p_image_indices: &image_index,
            ..Default::default()
        };
        unsafe {
            self.ctx
                .swapchain_loader
                .queue_present(self.ctx.present_queue, &present)
        }
    }
}

pub struct FrameSlot<D> {
    pub image_available: vk::Semaphore,
    pub in_flight: vk::Fence,
    pub command_buffer: vk::CommandBuffer,
    /// Resources sampled by the commands last submitted from this slot.
    pub dependencies: Vec<D>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Frame {
    pub slot: usize,
    pub image_index: u32,
    pub command_buffer: vk::CommandBuffer,
    pub suboptimal: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Acquire {
    Ready(Frame),
    /// Swapchain out of date; the frame is abandoned and the slot fence stays
    /// signalled.
    Stale,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Presented {
    Ok,
    Suboptimal,
    /// Out of date at present time; recreate before the next frame.
    Stale,
}

pub struct FrameRing<D> {
    slots: Vec<FrameSlot<D>>,
    render_finished: Vec<vk::Semaphore>,
    current: usize,
}

impl<D> FrameRing<D> {
    pub unsafe fn new(
        ctx: &DeviceContext,
        frames_in_flight: usize,
        image_count: usize,
    ) -> Result<Self> {
        if frames_in_flight == 0 {
            return Err(anyhow!("frame ring needs at least one slot"));
        }
        let mut ring = Self {
            slots: Vec::with_capacity(frames_in_flight),
            render_finished: Vec::new(),
            current: 0,
        };
        if let Err(e) = ring.populate(ctx, frames_in_flight, image_count) {
            ring.destroy(ctx);
            return Err(e);
        }
        debug!("frame ring: {frames_in_flight} slot(s), {image_count} image semaphore(s)");
        Ok(ring)
    }

    unsafe fn populate(
        &mut self,
        ctx: &DeviceContext,
        frames_in_flight: usize,
        image_count: usize,
    ) -> Result<()> {
        let d = &ctx.device;
        let sem_ci = vk::SemaphoreCreateInfo::default();
        let fence_ci = vk::FenceCreateInfo {
            s_type: vk::StructureType::FENCE_CREATE_INFO,
            flags: vk::FenceCreateFlags::SIGNALED,
            ..Default::default()
        };

        let command_buffers = ctx.allocate_command_buffers(frames_in_flight as u32)?;
        for command_buffer in command_buffers {
            // Pushed first so destroy() frees it even if the sync objects fail.
            self.slots.push(FrameSlot {
                image_available: vk::Semaphore::null(),
                in_flight: vk::Fence::null(),
                command_buffer,
                dependencies: Vec::new(),
            });
            let slot = self
                .slots
                .last_mut()
                .ok_or_else(|| anyhow!("frame slot vanished"))?;
            slot.image_available = d.create_semaphore(&sem_ci, None).context("create_semaphore")?;
            slot.in_flight = d.create_fence(&fence_ci, None).context("create_fence")?;
        }
        self.recreate_image_semaphores(d, image_count)
    }

    #[cfg(test)]
    pub(crate) fn from_parts(slots: Vec<FrameSlot<D>>, render_finished: Vec<vk::Semaphore>) -> Self {
        Self {
            slots,
            render_finished,
            current: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn current(&self) -> usize {
        self.current
    }

    pub fn dependencies_mut(&mut self, slot: usize) -> &mut Vec<D> {
        &mut self.slots[slot].dependencies
    }

    pub fn render_finished(&self, image_index: u32) -> vk::Semaphore {
        self.render_finished[image_index as usize]
    }

    // STRICT ORDER:
    // 1) wait the slot fence (the GPU is done with everything this slot sent)
    // 2) release the slot's dependencies
    // 3) acquire; out of date => Stale with the fence still signalled
    // 4) reset the fence only once a submit is certain to follow
    pub fn acquire(&mut self, queue: &mut impl FrameQueue) -> Result<Acquire> {
        let Some(slot) = self.slots.get_mut(self.current) else {
            return Err(anyhow!("frame ring has no slot {}", self.current));
        };
        queue
            .wait_for_fence(slot.in_flight)
            .context("wait_for_fences(frame slot)")?;
        slot.dependencies.clear();

        let (image_index, suboptimal) = match queue.acquire_next_image(slot.image_available) {
            Ok(pair) => pair,
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                debug!("acquire: swapchain out of date");
                return Ok(Acquire::Stale);
            }
            Err(e) => return Err(anyhow!(e).context("acquire_next_image")),
        };
        if suboptimal {
            debug!("acquire: swapchain suboptimal");
        }
        if image_index as usize >= self.render_finished.len() {
            return Err(anyhow!(
                "acquired image {image_index} but only {} image semaphores exist",
                self.render_finished.len()
            ));
        }

        queue
            .reset_fence(slot.in_flight)
            .context("reset_fences(frame slot)")?;

        Ok(Acquire::Ready(Frame {
            slot: self.current,
            image_index,
            command_buffer: slot.command_buffer,
            suboptimal,
        }))
    }

    /// Submits the recorded buffer and presents. The ring advances unless an
    /// error is returned.
    pub fn submit_and_present(
        &mut self,
        queue: &mut impl FrameQueue,
        frame: &Frame,
    ) -> Result<Presented> {
        let Some(slot) = self.slots.get(frame.slot) else {
            return Err(anyhow!("frame ring has no slot {}", frame.slot));
        };
        let render_finished = self.render_finished[frame.image_index as usize];

        queue
            .submit(
                frame.command_buffer,
                slot.image_available,
                render_finished,
                slot.in_flight,
            )
            .context("queue_submit")?;

        let presented = match queue.present(frame.image_index, render_finished) {
            Ok(false) => Presented::Ok,
            Ok(true) => {
                warn!("present: swapchain suboptimal");
                Presented::Suboptimal
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Presented::Stale,
            Err(e) => return Err(anyhow!(e).context("queue_present")),
        };

        self.current = (self.current + 1) % self.slots.len();
        Ok(presented)
    }

    /// Replaces the per-image semaphores after the swapchain was rebuilt.
    /// The device must be idle.
    pub unsafe fn recreate_image_semaphores(
        &mut self,
        device: &ash::Device,
        image_count: usize,
    ) -> Result<()> {
        for sem in self.render_finished.drain(..) {
            device.destroy_semaphore(sem, None);
        }
        let sem_ci = vk::SemaphoreCreateInfo::default();
        for _ in 0..image_count {
            let sem = device
                .create_semaphore(&sem_ci, None)
                .context("create_semaphore(render finished)")?;
            self.render_finished.push(sem);
        }
        Ok(())
    }

    /// Drops every slot's dependencies, then the sync objects and buffers.
    /// The device must be idle.
    pub unsafe fn destroy(&mut self, ctx: &DeviceContext) {
        let d = &ctx.device;
        for slot in self.slots.drain(..) {
            drop(slot.dependencies);
            if slot.in_flight != vk::Fence::null() {
                d.destroy_fence(slot.in_flight, None);
            }
            if slot.image_available != vk::Semaphore::null() {
                d.destroy_semaphore(slot.image_available, None);
            }
            d.free_command_buffers(ctx.command_pool, &[slot.command_buffer]);
        }
        for sem in self.render_finished.drain(..) {
            d.destroy_semaphore(sem, None);
        }
        self.current = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;
    use std::collections::{HashMap, VecDeque};

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    enum FenceState {
        Signalled,
        Reset,
        Pending,
    }

    #[derive(Debug, PartialEq, Eq)]
    struct Submitted {
        command_buffer: vk::CommandBuffer,
        wait: vk::Semaphore,
        signal: vk::Semaphore,
        fence: vk::Fence,
    }

    /// Models fence state precisely: `Pending` fences only signal when waited
    /// on, and every misuse panics.
    #[derive(Default)]
    struct MockQueue {
        fences: HashMap<vk::Fence, FenceState>,
        busy_buffers: HashMap<vk::CommandBuffer, vk::Fence>,
        images: VecDeque<VkResult<(u32, bool)>>,
        present_results: VecDeque<VkResult<bool>>,
        submits: Vec<Submitted>,
        presents: Vec<(u32, vk::Semaphore)>,
    }

    impl FrameQueue for MockQueue {
        fn wait_for_fence(&mut self, fence: vk::Fence) -> VkResult<()> {
            let state = self.fences.entry(fence).or_insert(FenceState::Signalled);
            assert_ne!(*state, FenceState::Reset, "waiting on a fence nobody will signal");
            *state = FenceState::Signalled;
            self.busy_buffers.retain(|_, f| *f != fence);
            Ok(())
        }

        fn reset_fence(&mut self, fence: vk::Fence) -> VkResult<()> {
            let state = self.fences.entry(fence).or_insert(FenceState::Signalled);
            assert_eq!(*state, FenceState::Signalled, "reset before wait");
            *state = FenceState::Reset;
            Ok(())
        }

        fn acquire_next_image(&mut self, _signal: vk::Semaphore) -> VkResult<(u32, bool)> {
            self.images.pop_front().unwrap_or(Ok((0, false)))
        }

        fn submit(
            &mut self,
            command_buffer: vk::CommandBuffer,
            wait: vk::Semaphore,
            signal: vk::Semaphore,
            fence: vk::Fence,
        ) -> VkResult<()> {
            assert!(
                !self.busy_buffers.contains_key(&command_buffer),
                "command buffer reused while its fence is pending"
            );
            let state = self.fences.get_mut(&fence).expect("unknown fence");
            assert_eq!(*state, FenceState::Reset, "submit with an unreset fence");
            *state = FenceState::Pending;
            self.busy_buffers.insert(command_buffer, fence);
            self.submits.push(Submitted {
                command_buffer,
                wait,
                signal,
                fence,
            });
            Ok(())
        }

        fn present(&mut self, image_index: u32, wait: vk::Semaphore) -> VkResult<bool> {
            self.presents.push((image_index, wait));
            self.present_results.pop_front().unwrap_or(Ok(false))
        }
    }

    fn slot(n: u64) -> FrameSlot<u32> {
        FrameSlot {
            image_available: vk::Semaphore::from_raw(100 + n),
            in_flight: vk::Fence::from_raw(200 + n),
            command_buffer: vk::CommandBuffer::from_raw(300 + n),
            dependencies: Vec::new(),
        }
    }

    fn ring(slots: u64, images: u64) -> FrameRing<u32> {
        FrameRing::from_parts(
            (0..slots).map(slot).collect(),
            (0..images).map(|i| vk::Semaphore::from_raw(400 + i)).collect(),
        )
    }

    fn frame(acquired: Acquire) -> Frame {
        match acquired {
            Acquire::Ready(f) => f,
            Acquire::Stale => panic!("unexpected stale acquire"),
        }
    }

    #[test]
    fn empty_ring_refuses_to_acquire() {
        let mut ring = ring(0, 3);
        let mut queue = MockQueue::default();
        queue.images = vec![Ok((0, false))].into();
        assert!(ring.acquire(&mut queue).is_err());
        assert_eq!(queue.images.len(), 1);
        assert!(queue.submits.is_empty());
    }

    #[test]
    fn two_slots_three_images_ten_frames() {
        let mut ring = ring(2, 3);
        let mut queue = MockQueue::default();
        queue.images = (0..10).map(|i| Ok((i % 3, false))).collect();

        let mut slots_seen = Vec::new();
        for _ in 0..10 {
            let f = frame(ring.acquire(&mut queue).unwrap());
            slots_seen.push(f.slot);
            assert_eq!(ring.submit_and_present(&mut queue, &f).unwrap(), Presented::Ok);
        }

        assert_eq!(slots_seen, vec![0, 1, 0, 1, 0, 1, 0, 1, 0, 1]);
        for (i, s) in queue.submits.iter().enumerate() {
            let image = (i % 3) as u64;
            let slot = (i % 2) as u64;
            assert_eq!(s.signal, vk::Semaphore::from_raw(400 + image));
            assert_eq!(s.wait, vk::Semaphore::from_raw(100 + slot));
            assert_eq!(s.command_buffer, vk::CommandBuffer::from_raw(300 + slot));
            assert_eq!(s.fence, vk::Fence::from_raw(200 + slot));
            assert_eq!(queue.presents[i], (image as u32, s.signal));
        }
    }

    #[test]
    fn out_of_date_acquire_keeps_fence_signalled() {
        let mut ring = ring(2, 2);
        let mut queue = MockQueue::default();
        queue.images = VecDeque::from([Err(vk::Result::ERROR_OUT_OF_DATE_KHR), Ok((1, false))]);
        ring.dependencies_mut(0).push(7);

        assert_eq!(ring.acquire(&mut queue).unwrap(), Acquire::Stale);
        assert!(ring.dependencies_mut(0).is_empty());
        assert_eq!(ring.current(), 0);
        assert_eq!(
            queue.fences[&vk::Fence::from_raw(200)],
            FenceState::Signalled
        );

        // Retrying the same slot must not deadlock on its own fence.
        let f = frame(ring.acquire(&mut queue).unwrap());
        assert_eq!((f.slot, f.image_index), (0, 1));
    }

    #[test]
    fn suboptimal_counts_as_success() {
        let mut ring = ring(1, 1);
        let mut queue = MockQueue::default();
        queue.images = VecDeque::from([Ok((0, true))]);
        queue.present_results = VecDeque::from([Ok(true)]);

        let f = frame(ring.acquire(&mut queue).unwrap());
        assert!(f.suboptimal);
        assert_eq!(
            ring.submit_and_present(&mut queue, &f).unwrap(),
            Presented::Suboptimal
        );
    }

    #[test]
    fn present_out_of_date_still_advances() {
        let mut ring = ring(2, 2);
        let mut queue = MockQueue::default();
        queue.present_results = VecDeque::from([Err(vk::Result::ERROR_OUT_OF_DATE_KHR)]);

        let f = frame(ring.acquire(&mut queue).unwrap());
        assert_eq!(ring.submit_and_present(&mut queue, &f).unwrap(), Presented::Stale);
        assert_eq!(ring.current(), 1);
    }

    #[test]
    fn device_lost_is_fatal() {
        let mut ring = ring(2, 2);
        let mut queue = MockQueue::default();
        queue.images = VecDeque::from([Err(vk::Result::ERROR_DEVICE_LOST)]);
        assert!(ring.acquire(&mut queue).is_err());

        let f = frame(ring.acquire(&mut queue).unwrap());
        queue.present_results = VecDeque::from([Err(vk::Result::ERROR_SURFACE_LOST_KHR)]);
        assert!(ring.submit_and_present(&mut queue, &f).is_err());
        assert_eq!(ring.current(), 0);
    }

    #[test]
    fn image_index_beyond_semaphores_is_rejected() {
        let mut ring = ring(1, 2);
        let mut queue = MockQueue::default();
        queue.images = VecDeque::from([Ok((5, false))]);
        assert!(ring.acquire(&mut queue).is_err());
    }
}
