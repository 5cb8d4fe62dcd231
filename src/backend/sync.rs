// Synchronization primitives and the per-frame protocol
//
// Fences for GPU-CPU sync, semaphores for GPU-GPU ordering. Each frame in
// flight owns one of each set; the synchronizer walks a slot through
// acquire, record, submit and present, then moves on to the next slot.

use anyhow::{Context, Result};
use ash::vk;

use super::shader::CompiledShader;
use super::swapchain::{AcquireOutcome, PresentOutcome};
use super::tracker::ResourceKind;
use super::VulkanDevice;
use crate::platform::SurfaceProvider;

/// How many frames the CPU may run ahead of the GPU
pub const MAX_FRAMES_IN_FLIGHT: usize = 2;

/// Frame synchronization - one per frame in flight
pub struct FrameSlot {
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub in_flight_fence: vk::Fence,
}

impl FrameSlot {
    pub fn new(device: &VulkanDevice) -> Result<Self> {
        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        // Start signaled so the first wait on a fresh slot returns at once
        let fence_info = vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED);

        unsafe {
            let image_available = device
                .device
                .create_semaphore(&semaphore_info, None)
                .context("Failed to create image-available semaphore")?;
            device.tracker.created(ResourceKind::Semaphore);

            let render_finished = match device.device.create_semaphore(&semaphore_info, None) {
                Ok(semaphore) => semaphore,
                Err(e) => {
                    device.device.destroy_semaphore(image_available, None);
                    device.tracker.destroyed(ResourceKind::Semaphore);
                    return Err(e).context("Failed to create render-finished semaphore");
                }
            };
            device.tracker.created(ResourceKind::Semaphore);

            let in_flight_fence = match device.device.create_fence(&fence_info, None) {
                Ok(fence) => fence,
                Err(e) => {
                    device.device.destroy_semaphore(image_available, None);
                    device.device.destroy_semaphore(render_finished, None);
                    device.tracker.destroyed_n(ResourceKind::Semaphore, 2);
                    return Err(e).context("Failed to create in-flight fence");
                }
            };
            device.tracker.created(ResourceKind::Fence);

            Ok(Self {
                image_available,
                render_finished,
                in_flight_fence,
            })
        }
    }

    pub fn destroy(&self, device: &VulkanDevice) {
        unsafe {
            device.device.destroy_semaphore(self.image_available, None);
            device.device.destroy_semaphore(self.render_finished, None);
            device.device.destroy_fence(self.in_flight_fence, None);
        }
        device.tracker.destroyed_n(ResourceKind::Semaphore, 2);
        device.tracker.destroyed(ResourceKind::Fence);
    }
}

/// Where a frame slot is in its cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    Acquired(u32),
    Recorded(u32),
    Submitted(u32),
    /// Queued for presentation; back to `Idle` once its fence is waited on
    Presented,
}

/// What one call to `end_frame` (or a whole tick) achieved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    Presented { image_index: u32, recreated: bool },
    /// Acquire reported out-of-date; the swapchain was rebuilt instead
    Skipped,
}

/// The GPU side of the frame protocol.
///
/// `slot` is always in `0..MAX_FRAMES_IN_FLIGHT`.
pub trait FrameDevice {
    /// Block until the slot's fence is signaled
    fn wait_for_slot(&mut self, slot: usize) -> Result<()>;

    /// Signals the slot's image-available semaphore unless out of date
    fn acquire_image(&mut self, slot: usize) -> Result<AcquireOutcome>;

    fn reset_slot_fence(&mut self, slot: usize) -> Result<()>;

    fn record_commands(&mut self, slot: usize, image_index: u32) -> Result<()>;

    /// Waits image-available, signals render-finished and the fence
    fn submit(&mut self, slot: usize) -> Result<()>;

    /// Waits render-finished
    fn present(&mut self, slot: usize, image_index: u32) -> Result<PresentOutcome>;

    /// Rebuild swapchain-dependent state. `Ok(false)` if the window closed
    /// while we waited for it to become usable.
    fn regenerate_swapchain(&mut self, surface: &mut dyn SurfaceProvider) -> Result<bool>;

    /// Build the pipeline from new shaders. On error the old one stays.
    fn replace_shaders(&mut self, vertex: CompiledShader, fragment: CompiledShader) -> Result<()>;
}

/// Drives slots through acquire / record / submit / present
#[derive(Debug)]
pub struct FrameSynchronizer {
    frame_index: usize,
    slots: [SlotState; MAX_FRAMES_IN_FLIGHT],
    /// Acquire said suboptimal; recreate once this frame is presented
    pending_recreate: bool,
    frames_presented: u64,
    frames_skipped: u64,
    recreations: u64,
}

impl Default for FrameSynchronizer {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameSynchronizer {
    pub fn new() -> Self {
        Self {
            frame_index: 0,
            slots: [SlotState::Idle; MAX_FRAMES_IN_FLIGHT],
            pending_recreate: false,
            frames_presented: 0,
            frames_skipped: 0,
            recreations: 0,
        }
    }

    pub fn frame_index(&self) -> usize {
        self.frame_index
    }

    pub fn slot_state(&self, slot: usize) -> SlotState {
        self.slots[slot]
    }

    pub fn frames_presented(&self) -> u64 {
        self.frames_presented
    }

    pub fn frames_skipped(&self) -> u64 {
        self.frames_skipped
    }

    pub fn recreations(&self) -> u64 {
        self.recreations
    }

    /// Wait for the slot, acquire an image and reset the fence.
    ///
    /// Returns `None` when the swapchain was out of date: it has been
    /// rebuilt, nothing was signaled and the frame index did not move.
    pub fn begin_frame<D>(&mut self, device: &mut D, surface: &mut dyn SurfaceProvider) -> Result<Option<u32>>
    where
        D: FrameDevice + ?Sized,
    {
        let slot = self.frame_index;
        match self.slots[slot] {
            SlotState::Idle | SlotState::Presented => {}
            state => anyhow::bail!("begin_frame called while slot {} is {:?}", slot, state),
        }

        device.wait_for_slot(slot)?;
        self.slots[slot] = SlotState::Idle;

        match device.acquire_image(slot)? {
            AcquireOutcome::OutOfDate => {
                log::debug!("Swapchain out of date on acquire, skipping frame");
                self.frames_skipped += 1;
                self.regenerate(device, surface)?;
                Ok(None)
            }
            AcquireOutcome::Acquired {
                image_index,
                suboptimal,
            } => {
                if suboptimal {
                    self.pending_recreate = true;
                }
                // Only reset once we know work will be submitted against it
                device.reset_slot_fence(slot)?;
                self.slots[slot] = SlotState::Acquired(image_index);
                Ok(Some(image_index))
            }
        }
    }

    /// Record the acquired image's commands
    pub fn draw<D>(&mut self, device: &mut D) -> Result<()>
    where
        D: FrameDevice + ?Sized,
    {
        let slot = self.frame_index;
        let SlotState::Acquired(image_index) = self.slots[slot] else {
            anyhow::bail!("draw called while slot {} is {:?}", slot, self.slots[slot]);
        };

        device.record_commands(slot, image_index)?;
        self.slots[slot] = SlotState::Recorded(image_index);
        Ok(())
    }

    /// Submit, present, recreate if needed and advance to the next slot
    pub fn end_frame<D>(
        &mut self,
        device: &mut D,
        surface: &mut dyn SurfaceProvider,
        resized: bool,
    ) -> Result<FrameStatus>
    where
        D: FrameDevice + ?Sized,
    {
        let slot = self.frame_index;
        let SlotState::Recorded(image_index) = self.slots[slot] else {
            anyhow::bail!("end_frame called while slot {} is {:?}", slot, self.slots[slot]);
        };

        device.submit(slot)?;
        self.slots[slot] = SlotState::Submitted(image_index);

        let outcome = device.present(slot, image_index)?;
        self.slots[slot] = SlotState::Presented;
        self.frames_presented += 1;

        let recreated = outcome.needs_recreate() || resized || self.pending_recreate;
        if recreated {
            log::debug!(
                "Recreating swapchain after present ({:?}, resized: {})",
                outcome,
                resized
            );
            self.regenerate(device, surface)?;
        }

        self.frame_index = (self.frame_index + 1) % MAX_FRAMES_IN_FLIGHT;
        Ok(FrameStatus::Presented {
            image_index,
            recreated,
        })
    }

    /// One full frame
    pub fn tick<D>(
        &mut self,
        device: &mut D,
        surface: &mut dyn SurfaceProvider,
        resized: bool,
    ) -> Result<FrameStatus>
    where
        D: FrameDevice + ?Sized,
    {
        if self.begin_frame(device, surface)?.is_none() {
            return Ok(FrameStatus::Skipped);
        }
        self.draw(device)?;
        self.end_frame(device, surface, resized)
    }

    fn regenerate<D>(&mut self, device: &mut D, surface: &mut dyn SurfaceProvider) -> Result<()>
    where
        D: FrameDevice + ?Sized,
    {
        self.pending_recreate = false;
        if device.regenerate_swapchain(surface)? {
            self.recreations += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Wait(usize),
        Acquire(usize),
        Reset(usize),
        Record(usize, u32),
        Submit(usize),
        Present(usize, u32),
        Regenerate,
    }

    #[derive(Default)]
    struct Recorder {
        calls: Vec<Call>,
        acquire: Vec<AcquireOutcome>,
        present: Vec<PresentOutcome>,
        next_image: u32,
    }

    impl FrameDevice for Recorder {
        fn wait_for_slot(&mut self, slot: usize) -> Result<()> {
            self.calls.push(Call::Wait(slot));
            Ok(())
        }

        fn acquire_image(&mut self, slot: usize) -> Result<AcquireOutcome> {
            self.calls.push(Call::Acquire(slot));
            if let Some(outcome) = self.acquire.pop() {
                return Ok(outcome);
            }
            let image_index = self.next_image;
            self.next_image = (self.next_image + 1) % 3;
            Ok(AcquireOutcome::Acquired {
                image_index,
                suboptimal: false,
            })
        }

        fn reset_slot_fence(&mut self, slot: usize) -> Result<()> {
            self.calls.push(Call::Reset(slot));
            Ok(())
        }

        fn record_commands(&mut self, slot: usize, image_index: u32) -> Result<()> {
            self.calls.push(Call::Record(slot, image_index));
            Ok(())
        }

        fn submit(&mut self, slot: usize) -> Result<()> {
            self.calls.push(Call::Submit(slot));
            Ok(())
        }

        fn present(&mut self, slot: usize, image_index: u32) -> Result<PresentOutcome> {
            self.calls.push(Call::Present(slot, image_index));
            Ok(self.present.pop().unwrap_or(PresentOutcome::Presented))
        }

        fn regenerate_swapchain(&mut self, _surface: &mut dyn SurfaceProvider) -> Result<bool> {
            self.calls.push(Call::Regenerate);
            Ok(true)
        }

        fn replace_shaders(&mut self, _vertex: CompiledShader, _fragment: CompiledShader) -> Result<()> {
            Ok(())
        }
    }

    struct Surface;

    impl SurfaceProvider for Surface {
        fn framebuffer_size(&self) -> (u32, u32) {
            (800, 600)
        }

        fn wait_events(&mut self) -> bool {
            true
        }
    }

    #[test]
    fn tick_runs_steps_in_protocol_order() {
        let mut device = Recorder::default();
        let mut sync = FrameSynchronizer::new();

        let status = sync.tick(&mut device, &mut Surface, false).unwrap();

        assert_eq!(
            status,
            FrameStatus::Presented {
                image_index: 0,
                recreated: false
            }
        );
        assert_eq!(
            device.calls,
            vec![
                Call::Wait(0),
                Call::Acquire(0),
                Call::Reset(0),
                Call::Record(0, 0),
                Call::Submit(0),
                Call::Present(0, 0),
            ]
        );
        assert_eq!(sync.frame_index(), 1);
        assert_eq!(sync.slot_state(0), SlotState::Presented);
    }

    #[test]
    fn index_wraps_after_max_frames() {
        let mut device = Recorder::default();
        let mut sync = FrameSynchronizer::new();

        for _ in 0..MAX_FRAMES_IN_FLIGHT {
            sync.tick(&mut device, &mut Surface, false).unwrap();
        }

        assert_eq!(sync.frame_index(), 0);
        assert_eq!(sync.frames_presented(), MAX_FRAMES_IN_FLIGHT as u64);
    }

    #[test]
    fn out_of_date_acquire_keeps_fence_and_index() {
        let mut device = Recorder {
            acquire: vec![AcquireOutcome::OutOfDate],
            ..Default::default()
        };
        let mut sync = FrameSynchronizer::new();

        let status = sync.tick(&mut device, &mut Surface, false).unwrap();

        assert_eq!(status, FrameStatus::Skipped);
        assert_eq!(device.calls, vec![Call::Wait(0), Call::Acquire(0), Call::Regenerate]);
        assert_eq!(sync.frame_index(), 0);
        assert_eq!(sync.slot_state(0), SlotState::Idle);
        assert_eq!(sync.recreations(), 1);
        assert_eq!(sync.frames_skipped(), 1);
    }

    #[test]
    fn suboptimal_acquire_recreates_after_present() {
        let mut device = Recorder {
            acquire: vec![AcquireOutcome::Acquired {
                image_index: 2,
                suboptimal: true,
            }],
            ..Default::default()
        };
        let mut sync = FrameSynchronizer::new();

        let status = sync.tick(&mut device, &mut Surface, false).unwrap();

        assert_eq!(
            status,
            FrameStatus::Presented {
                image_index: 2,
                recreated: true
            }
        );
        assert_eq!(device.calls.last(), Some(&Call::Regenerate));
        assert_eq!(sync.frame_index(), 1);
    }

    #[test]
    fn present_outcomes_and_resize_trigger_recreation() {
        let mut device = Recorder {
            present: vec![PresentOutcome::OutOfDate, PresentOutcome::Suboptimal],
            ..Default::default()
        };
        let mut sync = FrameSynchronizer::new();

        for _ in 0..2 {
            sync.tick(&mut device, &mut Surface, false).unwrap();
        }
        assert_eq!(sync.recreations(), 2);

        sync.tick(&mut device, &mut Surface, false).unwrap();
        assert_eq!(sync.recreations(), 2);

        sync.tick(&mut device, &mut Surface, true).unwrap();
        assert_eq!(sync.recreations(), 3);
    }

    #[test]
    fn out_of_order_calls_fail() {
        let mut device = Recorder::default();
        let mut sync = FrameSynchronizer::new();

        assert!(sync.draw(&mut device).is_err());
        assert!(sync.end_frame(&mut device, &mut Surface, false).is_err());

        sync.begin_frame(&mut device, &mut Surface).unwrap();
        assert!(sync.begin_frame(&mut device, &mut Surface).is_err());
        assert!(sync.end_frame(&mut device, &mut Surface, false).is_err());

        sync.draw(&mut device).unwrap();
        assert!(sync.draw(&mut device).is_err());
        sync.end_frame(&mut device, &mut Surface, false).unwrap();
    }
}
