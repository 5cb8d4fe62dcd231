// GPU handle tracking
//
// Counts live Vulkan objects by kind. Every creation and destruction site
// reports here, so teardown can tell whether anything leaked.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Kinds of GPU handles owned by the graphics context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Surface,
    DebugMessenger,
    Swapchain,
    ImageView,
    Framebuffer,
    RenderPass,
    PipelineLayout,
    Pipeline,
    ShaderModule,
    CommandPool,
    Semaphore,
    Fence,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 12] = [
        ResourceKind::Surface,
        ResourceKind::DebugMessenger,
        ResourceKind::Swapchain,
        ResourceKind::ImageView,
        ResourceKind::Framebuffer,
        ResourceKind::RenderPass,
        ResourceKind::PipelineLayout,
        ResourceKind::Pipeline,
        ResourceKind::ShaderModule,
        ResourceKind::CommandPool,
        ResourceKind::Semaphore,
        ResourceKind::Fence,
    ];

    fn slot(self) -> usize {
        self as usize
    }
}

#[derive(Default)]
struct Counter {
    live: AtomicUsize,
    total: AtomicUsize,
}

/// Live/total counters per [`ResourceKind`]
#[derive(Default)]
pub struct ResourceTracker {
    counters: [Counter; ResourceKind::ALL.len()],
}

impl ResourceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn created(&self, kind: ResourceKind) {
        self.created_n(kind, 1);
    }

    pub fn created_n(&self, kind: ResourceKind, count: usize) {
        let counter = &self.counters[kind.slot()];
        counter.live.fetch_add(count, Ordering::Relaxed);
        counter.total.fetch_add(count, Ordering::Relaxed);
    }

    pub fn destroyed(&self, kind: ResourceKind) {
        self.destroyed_n(kind, 1);
    }

    pub fn destroyed_n(&self, kind: ResourceKind, count: usize) {
        let counter = &self.counters[kind.slot()];
        let previous = counter.live.fetch_sub(count, Ordering::Relaxed);
        debug_assert!(previous >= count, "{kind:?} destroyed more often than created");
    }

    /// Handles of this kind currently alive
    pub fn live(&self, kind: ResourceKind) -> usize {
        self.counters[kind.slot()].live.load(Ordering::Relaxed)
    }

    /// Handles of this kind ever created
    pub fn created_total(&self, kind: ResourceKind) -> usize {
        self.counters[kind.slot()].total.load(Ordering::Relaxed)
    }

    pub fn total_live(&self) -> usize {
        ResourceKind::ALL.iter().map(|&kind| self.live(kind)).sum()
    }

    /// Log every kind that still has live handles. Returns the leak count.
    pub fn report_leaks(&self) -> usize {
        let mut leaked = 0;
        for kind in ResourceKind::ALL {
            let live = self.live(kind);
            if live > 0 {
                log::warn!("{} {:?} handle(s) still alive", live, kind);
                leaked += live;
            }
        }
        leaked
    }
}

impl std::fmt::Debug for ResourceTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut map = f.debug_map();
        for kind in ResourceKind::ALL {
            map.entry(&kind, &self.live(kind));
        }
        map.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_live_and_total_separately() {
        let tracker = ResourceTracker::new();
        tracker.created_n(ResourceKind::ImageView, 3);
        tracker.destroyed_n(ResourceKind::ImageView, 3);
        tracker.created_n(ResourceKind::ImageView, 2);

        assert_eq!(tracker.live(ResourceKind::ImageView), 2);
        assert_eq!(tracker.created_total(ResourceKind::ImageView), 5);
        assert_eq!(tracker.live(ResourceKind::Framebuffer), 0);
    }

    #[test]
    fn report_leaks_sums_all_kinds() {
        let tracker = ResourceTracker::new();
        tracker.created(ResourceKind::Fence);
        tracker.created(ResourceKind::Semaphore);
        tracker.created(ResourceKind::Semaphore);
        tracker.destroyed(ResourceKind::Semaphore);

        assert_eq!(tracker.total_live(), 2);
        assert_eq!(tracker.report_leaks(), 2);
    }

    #[test]
    fn every_kind_has_a_distinct_slot() {
        for (index, kind) in ResourceKind::ALL.iter().enumerate() {
            assert_eq!(kind.slot(), index);
        }
    }
}
