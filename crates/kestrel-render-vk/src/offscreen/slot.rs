// SPDX-License-Identifier: CEPL-1.0
use anyhow::Result;
use kestrel_render::RenderSize;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TargetState {
    Uninitialized,
    Ready,
    /// A different size was requested; rebuilt on the next flush.
    Dirty,
    Destroyed,
}

/// Lifecycle of a resizable render target, independent of what the target is.
#[derive(Debug)]
pub struct OffscreenSlot<T> {
    state: TargetState,
    requested: RenderSize,
    built: RenderSize,
    current: Option<T>,
}

impl<T> Default for OffscreenSlot<T> {
    fn default() -> Self {
        Self {
            state: TargetState::Uninitialized,
            requested: RenderSize::default(),
            built: RenderSize::default(),
            current: None,
        }
    }
}

impl<T> OffscreenSlot<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> TargetState {
        self.state
    }

    pub fn requested_size(&self) -> RenderSize {
        self.requested
    }

    pub fn built_size(&self) -> RenderSize {
        self.built
    }

    /// Returns true when this call marked the slot dirty. Empty sizes, the
    /// already-requested size and a destroyed slot are ignored. Asking for the
    /// built size again cancels a pending rebuild.
    pub fn request_resize(&mut self, size: RenderSize) -> bool {
        if size.is_empty() || self.state == TargetState::Destroyed {
            return false;
        }
        if self.state == TargetState::Dirty && size == self.built {
            self.requested = self.built;
            self.state = TargetState::Ready;
            return false;
        }
        if size == self.requested {
            return false;
        }
        self.requested = size;
        match self.state {
            TargetState::Ready => {
                self.state = TargetState::Dirty;
                true
            }
            _ => false,
        }
    }

    pub fn needs_rebuild(&self) -> bool {
        !self.requested.is_empty()
            && matches!(self.state, TargetState::Uninitialized | TargetState::Dirty)
    }

    /// Builds a replacement when one is needed. `build` receives the requested
    /// size and the previous instance, which it must dispose of before
    /// creating the new one. Returns whether a rebuild happened.
    pub fn rebuild_with(
        &mut self,
        build: impl FnOnce(RenderSize, Option<T>) -> Result<T>,
    ) -> Result<bool> {
        if !self.needs_rebuild() {
            return Ok(false);
        }
        let old = self.current.take();
        match build(self.requested, old) {
            Ok(target) => {
                self.current = Some(target);
                self.built = self.requested;
                self.state = TargetState::Ready;
                Ok(true)
            }
            Err(e) => {
                self.built = RenderSize::default();
                self.state = TargetState::Uninitialized;
                Err(e)
            }
        }
    }

    pub fn current(&self) -> Option<&T> {
        self.current.as_ref()
    }

    /// Hands back the live instance; the slot accepts no further requests.
    pub fn destroy(&mut self) -> Option<T> {
        self.state = TargetState::Destroyed;
        self.current.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    fn ready(size: RenderSize) -> OffscreenSlot<u32> {
        let mut slot = OffscreenSlot::new();
        slot.request_resize(size);
        assert!(slot.rebuild_with(|_, _| Ok(1)).unwrap());
        slot
    }

    #[test]
    fn first_request_builds_once() {
        let mut slot: OffscreenSlot<u32> = OffscreenSlot::new();
        assert!(!slot.needs_rebuild());
        slot.request_resize(RenderSize::new(320, 200));
        assert!(slot.needs_rebuild());

        let mut calls = 0;
        slot.rebuild_with(|size, old| {
            calls += 1;
            assert_eq!(size, RenderSize::new(320, 200));
            assert!(old.is_none());
            Ok(7)
        })
        .unwrap();
        assert_eq!(slot.state(), TargetState::Ready);
        assert_eq!(slot.current(), Some(&7));
        assert!(!slot.rebuild_with(|_, _| Ok(8)).unwrap());
        assert_eq!(calls, 1);
    }

    #[test]
    fn resize_to_current_size_is_a_noop() {
        let size = RenderSize::new(640, 480);
        let mut slot = ready(size);
        assert!(!slot.request_resize(size));
        assert_eq!(slot.state(), TargetState::Ready);
        assert!(!slot.needs_rebuild());
    }

    #[test]
    fn repeated_requests_mark_dirty_once() {
        let mut slot = ready(RenderSize::new(100, 100));
        let bigger = RenderSize::new(200, 100);
        assert!(slot.request_resize(bigger));
        assert!(!slot.request_resize(bigger));
        assert!(!slot.request_resize(RenderSize::new(300, 100)));
        assert_eq!(slot.state(), TargetState::Dirty);
        assert_eq!(slot.requested_size(), RenderSize::new(300, 100));

        slot.rebuild_with(|size, old| {
            assert_eq!(old, Some(1));
            assert_eq!(size, RenderSize::new(300, 100));
            Ok(2)
        })
        .unwrap();
        assert_eq!(slot.built_size(), RenderSize::new(300, 100));
        assert_eq!(slot.state(), TargetState::Ready);
    }

    #[test]
    fn resizing_back_before_flush_cancels_rebuild() {
        let built = RenderSize::new(100, 100);
        let mut slot = ready(built);
        assert!(slot.request_resize(RenderSize::new(200, 100)));
        assert!(!slot.request_resize(built));
        assert_eq!(slot.state(), TargetState::Ready);
        assert_eq!(slot.requested_size(), built);
        assert!(!slot.needs_rebuild());
        assert!(!slot.rebuild_with(|_, _| Ok(2)).unwrap());
        assert_eq!(slot.current(), Some(&1));

        // a real change afterwards still marks dirty
        assert!(slot.request_resize(RenderSize::new(200, 100)));
        assert!(slot.needs_rebuild());
    }

    #[test]
    fn empty_sizes_are_ignored() {
        let mut slot = ready(RenderSize::new(10, 10));
        assert!(!slot.request_resize(RenderSize::new(0, 10)));
        assert!(!slot.request_resize(RenderSize::new(10, 0)));
        assert_eq!(slot.state(), TargetState::Ready);
    }

    #[test]
    fn failed_build_leaves_slot_rebuildable() {
        let mut slot = ready(RenderSize::new(10, 10));
        slot.request_resize(RenderSize::new(20, 20));
        assert!(slot.rebuild_with(|_, _| Err(anyhow!("out of memory"))).is_err());
        assert_eq!(slot.state(), TargetState::Uninitialized);
        assert!(slot.current().is_none());
        assert!(slot.needs_rebuild());
    }

    #[test]
    fn destroyed_slot_rejects_requests() {
        let mut slot = ready(RenderSize::new(10, 10));
        assert_eq!(slot.destroy(), Some(1));
        assert!(!slot.request_resize(RenderSize::new(20, 20)));
        assert!(!slot.needs_rebuild());
        assert_eq!(slot.state(), TargetState::Destroyed);
    }
}
