// SPDX-License-Identifier: CEPL-1.0
//! Superseded resources parked until the swapchain image that last saw them
//! comes around again.

pub struct DeferredRetirement<T> {
    pending: Vec<T>,
    by_image: Vec<Vec<T>>,
}

impl<T> DeferredRetirement<T> {
    pub fn new(image_count: usize) -> Self {
        Self {
            pending: Vec::new(),
            by_image: (0..image_count).map(|_| Vec::new()).collect(),
        }
    }

    /// Parks `item` until the next acquired image is committed.
    pub fn retire(&mut self, item: T) {
        self.pending.push(item);
    }

    /// Called once `image_index` has been acquired: drops whatever was filed
    /// under that index last time round, then files the pending items there.
    pub fn commit(&mut self, image_index: u32) {
        let Some(bucket) = self.by_image.get_mut(image_index as usize) else {
            return;
        };
        bucket.clear();
        bucket.append(&mut self.pending);
    }

    /// Drops everything. Only valid once the device is idle.
    pub fn flush_all(&mut self) {
        self.pending.clear();
        for bucket in &mut self.by_image {
            bucket.clear();
        }
    }

    /// Re-keys for a new swapchain image count. Only valid once the device is
    /// idle; everything already filed is dropped.
    pub fn resize(&mut self, image_count: usize) {
        for bucket in &mut self.by_image {
            bucket.clear();
        }
        self.by_image.resize_with(image_count, Vec::new);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn retained_count(&self) -> usize {
        self.by_image.iter().map(Vec::len).sum()
    }

    pub fn image_count(&self) -> usize {
        self.by_image.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    /// Stands in for a GPU target: records whether its fence had signalled by
    /// the time it was dropped.
    struct Tracked {
        fence_signalled: Rc<Cell<bool>>,
        dropped: Rc<Cell<bool>>,
        dropped_early: Rc<Cell<bool>>,
    }

    impl Drop for Tracked {
        fn drop(&mut self) {
            if !self.fence_signalled.get() {
                self.dropped_early.set(true);
            }
            self.dropped.set(true);
        }
    }

    fn tracked() -> (Tracked, Rc<Cell<bool>>, Rc<Cell<bool>>, Rc<Cell<bool>>) {
        let fence = Rc::new(Cell::new(false));
        let dropped = Rc::new(Cell::new(false));
        let early = Rc::new(Cell::new(false));
        let t = Tracked {
            fence_signalled: fence.clone(),
            dropped: dropped.clone(),
            dropped_early: early.clone(),
        };
        (t, fence, dropped, early)
    }

    #[test]
    fn superseded_target_lives_until_its_image_returns() {
        let mut retired = DeferredRetirement::new(3);
        let (old, fence, dropped, early) = tracked();

        retired.retire(old);
        assert_eq!(retired.pending_count(), 1);

        // Frame on image 1 takes ownership of the pending item.
        retired.commit(1);
        assert_eq!((retired.pending_count(), retired.retained_count()), (0, 1));

        retired.commit(2);
        retired.commit(0);
        assert!(!dropped.get());

        // The GPU finishes with image 1's frame before the image is handed back.
        fence.set(true);
        retired.commit(1);
        assert!(dropped.get());
        assert!(!early.get());
        assert_eq!(retired.retained_count(), 0);
    }

    #[test]
    fn commit_drops_old_before_filing_new() {
        let mut retired = DeferredRetirement::new(2);
        let (first, f1, d1, _) = tracked();
        let (second, _, d2, _) = tracked();
        f1.set(true);

        retired.retire(first);
        retired.commit(0);
        retired.retire(second);
        retired.commit(0);

        assert!(d1.get());
        assert!(!d2.get());
        assert_eq!(retired.retained_count(), 1);
    }

    #[test]
    fn flush_and_resize_release_everything() {
        let mut retired = DeferredRetirement::new(2);
        retired.retire(1);
        retired.commit(0);
        retired.retire(2);
        retired.flush_all();
        assert_eq!((retired.pending_count(), retired.retained_count()), (0, 0));

        retired.retire(3);
        retired.commit(1);
        retired.resize(4);
        assert_eq!(retired.image_count(), 4);
        assert_eq!(retired.retained_count(), 0);
    }

    #[test]
    fn out_of_range_commit_keeps_items_pending() {
        let mut retired = DeferredRetirement::new(1);
        retired.retire("x");
        retired.commit(5);
        assert_eq!(retired.pending_count(), 1);
    }
}
