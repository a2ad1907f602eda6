//! Task-scoped tracked memory
//!
//! Task bodies register the large buffers they hold with the tracker of
//! their attempt. Whatever is still registered when the body returns is a
//! leak: the runner reads it back through [`MemoryTracker::teardown`].

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::warn;

/// Handle to a tracked region, returned by [`MemoryTracker::allocate`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegionHandle(u64);

#[derive(Debug, Default)]
struct TrackerState {
    regions: HashMap<u64, u64>,
    next_handle: u64,
    outstanding: u64,
    peak: u64,
}

/// Per-attempt accounting of tracked memory regions
#[derive(Debug)]
pub struct MemoryTracker {
    task_id: i64,
    state: Mutex<TrackerState>,
}

impl MemoryTracker {
    pub fn new(task_id: i64) -> Self {
        Self {
            task_id,
            state: Mutex::new(TrackerState::default()),
        }
    }

    /// Record a region of `bytes` as held by this task
    pub fn allocate(&self, bytes: u64) -> RegionHandle {
        let mut state = self.state.lock();
        let handle = state.next_handle;
        state.next_handle += 1;
        state.regions.insert(handle, bytes);
        state.outstanding += bytes;
        state.peak = state.peak.max(state.outstanding);
        RegionHandle(handle)
    }

    /// Release a region. Returns the bytes freed; releasing twice frees nothing.
    pub fn release(&self, handle: RegionHandle) -> u64 {
        let mut state = self.state.lock();
        match state.regions.remove(&handle.0) {
            Some(bytes) => {
                state.outstanding -= bytes;
                bytes
            }
            None => {
                warn!(task_id = self.task_id, handle = handle.0, "Release of unknown memory region");
                0
            }
        }
    }

    /// Track a region for the lifetime of the returned guard
    pub fn track(&self, bytes: u64) -> TrackedRegion<'_> {
        TrackedRegion {
            tracker: self,
            handle: self.allocate(bytes),
        }
    }

    pub fn outstanding_bytes(&self) -> u64 {
        self.state.lock().outstanding
    }

    pub fn peak_bytes(&self) -> u64 {
        self.state.lock().peak
    }

    /// Drop every remaining region and return how many bytes were leaked
    pub fn teardown(&self) -> u64 {
        let mut state = self.state.lock();
        let leaked = state.outstanding;
        state.regions.clear();
        state.outstanding = 0;
        leaked
    }
}

/// Guard that releases its region when dropped
#[derive(Debug)]
pub struct TrackedRegion<'a> {
    tracker: &'a MemoryTracker,
    handle: RegionHandle,
}

impl TrackedRegion<'_> {
    pub fn handle(&self) -> RegionHandle {
        self.handle
    }
}

impl Drop for TrackedRegion<'_> {
    fn drop(&mut self) {
        self.tracker.release(self.handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_and_release_balance() {
        let tracker = MemoryTracker::new(1);
        let a = tracker.allocate(100);
        let b = tracker.allocate(50);
        assert_eq!(tracker.outstanding_bytes(), 150);

        assert_eq!(tracker.release(a), 100);
        assert_eq!(tracker.release(b), 50);
        assert_eq!(tracker.outstanding_bytes(), 0);
        assert_eq!(tracker.peak_bytes(), 150);
        assert_eq!(tracker.teardown(), 0);
    }

    #[test]
    fn test_unreleased_region_is_leaked() {
        let tracker = MemoryTracker::new(7);
        let _ = tracker.allocate(4096);
        assert_eq!(tracker.teardown(), 4096);
        // teardown clears the accounting
        assert_eq!(tracker.teardown(), 0);
    }

    #[test]
    fn test_double_release_is_noop() {
        let tracker = MemoryTracker::new(1);
        let handle = tracker.allocate(10);
        assert_eq!(tracker.release(handle), 10);
        assert_eq!(tracker.release(handle), 0);
        assert_eq!(tracker.outstanding_bytes(), 0);
    }

    #[test]
    fn test_tracked_region_releases_on_drop() {
        let tracker = MemoryTracker::new(1);
        {
            let _region = tracker.track(256);
            assert_eq!(tracker.outstanding_bytes(), 256);
        }
        assert_eq!(tracker.outstanding_bytes(), 0);
        assert_eq!(tracker.peak_bytes(), 256);
    }
}
