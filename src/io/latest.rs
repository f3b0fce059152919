//! Latest-result slot shared between the acquisition worker and readers
//!
//! Holds exactly one [`AcquisitionResult`]. Publishing overwrites it; reading
//! copies it out and clears the fresh flag, so a reader sees each result at
//! most once.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::protocol::acquisition::AcquisitionResult;

#[derive(Debug, Default)]
struct Slot {
    data: AcquisitionResult,
    fresh: bool,
}

/// Single-slot store for the most recent acquisition
#[derive(Debug, Default)]
pub struct LatestData {
    slot: Mutex<Slot>,
}

impl LatestData {
    /// Create an empty slot
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        // A panicking reader cannot leave the slot half-written
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Replace the stored result without marking it fresh
    ///
    /// Used to lay down the static fields before the first cycle.
    pub fn seed(&self, data: AcquisitionResult) {
        let mut slot = self.lock();
        slot.data = data;
        slot.fresh = false;
    }

    /// Store a new result and mark it fresh
    pub fn publish(&self, data: AcquisitionResult) {
        let mut slot = self.lock();
        slot.data = data;
        slot.fresh = true;
    }

    /// Copy the stored result into `out` if it has not been read yet
    ///
    /// Returns `true` and clears the fresh flag when a new result was
    /// copied; otherwise leaves `out` untouched and returns `false`.
    pub fn take(&self, out: &mut AcquisitionResult) -> bool {
        let mut slot = self.lock();
        if !slot.fresh {
            return false;
        }
        out.clone_from(&slot.data);
        slot.fresh = false;
        true
    }

    /// Whether an unread result is waiting
    pub fn is_fresh(&self) -> bool {
        self.lock().fresh
    }

    /// Copy of the stored result, fresh or not
    pub fn snapshot(&self) -> AcquisitionResult {
        self.lock().data.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(max_amplitude: i32) -> AcquisitionResult {
        AcquisitionResult {
            max_amplitude,
            ..Default::default()
        }
    }

    #[test]
    fn test_read_once_semantics() {
        let latest = LatestData::new();
        let mut out = AcquisitionResult::default();

        assert!(!latest.take(&mut out));

        latest.publish(result(7));
        assert!(latest.take(&mut out));
        assert_eq!(out.max_amplitude, 7);
        assert!(!latest.take(&mut out));
    }

    #[test]
    fn test_publish_overwrites_unread() {
        let latest = LatestData::new();
        latest.publish(result(1));
        latest.publish(result(2));

        let mut out = AcquisitionResult::default();
        assert!(latest.take(&mut out));
        assert_eq!(out.max_amplitude, 2);
    }

    #[test]
    fn test_seed_is_not_fresh() {
        let latest = LatestData::new();
        latest.seed(result(5));
        assert!(!latest.is_fresh());
        assert_eq!(latest.snapshot().max_amplitude, 5);

        let mut out = result(-1);
        assert!(!latest.take(&mut out));
        assert_eq!(out.max_amplitude, -1);
    }

    #[test]
    fn test_concurrent_readers_each_result_once() {
        let latest = LatestData::new();
        latest.publish(result(3));

        let hits: usize = std::thread::scope(|s| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let latest = &latest;
                    s.spawn(move || {
                        let mut out = AcquisitionResult::default();
                        usize::from(latest.take(&mut out))
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });

        assert_eq!(hits, 1);
    }
}
