//! Rolling duplicate-detection window.
//!
//! Dual-send delivers the same content over both transports, so every
//! receiver sees most items twice. The window remembers recent fingerprints
//! per originating device and reports a repeat inside the window as a
//! duplicate.
//!
//! Time is passed in by the caller, so the window itself never reads a clock.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use clipsync_types::DeviceId;

use crate::ContentFingerprint;

/// Default duplicate window (5 seconds).
pub const DEFAULT_DEDUP_WINDOW: Duration = Duration::from_secs(5);

/// Per-device bound on remembered fingerprints.
const MAX_ENTRIES_PER_DEVICE: usize = 256;

/// Recently seen fingerprints, partitioned by originating device.
#[derive(Debug)]
pub struct DedupWindow {
    window: Duration,
    seen: HashMap<DeviceId, VecDeque<(Instant, ContentFingerprint)>>,
}

impl Default for DedupWindow {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_WINDOW)
    }
}

impl DedupWindow {
    /// Create a window of the given length.
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            seen: HashMap::new(),
        }
    }

    /// The configured window length.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Check `fingerprint` against the device's partition and record it.
    ///
    /// Returns `true` if an identical fingerprint was seen from `device`
    /// within the window. Duplicates are not re-recorded, so a stream of
    /// repeats cannot keep an entry alive forever.
    pub fn check_and_record(
        &mut self,
        device: &DeviceId,
        fingerprint: ContentFingerprint,
        now: Instant,
    ) -> bool {
        let window = self.window;
        let entries = self.seen.entry(device.clone()).or_default();
        evict_expired(entries, window, now);

        if entries.iter().any(|(_, fp)| *fp == fingerprint) {
            return true;
        }

        if entries.len() >= MAX_ENTRIES_PER_DEVICE {
            entries.pop_front();
        }
        entries.push_back((now, fingerprint));
        false
    }

    /// Check without recording.
    pub fn contains(&self, device: &DeviceId, fingerprint: &ContentFingerprint, now: Instant) -> bool {
        self.seen.get(device).is_some_and(|entries| {
            entries
                .iter()
                .any(|(at, fp)| fp == fingerprint && now.saturating_duration_since(*at) < self.window)
        })
    }

    /// Record without checking.
    pub fn record(&mut self, device: &DeviceId, fingerprint: ContentFingerprint, now: Instant) {
        let window = self.window;
        let entries = self.seen.entry(device.clone()).or_default();
        evict_expired(entries, window, now);
        if entries.len() >= MAX_ENTRIES_PER_DEVICE {
            entries.pop_front();
        }
        entries.push_back((now, fingerprint));
    }

    /// Drop expired entries and empty partitions.
    pub fn prune(&mut self, now: Instant) {
        let window = self.window;
        self.seen.retain(|_, entries| {
            evict_expired(entries, window, now);
            !entries.is_empty()
        });
    }

    /// Number of devices with live entries.
    pub fn device_count(&self) -> usize {
        self.seen.len()
    }
}

fn evict_expired(
    entries: &mut VecDeque<(Instant, ContentFingerprint)>,
    window: Duration,
    now: Instant,
) {
    while let Some((at, _)) = entries.front() {
        if now.saturating_duration_since(*at) >= window {
            entries.pop_front();
        } else {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clipsync_types::ContentType;

    fn id(s: &str) -> DeviceId {
        DeviceId::new(s).unwrap()
    }

    fn fp(s: &str) -> ContentFingerprint {
        ContentFingerprint::of(ContentType::Text, s.as_bytes())
    }

    #[test]
    fn second_arrival_within_window_is_duplicate() {
        let mut window = DedupWindow::default();
        let t0 = Instant::now();

        assert!(!window.check_and_record(&id("mac"), fp("hello"), t0));
        assert!(window.check_and_record(&id("mac"), fp("hello"), t0 + Duration::from_millis(40)));
    }

    #[test]
    fn arrival_after_window_is_fresh() {
        let mut window = DedupWindow::new(Duration::from_secs(5));
        let t0 = Instant::now();

        assert!(!window.check_and_record(&id("mac"), fp("hello"), t0));
        assert!(!window.check_and_record(&id("mac"), fp("hello"), t0 + Duration::from_secs(5)));
    }

    #[test]
    fn partitions_are_per_device() {
        let mut window = DedupWindow::default();
        let t0 = Instant::now();

        assert!(!window.check_and_record(&id("mac"), fp("hello"), t0));
        assert!(!window.check_and_record(&id("pixel"), fp("hello"), t0));
        assert_eq!(window.device_count(), 2);
    }

    #[test]
    fn different_content_is_not_duplicate() {
        let mut window = DedupWindow::default();
        let t0 = Instant::now();

        assert!(!window.check_and_record(&id("mac"), fp("abcd"), t0));
        assert!(!window.check_and_record(&id("mac"), fp("abce"), t0));
    }

    #[test]
    fn duplicates_do_not_extend_the_window() {
        let mut window = DedupWindow::new(Duration::from_secs(5));
        let t0 = Instant::now();

        window.check_and_record(&id("mac"), fp("x"), t0);
        assert!(window.check_and_record(&id("mac"), fp("x"), t0 + Duration::from_secs(4)));
        // Still measured from the first sighting.
        assert!(!window.check_and_record(&id("mac"), fp("x"), t0 + Duration::from_secs(6)));
    }

    #[test]
    fn record_then_contains() {
        let mut window = DedupWindow::default();
        let t0 = Instant::now();

        window.record(&id("me"), fp("copied"), t0);
        assert!(window.contains(&id("me"), &fp("copied"), t0 + Duration::from_secs(1)));
        assert!(!window.contains(&id("me"), &fp("copied"), t0 + Duration::from_secs(10)));
        assert!(!window.contains(&id("other"), &fp("copied"), t0));
    }

    #[test]
    fn prune_drops_empty_partitions() {
        let mut window = DedupWindow::new(Duration::from_secs(1));
        let t0 = Instant::now();

        window.record(&id("a"), fp("1"), t0);
        window.record(&id("b"), fp("2"), t0 + Duration::from_secs(2));
        window.prune(t0 + Duration::from_millis(2500));

        assert_eq!(window.device_count(), 1);
    }

    #[test]
    fn partition_is_bounded() {
        let mut window = DedupWindow::default();
        let t0 = Instant::now();

        for i in 0..(MAX_ENTRIES_PER_DEVICE + 10) {
            window.record(&id("a"), fp(&i.to_string()), t0);
        }
        assert!(!window.contains(&id("a"), &fp("0"), t0));
        assert!(window.contains(&id("a"), &fp("265"), t0));
    }
}
