//! Root buckets and the clutch root.
//!
//! Each QoS band owns one root bucket: a FIFO of clutch buckets runnable
//! in that band plus the EDF deadline, warp budget, and starvation stamp
//! that drive band selection.

use std::collections::VecDeque;

use static_assertions::const_assert;

use clutch_api::{Pri, QosBucket, SimTime, NOPRI};

use crate::group::ClutchBucketGroup;

// Band runnability is tracked in a u64 bitmap.
const_assert!(QosBucket::COUNT <= 64);

/// How a root bucket won selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceKind {
    /// Fixed-priority lane, outside the EDF race
    Fixpri,
    /// Normal earliest-deadline-first winner
    Edf,
    /// Higher band overriding EDF on warp budget
    Warp,
    /// Starved band elevated past warp and EDF
    Starvation,
}

/// Per-band root bucket.
#[derive(Debug)]
pub struct RootBucket {
    pub band: QosBucket,
    /// Clutch bucket groups (arena indices) runnable in this band,
    /// round-robin order
    fifo: VecDeque<usize>,
    /// Absolute EDF virtual deadline
    pub deadline: SimTime,
    /// Remaining warp budget
    pub warp_remaining: u64,
    /// End of the open warp window; `None` while no window is open
    pub warped_deadline: Option<SimTime>,
    /// Last time the band received service while runnable
    pub starvation_ts: SimTime,
}

impl RootBucket {
    fn new(band: QosBucket) -> Self {
        Self {
            band,
            fifo: VecDeque::new(),
            deadline: 0,
            warp_remaining: band.warp_us(),
            warped_deadline: None,
            starvation_ts: 0,
        }
    }

    pub fn is_runnable(&self) -> bool {
        !self.fifo.is_empty()
    }

    pub fn fifo_head(&self) -> Option<usize> {
        self.fifo.front().copied()
    }

    pub fn fifo_len(&self) -> usize {
        self.fifo.len()
    }

    /// Whether this band may override EDF on warp at `now`: budget left
    /// and either no window open yet or the open window still running.
    pub fn warp_available(&self, now: SimTime) -> bool {
        if self.warp_remaining == 0 {
            return false;
        }
        match self.warped_deadline {
            None => true,
            Some(end) => end > now,
        }
    }

    /// Account one selection of this band at `now`.
    pub fn serviced(&mut self, kind: ServiceKind, now: SimTime) {
        match kind {
            ServiceKind::Warp => {
                match self.warped_deadline {
                    // First warp selection opens the window.
                    None => self.warped_deadline = Some(now + self.warp_remaining),
                    // Later selections charge elapsed window time.
                    Some(end) => self.warp_remaining = end.saturating_sub(now),
                }
            }
            ServiceKind::Edf | ServiceKind::Starvation => {
                // Service through the normal EDF path closes any warp
                // window and refills the budget.
                self.warped_deadline = None;
                self.warp_remaining = self.band.warp_us();
            }
            ServiceKind::Fixpri => {}
        }
        if kind != ServiceKind::Fixpri {
            self.deadline = now + self.band.wcel_us();
        }
        self.starvation_ts = now;
    }
}

/// The root of the clutch hierarchy: one root bucket per QoS band.
#[derive(Debug)]
pub struct ClutchRoot {
    pub buckets: [RootBucket; QosBucket::COUNT],
    runnable_bitmap: u64,
}

impl ClutchRoot {
    pub fn new() -> Self {
        Self {
            buckets: [
                RootBucket::new(QosBucket::Fixpri),
                RootBucket::new(QosBucket::Foreground),
                RootBucket::new(QosBucket::UserInitiated),
                RootBucket::new(QosBucket::Default),
                RootBucket::new(QosBucket::Utility),
                RootBucket::new(QosBucket::Background),
            ],
            runnable_bitmap: 0,
        }
    }

    pub fn bucket(&self, band: QosBucket) -> &RootBucket {
        &self.buckets[band.index()]
    }

    pub fn bucket_mut(&mut self, band: QosBucket) -> &mut RootBucket {
        &mut self.buckets[band.index()]
    }

    pub fn is_band_runnable(&self, band: QosBucket) -> bool {
        self.runnable_bitmap & (1 << band.index()) != 0
    }

    /// Insert a clutch bucket group into its band's FIFO. On the
    /// empty-to-runnable transition the band's deadline and starvation
    /// stamp restart from `now`.
    pub fn insert_bucket_group(&mut self, band: QosBucket, cbg_idx: usize, now: SimTime) {
        let rb = &mut self.buckets[band.index()];
        debug_assert!(!rb.fifo.contains(&cbg_idx));
        if rb.fifo.is_empty() {
            rb.deadline = now + band.wcel_us();
            rb.starvation_ts = now;
            self.runnable_bitmap |= 1 << band.index();
        }
        rb.fifo.push_back(cbg_idx);
    }

    /// Remove a clutch bucket group from its band's FIFO.
    pub fn remove_bucket_group(&mut self, band: QosBucket, cbg_idx: usize) {
        let rb = &mut self.buckets[band.index()];
        rb.fifo.retain(|&c| c != cbg_idx);
        if rb.fifo.is_empty() {
            self.runnable_bitmap &= !(1 << band.index());
        }
    }

    /// Rotate the served clutch bucket group to the FIFO tail, or drop it
    /// if its runqueue drained.
    pub fn rotate_bucket_group(&mut self, band: QosBucket, cbg_idx: usize, still_runnable: bool) {
        let rb = &mut self.buckets[band.index()];
        if rb.fifo.front() == Some(&cbg_idx) {
            rb.fifo.pop_front();
        } else {
            rb.fifo.retain(|&c| c != cbg_idx);
        }
        if still_runnable {
            rb.fifo.push_back(cbg_idx);
        } else if rb.fifo.is_empty() {
            self.runnable_bitmap &= !(1 << band.index());
        }
    }

    /// Highest thread priority across the hierarchy, NOPRI when empty.
    pub fn scr_priority(&self, bucket_groups: &[ClutchBucketGroup]) -> Pri {
        let mut best = NOPRI;
        for rb in &self.buckets {
            for &cbg_idx in &rb.fifo {
                best = best.max(bucket_groups[cbg_idx].bucket.runq.highest_pri());
            }
        }
        best
    }
}

impl Default for ClutchRoot {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warp_window_opens_then_charges() {
        let mut rb = RootBucket::new(QosBucket::Foreground);
        let budget = QosBucket::Foreground.warp_us();
        assert!(rb.warp_available(0));

        rb.serviced(ServiceKind::Warp, 1_000);
        assert_eq!(rb.warped_deadline, Some(1_000 + budget));
        assert_eq!(rb.warp_remaining, budget);

        // 3ms later the open window has burned 3ms of budget.
        rb.serviced(ServiceKind::Warp, 4_000);
        assert_eq!(rb.warp_remaining, budget - 3_000);

        // Past the window end, warp is no longer available.
        assert!(!rb.warp_available(1_000 + budget));
    }

    #[test]
    fn edf_service_resets_warp_budget() {
        let mut rb = RootBucket::new(QosBucket::Foreground);
        rb.serviced(ServiceKind::Warp, 0);
        rb.serviced(ServiceKind::Warp, 5_000);
        assert!(rb.warp_remaining < QosBucket::Foreground.warp_us());

        rb.serviced(ServiceKind::Edf, 10_000);
        assert_eq!(rb.warp_remaining, QosBucket::Foreground.warp_us());
        assert_eq!(rb.warped_deadline, None);
    }

    #[test]
    fn service_refreshes_deadline_from_now() {
        let mut rb = RootBucket::new(QosBucket::Background);
        rb.deadline = 100;
        rb.serviced(ServiceKind::Edf, 50);
        assert_eq!(rb.deadline, 50 + QosBucket::Background.wcel_us());
        rb.serviced(ServiceKind::Edf, 2_000_000);
        assert_eq!(rb.deadline, 2_000_000 + QosBucket::Background.wcel_us());
    }

    #[test]
    fn fifo_rotation_round_robins() {
        let mut root = ClutchRoot::new();
        root.insert_bucket_group(QosBucket::Foreground, 0, 0);
        root.insert_bucket_group(QosBucket::Foreground, 1, 0);
        assert_eq!(root.bucket(QosBucket::Foreground).fifo_head(), Some(0));

        root.rotate_bucket_group(QosBucket::Foreground, 0, true);
        assert_eq!(root.bucket(QosBucket::Foreground).fifo_head(), Some(1));

        root.rotate_bucket_group(QosBucket::Foreground, 1, false);
        assert_eq!(root.bucket(QosBucket::Foreground).fifo_head(), Some(0));
        assert!(root.is_band_runnable(QosBucket::Foreground));

        root.rotate_bucket_group(QosBucket::Foreground, 0, false);
        assert!(!root.is_band_runnable(QosBucket::Foreground));
    }
}
