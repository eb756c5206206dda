//! Core identifiers, priority range, QoS buckets, and scheduling parameters.

use bitflags::bitflags;
use serde::Serialize;

use crate::error::{Error, Result};

/// Thread ID type
pub type Tid = usize;

/// Thread group ID type
pub type GroupId = usize;

/// Processor (logical CPU) ID type
pub type ProcessorId = usize;

/// Simulation time in microseconds
pub type SimTime = u64;

/// Scheduling priority. Valid priorities are `MINPRI..=MAXPRI`; `NOPRI`
/// marks the absence of a runnable candidate.
pub type Pri = i32;

/// Sentinel for "no priority" (empty runqueue)
pub const NOPRI: Pri = -1;
/// Lowest scheduling priority
pub const MINPRI: Pri = 0;
/// Highest scheduling priority
pub const MAXPRI: Pri = 127;
/// Base of the real-time priority band (96..=127)
pub const BASEPRI_RTQUEUES: Pri = 96;
/// Base priority of foreground timeshare threads
pub const BASEPRI_FOREGROUND: Pri = 47;
/// Base priority of user-initiated timeshare threads
pub const BASEPRI_USER_INITIATED: Pri = 37;
/// Default timeshare base priority
pub const BASEPRI_DEFAULT: Pri = 31;
/// Base priority of utility timeshare threads
pub const BASEPRI_UTILITY: Pri = 20;
/// Ceiling of the throttled (background) band
pub const MAXPRI_THROTTLE: Pri = 4;

/// Thread states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ThreadState {
    /// Blocked, waiting for a wakeup
    Waiting,
    /// Ready to run, enqueued in exactly one runqueue
    Runnable,
    /// Installed on a processor
    Running,
    /// Terminated; absorbing state
    Terminated,
}

/// Thread scheduling policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SchedPolicy {
    /// Fair-share timesharing with usage decay
    Timeshare,
    /// Real-time with period / computation / constraint parameters
    Realtime,
    /// Fixed priority, no decay
    Fixpri,
}

/// The six QoS bands of the clutch hierarchy, highest first.
///
/// The discriminant is the root-bucket index; lower index means higher
/// urgency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum QosBucket {
    /// Fixed-priority lane, always above the timeshare bands
    Fixpri = 0,
    /// Foreground (FG)
    Foreground = 1,
    /// User-initiated (IN)
    UserInitiated = 2,
    /// Default (DF)
    Default = 3,
    /// Utility (UT)
    Utility = 4,
    /// Background (BG)
    Background = 5,
}

impl QosBucket {
    /// Number of QoS bands
    pub const COUNT: usize = 6;

    /// All bands, highest urgency first
    pub const ALL: [QosBucket; Self::COUNT] = [
        QosBucket::Fixpri,
        QosBucket::Foreground,
        QosBucket::UserInitiated,
        QosBucket::Default,
        QosBucket::Utility,
        QosBucket::Background,
    ];

    /// Root-bucket index of this band
    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    /// Band for a root-bucket index
    pub fn from_index(index: usize) -> Option<QosBucket> {
        Self::ALL.get(index).copied()
    }

    /// Band a timeshare thread of the given base priority belongs to.
    pub fn from_base_pri(base_pri: Pri) -> QosBucket {
        if base_pri >= BASEPRI_FOREGROUND {
            QosBucket::Foreground
        } else if base_pri >= BASEPRI_USER_INITIATED {
            QosBucket::UserInitiated
        } else if base_pri >= BASEPRI_DEFAULT {
            QosBucket::Default
        } else if base_pri >= BASEPRI_UTILITY {
            QosBucket::Utility
        } else {
            QosBucket::Background
        }
    }

    /// Worst-case execution latency for the band, in microseconds.
    ///
    /// This is the increment applied to a root bucket's virtual deadline
    /// each time the band is served; smaller values make the band win the
    /// EDF race more often.
    pub fn wcel_us(self) -> u64 {
        match self {
            QosBucket::Fixpri => 0,
            QosBucket::Foreground => 37_500,
            QosBucket::UserInitiated => 75_000,
            QosBucket::Default => 150_000,
            QosBucket::Utility => 250_000,
            QosBucket::Background => 500_000,
        }
    }

    /// Full warp budget for the band, in microseconds.
    pub fn warp_us(self) -> u64 {
        match self {
            QosBucket::Fixpri => 0,
            QosBucket::Foreground => 8_000,
            QosBucket::UserInitiated => 4_000,
            QosBucket::Default => 2_000,
            QosBucket::Utility => 1_000,
            QosBucket::Background => 0,
        }
    }

    /// Short label used in trace lines and snapshots.
    pub fn label(self) -> &'static str {
        match self {
            QosBucket::Fixpri => "FIXPRI",
            QosBucket::Foreground => "FG",
            QosBucket::UserInitiated => "IN",
            QosBucket::Default => "DF",
            QosBucket::Utility => "UT",
            QosBucket::Background => "BG",
        }
    }
}

bitflags! {
    /// Options accepted by `thread_setrun`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SetrunFlags: u32 {
        /// Run the preemption check eagerly, allowing equal-priority preemption
        const PREEMPT = 1 << 0;
        /// Force tail insertion among equal-priority threads
        const TAILQ = 1 << 1;
        /// Force head insertion among equal-priority threads
        const HEADQ = 1 << 2;
    }
}

/// Real-time scheduling parameters.
///
/// All values are in microseconds of simulation time. `period_us == 0`
/// means a one-shot activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RtParams {
    /// Activation period; 0 for one-shot
    pub period_us: u64,
    /// Computation burst per activation
    pub computation_us: u64,
    /// Relative deadline from activation
    pub constraint_us: u64,
}

impl RtParams {
    /// Validate the parameter block at construction time.
    pub fn validate(&self) -> Result<()> {
        if self.computation_us == 0 {
            return Err(Error::InvalidArgument(
                "rt computation must be positive".into(),
            ));
        }
        if self.constraint_us < self.computation_us {
            return Err(Error::InvalidArgument(
                "rt constraint shorter than computation".into(),
            ));
        }
        if self.period_us != 0 && self.period_us < self.computation_us {
            return Err(Error::InvalidArgument(
                "rt period shorter than computation".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_indices_round_trip() {
        for band in QosBucket::ALL {
            assert_eq!(QosBucket::from_index(band.index()), Some(band));
        }
        assert_eq!(QosBucket::from_index(QosBucket::COUNT), None);
    }

    #[test]
    fn base_pri_band_mapping() {
        assert_eq!(QosBucket::from_base_pri(50), QosBucket::Foreground);
        assert_eq!(QosBucket::from_base_pri(47), QosBucket::Foreground);
        assert_eq!(QosBucket::from_base_pri(40), QosBucket::UserInitiated);
        assert_eq!(QosBucket::from_base_pri(31), QosBucket::Default);
        assert_eq!(QosBucket::from_base_pri(25), QosBucket::Utility);
        assert_eq!(QosBucket::from_base_pri(4), QosBucket::Background);
    }

    #[test]
    fn wcel_orders_bands() {
        // A higher band must carry a shorter deadline increment.
        let mut prev = 0;
        for band in &QosBucket::ALL[1..] {
            assert!(band.wcel_us() > prev);
            prev = band.wcel_us();
        }
    }

    #[test]
    fn rt_params_validation() {
        let ok = RtParams {
            period_us: 10_000,
            computation_us: 3_000,
            constraint_us: 5_000,
        };
        assert!(ok.validate().is_ok());

        let bad = RtParams {
            period_us: 2_000,
            computation_us: 3_000,
            constraint_us: 5_000,
        };
        assert!(bad.validate().is_err());
    }
}
