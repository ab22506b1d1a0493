pub mod band;
pub mod emission;
pub mod error;
pub mod frequency_plan;
pub mod helper;
pub mod rollover_clock;
pub mod scheduler;
pub mod sub_band;
pub mod time_on_air;

use std::fmt;
use std::ops::{Add, AddAssign, Neg, Sub, SubAssign};
use std::str::FromStr;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

pub use emission::{Emission, Emissions, TimeOffAir};
pub use error::{Error, Result};
pub use frequency_plan::FrequencyPlan;
pub use rollover_clock::RolloverClock;
pub use scheduler::{GcHandle, ScheduleOptions, Scheduler, SchedulerConfig};
pub use sub_band::{DutyCycleCeilings, DutyCycleStyle, SubBand, SubBandParameters, SubBandStats};
pub use time_on_air::{time_on_air, CodingRate, DataRate, TxSettings};

/* scheduling constants */
pub const QUEUE_DELAY: Duration = Duration::from_millis(30); /* concentrator recharge minimum between packets */
pub const SCHEDULE_TIME_SHORT: Duration = Duration::from_millis(100 + 30); /* minimum forward delay for pinned transmissions */
pub const SCHEDULE_TIME_LONG: Duration = Duration::from_millis(500 + 30); /* default forward delay for anytime transmissions */
pub const MIN_RTT_COUNT: usize = 5; /* observations before RTT stats are used */
pub const LATE_RTT_PERCENTILE: u32 = 90; /* percentile used for the "too late" threshold */
pub const DUTY_CYCLE_WINDOW: Duration = Duration::from_secs(60 * 60); /* sub-band sliding window */

/* concentrator counter */
pub const TIMESTAMP_ROLLOVER_US: i64 = 1 << 32; /* the 32-bit microsecond counter wraps every ~71 minutes */
pub const DEFAULT_ROLLOVER_THRESHOLD: Duration = Duration::from_micros(0x3938700); /* 60 s backward jump */

/// Nanoseconds relative to the concentrator power-on.
///
/// Differences between two concentrator times are concentrator times as well,
/// so spans may be negative. Arithmetic saturates at the `i64` range.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConcentratorTime(pub i64);

impl ConcentratorTime {
    pub const ZERO: ConcentratorTime = ConcentratorTime(0);

    pub const fn from_nanos(ns: i64) -> Self {
        Self(ns)
    }

    pub const fn from_micros(us: i64) -> Self {
        Self(us.saturating_mul(1_000))
    }

    pub const fn as_nanos(self) -> i64 {
        self.0
    }

    pub const fn as_micros(self) -> i64 {
        self.0 / 1_000
    }

    pub fn is_negative(self) -> bool {
        self.0 < 0
    }

    pub fn checked_add(self, rhs: ConcentratorTime) -> Option<ConcentratorTime> {
        self.0.checked_add(rhs.0).map(ConcentratorTime)
    }

    /// Non-negative spans as a `Duration`, `None` otherwise.
    pub fn to_duration(self) -> Option<Duration> {
        u64::try_from(self.0).ok().map(Duration::from_nanos)
    }
}

impl From<Duration> for ConcentratorTime {
    fn from(d: Duration) -> Self {
        Self(i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
    }
}

impl Add for ConcentratorTime {
    type Output = ConcentratorTime;
    fn add(self, rhs: ConcentratorTime) -> ConcentratorTime {
        ConcentratorTime(self.0.saturating_add(rhs.0))
    }
}

impl Sub for ConcentratorTime {
    type Output = ConcentratorTime;
    fn sub(self, rhs: ConcentratorTime) -> ConcentratorTime {
        ConcentratorTime(self.0.saturating_sub(rhs.0))
    }
}

impl Add<Duration> for ConcentratorTime {
    type Output = ConcentratorTime;
    fn add(self, rhs: Duration) -> ConcentratorTime {
        self + ConcentratorTime::from(rhs)
    }
}

impl Sub<Duration> for ConcentratorTime {
    type Output = ConcentratorTime;
    fn sub(self, rhs: Duration) -> ConcentratorTime {
        self - ConcentratorTime::from(rhs)
    }
}

impl AddAssign<Duration> for ConcentratorTime {
    fn add_assign(&mut self, rhs: Duration) {
        *self = *self + rhs;
    }
}

impl SubAssign<Duration> for ConcentratorTime {
    fn sub_assign(&mut self, rhs: Duration) {
        *self = *self - rhs;
    }
}

impl Neg for ConcentratorTime {
    type Output = ConcentratorTime;
    fn neg(self) -> ConcentratorTime {
        ConcentratorTime(self.0.saturating_neg())
    }
}

impl fmt::Display for ConcentratorTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let abs = Duration::from_nanos(self.0.unsigned_abs());
        if self.0 < 0 {
            write!(f, "-{:?}", abs)
        } else {
            write!(f, "{:?}", abs)
        }
    }
}

/// Schedule priority of a downlink, lowest to highest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TxSchedulePriority {
    Lowest,
    Low,
    BelowNormal,
    #[default]
    Normal,
    AboveNormal,
    High,
    Highest,
}

impl TxSchedulePriority {
    pub const ALL: [TxSchedulePriority; 7] = [
        TxSchedulePriority::Lowest,
        TxSchedulePriority::Low,
        TxSchedulePriority::BelowNormal,
        TxSchedulePriority::Normal,
        TxSchedulePriority::AboveNormal,
        TxSchedulePriority::High,
        TxSchedulePriority::Highest,
    ];

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for TxSchedulePriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TxSchedulePriority::Lowest => "LOWEST",
            TxSchedulePriority::Low => "LOW",
            TxSchedulePriority::BelowNormal => "BELOW_NORMAL",
            TxSchedulePriority::Normal => "NORMAL",
            TxSchedulePriority::AboveNormal => "ABOVE_NORMAL",
            TxSchedulePriority::High => "HIGH",
            TxSchedulePriority::Highest => "HIGHEST",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for TxSchedulePriority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        TxSchedulePriority::ALL
            .into_iter()
            .find(|p| p.to_string().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::InvalidPriority { priority: s.to_owned() })
    }
}

/// Source of the server wall clock.
pub trait TimeSource: Send + Sync {
    fn now(&self) -> SystemTime;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Round-trip time statistics of a gateway connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RttSnapshot {
    pub min: Duration,
    pub max: Duration,
    pub median: Duration,
    pub percentile: Duration, /* value at the requested percentile */
    pub count: usize,
}

pub trait RttStats {
    /// Statistics over the observations still relevant at `reference`, `None` when there are none.
    fn stats(&self, percentile: u32, reference: SystemTime) -> Option<RttSnapshot>;
}

/* nearest-rank percentile over raw observations */
impl RttStats for [Duration] {
    fn stats(&self, percentile: u32, _reference: SystemTime) -> Option<RttSnapshot> {
        if self.is_empty() {
            return None;
        }
        let mut sorted = self.to_vec();
        sorted.sort_unstable();
        let n = sorted.len();
        let rank = |p: u32| -> usize {
            let r = (p.min(100) as usize * n).div_ceil(100);
            r.clamp(1, n) - 1
        };
        Some(RttSnapshot {
            min: sorted[0],
            max: sorted[n - 1],
            median: sorted[rank(50)],
            percentile: sorted[rank(percentile)],
            count: n,
        })
    }
}

impl RttStats for Vec<Duration> {
    fn stats(&self, percentile: u32, reference: SystemTime) -> Option<RttSnapshot> {
        self.as_slice().stats(percentile, reference)
    }
}

/// Clock state captured when an uplink was received, used to reseed the clock at downlink time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UplinkToken {
    pub timestamp: u32,                           /* concentrator timestamp of the uplink */
    pub server_time: Option<SystemTime>,          /* server wall time at reception */
    pub gateway_time: Option<SystemTime>,         /* absolute gateway time, if the gateway reported one */
    pub concentrator_time: Option<ConcentratorTime>, /* absolute concentrator time of the uplink */
}
